//! 积分消费服务
//!
//! 消费学习平台的领域事件，为用户累计积分并维护全局排行榜。

use std::sync::Arc;

use anyhow::Result;
use gamification_shared::{
    config::AppConfig,
    dlq::DlqProducer,
    events::event_types,
    kafka::{KafkaBroker, KafkaProducer},
    observability,
};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use points_service::{
    ConsumerSettings, EventDispatcher, FixedAward, LedgerMode, LessonCompletedHandler,
    PointsLedger, QueueConsumer, RedisScoreStore,
};

const SERVICE_NAME: &str = "points-service";

#[tokio::main]
async fn main() -> Result<()> {
    // 本地开发时从 .env 读取 REDIS_URL 等变量，文件不存在不算错误
    let _ = dotenvy::dotenv();

    // 1. 加载配置
    let config = AppConfig::load(SERVICE_NAME)?;

    // 2. 初始化可观测性
    let _guard = observability::init(&config.service_name, &config.observability).await?;
    info!(
        environment = %config.environment,
        queue = %config.kafka.queue_name,
        "Starting points-service..."
    );

    // 3. 初始化 Redis，不可达时直接退出
    let store = Arc::new(RedisScoreStore::new(&config.redis)?);
    store.health_check().await?;
    info!("Redis connection established");

    // 4. 组装账本与事件处理器
    let mode = LedgerMode::from_atomic_flag(config.points.atomic_ledger);
    let ledger = Arc::new(PointsLedger::new(store).with_mode(mode));
    let policy = Arc::new(FixedAward::new(config.points.lesson_completed));
    let dispatcher = EventDispatcher::new().with_handler(
        event_types::LESSON_COMPLETED,
        Arc::new(LessonCompletedHandler::new(ledger, policy)),
    );
    info!(
        ledger_mode = ?mode,
        lesson_points = config.points.lesson_completed,
        "Points ledger initialized"
    );

    // 5. 创建消费者
    let broker = Arc::new(KafkaBroker::new(config.kafka.clone()));
    let mut consumer = QueueConsumer::new(
        broker,
        Arc::new(dispatcher),
        ConsumerSettings::from_config(&config),
    );

    if config.consumer.dead_letter_enabled {
        let producer = KafkaProducer::new(&config.kafka)?;
        let dlq = DlqProducer::new(producer, config.consumer.dead_letter_topic.clone());
        consumer = consumer.with_dead_letters(Arc::new(dlq));
        info!(topic = %config.consumer.dead_letter_topic, "Dead-letter forwarding enabled");
    }

    // 6. 运行直到收到停机信号
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer_task = tokio::spawn(consumer.run(shutdown_rx));

    shutdown_signal().await;
    shutdown_tx.send_replace(true);

    if let Err(e) = consumer_task.await {
        error!(error = %e, "Consumer task terminated abnormally");
    }

    info!("points-service stopped");
    Ok(())
}

/// 等待 Ctrl+C 或 SIGTERM
///
/// 信号处理器注册失败时只记录日志，对应分支永不完成。
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
