//! Kafka 基础设施封装
//!
//! 把 rdkafka 的底层 API 适配为 `queue` 模块的 broker 抽象：
//! - 连接：创建 `StreamConsumer` 并主动拉取一次元数据，确认 broker 可达
//! - 声明：通过 Admin API 创建持久化 topic，已存在视为成功
//! - 消费：订阅消费组，关闭自动存储 offset，由确认操作显式存储
//! - 确认/丢弃：都推进 offset，区别只在日志与上层语义，消息都不会再被投递
//!
//! 消息并发处理、乱序确认，存储的 offset 只推进到"之前的消息全部确认"的位置，
//! 且单调不减，重启或再均衡后不会重复投递已确认的消息。
//!
//! 另提供 `KafkaProducer` 供死信队列使用。

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::types::RDKafkaErrorCode;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::KafkaConfig;
use crate::error::{GamificationError, Result};
use crate::queue::{Acknowledger, Delivery, QueueBroker, QueueChannel};

/// 探测 broker 元数据的超时时间
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);
/// 声明 topic 的 Admin 操作超时时间
const ADMIN_TIMEOUT: Duration = Duration::from_secs(10);

/// 构造消费者配置
///
/// `enable.auto.offset.store=false` 保证只有被确认（或丢弃）的消息才会提交 offset，
/// 自动提交只负责把已存储的 offset 周期性刷到 broker。
fn consumer_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.brokers)
        .set("group.id", &config.consumer_group)
        .set("auto.offset.reset", &config.auto_offset_reset)
        .set("enable.auto.commit", "true")
        .set("enable.auto.offset.store", "false")
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", config.session_timeout_ms.to_string());
    client_config
}

/// 生成消息标识：`topic/partition@offset`
fn delivery_tag(topic: &str, partition: i32, offset: i64) -> String {
    format!("{topic}/{partition}@{offset}")
}

// ---------------------------------------------------------------------------
// OffsetTracker
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PartitionProgress {
    in_flight: BTreeSet<i64>,
    highest_seen: Option<i64>,
    stored: Option<i64>,
}

/// 按分区跟踪在途消息，计算可以安全存储的 offset
///
/// 可存储的位置是最小在途 offset；没有在途消息时为已见最大 offset + 1。
/// 返回值只会单调增大，不会把已存储的位置往回拨。
#[derive(Debug, Default)]
struct OffsetTracker {
    partitions: HashMap<(String, i32), PartitionProgress>,
}

impl OffsetTracker {
    /// 消息交给上层处理前登记
    fn begin(&mut self, topic: &str, partition: i32, offset: i64) {
        let progress = self
            .partitions
            .entry((topic.to_string(), partition))
            .or_default();
        progress.in_flight.insert(offset);
        progress.highest_seen = Some(progress.highest_seen.map_or(offset, |h| h.max(offset)));
    }

    /// 消息确认后调用，返回需要存储的新 offset；位置没有前进时返回 None
    fn complete(&mut self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let progress = self.partitions.get_mut(&(topic.to_string(), partition))?;
        progress.in_flight.remove(&offset);

        let watermark = match progress.in_flight.first() {
            Some(lowest) => *lowest,
            None => progress.highest_seen? + 1,
        };
        if progress.stored.is_some_and(|stored| watermark <= stored) {
            return None;
        }
        progress.stored = Some(watermark);
        Some(watermark)
    }
}

// ---------------------------------------------------------------------------
// KafkaBroker
// ---------------------------------------------------------------------------

/// 基于 Kafka 消费组的 broker 实现
///
/// 只保存连接参数，每次 `connect` 都创建全新的消费者，
/// 上一次会话的客户端随通道一起被释放。
pub struct KafkaBroker {
    config: KafkaConfig,
}

impl KafkaBroker {
    pub fn new(config: KafkaConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl QueueBroker for KafkaBroker {
    async fn connect(&self) -> Result<Box<dyn QueueChannel>> {
        let consumer: StreamConsumer = consumer_config(&self.config)
            .create()
            .map_err(|e| GamificationError::Transport(format!("创建消费者失败: {e}")))?;
        let consumer = Arc::new(consumer);

        // 创建客户端并不会真正建立连接，主动拉取一次元数据以确认 broker 可达
        let metadata_client = Arc::clone(&consumer);
        tokio::task::spawn_blocking(move || {
            metadata_client.fetch_metadata(None, METADATA_TIMEOUT).map(|_| ())
        })
        .await
        .map_err(|e| GamificationError::Internal(format!("元数据探测任务异常: {e}")))?
        .map_err(|e| GamificationError::Transport(format!("broker 不可达: {e}")))?;

        info!(
            brokers = %self.config.brokers,
            group_id = %self.config.consumer_group,
            "已连接 Kafka"
        );

        Ok(Box::new(KafkaChannel {
            consumer,
            config: self.config.clone(),
            offsets: Arc::new(Mutex::new(OffsetTracker::default())),
        }))
    }
}

// ---------------------------------------------------------------------------
// KafkaChannel
// ---------------------------------------------------------------------------

/// 一次 Kafka 会话
pub struct KafkaChannel {
    consumer: Arc<StreamConsumer>,
    config: KafkaConfig,
    offsets: Arc<Mutex<OffsetTracker>>,
}

impl KafkaChannel {
    fn to_delivery(&self, msg: &BorrowedMessage<'_>) -> Delivery {
        let topic = msg.topic().to_string();
        let partition = msg.partition();
        let offset = msg.offset();
        let body = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

        self.offsets.lock().begin(&topic, partition, offset);
        let acker = KafkaAcker {
            consumer: Arc::clone(&self.consumer),
            offsets: Arc::clone(&self.offsets),
            topic: topic.clone(),
            partition,
            offset,
        };

        Delivery::new(delivery_tag(&topic, partition, offset), body, Box::new(acker))
    }
}

#[async_trait]
impl QueueChannel for KafkaChannel {
    async fn declare(&mut self, queue: &str) -> Result<()> {
        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &self.config.brokers)
            .create()
            .map_err(|e| GamificationError::Transport(format!("创建 Admin 客户端失败: {e}")))?;

        let topic = NewTopic::new(
            queue,
            self.config.partitions,
            TopicReplication::Fixed(self.config.replication_factor),
        );
        let options = AdminOptions::new().operation_timeout(Some(ADMIN_TIMEOUT));

        let results = admin
            .create_topics(&[topic], &options)
            .await
            .map_err(|e| GamificationError::Transport(format!("声明队列失败: {e}")))?;

        for result in results {
            match result {
                Ok(name) => info!(queue = %name, "队列已创建"),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(queue = %name, "队列已存在")
                }
                Err((name, code)) => {
                    return Err(GamificationError::Transport(format!(
                        "声明队列 {name} 失败: {code:?}"
                    )));
                }
            }
        }

        Ok(())
    }

    async fn consume(&mut self, queue: &str) -> Result<()> {
        self.consumer
            .subscribe(&[queue])
            .map_err(|e| GamificationError::Transport(format!("订阅队列失败: {e}")))?;

        info!(queue, "已订阅队列");
        Ok(())
    }

    async fn next_delivery(&mut self) -> Option<Result<Delivery>> {
        match self.consumer.recv().await {
            Ok(msg) => Some(Ok(self.to_delivery(&msg))),
            Err(e) => Some(Err(GamificationError::Transport(format!(
                "接收消息失败: {e}"
            )))),
        }
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let consumer = Arc::clone(&self.consumer);
        let committed = tokio::task::spawn_blocking(move || {
            consumer.commit_consumer_state(CommitMode::Sync)
        })
        .await
        .map_err(|e| GamificationError::Internal(format!("提交 offset 任务异常: {e}")))?;

        // 没有新存储的 offset 时 librdkafka 会返回 NoOffset，不算失败
        if let Err(e) = committed {
            debug!(error = %e, "关闭前提交 offset 未完成");
        }

        self.consumer.unsubscribe();
        info!("Kafka 通道已关闭");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// KafkaAcker
// ---------------------------------------------------------------------------

/// 存储 offset 的确认句柄
///
/// Kafka 没有逐条否定确认，"丢弃"同样推进 offset，让消息永远不再投递。
struct KafkaAcker {
    consumer: Arc<StreamConsumer>,
    offsets: Arc<Mutex<OffsetTracker>>,
    topic: String,
    partition: i32,
    offset: i64,
}

impl KafkaAcker {
    fn store_next_offset(&self) -> Result<()> {
        let Some(next) = self
            .offsets
            .lock()
            .complete(&self.topic, self.partition, self.offset)
        else {
            return Ok(());
        };

        self.consumer
            .store_offset(&self.topic, self.partition, next)
            .map_err(|e| GamificationError::Kafka(format!("存储 offset 失败: {e}")))
    }
}

#[async_trait]
impl Acknowledger for KafkaAcker {
    async fn ack(&self) -> Result<()> {
        self.store_next_offset()
    }

    async fn discard(&self) -> Result<()> {
        self.store_next_offset()?;
        debug!(
            topic = %self.topic,
            partition = self.partition,
            offset = self.offset,
            "消息已丢弃，不会重新投递"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// KafkaProducer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 生产者
///
/// 封装 `FutureProducer` 并提供类型安全的 JSON 发送方法，
/// `FutureProducer` 本身是 Arc 包装的，可以廉价克隆。
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    /// 根据配置创建生产者
    ///
    /// `message.timeout.ms` 设为 5 秒，超过后由调用方决定如何处理。
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| GamificationError::Kafka(format!("创建生产者失败: {e}")))?;

        info!(brokers = %config.brokers, "Kafka 生产者已初始化");
        Ok(Self { producer })
    }

    /// 发送原始字节消息
    pub async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(i32, i64)> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        let delivery = self
            .producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| GamificationError::Kafka(format!("发送消息失败: {e}")))?;

        debug!(
            topic,
            key,
            partition = delivery.partition,
            offset = delivery.offset,
            "消息已发送"
        );
        Ok((delivery.partition, delivery.offset))
    }

    /// 将值序列化为 JSON 后发送
    pub async fn send_json<T: Serialize>(
        &self,
        topic: &str,
        key: &str,
        value: &T,
    ) -> Result<(i32, i64)> {
        let payload = serde_json::to_vec(value)?;
        self.send(topic, key, &payload).await
    }
}
