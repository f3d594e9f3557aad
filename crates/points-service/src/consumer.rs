//! 队列消费者
//!
//! 维护与持久化队列的连接生命周期：
//! `Disconnected → Connecting → Declaring → Consuming`，任何连接层错误都回到
//! `Disconnected`，等待固定间隔后无限重试。
//!
//! 每条消息在独立任务中处理，消息的确认只在其自身处理完成后发出：
//! - 处理成功或事件类型未知：确认
//! - 解码失败或业务失败：否定确认且不重新入队（可选先写入死信）
//!
//! 收到停机信号后不再拉取新消息，等待在途任务完成确认，再关闭通道。

use std::sync::Arc;
use std::time::Duration;

use gamification_shared::config::AppConfig;
use gamification_shared::dlq::{DeadLetterMessage, DeadLetterSink};
use gamification_shared::error::GamificationError;
use gamification_shared::observability::metrics;
use gamification_shared::queue::{Delivery, QueueBroker, QueueChannel};
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::dispatcher::{DispatchOutcome, EventDispatcher};
use crate::error::PointsError;

/// 消费者连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Declaring,
    Consuming,
}

impl ConsumerState {
    fn gauge_value(self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::Declaring => 2.0,
            Self::Consuming => 3.0,
        }
    }
}

/// 消费者运行参数
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub queue_name: String,
    pub reconnect_delay: Duration,
    /// 同时处理的消息上限
    pub max_in_flight: usize,
    /// 写入死信记录的来源服务名
    pub service_name: String,
}

impl ConsumerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            queue_name: config.kafka.queue_name.clone(),
            reconnect_delay: config.consumer.reconnect_delay(),
            max_in_flight: config.consumer.max_in_flight.max(1),
            service_name: config.service_name.clone(),
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// 一次会话的结束原因
enum SessionEnd {
    Shutdown,
    Lost(GamificationError),
}

/// 持久化队列消费者
pub struct QueueConsumer {
    broker: Arc<dyn QueueBroker>,
    dispatcher: Arc<EventDispatcher>,
    dead_letters: Option<Arc<DeadLetterRouter>>,
    settings: ConsumerSettings,
    state: watch::Sender<ConsumerState>,
}

impl QueueConsumer {
    pub fn new(
        broker: Arc<dyn QueueBroker>,
        dispatcher: Arc<EventDispatcher>,
        settings: ConsumerSettings,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Disconnected);
        Self {
            broker,
            dispatcher,
            dead_letters: None,
            settings,
            state,
        }
    }

    /// 被丢弃的消息在否定确认前先写入死信
    pub fn with_dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(Arc::new(DeadLetterRouter::new(
            sink,
            self.settings.queue_name.as_str(),
            self.settings.service_name.as_str(),
        )));
        self
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// 订阅状态变化
    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.send_replace(state);
        metrics::set_consumer_state(state.gauge_value());
        debug!(state = ?state, "消费者状态变更");
    }

    /// 运行消费循环，直到停机信号置为 true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(queue = %self.settings.queue_name, "队列消费者已启动");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_session(&mut shutdown).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost(e) => {
                    self.set_state(ConsumerState::Disconnected);
                    let retry_in_secs = self.settings.reconnect_delay.as_secs_f64();
                    if e.is_transport() {
                        warn!(error = %e, code = e.code(), retry_in_secs, "与 broker 的连接中断，稍后重连");
                    } else {
                        error!(error = %e, code = e.code(), retry_in_secs, "消费会话异常结束，稍后重连");
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.reconnect_delay) => {
                    metrics::record_reconnect();
                }
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }

        self.set_state(ConsumerState::Disconnected);
        info!("队列消费者已停止");
    }

    /// 一次完整会话：连接、声明、订阅、消费，直到连接中断或停机
    async fn run_session(&self, shutdown: &mut watch::Receiver<bool>) -> SessionEnd {
        self.set_state(ConsumerState::Connecting);
        let mut channel = tokio::select! {
            connected = self.broker.connect() => match connected {
                Ok(channel) => channel,
                Err(e) => return SessionEnd::Lost(e),
            },
            _ = shutdown_requested(shutdown) => return SessionEnd::Shutdown,
        };

        self.set_state(ConsumerState::Declaring);
        let queue = self.settings.queue_name.as_str();
        let prepared = match channel.declare(queue).await {
            Ok(()) => channel.consume(queue).await,
            Err(e) => Err(e),
        };
        if let Err(e) = prepared {
            close_channel(channel).await;
            return SessionEnd::Lost(e);
        }

        self.set_state(ConsumerState::Consuming);
        info!(queue, "开始消费");

        let mut tasks = JoinSet::new();
        let end = self.consume(channel.as_mut(), &mut tasks, shutdown).await;

        // 在途任务必须在通道关闭前完成确认
        let in_flight = tasks.len();
        if in_flight > 0 {
            info!(in_flight, "等待在途消息处理完成");
        }
        while let Some(joined) = tasks.join_next().await {
            log_task_result(joined);
        }

        close_channel(channel).await;
        end
    }

    async fn consume(
        &self,
        channel: &mut dyn QueueChannel,
        tasks: &mut JoinSet<()>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let permits = Arc::new(Semaphore::new(self.settings.max_in_flight));

        loop {
            let permit = tokio::select! {
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(e) => {
                        return SessionEnd::Lost(GamificationError::Internal(e.to_string()));
                    }
                },
                _ = shutdown_requested(shutdown) => return SessionEnd::Shutdown,
            };

            let delivery = tokio::select! {
                next = channel.next_delivery() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => return SessionEnd::Lost(e),
                    None => {
                        return SessionEnd::Lost(GamificationError::Transport(
                            "broker 关闭了通道".to_string(),
                        ));
                    }
                },
                _ = shutdown_requested(shutdown) => return SessionEnd::Shutdown,
            };

            let dispatcher = Arc::clone(&self.dispatcher);
            let dead_letters = self.dead_letters.clone();
            tasks.spawn(async move {
                process_delivery(&dispatcher, dead_letters.as_deref(), delivery).await;
                drop(permit);
            });

            while let Some(joined) = tasks.try_join_next() {
                log_task_result(joined);
            }
        }
    }
}

/// 处理单条消息并发出确认
///
/// 独立于消费者实例，测试可以直接调用。
pub async fn process_delivery(
    dispatcher: &EventDispatcher,
    dead_letters: Option<&DeadLetterRouter>,
    delivery: Delivery,
) {
    match dispatcher.dispatch(&delivery.body).await {
        Ok(outcome) => {
            if let DispatchOutcome::Ignored { event_type } = &outcome {
                debug!(delivery = %delivery.tag, event_type = %event_type, "确认未知类型消息");
            }
            let tag = delivery.tag.clone();
            if let Err(e) = delivery.ack().await {
                warn!(delivery = %tag, error = %e, "确认消息失败");
            }
        }
        Err(e) => {
            if e.is_decode() {
                warn!(delivery = %delivery.tag, error = %e, kind = e.kind(), "消息无法解码，丢弃");
            } else {
                error!(delivery = %delivery.tag, error = %e, kind = e.kind(), "事件处理失败，丢弃");
            }

            if let Some(router) = dead_letters {
                router.forward(&delivery, &e).await;
            }

            let tag = delivery.tag.clone();
            if let Err(e) = delivery.discard().await {
                warn!(delivery = %tag, error = %e, "丢弃消息失败");
            }
        }
    }
}

/// 把被丢弃的消息写入死信
pub struct DeadLetterRouter {
    sink: Arc<dyn DeadLetterSink>,
    source_queue: String,
    service_name: String,
}

impl DeadLetterRouter {
    pub fn new(
        sink: Arc<dyn DeadLetterSink>,
        source_queue: impl Into<String>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            sink,
            source_queue: source_queue.into(),
            service_name: service_name.into(),
        }
    }

    /// 写入失败只记录日志，不影响丢弃决定
    pub async fn forward(&self, delivery: &Delivery, error: &PointsError) {
        let message = DeadLetterMessage::new(
            delivery.tag.as_str(),
            self.source_queue.as_str(),
            &delivery.body,
            error.to_string(),
            error.kind(),
            self.service_name.as_str(),
        );

        match self.sink.publish(&message).await {
            Ok(()) => metrics::record_dead_letter(error.kind()),
            Err(e) => error!(
                delivery = %delivery.tag,
                error = %e,
                "写入死信失败，消息将直接丢弃"
            ),
        }
    }
}

/// 等待停机信号；发送端已释放时永不返回
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn close_channel(channel: Box<dyn QueueChannel>) {
    if let Err(e) = channel.close().await {
        warn!(error = %e, "关闭通道失败");
    }
}

fn log_task_result(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "消息处理任务异常退出");
    }
}
