//! 测试工具模块
//!
//! 提供内存版 broker 与死信投递目标，使消费者可以在没有 Kafka 的情况下
//! 被完整驱动：发布消息、注入连接故障、观察每条消息的确认结果。

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::config::RedisConfig;
use crate::dlq::{DeadLetterMessage, DeadLetterSink};
use crate::error::{GamificationError, Result};
use crate::queue::{Acknowledger, Delivery, QueueBroker, QueueChannel};

// ==================== 测试配置辅助 ====================

/// 创建测试用 Redis 配置
///
/// 优先使用环境变量，默认指向本地 Redis 的 1 号库，避免污染开发数据
pub fn test_redis_config() -> RedisConfig {
    RedisConfig {
        url: std::env::var("TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://localhost:6379/1".to_string()),
    }
}

// ==================== 内存 broker ====================

/// 消息的最终确认结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettledDelivery {
    pub tag: String,
    pub settlement: Settlement,
}

enum Frame {
    Message { tag: String, body: Vec<u8> },
    TransportError(String),
}

struct Inner {
    sender: mpsc::UnboundedSender<Frame>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    failing_connects: AtomicU32,
    connects: AtomicU32,
    closes: AtomicU32,
    next_tag: AtomicU64,
    declared: Mutex<Vec<String>>,
    settled: Mutex<Vec<SettledDelivery>>,
    settled_count: watch::Sender<usize>,
}

/// 内存 broker
///
/// 所有会话共享同一条消息流：断线重连后，尚未被拉取的消息会在新会话中继续投递，
/// 与持久化队列的行为一致。
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (settled_count, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                sender,
                receiver: tokio::sync::Mutex::new(receiver),
                failing_connects: AtomicU32::new(0),
                connects: AtomicU32::new(0),
                closes: AtomicU32::new(0),
                next_tag: AtomicU64::new(1),
                declared: Mutex::new(Vec::new()),
                settled: Mutex::new(Vec::new()),
                settled_count,
            }),
        }
    }

    /// 发布原始消息体，返回分配的消息标识
    pub fn publish(&self, body: impl Into<Vec<u8>>) -> String {
        let tag = format!("mem-{}", self.inner.next_tag.fetch_add(1, Ordering::SeqCst));
        let _ = self.inner.sender.send(Frame::Message {
            tag: tag.clone(),
            body: body.into(),
        });
        tag
    }

    /// 将值序列化为 JSON 后发布
    pub fn publish_json<T: Serialize>(&self, value: &T) -> String {
        let body = serde_json::to_vec(value).unwrap_or_default();
        self.publish(body)
    }

    /// 在消息流中插入一次连接中断
    pub fn inject_transport_error(&self, reason: &str) {
        let _ = self
            .inner
            .sender
            .send(Frame::TransportError(reason.to_string()));
    }

    /// 让接下来的 n 次连接失败
    pub fn fail_next_connects(&self, n: u32) {
        self.inner.failing_connects.store(n, Ordering::SeqCst);
    }

    /// 连接尝试次数（含失败的）
    pub fn connect_attempts(&self) -> u32 {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> u32 {
        self.inner.closes.load(Ordering::SeqCst)
    }

    pub fn declared_queues(&self) -> Vec<String> {
        self.inner.declared.lock().clone()
    }

    pub fn settlements(&self) -> Vec<SettledDelivery> {
        self.inner.settled.lock().clone()
    }

    pub fn settlement_of(&self, tag: &str) -> Option<Settlement> {
        self.inner
            .settled
            .lock()
            .iter()
            .find(|s| s.tag == tag)
            .map(|s| s.settlement)
    }

    /// 等待至少 n 条消息被确认，超时返回 false
    pub async fn wait_for_settlements(&self, n: usize, timeout: Duration) -> bool {
        let mut rx = self.inner.settled_count.subscribe();
        let reached = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|count| *count >= n)).await,
            Ok(Ok(_))
        );
        reached
    }
}

#[async_trait]
impl QueueBroker for MemoryBroker {
    async fn connect(&self) -> Result<Box<dyn QueueChannel>> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);

        let should_fail = self
            .inner
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(GamificationError::Transport("connection refused".to_string()));
        }

        Ok(Box::new(MemoryChannel {
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MemoryChannel {
    inner: Arc<Inner>,
}

#[async_trait]
impl QueueChannel for MemoryChannel {
    async fn declare(&mut self, queue: &str) -> Result<()> {
        self.inner.declared.lock().push(queue.to_string());
        Ok(())
    }

    async fn consume(&mut self, _queue: &str) -> Result<()> {
        Ok(())
    }

    async fn next_delivery(&mut self) -> Option<Result<Delivery>> {
        let mut receiver = self.inner.receiver.lock().await;
        match receiver.recv().await? {
            Frame::Message { tag, body } => {
                let acker = MemoryAcker {
                    inner: Arc::clone(&self.inner),
                    tag: tag.clone(),
                };
                Some(Ok(Delivery::new(tag, body, Box::new(acker))))
            }
            Frame::TransportError(reason) => Some(Err(GamificationError::Transport(reason))),
        }
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.inner.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryAcker {
    inner: Arc<Inner>,
    tag: String,
}

impl MemoryAcker {
    fn settle(&self, settlement: Settlement) {
        self.inner.settled.lock().push(SettledDelivery {
            tag: self.tag.clone(),
            settlement,
        });
        self.inner.settled_count.send_modify(|count| *count += 1);
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(Settlement::Acked);
        Ok(())
    }

    async fn discard(&self) -> Result<()> {
        self.settle(Settlement::Discarded);
        Ok(())
    }
}

// ==================== 内存死信 ====================

/// 收集死信消息的内存投递目标
#[derive(Clone, Default)]
pub struct MemoryDeadLetters {
    messages: Arc<Mutex<Vec<DeadLetterMessage>>>,
}

impl MemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<DeadLetterMessage> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetters {
    async fn publish(&self, message: &DeadLetterMessage) -> Result<()> {
        self.messages.lock().push(message.clone());
        Ok(())
    }
}
