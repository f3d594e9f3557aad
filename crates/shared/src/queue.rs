//! 消息队列抽象
//!
//! 消费者只依赖这里的三个 trait：`QueueBroker` 负责建立连接，
//! `QueueChannel` 覆盖声明、订阅、拉取与关闭，`Acknowledger` 负责单条消息的确认。
//! 生产环境使用 `kafka` 模块中的实现，测试使用 `test_utils::MemoryBroker`。

use async_trait::async_trait;

use crate::error::Result;

/// 消息队列连接工厂
#[async_trait]
pub trait QueueBroker: Send + Sync {
    /// 建立一条新的连接/通道；失败视为连接层故障
    async fn connect(&self) -> Result<Box<dyn QueueChannel>>;
}

/// 一次连接会话内的通道
#[async_trait]
pub trait QueueChannel: Send {
    /// 声明持久化队列（已存在则视为成功）
    async fn declare(&mut self, queue: &str) -> Result<()>;

    /// 以手动确认模式开始消费
    async fn consume(&mut self, queue: &str) -> Result<()>;

    /// 等待下一条消息
    ///
    /// 返回 `None` 表示通道已关闭，`Some(Err)` 表示连接层故障。
    /// 实现必须是取消安全的，消费循环会把它放进 `select!`。
    async fn next_delivery(&mut self) -> Option<Result<Delivery>>;

    /// 关闭通道，确保已发出的确认被刷到 broker
    async fn close(self: Box<Self>) -> Result<()>;
}

/// 单条消息的确认句柄
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// 正向确认：消息已处理
    async fn ack(&self) -> Result<()>;

    /// 否定确认且不重新入队：消息被永久丢弃
    async fn discard(&self) -> Result<()>;
}

/// 投递到消费者的一条消息
///
/// `ack` / `discard` 消费 self，保证每条消息只被确认一次。
pub struct Delivery {
    /// broker 侧的消息标识，仅用于日志和死信记录
    pub tag: String,
    pub body: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(tag: impl Into<String>, body: Vec<u8>, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            tag: tag.into(),
            body,
            acker,
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn discard(self) -> Result<()> {
        self.acker.discard().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("tag", &self.tag)
            .field("body_len", &self.body.len())
            .finish()
    }
}
