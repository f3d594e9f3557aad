//! 死信队列
//!
//! 消费者对无法处理的消息一律否定确认且不重新入队。开启死信后，
//! 这些消息在丢弃前会额外写入死信 topic，保留原始消息体与失败原因，
//! 供人工排查或离线重放。是否丢弃的决策本身不受影响。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::kafka::KafkaProducer;

// ---------------------------------------------------------------------------
// DeadLetterMessage：死信消息信封
// ---------------------------------------------------------------------------

/// 死信消息信封
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    /// 死信记录 ID（UUID v7，按时间有序）
    pub id: String,
    /// broker 侧消息标识
    pub delivery_tag: String,
    /// 原始队列
    pub source_queue: String,
    /// 原始消息体（非 UTF-8 字节以替换字符保存）
    pub payload: String,
    /// 失败原因
    pub error: String,
    /// 失败分类（如 malformed_envelope、ledger_update）
    pub error_kind: String,
    pub failed_at: DateTime<Utc>,
    /// 来源服务
    pub source_service: String,
}

impl DeadLetterMessage {
    pub fn new(
        delivery_tag: impl Into<String>,
        source_queue: impl Into<String>,
        body: &[u8],
        error: impl Into<String>,
        error_kind: impl Into<String>,
        source_service: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            delivery_tag: delivery_tag.into(),
            source_queue: source_queue.into(),
            payload: String::from_utf8_lossy(body).into_owned(),
            error: error.into(),
            error_kind: error_kind.into(),
            failed_at: Utc::now(),
            source_service: source_service.into(),
        }
    }
}

/// 死信投递目标
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn publish(&self, message: &DeadLetterMessage) -> Result<()>;
}

// ---------------------------------------------------------------------------
// DlqProducer：写入 Kafka 死信 topic
// ---------------------------------------------------------------------------

pub struct DlqProducer {
    producer: KafkaProducer,
    topic: String,
}

impl DlqProducer {
    pub fn new(producer: KafkaProducer, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl DeadLetterSink for DlqProducer {
    async fn publish(&self, message: &DeadLetterMessage) -> Result<()> {
        self.producer
            .send_json(&self.topic, &message.delivery_tag, message)
            .await?;

        warn!(
            delivery = %message.delivery_tag,
            source_queue = %message.source_queue,
            error_kind = %message.error_kind,
            error = %message.error,
            "消息已发送到死信队列"
        );
        Ok(())
    }
}
