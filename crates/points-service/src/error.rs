//! 积分服务专用错误类型
//!
//! 在共享库 GamificationError 基础上区分"信封畸形 / 负载畸形 / 积分写入失败"，
//! 消费者据此记录日志、打点并写入死信；三者对 broker 的确认结果相同（丢弃）。

use gamification_shared::error::GamificationError;

/// 积分事件处理错误
#[derive(Debug, thiserror::Error)]
pub enum PointsError {
    /// 消息体不是合法的 `{type, payload}` 信封，重投也不会变好
    #[error("事件信封解析失败: {0}")]
    MalformedEnvelope(#[source] serde_json::Error),

    /// 已识别的事件类型，但负载无法解码为对应结构
    #[error("事件负载解析失败: event_type={event_type}: {source}")]
    MalformedPayload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    /// 积分写入失败，结果不确定：计数器可能已变更（见 PointsLedger 的补偿说明）
    #[error("积分更新失败: user_id={user_id}, delta={delta}: {source}")]
    LedgerUpdate {
        user_id: i64,
        delta: i64,
        #[source]
        source: GamificationError,
    },

    /// 透传共享库错误（读路径上的存储连接故障等）
    #[error(transparent)]
    Shared(#[from] GamificationError),
}

impl PointsError {
    /// 错误分类，用于日志字段、指标标签和死信记录
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedEnvelope(_) => "malformed_envelope",
            Self::MalformedPayload { .. } => "malformed_payload",
            Self::LedgerUpdate { .. } => "ledger_update",
            Self::Shared(_) => "infrastructure",
        }
    }

    /// 是否为解码类错误（生产者发出了坏消息）
    pub fn is_decode(&self) -> bool {
        matches!(
            self,
            Self::MalformedEnvelope(_) | Self::MalformedPayload { .. }
        )
    }
}
