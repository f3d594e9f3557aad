//! 统一错误处理模块
//!
//! 定义基础设施层（Redis、Kafka、配置）共享的错误类型，使用 thiserror 提供良好的错误信息。
//! 业务相关的错误变体由各服务在自己的 error 模块中定义，并透传本类型。

use thiserror::Error;

/// 基础设施错误类型
#[derive(Debug, Error)]
pub enum GamificationError {
    // ==================== 存储错误 ====================
    #[error("Redis 错误: {0}")]
    Redis(#[from] redis::RedisError),

    // ==================== 消息队列错误 ====================
    #[error("Kafka 错误: {0}")]
    Kafka(String),

    /// 与 broker 的连接/通道失效，消费者需要断开并重连
    #[error("消息队列连接中断: {0}")]
    Transport(String),

    // ==================== 配置与序列化 ====================
    #[error("配置错误: {0}")]
    Config(#[from] config::ConfigError),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    // ==================== 通用错误 ====================
    /// 底层实现不支持所请求的操作（例如内存存储不支持脚本原子写）
    #[error("不支持的操作: {0}")]
    Unsupported(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, GamificationError>;

impl GamificationError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Redis(_) => "REDIS_ERROR",
            Self::Kafka(_) => "KAFKA_ERROR",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Unsupported(_) => "UNSUPPORTED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否属于连接层故障
    ///
    /// 连接层故障只触发重连，永远不会传递给消息处理器。
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Kafka(_))
    }
}
