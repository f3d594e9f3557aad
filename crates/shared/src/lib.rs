//! 共享库
//!
//! 积分服务与未来其他事件消费者共用的配置、错误处理、事件模型、
//! 消息队列抽象（及其 Kafka 实现）、死信队列与可观测性基础设施。

pub mod config;
pub mod dlq;
pub mod error;
pub mod events;
pub mod kafka;
pub mod observability;
pub mod queue;
pub mod test_utils;
