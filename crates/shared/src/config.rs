//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。
//! 这里的配置只是纯值：broker 地址、Redis 地址、队列名与积分奖励数额，
//! 本服务不持有任何磁盘状态。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Redis 配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
        }
    }
}

/// Kafka 配置
///
/// `queue_name` 即持久化事件队列（topic）的名字，上游服务向它发布事件。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    pub brokers: String,
    pub consumer_group: String,
    pub auto_offset_reset: String,
    pub queue_name: String,
    /// 声明队列时使用的分区数（topic 已存在时忽略）
    pub partitions: i32,
    pub replication_factor: i32,
    pub session_timeout_ms: u32,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            consumer_group: "gamification-service".to_string(),
            auto_offset_reset: "earliest".to_string(),
            queue_name: "gamification_events".to_string(),
            partitions: 3,
            replication_factor: 1,
            session_timeout_ms: 10_000,
        }
    }
}

/// 消费者行为配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// 断线后重连前的固定等待时间
    pub reconnect_delay_secs: u64,
    /// 同时处理中的消息上限
    pub max_in_flight: usize,
    /// 被丢弃的消息是否额外投递到死信队列
    pub dead_letter_enabled: bool,
    pub dead_letter_topic: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: 5,
            max_in_flight: 64,
            dead_letter_enabled: false,
            dead_letter_topic: "gamification_events.dlq".to_string(),
        }
    }
}

impl ConsumerConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// 积分规则配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PointsConfig {
    /// 每完成一节课奖励的积分
    pub lesson_completed: i64,
    /// 是否使用 Redis 脚本把计数器与排行榜写入合并为一个原子操作
    pub atomic_ledger: bool,
}

impl Default for PointsConfig {
    fn default() -> Self {
        Self {
            lesson_completed: 10,
            atomic_ledger: false,
        }
    }
}

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// 日志输出格式：json（结构化）或 pretty（人类可读）
    pub log_format: String,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
    pub otlp_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: true,
            metrics_port: 9090,
            otlp_endpoint: None,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub redis: RedisConfig,
    pub kafka: KafkaConfig,
    pub consumer: ConsumerConfig,
    pub points: PointsConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. config/{service_name}.toml（服务特定配置）
    /// 4. 环境变量（GAMIFICATION_ 前缀，层级用双下划线，如 GAMIFICATION_KAFKA__BROKERS -> kafka.brokers）
    /// 5. 部署约定的简写变量（REDIS_URL、KAFKA_BROKERS、EVENT_QUEUE_NAME）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("GAMIFICATION_ENV").unwrap_or_else(|_| "development".to_string());

        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
            )
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", service_name)))
                    .required(false),
            )
            .add_source(
                Environment::with_prefix("GAMIFICATION")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let mut config: Self = builder.build()?.try_deserialize()?;
        config.apply_overrides(|name| std::env::var(name).ok());

        Ok(config)
    }

    /// 应用部署环境中沿用的简写变量
    ///
    /// 传入查找函数而不是直接读进程环境，测试时无需修改全局环境变量。
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("REDIS_URL").filter(|v| !v.is_empty()) {
            // 部署环境里常见裸 host:port 写法
            self.redis.url = if url.contains("://") {
                url
            } else {
                format!("redis://{url}")
            };
        }
        if let Some(brokers) = lookup("KAFKA_BROKERS").filter(|v| !v.is_empty()) {
            self.kafka.brokers = brokers;
        }
        if let Some(queue) = lookup("EVENT_QUEUE_NAME").filter(|v| !v.is_empty()) {
            self.kafka.queue_name = queue;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.kafka.queue_name, "gamification_events");
        assert_eq!(config.consumer.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.points.lesson_completed, 10);
        assert!(!config.points.atomic_ledger);
        assert!(!config.consumer.dead_letter_enabled);
    }

    #[test]
    fn test_overrides_replace_connection_values() {
        let vars = HashMap::from([
            ("REDIS_URL", "redis://cache:6380"),
            ("KAFKA_BROKERS", "kafka-1:9092,kafka-2:9092"),
            ("EVENT_QUEUE_NAME", ""),
        ]);
        let mut config = AppConfig::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.redis.url, "redis://cache:6380");
        assert_eq!(config.kafka.brokers, "kafka-1:9092,kafka-2:9092");
        // 空值不覆盖
        assert_eq!(config.kafka.queue_name, "gamification_events");
    }

    #[test]
    fn test_bare_redis_address_gets_scheme() {
        let mut config = AppConfig::default();
        config.apply_overrides(|name| (name == "REDIS_URL").then(|| "cache:6379".to_string()));
        assert_eq!(config.redis.url, "redis://cache:6379");

        config.apply_overrides(|name| {
            (name == "REDIS_URL").then(|| "rediss://secure-cache:6380/1".to_string())
        });
        assert_eq!(config.redis.url, "rediss://secure-cache:6380/1");
    }

    #[test]
    fn test_partial_section_keeps_defaults() {
        let config: AppConfig = Config::builder()
            .set_override("points.lesson_completed", 25)
            .and_then(|b| b.set_override("kafka.queue_name", "events"))
            .and_then(|b| b.build())
            .and_then(|c| c.try_deserialize())
            .unwrap();

        assert_eq!(config.points.lesson_completed, 25);
        assert!(!config.points.atomic_ledger);
        assert_eq!(config.kafka.queue_name, "events");
        assert_eq!(config.kafka.brokers, "localhost:9092");
    }
}
