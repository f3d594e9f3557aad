//! 事件模型
//!
//! 定义队列中每条消息的统一信封格式，以及已知事件类型的负载结构。
//! 信封解析与负载解析分两步进行：`payload` 以原始 JSON 片段保存，
//! 只有在找到对应处理器后才会解码，某一类型的畸形负载不会影响其他类型。

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// 已知事件类型
pub mod event_types {
    /// 用户完成一节课
    pub const LESSON_COMPLETED: &str = "lesson_completed";
}

// ---------------------------------------------------------------------------
// EventEnvelope：通用事件信封
// ---------------------------------------------------------------------------

/// 通用事件信封 `{"type": ..., "payload": ...}`
///
/// 平台内部分生产者使用 `eventType` 作为类型字段名，这里通过 alias 一并接受。
/// `payload` 可以缺省或为 null：没有处理器的事件照常确认，
/// 有处理器的事件在解码负载时才报错。
#[derive(Debug, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type", alias = "eventType")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
}

impl EventEnvelope {
    /// 由类型与任意可序列化负载构造信封，主要供生产者和测试使用
    pub fn new<T: Serialize>(event_type: &str, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_type: event_type.to_string(),
            payload: Some(serde_json::value::to_raw_value(payload)?),
        })
    }

    /// 从原始消息体解析信封
    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    /// 原始负载 JSON 片段
    pub fn raw_payload(&self) -> Option<&str> {
        self.payload.as_deref().map(RawValue::get)
    }

    /// 将负载解码为处理器需要的具体结构，缺省的负载按 null 解码
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(self.raw_payload().unwrap_or("null"))
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

// ---------------------------------------------------------------------------
// 具体负载
// ---------------------------------------------------------------------------

/// `lesson_completed` 事件负载，三个字段都是必填
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonCompletedPayload {
    pub user_id: i64,
    pub lesson_id: i64,
    pub course_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_keeps_payload_raw() {
        let body = br#"{"type":"lesson_completed","payload":{"user_id":42,"lesson_id":7,"course_id":3}}"#;
        let envelope = EventEnvelope::from_slice(body).unwrap();

        assert_eq!(envelope.event_type, event_types::LESSON_COMPLETED);
        assert_eq!(
            envelope.raw_payload(),
            Some(r#"{"user_id":42,"lesson_id":7,"course_id":3}"#)
        );

        let payload: LessonCompletedPayload = envelope.decode_payload().unwrap();
        assert_eq!(
            payload,
            LessonCompletedPayload {
                user_id: 42,
                lesson_id: 7,
                course_id: 3,
            }
        );
    }

    #[test]
    fn test_envelope_accepts_event_type_alias() {
        let body = br#"{"eventType":"user_registered","payload":{"id":1}}"#;
        let envelope = EventEnvelope::from_slice(body).unwrap();
        assert_eq!(envelope.event_type, "user_registered");
    }

    #[test]
    fn test_envelope_requires_type() {
        assert!(EventEnvelope::from_slice(br#"{"payload":{}}"#).is_err());
        assert!(EventEnvelope::from_slice(b"not json").is_err());
    }

    #[test]
    fn test_missing_payload_fails_only_on_decode() {
        for body in [
            &br#"{"type":"lesson_completed"}"#[..],
            br#"{"type":"lesson_completed","payload":null}"#,
        ] {
            let envelope = EventEnvelope::from_slice(body).unwrap();
            assert_eq!(envelope.raw_payload(), None);
            assert!(envelope.decode_payload::<LessonCompletedPayload>().is_err());
        }
    }

    #[test]
    fn test_envelope_without_payload_serializes_type_only() {
        let envelope = EventEnvelope::from_slice(br#"{"eventType":"ping"}"#).unwrap();
        assert_eq!(envelope.to_vec().unwrap(), br#"{"type":"ping"}"#);
    }

    #[test]
    fn test_malformed_payload_only_fails_on_decode() {
        // 信封本身合法，负载缺少 course_id
        let body = br#"{"type":"lesson_completed","payload":{"user_id":42,"lesson_id":7}}"#;
        let envelope = EventEnvelope::from_slice(body).unwrap();
        assert!(envelope.decode_payload::<LessonCompletedPayload>().is_err());
    }
}
