//! 事件分发
//!
//! 把原始消息体解析为信封，按事件类型路由到已注册的处理器。
//! 未注册的类型不是错误：记录日志后视为成功，兼容生产者先行发布的新事件。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use gamification_shared::events::EventEnvelope;
use gamification_shared::observability::metrics;
use tracing::{debug, warn};

use crate::error::PointsError;

/// 单一事件类型的处理器
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), PointsError>;
}

/// 分发结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled { event_type: String },
    /// 没有处理器的事件类型，消息应被确认
    Ignored { event_type: String },
}

/// 按事件类型路由的分发器
#[derive(Default)]
pub struct EventDispatcher {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册处理器，同一类型重复注册时后者覆盖前者
    pub fn with_handler(mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.insert(event_type.into(), handler);
        self
    }

    pub async fn dispatch(&self, body: &[u8]) -> Result<DispatchOutcome, PointsError> {
        let envelope = match EventEnvelope::from_slice(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                metrics::record_event("unknown", "malformed");
                return Err(PointsError::MalformedEnvelope(e));
            }
        };
        let event_type = envelope.event_type.clone();

        let Some(handler) = self.handlers.get(&event_type) else {
            warn!(event_type = %event_type, "未注册的事件类型，已忽略");
            metrics::record_event(&event_type, "ignored");
            return Ok(DispatchOutcome::Ignored { event_type });
        };

        match handler.handle(&envelope).await {
            Ok(()) => {
                debug!(event_type = %event_type, "事件处理完成");
                metrics::record_event(&event_type, "handled");
                Ok(DispatchOutcome::Handled { event_type })
            }
            Err(e) => {
                metrics::record_event(&event_type, e.kind());
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle(&self, envelope: &EventEnvelope) -> Result<(), PointsError> {
            let payload = envelope.raw_payload().unwrap_or("null");
            self.seen.lock().push(payload.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_routes_by_event_type() {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = EventDispatcher::new().with_handler("lesson_completed", handler.clone());

        let outcome = dispatcher
            .dispatch(br#"{"type":"lesson_completed","payload":{"user_id":1}}"#)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::Handled {
                event_type: "lesson_completed".to_string()
            }
        );
        assert_eq!(handler.seen.lock().as_slice(), [r#"{"user_id":1}"#]);
    }

    #[tokio::test]
    async fn test_unknown_type_is_ignored() {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = EventDispatcher::new().with_handler("lesson_completed", handler.clone());

        let outcome = dispatcher
            .dispatch(br#"{"type":"unknown_future_event","payload":"anything"}"#)
            .await
            .unwrap();

        assert!(matches!(outcome, DispatchOutcome::Ignored { .. }));
        assert!(handler.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_type_without_payload_is_ignored() {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = EventDispatcher::new().with_handler("lesson_completed", handler.clone());

        for body in [
            &br#"{"type":"unknown_future_event"}"#[..],
            br#"{"eventType":"unknown_future_event","payload":null}"#,
        ] {
            let outcome = dispatcher.dispatch(body).await.unwrap();
            assert_eq!(
                outcome,
                DispatchOutcome::Ignored {
                    event_type: "unknown_future_event".to_string()
                }
            );
        }
        assert!(handler.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_handled_type_without_payload_is_malformed_payload() {
        let store = Arc::new(crate::store::MemoryScoreStore::new());
        let ledger = Arc::new(crate::ledger::PointsLedger::new(store.clone()));
        let handler = Arc::new(crate::handlers::LessonCompletedHandler::new(
            ledger,
            Arc::new(crate::handlers::FixedAward::default()),
        ));
        let dispatcher = EventDispatcher::new().with_handler("lesson_completed", handler);

        let err = dispatcher
            .dispatch(br#"{"type":"lesson_completed"}"#)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "malformed_payload");
        assert_eq!(store.user_count(), 0);
    }

    #[tokio::test]
    async fn test_event_type_alias_is_accepted() {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = EventDispatcher::new().with_handler("lesson_completed", handler.clone());

        dispatcher
            .dispatch(br#"{"eventType":"lesson_completed","payload":{}}"#)
            .await
            .unwrap();
        assert_eq!(handler.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_envelopes_are_rejected() {
        let dispatcher = EventDispatcher::new();

        for body in [
            &b"not json"[..],
            br#"{"payload":{}}"#,
            br#"{"type":42,"payload":{}}"#,
        ] {
            let err = dispatcher.dispatch(body).await.unwrap_err();
            assert_eq!(err.kind(), "malformed_envelope");
        }
    }
}
