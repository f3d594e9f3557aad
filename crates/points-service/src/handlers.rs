//! 事件处理器
//!
//! 每种事件类型一个处理器，负责解码自己的负载并调用账本。
//! 积分规则通过 `AwardPolicy` 注入，目前只实现固定分值规则。

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use gamification_shared::events::{EventEnvelope, LessonCompletedPayload};
use gamification_shared::observability::metrics;
use tracing::{info, instrument};

use crate::dispatcher::EventHandler;
use crate::error::PointsError;
use crate::ledger::PointsLedger;

/// 默认每完成一节课奖励的积分
pub const DEFAULT_LESSON_POINTS: i64 = 10;

/// 积分规则
pub trait AwardPolicy: Send + Sync {
    /// 完成一节课应得的积分
    fn lesson_completed(&self, payload: &LessonCompletedPayload) -> i64;
}

/// 固定分值规则，与课程、章节无关
#[derive(Debug, Clone, Copy)]
pub struct FixedAward {
    points: i64,
}

impl FixedAward {
    pub fn new(points: i64) -> Self {
        Self { points }
    }
}

impl Default for FixedAward {
    fn default() -> Self {
        Self::new(DEFAULT_LESSON_POINTS)
    }
}

impl AwardPolicy for FixedAward {
    fn lesson_completed(&self, _payload: &LessonCompletedPayload) -> i64 {
        self.points
    }
}

/// `lesson_completed` 事件处理器
///
/// 不做去重：同一用户重复完成同一节课会重复得分。
pub struct LessonCompletedHandler {
    ledger: Arc<PointsLedger>,
    policy: Arc<dyn AwardPolicy>,
}

impl LessonCompletedHandler {
    pub fn new(ledger: Arc<PointsLedger>, policy: Arc<dyn AwardPolicy>) -> Self {
        Self { ledger, policy }
    }
}

#[async_trait]
impl EventHandler for LessonCompletedHandler {
    #[instrument(skip(self, envelope), fields(event_type = %envelope.event_type))]
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), PointsError> {
        let payload: LessonCompletedPayload =
            envelope
                .decode_payload()
                .map_err(|source| PointsError::MalformedPayload {
                    event_type: envelope.event_type.clone(),
                    source,
                })?;

        let points = self.policy.lesson_completed(&payload);
        let started = Instant::now();
        let new_score = self.ledger.add_points(payload.user_id, points).await?;
        metrics::record_points_awarded(
            &envelope.event_type,
            points,
            started.elapsed().as_secs_f64(),
        );

        info!(
            user_id = payload.user_id,
            lesson_id = payload.lesson_id,
            course_id = payload.course_id,
            points,
            new_score,
            "课程完成积分已发放"
        );
        Ok(())
    }
}
