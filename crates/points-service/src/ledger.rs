//! 积分账本
//!
//! 账本是积分存储唯一的写入方。一次加分分两步：先原子自增计数器，
//! 再把新的总分写入排行索引。第二步失败时发出一次补偿写入，把计数器恢复原值，
//! 然后返回第二步的原始错误。
//!
//! 补偿本身也可能失败，此时两份数据不一致，只能记录最高级别日志并等待 `reconcile` 修复。
//! 调用方应把任何错误视为"结果不确定"而非"未生效"。
//!
//! 计数器是权威数据。补偿模式下，同一用户的并发加分可能以乱序写入排行索引，
//! 因此每次写入索引后都会回读计数器，不一致时按计数器重写，直到两者相同。
//! 最后一次写索引的调用总会看到最终的计数器值，索引因此收敛。

use std::sync::Arc;
use std::time::Instant;

use gamification_shared::error::GamificationError;
use gamification_shared::observability::metrics;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};

use crate::error::PointsError;
use crate::store::ScoreStore;

/// 写入索引后回读校正的最大轮数
const MAX_CONVERGE_ROUNDS: usize = 8;

/// 账本写入模式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerMode {
    /// 两步写入，第二步失败时补偿
    #[default]
    Compensating,
    /// 由存储在一个原子单元内完成两步
    Atomic,
}

impl LedgerMode {
    pub fn from_atomic_flag(atomic: bool) -> Self {
        if atomic { Self::Atomic } else { Self::Compensating }
    }
}

/// 单个用户的一致性检查结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// 计数器与排行索引一致
    Consistent { score: i64 },
    /// 排行索引已按计数器重写
    Repaired { score: i64, previous: Option<i64> },
    /// 排行索引中有记录但计数器没有，无法判断应有分数，仅报告
    Orphaned { ranked: i64 },
    /// 两处都没有记录
    NoRecord,
}

/// 积分账本
pub struct PointsLedger {
    store: Arc<dyn ScoreStore>,
    mode: LedgerMode,
}

impl PointsLedger {
    pub fn new(store: Arc<dyn ScoreStore>) -> Self {
        Self {
            store,
            mode: LedgerMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: LedgerMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> LedgerMode {
        self.mode
    }

    /// 给用户加上 delta（可为负），返回新的总分
    #[instrument(skip(self), fields(mode = ?self.mode))]
    pub async fn add_points(&self, user_id: i64, delta: i64) -> Result<i64, PointsError> {
        let started = Instant::now();
        let ledger_error = |source: GamificationError| PointsError::LedgerUpdate {
            user_id,
            delta,
            source,
        };

        let new_score = match self.mode {
            LedgerMode::Atomic => self
                .store
                .increment_and_rank(user_id, delta)
                .await
                .map_err(ledger_error)?,
            LedgerMode::Compensating => {
                let new_score = self
                    .store
                    .increment_score(user_id, delta)
                    .await
                    .map_err(ledger_error)?;

                if let Err(index_error) = self.store.set_ranked_score(user_id, new_score).await {
                    self.compensate(user_id, delta, &index_error).await;
                    return Err(ledger_error(index_error));
                }
                self.converge_index(user_id).await;
                new_score
            }
        };

        debug!(
            user_id,
            delta,
            new_score,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "积分已更新"
        );
        Ok(new_score)
    }

    /// 回读计数器，排行索引被并发写入的旧值覆盖时重写
    ///
    /// 加分本身已经生效，这里的失败只记录日志，由下一次写入或 `reconcile` 修复。
    async fn converge_index(&self, user_id: i64) {
        for _ in 0..MAX_CONVERGE_ROUNDS {
            match self.reconcile(user_id).await {
                Ok(ReconcileOutcome::Repaired { .. }) => continue,
                Ok(_) => return,
                Err(e) => {
                    warn!(user_id, error = %e, "回读校正排行索引失败");
                    return;
                }
            }
        }
        warn!(user_id, rounds = MAX_CONVERGE_ROUNDS, "排行索引仍在被并发修改，停止校正");
    }

    /// 排行索引写入失败后，撤销计数器上的自增
    async fn compensate(&self, user_id: i64, delta: i64, cause: &GamificationError) {
        let Some(reverse) = delta.checked_neg() else {
            error!(
                user_id,
                delta,
                cause = %cause,
                divergence = true,
                "无法构造补偿写入，计数器与排行索引不一致"
            );
            metrics::record_compensation("failed");
            return;
        };

        match self.store.increment_score(user_id, reverse).await {
            Ok(restored) => {
                warn!(
                    user_id,
                    delta,
                    restored_score = restored,
                    cause = %cause,
                    "排行索引写入失败，计数器已恢复"
                );
                metrics::record_compensation("restored");
                self.repair_after_compensation(user_id, restored).await;
            }
            Err(e) => {
                error!(
                    user_id,
                    delta,
                    cause = %cause,
                    error = %e,
                    divergence = true,
                    "补偿写入失败，计数器与排行索引不一致"
                );
                metrics::record_compensation("failed");
            }
        }
    }

    /// 并发加分可能已把包含本次 delta 的分数写进索引，补偿后按恢复值重写
    ///
    /// 只修正已在榜的用户，首次加分失败的用户不会以 0 分上榜。
    async fn repair_after_compensation(&self, user_id: i64, restored: i64) {
        match self.store.ranked_score(user_id).await {
            Ok(Some(ranked)) if ranked != restored => {
                if let Err(e) = self.store.set_ranked_score(user_id, restored).await {
                    warn!(user_id, ranked, restored, error = %e, "补偿后修正排行索引失败");
                } else {
                    metrics::record_divergence_repair();
                }
            }
            Ok(_) => {}
            Err(e) => warn!(user_id, error = %e, "补偿后读取排行索引失败"),
        }
    }

    /// 检查单个用户的计数器与排行索引，不一致时按计数器重写排行索引
    #[instrument(skip(self))]
    pub async fn reconcile(&self, user_id: i64) -> Result<ReconcileOutcome, PointsError> {
        let counter = self.store.stored_score(user_id).await?;
        let ranked = self.store.ranked_score(user_id).await?;

        let outcome = match (counter, ranked) {
            (None, None) => ReconcileOutcome::NoRecord,
            (None, Some(ranked)) => {
                warn!(user_id, ranked, "排行索引存在无计数器的记录");
                ReconcileOutcome::Orphaned { ranked }
            }
            (Some(score), Some(ranked)) if score == ranked => {
                ReconcileOutcome::Consistent { score }
            }
            (Some(score), previous) => {
                self.store.set_ranked_score(user_id, score).await?;
                metrics::record_divergence_repair();
                warn!(user_id, score, previous = ?previous, "排行索引已按计数器修复");
                ReconcileOutcome::Repaired { score, previous }
            }
        };

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockScoreStore;
    use mockall::Sequence;
    use mockall::predicate::eq;

    fn index_down() -> GamificationError {
        GamificationError::Internal("zadd: connection reset".to_string())
    }

    #[tokio::test]
    async fn test_add_points_writes_counter_then_index() {
        let mut store = MockScoreStore::new();
        let mut seq = Sequence::new();
        store
            .expect_increment_score()
            .with(eq(42), eq(10))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(30));
        store
            .expect_set_ranked_score()
            .with(eq(42), eq(30))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        store
            .expect_stored_score()
            .with(eq(42))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(30)));
        store
            .expect_ranked_score()
            .with(eq(42))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(30)));

        let ledger = PointsLedger::new(Arc::new(store));
        assert_eq!(ledger.add_points(42, 10).await.unwrap(), 30);
    }

    #[tokio::test]
    async fn test_stale_index_write_is_rewritten_from_counter() {
        let mut store = MockScoreStore::new();
        store
            .expect_increment_score()
            .with(eq(42), eq(10))
            .times(1)
            .returning(|_, _| Ok(10));
        // 本次写入的 10 落在并发写入的 20 之后
        store
            .expect_set_ranked_score()
            .with(eq(42), eq(10))
            .times(1)
            .returning(|_, _| Ok(()));
        store
            .expect_stored_score()
            .returning(|_| Ok(Some(20)));
        let ranked = Arc::new(parking_lot::Mutex::new(10));
        let read = Arc::clone(&ranked);
        store
            .expect_ranked_score()
            .returning(move |_| Ok(Some(*read.lock())));
        let written = Arc::clone(&ranked);
        store
            .expect_set_ranked_score()
            .with(eq(42), eq(20))
            .times(1)
            .returning(move |_, score| {
                *written.lock() = score;
                Ok(())
            });

        let ledger = PointsLedger::new(Arc::new(store));
        assert_eq!(ledger.add_points(42, 10).await.unwrap(), 10);
        assert_eq!(*ranked.lock(), 20);
    }

    #[tokio::test]
    async fn test_index_failure_is_compensated() {
        let mut store = MockScoreStore::new();
        store
            .expect_increment_score()
            .with(eq(42), eq(10))
            .times(1)
            .returning(|_, _| Ok(10));
        store
            .expect_set_ranked_score()
            .times(1)
            .returning(|_, _| Err(index_down()));
        store
            .expect_increment_score()
            .with(eq(42), eq(-10))
            .times(1)
            .returning(|_, _| Ok(0));
        store
            .expect_ranked_score()
            .with(eq(42))
            .times(1)
            .returning(|_| Ok(None));

        let ledger = PointsLedger::new(Arc::new(store));
        let err = ledger.add_points(42, 10).await.unwrap_err();

        match err {
            PointsError::LedgerUpdate {
                user_id,
                delta,
                source,
            } => {
                assert_eq!((user_id, delta), (42, 10));
                assert!(source.to_string().contains("zadd"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_negative_delta_is_compensated_symmetrically() {
        let mut store = MockScoreStore::new();
        store
            .expect_increment_score()
            .with(eq(7), eq(-5))
            .times(1)
            .returning(|_, _| Ok(15));
        store
            .expect_set_ranked_score()
            .with(eq(7), eq(15))
            .times(1)
            .returning(|_, _| Err(index_down()));
        store
            .expect_increment_score()
            .with(eq(7), eq(5))
            .times(1)
            .returning(|_, _| Ok(20));
        store.expect_ranked_score().returning(|_| Ok(Some(20)));

        let ledger = PointsLedger::new(Arc::new(store));
        assert!(ledger.add_points(7, -5).await.is_err());
    }

    #[tokio::test]
    async fn test_compensation_rewrites_index_raised_by_concurrent_award() {
        let mut store = MockScoreStore::new();
        store
            .expect_increment_score()
            .with(eq(7), eq(10))
            .times(1)
            .returning(|_, _| Ok(30));
        store
            .expect_set_ranked_score()
            .with(eq(7), eq(30))
            .times(1)
            .returning(|_, _| Err(index_down()));
        store
            .expect_increment_score()
            .with(eq(7), eq(-10))
            .times(1)
            .returning(|_, _| Ok(20));
        // 并发的另一笔加分已把含本次 delta 的 30 写入索引
        store.expect_ranked_score().returning(|_| Ok(Some(30)));
        store
            .expect_set_ranked_score()
            .with(eq(7), eq(20))
            .times(1)
            .returning(|_, _| Ok(()));

        let ledger = PointsLedger::new(Arc::new(store));
        assert!(ledger.add_points(7, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_compensation_returns_index_error() {
        let mut store = MockScoreStore::new();
        store
            .expect_increment_score()
            .with(eq(42), eq(10))
            .times(1)
            .returning(|_, _| Ok(10));
        store
            .expect_set_ranked_score()
            .times(1)
            .returning(|_, _| Err(index_down()));
        store
            .expect_increment_score()
            .with(eq(42), eq(-10))
            .times(1)
            .returning(|_, _| Err(GamificationError::Internal("hincrby timeout".to_string())));

        let ledger = PointsLedger::new(Arc::new(store));
        let err = ledger.add_points(42, 10).await.unwrap_err();

        assert_eq!(err.kind(), "ledger_update");
        assert!(err.to_string().contains("zadd"));
        assert!(!err.to_string().contains("hincrby"));
    }

    #[tokio::test]
    async fn test_counter_failure_skips_index_write() {
        let mut store = MockScoreStore::new();
        store
            .expect_increment_score()
            .times(1)
            .returning(|_, _| Err(GamificationError::Internal("down".to_string())));
        store.expect_set_ranked_score().never();

        let ledger = PointsLedger::new(Arc::new(store));
        assert!(ledger.add_points(1, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_unrepresentable_compensation_is_not_attempted() {
        let mut store = MockScoreStore::new();
        store
            .expect_increment_score()
            .with(eq(1), eq(i64::MIN))
            .times(1)
            .returning(|_, _| Ok(i64::MIN));
        store
            .expect_set_ranked_score()
            .times(1)
            .returning(|_, _| Err(index_down()));

        let ledger = PointsLedger::new(Arc::new(store));
        assert!(ledger.add_points(1, i64::MIN).await.is_err());
    }

    #[tokio::test]
    async fn test_atomic_mode_uses_single_store_call() {
        let mut store = MockScoreStore::new();
        store
            .expect_increment_and_rank()
            .with(eq(42), eq(10))
            .times(1)
            .returning(|_, _| Ok(10));
        store.expect_increment_score().never();
        store.expect_set_ranked_score().never();

        let ledger = PointsLedger::new(Arc::new(store)).with_mode(LedgerMode::Atomic);
        assert_eq!(ledger.mode(), LedgerMode::Atomic);
        assert_eq!(ledger.add_points(42, 10).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_reconcile_repairs_index_from_counter() {
        let mut store = MockScoreStore::new();
        store.expect_stored_score().returning(|_| Ok(Some(40)));
        store.expect_ranked_score().returning(|_| Ok(Some(30)));
        store
            .expect_set_ranked_score()
            .with(eq(9), eq(40))
            .times(1)
            .returning(|_, _| Ok(()));

        let ledger = PointsLedger::new(Arc::new(store));
        assert_eq!(
            ledger.reconcile(9).await.unwrap(),
            ReconcileOutcome::Repaired {
                score: 40,
                previous: Some(30)
            }
        );
    }

    #[tokio::test]
    async fn test_reconcile_reports_without_writing() {
        let mut store = MockScoreStore::new();
        store.expect_stored_score().returning(|user_id| {
            Ok(match user_id {
                1 => Some(10),
                _ => None,
            })
        });
        store.expect_ranked_score().returning(|user_id| {
            Ok(match user_id {
                1 => Some(10),
                2 => Some(5),
                _ => None,
            })
        });
        store.expect_set_ranked_score().never();

        let ledger = PointsLedger::new(Arc::new(store));
        assert_eq!(
            ledger.reconcile(1).await.unwrap(),
            ReconcileOutcome::Consistent { score: 10 }
        );
        assert_eq!(
            ledger.reconcile(2).await.unwrap(),
            ReconcileOutcome::Orphaned { ranked: 5 }
        );
        assert_eq!(ledger.reconcile(3).await.unwrap(), ReconcileOutcome::NoRecord);
    }

    #[test]
    fn test_mode_from_flag() {
        assert_eq!(LedgerMode::from_atomic_flag(false), LedgerMode::Compensating);
        assert_eq!(LedgerMode::from_atomic_flag(true), LedgerMode::Atomic);
    }
}
