//! 只读查询
//!
//! 供 API 层调用，与账本写入并发执行且不做协调：读到的分数可能处于两步写入之间，
//! 这是可接受的最终一致。"从未得分"不是错误，存储连接故障才会返回错误。

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::PointsError;
use crate::store::{RankedScore, ScoreStore};

/// 排行榜条目
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub user_id: i64,
    pub score: i64,
}

impl From<RankedScore> for LeaderboardEntry {
    fn from(ranked: RankedScore) -> Self {
        Self {
            user_id: ranked.user_id,
            score: ranked.score,
        }
    }
}

/// 查询服务
#[derive(Clone)]
pub struct QueryService {
    store: Arc<dyn ScoreStore>,
}

impl QueryService {
    pub fn new(store: Arc<dyn ScoreStore>) -> Self {
        Self { store }
    }

    /// 用户的全部统计字段，无记录时返回空表
    #[instrument(skip(self))]
    pub async fn get_stats(&self, user_id: i64) -> Result<HashMap<String, String>, PointsError> {
        Ok(self.store.user_stats(user_id).await?)
    }

    /// 前 n 名，分数降序、同分时用户 ID 小者在前；n <= 0 返回空列表
    #[instrument(skip(self))]
    pub async fn get_top_users(&self, n: i64) -> Result<Vec<LeaderboardEntry>, PointsError> {
        let Ok(limit) = usize::try_from(n) else {
            return Ok(Vec::new());
        };
        if limit == 0 {
            return Ok(Vec::new());
        }

        let top = self.store.top_scores(limit).await?;
        Ok(top.into_iter().map(LeaderboardEntry::from).collect())
    }

    /// 用户的零基排名，排序规则与排行榜相同；不在榜时返回 None
    pub async fn get_user_rank(&self, user_id: i64) -> Result<Option<u64>, PointsError> {
        Ok(self.store.rank_of(user_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockScoreStore;
    use gamification_shared::error::GamificationError;
    use mockall::predicate::eq;

    #[tokio::test]
    async fn test_non_positive_n_does_not_touch_store() {
        let mut store = MockScoreStore::new();
        store.expect_top_scores().never();

        let query = QueryService::new(Arc::new(store));
        assert!(query.get_top_users(0).await.unwrap().is_empty());
        assert!(query.get_top_users(-1).await.unwrap().is_empty());
        assert!(query.get_top_users(i64::MIN).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_top_users_maps_entries() {
        let mut store = MockScoreStore::new();
        store
            .expect_top_scores()
            .with(eq(2))
            .times(1)
            .returning(|_| Ok(vec![RankedScore::new(42, 20), RankedScore::new(7, 10)]));

        let query = QueryService::new(Arc::new(store));
        let top = query.get_top_users(2).await.unwrap();
        assert_eq!(
            top,
            vec![
                LeaderboardEntry {
                    user_id: 42,
                    score: 20
                },
                LeaderboardEntry {
                    user_id: 7,
                    score: 10
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_store_failure_is_propagated() {
        let mut store = MockScoreStore::new();
        store
            .expect_user_stats()
            .returning(|_| Err(GamificationError::Internal("connection refused".to_string())));

        let query = QueryService::new(Arc::new(store));
        let err = query.get_stats(1).await.unwrap_err();
        assert_eq!(err.kind(), "infrastructure");
    }

    #[test]
    fn test_entry_serializes_snake_case() {
        let entry = LeaderboardEntry {
            user_id: 42,
            score: 20,
        };
        assert_eq!(
            serde_json::to_string(&entry).unwrap(),
            r#"{"user_id":42,"score":20}"#
        );
    }
}
