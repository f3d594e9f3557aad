//! 积分存储层
//!
//! 同一份用户积分以两种物理结构保存：
//! - 计数器：每个用户一个哈希，`score` 字段支持原子自增
//! - 排行索引：全局有序集合，按分数倒序支持 Top-N 与排名查询
//!
//! 两者的同步由 `PointsLedger` 负责，存储层只提供单步操作。

mod memory_store;
mod redis_store;

pub use memory_store::MemoryScoreStore;
pub use redis_store::RedisScoreStore;

use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use gamification_shared::error::{GamificationError, Result};
use serde::{Deserialize, Serialize};

/// 排行索引中的一条记录
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedScore {
    pub user_id: i64,
    pub score: i64,
}

impl RankedScore {
    pub fn new(user_id: i64, score: i64) -> Self {
        Self { user_id, score }
    }
}

/// 排行榜顺序：分数降序，同分时用户 ID 小者在前
pub fn leaderboard_order(a: &RankedScore, b: &RankedScore) -> Ordering {
    b.score.cmp(&a.score).then(a.user_id.cmp(&b.user_id))
}

/// 积分存储接口
///
/// 除 `PointsLedger` 外，任何组件都不应调用写方法。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScoreStore: Send + Sync {
    // 写操作

    /// 原子地给计数器加上 delta，返回新的总分；用户不存在时从 0 开始
    async fn increment_score(&self, user_id: i64, delta: i64) -> Result<i64>;

    /// 把绝对分数写入排行索引
    async fn set_ranked_score(&self, user_id: i64, score: i64) -> Result<()>;

    /// 计数器自增与排行索引写入作为一个原子单元执行
    async fn increment_and_rank(&self, _user_id: i64, _delta: i64) -> Result<i64> {
        Err(GamificationError::Unsupported(
            "该存储不支持原子积分写入".to_string(),
        ))
    }

    // 读操作

    /// 计数器中的分数，用户无记录时返回 None
    async fn stored_score(&self, user_id: i64) -> Result<Option<i64>>;

    /// 排行索引中的分数，用户不在榜时返回 None
    async fn ranked_score(&self, user_id: i64) -> Result<Option<i64>>;

    /// 用户的全部统计字段；无记录时返回空表
    async fn user_stats(&self, user_id: i64) -> Result<HashMap<String, String>>;

    /// 按排行榜顺序返回前 limit 名
    async fn top_scores(&self, limit: usize) -> Result<Vec<RankedScore>>;

    /// 用户的零基排名，不在榜时返回 None
    async fn rank_of(&self, user_id: i64) -> Result<Option<u64>>;
}
