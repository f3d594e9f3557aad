//! 内存实现
//!
//! 计数器用 DashMap 做逐用户原子自增，排行索引用有序集合维护，
//! 语义与 Redis 实现一致，供测试和本地调试使用。

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use gamification_shared::error::{GamificationError, Result};
use parking_lot::RwLock;

use super::{RankedScore, ScoreStore};

const SCORE_FIELD: &str = "score";

#[derive(Default)]
struct RankedIndex {
    scores: HashMap<i64, i64>,
    /// (Reverse(score), user_id)，迭代顺序即排行榜顺序
    order: BTreeSet<(Reverse<i64>, i64)>,
}

impl RankedIndex {
    fn set(&mut self, user_id: i64, score: i64) {
        if let Some(previous) = self.scores.insert(user_id, score) {
            self.order.remove(&(Reverse(previous), user_id));
        }
        self.order.insert((Reverse(score), user_id));
    }
}

/// 基于进程内数据结构的积分存储
#[derive(Clone, Default)]
pub struct MemoryScoreStore {
    counters: Arc<DashMap<i64, i64>>,
    index: Arc<RwLock<RankedIndex>>,
}

/// 与 Redis HINCRBY 一致：溢出时报错，计数器保持原值
fn checked_increment(counter: &mut i64, user_id: i64, delta: i64) -> Result<i64> {
    *counter = counter.checked_add(delta).ok_or_else(|| {
        GamificationError::Internal(format!(
            "用户 {user_id} 积分溢出: {counter} + {delta}"
        ))
    })?;
    Ok(*counter)
}

impl MemoryScoreStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已有积分记录的用户数
    pub fn user_count(&self) -> usize {
        self.counters.len()
    }
}

#[async_trait]
impl ScoreStore for MemoryScoreStore {
    async fn increment_score(&self, user_id: i64, delta: i64) -> Result<i64> {
        let mut counter = self.counters.entry(user_id).or_insert(0);
        checked_increment(&mut counter, user_id, delta)
    }

    async fn set_ranked_score(&self, user_id: i64, score: i64) -> Result<()> {
        self.index.write().set(user_id, score);
        Ok(())
    }

    async fn increment_and_rank(&self, user_id: i64, delta: i64) -> Result<i64> {
        // 持有索引写锁期间完成两步，排行索引的写入顺序与计数器一致
        let mut index = self.index.write();
        let score = {
            let mut counter = self.counters.entry(user_id).or_insert(0);
            checked_increment(&mut counter, user_id, delta)?
        };
        index.set(user_id, score);
        Ok(score)
    }

    async fn stored_score(&self, user_id: i64) -> Result<Option<i64>> {
        Ok(self.counters.get(&user_id).map(|c| *c))
    }

    async fn ranked_score(&self, user_id: i64) -> Result<Option<i64>> {
        Ok(self.index.read().scores.get(&user_id).copied())
    }

    async fn user_stats(&self, user_id: i64) -> Result<HashMap<String, String>> {
        Ok(self
            .counters
            .get(&user_id)
            .map(|c| HashMap::from([(SCORE_FIELD.to_string(), c.to_string())]))
            .unwrap_or_default())
    }

    async fn top_scores(&self, limit: usize) -> Result<Vec<RankedScore>> {
        Ok(self
            .index
            .read()
            .order
            .iter()
            .take(limit)
            .map(|(Reverse(score), user_id)| RankedScore::new(*user_id, *score))
            .collect())
    }

    async fn rank_of(&self, user_id: i64) -> Result<Option<u64>> {
        let index = self.index.read();
        let Some(score) = index.scores.get(&user_id).copied() else {
            return Ok(None);
        };
        let rank = index.order.range(..(Reverse(score), user_id)).count();
        Ok(Some(rank as u64))
    }
}
