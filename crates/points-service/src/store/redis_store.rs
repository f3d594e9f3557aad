//! Redis 实现
//!
//! 键布局：
//! - `user:{id}`：哈希，`score` 字段为累计积分
//! - `leaderboard:global`：有序集合，member 为用户 ID 字符串，score 为累计积分
//!
//! 有序集合以双精度浮点保存分数，绝对值不超过 2^53 时精确。

use std::collections::HashMap;

use async_trait::async_trait;
use gamification_shared::config::RedisConfig;
use gamification_shared::error::{GamificationError, Result};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, info, instrument};

use super::{RankedScore, ScoreStore, leaderboard_order};

const LEADERBOARD_KEY: &str = "leaderboard:global";
const USER_KEY_PREFIX: &str = "user:";
const SCORE_FIELD: &str = "score";

/// 在一个脚本内完成自增与排行写入，Redis 保证脚本执行期间不会穿插其他命令
const INCREMENT_AND_RANK_SCRIPT: &str = r"
local score = redis.call('HINCRBY', KEYS[1], ARGV[1], ARGV[2])
redis.call('ZADD', KEYS[2], score, ARGV[3])
return score
";

fn user_key(user_id: i64) -> String {
    format!("{USER_KEY_PREFIX}{user_id}")
}

fn parse_member(member: &str) -> Result<i64> {
    member
        .parse()
        .map_err(|_| GamificationError::Internal(format!("排行榜成员不是合法的用户 ID: {member}")))
}

/// 用边界分数的全部同分成员替换 ZREVRANGE 截断处的成员，再按排行榜顺序截取
///
/// Redis 对同分成员按字典序倒排，截断处可能丢掉 ID 更小的同分用户。
fn merge_boundary_ties(
    mut head: Vec<RankedScore>,
    boundary: i64,
    tied: &[i64],
    limit: usize,
) -> Vec<RankedScore> {
    head.retain(|e| e.score != boundary);
    head.extend(tied.iter().map(|id| RankedScore::new(*id, boundary)));
    head.sort_by(leaderboard_order);
    head.truncate(limit);
    head
}

/// 零基排名：分数更高的人数加上同分中 ID 更小的人数
fn tied_rank(higher: u64, tied: &[i64], user_id: i64) -> u64 {
    higher + tied.iter().filter(|id| **id < user_id).count() as u64
}

/// 基于 Redis 的积分存储
#[derive(Clone)]
pub struct RedisScoreStore {
    client: Client,
    increment_script: Script,
}

impl RedisScoreStore {
    /// 创建 Redis 客户端，此时不建立连接
    pub fn new(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        info!("Redis client created");
        Ok(Self {
            client,
            increment_script: Script::new(INCREMENT_AND_RANK_SCRIPT),
        })
    }

    async fn get_conn(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(GamificationError::from)
    }

    /// 健康检查
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.get_conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(GamificationError::from)
    }

    /// 与 score 同分的全部用户 ID
    async fn members_with_score(
        &self,
        conn: &mut MultiplexedConnection,
        score: i64,
    ) -> Result<Vec<i64>> {
        let members: Vec<String> = conn.zrangebyscore(LEADERBOARD_KEY, score, score).await?;
        members.iter().map(|m| parse_member(m)).collect()
    }
}

#[async_trait]
impl ScoreStore for RedisScoreStore {
    #[instrument(skip(self))]
    async fn increment_score(&self, user_id: i64, delta: i64) -> Result<i64> {
        let mut conn = self.get_conn().await?;
        let score: i64 = conn.hincr(user_key(user_id), SCORE_FIELD, delta).await?;
        Ok(score)
    }

    #[instrument(skip(self))]
    async fn set_ranked_score(&self, user_id: i64, score: i64) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let _: () = conn
            .zadd(LEADERBOARD_KEY, user_id.to_string(), score)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn increment_and_rank(&self, user_id: i64, delta: i64) -> Result<i64> {
        let mut conn = self.get_conn().await?;
        let score: i64 = self
            .increment_script
            .key(user_key(user_id))
            .key(LEADERBOARD_KEY)
            .arg(SCORE_FIELD)
            .arg(delta)
            .arg(user_id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(score)
    }

    async fn stored_score(&self, user_id: i64) -> Result<Option<i64>> {
        let mut conn = self.get_conn().await?;
        let score: Option<i64> = conn.hget(user_key(user_id), SCORE_FIELD).await?;
        Ok(score)
    }

    async fn ranked_score(&self, user_id: i64) -> Result<Option<i64>> {
        let mut conn = self.get_conn().await?;
        let score: Option<f64> = conn.zscore(LEADERBOARD_KEY, user_id.to_string()).await?;
        Ok(score.map(|s| s as i64))
    }

    async fn user_stats(&self, user_id: i64) -> Result<HashMap<String, String>> {
        let mut conn = self.get_conn().await?;
        let stats: HashMap<String, String> = conn.hgetall(user_key(user_id)).await?;
        Ok(stats)
    }

    #[instrument(skip(self))]
    async fn top_scores(&self, limit: usize) -> Result<Vec<RankedScore>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.get_conn().await?;
        let stop = isize::try_from(limit - 1).unwrap_or(isize::MAX);
        let head: Vec<(String, f64)> = conn
            .zrevrange_withscores(LEADERBOARD_KEY, 0, stop)
            .await?;

        let mut entries = head
            .iter()
            .map(|(member, score)| Ok(RankedScore::new(parse_member(member)?, *score as i64)))
            .collect::<Result<Vec<_>>>()?;

        let boundary = entries
            .last()
            .map(|e| e.score)
            .filter(|_| entries.len() == limit);
        match boundary {
            Some(boundary) => {
                let tied = self.members_with_score(&mut conn, boundary).await?;
                debug!(boundary, tied = tied.len(), "补齐排行榜边界同分成员");
                Ok(merge_boundary_ties(entries, boundary, &tied, limit))
            }
            None => {
                entries.sort_by(leaderboard_order);
                Ok(entries)
            }
        }
    }

    async fn rank_of(&self, user_id: i64) -> Result<Option<u64>> {
        let mut conn = self.get_conn().await?;
        let score: Option<f64> = conn.zscore(LEADERBOARD_KEY, user_id.to_string()).await?;
        let Some(score) = score.map(|s| s as i64) else {
            return Ok(None);
        };

        let higher: u64 = conn
            .zcount(LEADERBOARD_KEY, format!("({score}"), "+inf")
            .await?;
        let tied = self.members_with_score(&mut conn, score).await?;

        Ok(Some(tied_rank(higher, &tied, user_id)))
    }
}
