//! 积分与排行榜服务
//!
//! 消费上游服务发布到持久化队列中的领域事件（如课程完成），
//! 为用户累计积分并维护全局排行榜；同时向 API 层提供只读查询。
//!
//! 组件自底向上：
//! - `store`：积分计数器与排行榜的存储抽象（Redis / 内存）
//! - `ledger`：两步写入与失败补偿
//! - `dispatcher` / `handlers`：信封解码与按事件类型路由
//! - `consumer`：连接生命周期、确认策略与断线重连
//! - `query`：统计与排行榜查询

pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod query;
pub mod store;

pub use consumer::{ConsumerSettings, ConsumerState, QueueConsumer};
pub use dispatcher::{DispatchOutcome, EventDispatcher, EventHandler};
pub use error::PointsError;
pub use handlers::{AwardPolicy, FixedAward, LessonCompletedHandler};
pub use ledger::{LedgerMode, PointsLedger, ReconcileOutcome};
pub use query::{LeaderboardEntry, QueryService};
pub use store::{MemoryScoreStore, RankedScore, RedisScoreStore, ScoreStore};
