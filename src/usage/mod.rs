//! 用量统计模块
//!
//! 提供按日期分区的追加日志和统计查询接口

pub mod model;
pub mod store;
mod handlers;
mod router;

pub use model::{UsageEvent, UsageKind};
pub use router::create_usage_router;
pub use store::UsageLog;
