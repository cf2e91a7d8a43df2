//! 乘客积分对账核心
//!
//! 消费上游派单系统的注册、行程创建、行程完成三类事件，
//! 在至少一次、无序、可能重复的投递下把它们对账为一致的乘客与行程状态。
//!
//! ## 模块结构
//!
//! - `calculator`: 等级阶梯与积分计算（纯函数）
//! - `events`: 事件负载的解码与校验
//! - `reconciler`: 三个幂等事件处理器
//! - `query`: 会员信息、平均消费与积分扣减
//! - `store`: 存储接口及 PostgreSQL / 内存实现

pub mod calculator;
pub mod error;
pub mod events;
pub mod models;
pub mod query;
pub mod reconciler;
pub mod store;

pub use calculator::LoyaltyCalculator;
pub use error::{LoyaltyError, Result};
pub use models::{LoyaltyInfo, LoyaltyStatus, Ride, RideState, Rider};
pub use query::RiderQueryService;
pub use reconciler::{EventReconciler, HandleOutcome};
