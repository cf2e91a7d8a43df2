//! 存储层
//!
//! 提供乘客与行程的数据访问接口，以及 PostgreSQL 与内存两套实现。
//!
//! ## 设计原则
//!
//! - 存储只负责持久化，积分规则由调用方传入的计算器提供
//! - 单表写操作对应一条原子条件语句；行程完成在一个事务内同时写行程与乘客
//! - 不使用跨调用的锁或事务
//! - 定义 trait 接口以支持 mock 测试

mod memory;
mod postgres;
mod traits;

pub use memory::{MemoryRideStore, MemoryRiderStore};
pub use postgres::{PgRideStore, PgRiderStore};
pub use traits::*;
