//! 存储 Trait 定义
//!
//! 每个写操作都是一个原子工作单元，调用方不需要也不允许在两次调用之间持锁。
//! 行程完成是唯一跨两张表的写操作，翻转与记账必须一起生效或一起失败。
//! 处理器依赖这些接口而非具体实现，便于 mock 测试与内存实现替换。

use async_trait::async_trait;

use crate::calculator::{LoyaltyCalculator, RideAward};
use crate::error::Result;
use crate::models::{LoyaltyStatus, NewRide, NewRider, Ride, RideState, Rider};

/// insert-if-absent 的结果，两种情况都会带回当前存储中的记录
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome<T> {
    /// 本次调用写入了新记录
    Inserted(T),
    /// 记录已存在，未做任何修改
    Existing(T),
}

impl<T> InsertOutcome<T> {
    pub fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Self::Inserted(value) | Self::Existing(value) => value,
        }
    }
}

/// 原子自增量，points 与 ride_count 必须在同一条语句中更新
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiderIncrement {
    pub points: i64,
    pub ride_count: i64,
}

/// 条件更新的前置条件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiderCondition {
    /// 当前等级严格低于给定等级（只升不降）
    StatusBelow(LoyaltyStatus),
    /// 当前积分不少于给定值（扣减积分不会变成负数）
    PointsAtLeast(i64),
    /// 尚未设置名字（幽灵乘客）
    NameMissing,
}

impl RiderCondition {
    pub fn matches(&self, rider: &Rider) -> bool {
        match self {
            Self::StatusBelow(target) => rider.status < *target,
            Self::PointsAtLeast(points) => rider.points >= *points,
            Self::NameMissing => rider.name.is_none(),
        }
    }
}

/// 条件满足时应用的修改
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RiderPatch {
    pub status: Option<LoyaltyStatus>,
    pub name: Option<String>,
    pub points_delta: i64,
}

impl RiderPatch {
    pub fn status(status: LoyaltyStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn points_delta(delta: i64) -> Self {
        Self {
            points_delta: delta,
            ..Default::default()
        }
    }

    /// 在内存记录上应用修改
    pub fn apply(&self, rider: &mut Rider) {
        if let Some(status) = self.status {
            rider.status = status;
        }
        if let Some(name) = &self.name {
            rider.name = Some(name.clone());
        }
        rider.points += self.points_delta;
    }
}

/// 行程状态迁移结果
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// 本次调用完成了迁移
    Transitioned(Ride),
    /// 行程已处于目标状态，未做修改
    AlreadyInTarget(Ride),
    /// 行程不存在
    Absent,
}

/// 行程完成请求，行程不存在时按这些数据直接插入
#[derive(Debug, Clone, PartialEq)]
pub struct RideCompletion {
    pub ride_id: String,
    pub rider_id: String,
    pub amount: f64,
}

/// 行程完成结果
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    /// 本次调用把行程置为 completed，并在同一工作单元内给乘客记了账
    Awarded {
        ride: Ride,
        rider: Rider,
        award: RideAward,
        previous_status: LoyaltyStatus,
    },
    /// 行程早已完成，未做任何修改
    AlreadyCompleted(Ride),
}

/// 某乘客在某等级下的行程金额汇总
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AmountSummary {
    pub count: i64,
    pub total: f64,
}

impl AmountSummary {
    /// 平均金额，没有行程时为 0
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }
}

/// 乘客存储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RiderStore: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Rider>>;

    async fn insert_if_absent(&self, rider: NewRider) -> Result<InsertOutcome<Rider>>;

    /// 原子自增，乘客不存在时返回 None
    async fn atomic_increment(&self, id: &str, increment: RiderIncrement)
    -> Result<Option<Rider>>;

    /// 条件满足时原子应用修改并返回新记录；条件不满足或乘客不存在时返回 None
    async fn conditional_update(
        &self,
        id: &str,
        condition: RiderCondition,
        patch: RiderPatch,
    ) -> Result<Option<Rider>>;
}

/// 行程存储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RideStore: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Ride>>;

    async fn insert_if_absent(&self, ride: NewRide) -> Result<InsertOutcome<Ride>>;

    /// 原子地把行程从 `from` 迁移到 `to`
    async fn transition_state(
        &self,
        id: &str,
        from: RideState,
        to: RideState,
    ) -> Result<TransitionOutcome>;

    /// 完成行程并给乘客记账
    ///
    /// 行程为 created 时翻转为 completed，不存在时按 `completion` 直接插入为 completed
    /// （等级快照取乘客当前等级）。随后在同一工作单元内按 `calculator` 给行程所属乘客
    /// 加积分、行程数加一并做只升不降的等级调整。任一步失败则什么都不生效。
    /// 行程已是 completed 时不做任何修改。乘客必须已存在。
    async fn complete_and_award(
        &self,
        completion: RideCompletion,
        calculator: &LoyaltyCalculator,
    ) -> Result<CompletionOutcome>;

    async fn amount_summary(&self, rider_id: &str, status: LoyaltyStatus)
    -> Result<AmountSummary>;
}
