//! 积分计算器
//!
//! 纯函数：根据完成行程数推导等级，根据等级与金额计算积分。
//! 不做 I/O，不持有可变状态，可在任意线程共享。

use loyalty_shared::config::LoyaltyConfig;

use crate::error::{LoyaltyError, Result};
use crate::models::{LoyaltyStatus, Rider};

/// 等级阶梯中的一档
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tier {
    status: LoyaltyStatus,
    /// 进入该等级所需的最少完成行程数
    min_rides: i64,
    /// 每单位金额奖励的积分
    multiplier: i64,
}

/// 完成一次行程给乘客带来的变化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RideAward {
    /// 按完成前的等级计算的积分
    pub points: i64,
    /// 完成后的行程数
    pub ride_count: i64,
    /// 完成后的等级，不低于完成前的等级
    pub status: LoyaltyStatus,
}

impl RideAward {
    pub fn apply(&self, rider: &mut Rider) {
        rider.points += self.points;
        rider.ride_count = self.ride_count;
        rider.status = self.status;
    }
}

/// 积分计算器
#[derive(Debug, Clone)]
pub struct LoyaltyCalculator {
    /// 按 min_rides 升序排列，首档恒为 bronze / 0
    tiers: [Tier; 4],
}

impl Default for LoyaltyCalculator {
    fn default() -> Self {
        Self::build(&LoyaltyConfig::default())
    }
}

impl LoyaltyCalculator {
    /// 从配置构建计算器，门槛必须为正且严格递增，倍率不能为负
    pub fn new(config: &LoyaltyConfig) -> Result<Self> {
        let t = &config.thresholds;
        if t.silver <= 0 || t.gold <= t.silver || t.platinum <= t.gold {
            return Err(LoyaltyError::Configuration(format!(
                "等级门槛必须为正且严格递增: silver={}, gold={}, platinum={}",
                t.silver, t.gold, t.platinum
            )));
        }

        let m = &config.multipliers;
        if [m.bronze, m.silver, m.gold, m.platinum].iter().any(|v| *v < 0) {
            return Err(LoyaltyError::Configuration(format!(
                "积分倍率不能为负数: bronze={}, silver={}, gold={}, platinum={}",
                m.bronze, m.silver, m.gold, m.platinum
            )));
        }

        Ok(Self::build(config))
    }

    fn build(config: &LoyaltyConfig) -> Self {
        let t = &config.thresholds;
        let m = &config.multipliers;
        Self {
            tiers: [
                Tier {
                    status: LoyaltyStatus::Bronze,
                    min_rides: 0,
                    multiplier: m.bronze,
                },
                Tier {
                    status: LoyaltyStatus::Silver,
                    min_rides: t.silver,
                    multiplier: m.silver,
                },
                Tier {
                    status: LoyaltyStatus::Gold,
                    min_rides: t.gold,
                    multiplier: m.gold,
                },
                Tier {
                    status: LoyaltyStatus::Platinum,
                    min_rides: t.platinum,
                    multiplier: m.platinum,
                },
            ],
        }
    }

    fn tier(&self, status: LoyaltyStatus) -> &Tier {
        // tiers 与 LoyaltyStatus 的声明顺序一一对应
        &self.tiers[status as usize]
    }

    /// 距离下一等级还需完成的行程数，最高等级返回 0
    pub fn remaining_rides_to_next_tier(&self, ride_count: i64) -> i64 {
        let ride_count = ride_count.max(0);
        self.tiers
            .iter()
            .find(|tier| tier.min_rides > ride_count)
            .map_or(0, |tier| tier.min_rides - ride_count)
    }

    /// 单次行程奖励的积分：等级倍率 × 金额向下取整
    pub fn points_for_ride(&self, status: LoyaltyStatus, amount: f64) -> i64 {
        if !amount.is_finite() || amount <= 0.0 {
            return 0;
        }
        // f64 -> i64 的 as 转换对超大值饱和
        let units = amount.floor() as i64;
        self.tier(status).multiplier.saturating_mul(units)
    }

    /// 完成行程数对应的等级
    pub fn status_for_ride_count(&self, ride_count: i64) -> LoyaltyStatus {
        self.tiers
            .iter()
            .rev()
            .find(|tier| ride_count >= tier.min_rides)
            .map_or(LoyaltyStatus::Bronze, |tier| tier.status)
    }

    /// 乘客完成一次金额为 `amount` 的行程后的积分、行程数与等级
    pub fn award_for_ride(&self, rider: &Rider, amount: f64) -> RideAward {
        let ride_count = rider.ride_count + 1;
        RideAward {
            points: self.points_for_ride(rider.status, amount),
            ride_count,
            status: rider.status.max(self.status_for_ride_count(ride_count)),
        }
    }

    /// 下一等级，最高等级返回 None
    pub fn next_status(&self, status: LoyaltyStatus) -> Option<LoyaltyStatus> {
        self.tiers
            .iter()
            .map(|tier| tier.status)
            .find(|candidate| *candidate > status)
    }

    pub fn multiplier(&self, status: LoyaltyStatus) -> i64 {
        self.tier(status).multiplier
    }
}
