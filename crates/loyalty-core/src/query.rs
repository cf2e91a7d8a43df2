//! 乘客查询与积分扣减
//!
//! 对外读接口（会员信息、按等级的平均消费）与唯一的主动写操作（扣减积分）。

use std::sync::Arc;

use tracing::{info, instrument};

use crate::calculator::LoyaltyCalculator;
use crate::error::{LoyaltyError, Result};
use crate::models::{LoyaltyInfo, LoyaltyStatus, Rider};
use crate::store::{RideStore, RiderCondition, RiderPatch, RiderStore};

/// 乘客查询服务
pub struct RiderQueryService<R: RiderStore, D: RideStore> {
    riders: Arc<R>,
    rides: Arc<D>,
    calculator: LoyaltyCalculator,
}

impl<R: RiderStore, D: RideStore> RiderQueryService<R, D> {
    pub fn new(riders: Arc<R>, rides: Arc<D>, calculator: LoyaltyCalculator) -> Self {
        Self {
            riders,
            rides,
            calculator,
        }
    }

    async fn require_rider(&self, rider_id: &str) -> Result<Rider> {
        self.riders
            .find_by_id(rider_id)
            .await?
            .ok_or_else(|| LoyaltyError::rider_not_found(rider_id))
    }

    /// 会员信息：等级、积分、距离下一等级还需的行程数
    pub async fn loyalty_info(&self, rider_id: &str) -> Result<LoyaltyInfo> {
        let rider = self.require_rider(rider_id).await?;

        Ok(LoyaltyInfo {
            status: rider.status,
            points: rider.points,
            rides_to_next_status: self
                .calculator
                .remaining_rides_to_next_tier(rider.ride_count),
        })
    }

    /// 乘客在某等级期间创建的行程的平均金额，没有行程时为 0
    pub async fn average_spending(&self, rider_id: &str, status: LoyaltyStatus) -> Result<f64> {
        self.require_rider(rider_id).await?;

        let summary = self.rides.amount_summary(rider_id, status).await?;
        Ok(summary.average())
    }

    /// 扣减积分
    ///
    /// 单条条件更新（points >= 请求值），并发扣减不会让余额变为负数。
    #[instrument(skip(self))]
    pub async fn remove_points(&self, rider_id: &str, points: i64) -> Result<Rider> {
        if points <= 0 {
            return Err(LoyaltyError::InvalidArgument(format!(
                "扣减积分必须为正数: {points}"
            )));
        }

        let updated = self
            .riders
            .conditional_update(
                rider_id,
                RiderCondition::PointsAtLeast(points),
                RiderPatch::points_delta(-points),
            )
            .await?;

        if let Some(rider) = updated {
            info!(rider_id, removed = points, balance = rider.points, "已扣减积分");
            return Ok(rider);
        }

        // 条件未满足：区分乘客不存在与余额不足
        let rider = self.require_rider(rider_id).await?;
        Err(LoyaltyError::InsufficientPoints {
            requested: points,
            available: rider.points,
        })
    }
}
