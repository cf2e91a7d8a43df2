//! 事件对账处理器
//!
//! 三个处理器（注册、行程创建、行程完成）在至少一次、无序投递下保持幂等：
//! 同一负载重复调用任意次、以任意顺序到达，最终状态都与只处理一次相同。
//!
//! 积分只由"真正把行程翻转为 completed 的那次调用"发放，翻转与记账一起生效，
//! 观察到行程已完成的调用一律跳过乘客更新。跨实例协调只通过存储状态完成。

use std::sync::Arc;

use tracing::{info, instrument, warn};
use validator::Validate;

use loyalty_shared::observability::metrics::{record_points_awarded, record_tier_upgrade};

use crate::calculator::LoyaltyCalculator;
use crate::error::Result;
use crate::events::{RideCompletedEvent, RideCreatedEvent, RideEvent, SignupEvent};
use crate::models::{NewRide, NewRider, Ride, RideState, Rider};
use crate::store::{
    CompletionOutcome, InsertOutcome, RideCompletion, RideStore, RiderCondition, RiderPatch,
    RiderStore,
};

/// 处理结果，两者都是成功
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// 本次调用修改了存储
    Applied,
    /// 幂等空操作：重复投递或已被并发调用处理
    Duplicate,
}

impl HandleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Duplicate => "duplicate",
        }
    }
}

/// 事件对账器
pub struct EventReconciler<R: RiderStore, D: RideStore> {
    riders: Arc<R>,
    rides: Arc<D>,
    calculator: LoyaltyCalculator,
}

impl<R: RiderStore, D: RideStore> Clone for EventReconciler<R, D> {
    fn clone(&self) -> Self {
        Self {
            riders: self.riders.clone(),
            rides: self.rides.clone(),
            calculator: self.calculator.clone(),
        }
    }
}

impl<R: RiderStore, D: RideStore> EventReconciler<R, D> {
    pub fn new(riders: Arc<R>, rides: Arc<D>, calculator: LoyaltyCalculator) -> Self {
        Self {
            riders,
            rides,
            calculator,
        }
    }

    pub fn calculator(&self) -> &LoyaltyCalculator {
        &self.calculator
    }

    // ==================== 注册 ====================

    /// 处理乘客注册
    ///
    /// 乘客不存在时以最低等级、零积分插入；已存在时不触碰任何计数器，
    /// 若是幽灵乘客则补上名字。
    #[instrument(skip(self, event), fields(rider_id = %event.id))]
    pub async fn handle_signup(&self, event: &SignupEvent) -> Result<HandleOutcome> {
        event.validate()?;

        info!(rider_id = %event.id, name = %event.name, "收到乘客注册事件");

        let outcome = self
            .riders
            .insert_if_absent(NewRider::signup(&event.id, &event.name))
            .await?;

        let existing = match outcome {
            InsertOutcome::Inserted(_) => {
                info!(rider_id = %event.id, "已创建乘客");
                return Ok(HandleOutcome::Applied);
            }
            InsertOutcome::Existing(rider) => rider,
        };

        if !existing.is_ghost() {
            info!(rider_id = %event.id, "乘客已注册，忽略重复事件");
            return Ok(HandleOutcome::Duplicate);
        }

        let named = self
            .riders
            .conditional_update(
                &event.id,
                RiderCondition::NameMissing,
                RiderPatch::name(&event.name),
            )
            .await?;

        match named {
            Some(rider) => {
                info!(
                    rider_id = %event.id,
                    points = rider.points,
                    ride_count = rider.ride_count,
                    "幽灵乘客完成注册，保留已累计的积分"
                );
                Ok(HandleOutcome::Applied)
            }
            None => {
                info!(rider_id = %event.id, "乘客名字已被并发注册写入，忽略");
                Ok(HandleOutcome::Duplicate)
            }
        }
    }

    // ==================== 行程创建 ====================

    /// 处理行程创建
    ///
    /// 确保乘客存在后以当前等级快照插入行程；行程已存在（重复投递，
    /// 或已被先到的完成事件插入）时不覆盖其状态。
    #[instrument(skip(self, event), fields(ride_id = %event.id, rider_id = %event.rider_id))]
    pub async fn handle_ride_created(&self, event: &RideCreatedEvent) -> Result<HandleOutcome> {
        event.validate()?;

        info!(
            ride_id = %event.id,
            rider_id = %event.rider_id,
            amount = event.amount,
            "收到行程创建事件"
        );

        let rider = self.ensure_rider(&event.rider_id).await?;

        let outcome = self
            .rides
            .insert_if_absent(new_ride(event, &rider, RideState::Created))
            .await?;

        match outcome {
            InsertOutcome::Inserted(_) => {
                info!(
                    ride_id = %event.id,
                    rider_status = %rider.status,
                    "已创建行程"
                );
                Ok(HandleOutcome::Applied)
            }
            InsertOutcome::Existing(ride) => {
                warn_on_mismatch(&ride, event);
                info!(ride_id = %event.id, state = ride.state.as_str(), "行程已存在，忽略");
                Ok(HandleOutcome::Duplicate)
            }
        }
    }

    // ==================== 行程完成 ====================

    /// 处理行程完成
    ///
    /// 把行程置为 completed（或直接以 completed 插入）与给乘客记账由存储在同一工作单元内完成。
    /// 只有真正完成翻转的调用会加积分与行程数，并按新的行程数做只升不降的等级调整；
    /// 任一步失败则什么都不生效，重投时从头再来。
    #[instrument(skip(self, event), fields(ride_id = %event.id, rider_id = %event.rider_id))]
    pub async fn handle_ride_completed(
        &self,
        event: &RideCompletedEvent,
    ) -> Result<HandleOutcome> {
        event.validate()?;

        info!(
            ride_id = %event.id,
            rider_id = %event.rider_id,
            amount = event.amount,
            "收到行程完成事件"
        );

        // 行程可能要以完成状态直接插入，乘客需先存在
        self.ensure_rider(&event.rider_id).await?;

        let outcome = self
            .rides
            .complete_and_award(
                RideCompletion {
                    ride_id: event.id.clone(),
                    rider_id: event.rider_id.clone(),
                    amount: event.amount,
                },
                &self.calculator,
            )
            .await?;

        match outcome {
            CompletionOutcome::AlreadyCompleted(ride) => {
                warn_on_mismatch(&ride, event);
                info!(ride_id = %event.id, "行程已完成，忽略重复事件");
                Ok(HandleOutcome::Duplicate)
            }
            CompletionOutcome::Awarded {
                ride,
                rider,
                award,
                previous_status,
            } => {
                warn_on_mismatch(&ride, event);
                record_points_awarded(award.points);
                info!(
                    ride_id = %ride.id,
                    rider_id = %ride.rider_id,
                    points_awarded = award.points,
                    points = rider.points,
                    ride_count = rider.ride_count,
                    "已更新乘客积分"
                );

                if rider.status > previous_status {
                    record_tier_upgrade(rider.status.as_str());
                    info!(
                        rider_id = %ride.rider_id,
                        from = %previous_status,
                        to = %rider.status,
                        "乘客等级提升"
                    );
                }
                Ok(HandleOutcome::Applied)
            }
        }
    }

    /// 确保乘客存在，不存在时插入幽灵乘客
    async fn ensure_rider(&self, rider_id: &str) -> Result<Rider> {
        let outcome = self
            .riders
            .insert_if_absent(NewRider::ghost(rider_id))
            .await?;

        if outcome.is_inserted() {
            info!(rider_id, "乘客不存在，已创建幽灵乘客");
        }
        Ok(outcome.into_inner())
    }
}

fn new_ride(event: &RideEvent, rider: &Rider, state: RideState) -> NewRide {
    NewRide {
        id: event.id.clone(),
        rider_id: event.rider_id.clone(),
        amount: event.amount,
        rider_status: rider.status,
        state,
    }
}

/// 同一行程 ID 的重复事件携带了不同的数据：保留已存储的版本
fn warn_on_mismatch(stored: &Ride, event: &RideEvent) {
    if stored.rider_id != event.rider_id || stored.amount != event.amount {
        warn!(
            ride_id = %stored.id,
            stored_rider_id = %stored.rider_id,
            event_rider_id = %event.rider_id,
            stored_amount = stored.amount,
            event_amount = event.amount,
            "重复行程事件数据不一致，以已存储的数据为准"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoyaltyError;
    use crate::models::LoyaltyStatus;
    use crate::store::{MockRideStore, MockRiderStore};
    use chrono::Utc;
    use mockall::predicate::eq;

    const RIDE_ID: &str = "5f1f7a3c9b1e8a0012345678";
    const RIDER_ID: &str = "5f1f7a3c9b1e8a00abcdef01";

    fn ride_event(amount: f64) -> RideEvent {
        RideEvent {
            id: RIDE_ID.to_string(),
            amount,
            rider_id: RIDER_ID.to_string(),
        }
    }

    fn rider() -> Rider {
        NewRider::ghost(RIDER_ID).into_rider(Utc::now())
    }

    fn ride(state: RideState, amount: f64) -> Ride {
        NewRide {
            id: RIDE_ID.to_string(),
            rider_id: RIDER_ID.to_string(),
            amount,
            rider_status: LoyaltyStatus::Bronze,
            state,
        }
        .into_ride(Utc::now())
    }

    fn reconciler(
        riders: MockRiderStore,
        rides: MockRideStore,
    ) -> EventReconciler<MockRiderStore, MockRideStore> {
        EventReconciler::new(
            Arc::new(riders),
            Arc::new(rides),
            LoyaltyCalculator::default(),
        )
    }

    #[tokio::test]
    async fn test_malformed_event_touches_no_store() {
        // mock 没有任何期望：一旦被调用就会 panic
        let reconciler = reconciler(MockRiderStore::new(), MockRideStore::new());

        let err = reconciler
            .handle_ride_completed(&RideCompletedEvent(ride_event(-5.0)))
            .await
            .unwrap_err();
        assert!(matches!(err, LoyaltyError::MalformedMessage(_)));

        let err = reconciler
            .handle_signup(&SignupEvent {
                id: RIDER_ID.to_string(),
                name: "abc".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LoyaltyError::MalformedMessage(_)));
    }

    fn existing_rider(riders: &mut MockRiderStore) {
        riders
            .expect_insert_if_absent()
            .returning(|_| Ok(InsertOutcome::Existing(rider())));
    }

    #[tokio::test]
    async fn test_store_failure_is_propagated_unmodified() {
        let mut riders = MockRiderStore::new();
        existing_rider(&mut riders);
        let mut rides = MockRideStore::new();
        rides
            .expect_complete_and_award()
            .times(1)
            .returning(|_, _| Err(LoyaltyError::StoreUnavailable(sqlx::Error::PoolTimedOut)));

        let err = reconciler(riders, rides)
            .handle_ride_completed(&RideCompletedEvent(ride_event(20.0)))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            LoyaltyError::StoreUnavailable(sqlx::Error::PoolTimedOut)
        ));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_already_completed_ride_skips_rider_update() {
        // 除了确保乘客存在，乘客存储不应再被调用
        let mut riders = MockRiderStore::new();
        existing_rider(&mut riders);
        riders.expect_atomic_increment().never();
        riders.expect_conditional_update().never();

        let mut rides = MockRideStore::new();
        rides
            .expect_complete_and_award()
            .times(1)
            .returning(|_, _| Ok(CompletionOutcome::AlreadyCompleted(ride(RideState::Completed, 20.0))));

        let outcome = reconciler(riders, rides)
            .handle_ride_completed(&RideCompletedEvent(ride_event(20.0)))
            .await
            .unwrap();
        assert_eq!(outcome, HandleOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_completion_is_one_store_call_after_rider_exists() {
        let mut seq = mockall::Sequence::new();
        let mut riders = MockRiderStore::new();
        riders
            .expect_insert_if_absent()
            .with(eq(NewRider::ghost(RIDER_ID)))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|r| Ok(InsertOutcome::Inserted(r.into_rider(Utc::now()))));

        let mut rides = MockRideStore::new();
        rides
            .expect_complete_and_award()
            .withf(|completion, _| {
                *completion
                    == RideCompletion {
                        ride_id: RIDE_ID.to_string(),
                        rider_id: RIDER_ID.to_string(),
                        amount: 20.0,
                    }
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|completion, calculator| {
                let before = rider();
                let award = calculator.award_for_ride(&before, completion.amount);
                let mut after = before.clone();
                award.apply(&mut after);
                Ok(CompletionOutcome::Awarded {
                    ride: ride(RideState::Completed, completion.amount),
                    rider: after,
                    award,
                    previous_status: before.status,
                })
            });

        let outcome = reconciler(riders, rides)
            .handle_ride_completed(&RideCompletedEvent(ride_event(20.0)))
            .await
            .unwrap();
        assert_eq!(outcome, HandleOutcome::Applied);
    }

    #[tokio::test]
    async fn test_rider_failure_before_completion_leaves_ride_untouched() {
        let mut riders = MockRiderStore::new();
        riders
            .expect_insert_if_absent()
            .times(1)
            .returning(|_| Err(LoyaltyError::StoreUnavailable(sqlx::Error::PoolClosed)));
        let mut rides = MockRideStore::new();
        rides.expect_complete_and_award().never();

        let err = reconciler(riders, rides)
            .handle_ride_completed(&RideCompletedEvent(ride_event(20.0)))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_signup_for_existing_named_rider_is_duplicate() {
        let mut riders = MockRiderStore::new();
        riders.expect_insert_if_absent().times(1).returning(|_| {
            let mut r = rider();
            r.name = Some("Already Here".to_string());
            Ok(InsertOutcome::Existing(r))
        });
        riders.expect_conditional_update().never();

        let outcome = reconciler(riders, MockRideStore::new())
            .handle_signup(&SignupEvent {
                id: RIDER_ID.to_string(),
                name: "John Doe".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(outcome, HandleOutcome::Duplicate);
    }
}
