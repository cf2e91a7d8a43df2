//! 内存存储实现
//!
//! 基于 DashMap 的分片锁，每个操作在持有条目锁期间完成检查与修改，
//! 与 PostgreSQL 实现提供相同的原子性。行程存储与乘客存储共享乘客表，
//! 行程完成时先持行程条目、再持乘客条目，两者一起修改。用于单元测试与场景测试。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::traits::{
    AmountSummary, CompletionOutcome, InsertOutcome, RideCompletion, RideStore, RiderCondition,
    RiderIncrement, RiderPatch, RiderStore, TransitionOutcome,
};
use crate::calculator::LoyaltyCalculator;
use crate::error::{LoyaltyError, Result};
use crate::models::{LoyaltyStatus, NewRide, NewRider, Ride, RideState, Rider};

/// 内存乘客存储，克隆后共享同一份数据
#[derive(Clone, Default)]
pub struct MemoryRiderStore {
    riders: Arc<DashMap<String, Rider>>,
}

impl MemoryRiderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.riders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.riders.is_empty()
    }
}

#[async_trait]
impl RiderStore for MemoryRiderStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<Rider>> {
        Ok(self.riders.get(id).map(|r| r.value().clone()))
    }

    async fn insert_if_absent(&self, rider: NewRider) -> Result<InsertOutcome<Rider>> {
        let outcome = match self.riders.entry(rider.id.clone()) {
            Entry::Occupied(entry) => InsertOutcome::Existing(entry.get().clone()),
            Entry::Vacant(entry) => {
                let inserted = entry.insert(rider.into_rider(Utc::now()));
                InsertOutcome::Inserted(inserted.value().clone())
            }
        };
        Ok(outcome)
    }

    async fn atomic_increment(
        &self,
        id: &str,
        increment: RiderIncrement,
    ) -> Result<Option<Rider>> {
        Ok(self.riders.get_mut(id).map(|mut rider| {
            rider.points += increment.points;
            rider.ride_count += increment.ride_count;
            rider.updated_at = Utc::now();
            rider.value().clone()
        }))
    }

    async fn conditional_update(
        &self,
        id: &str,
        condition: RiderCondition,
        patch: RiderPatch,
    ) -> Result<Option<Rider>> {
        let Some(mut rider) = self.riders.get_mut(id) else {
            return Ok(None);
        };

        if !condition.matches(&rider) {
            return Ok(None);
        }

        patch.apply(&mut rider);
        rider.updated_at = Utc::now();
        Ok(Some(rider.value().clone()))
    }
}

/// 内存行程存储
#[derive(Clone)]
pub struct MemoryRideStore {
    rides: Arc<DashMap<String, Ride>>,
    riders: Arc<DashMap<String, Rider>>,
}

impl MemoryRideStore {
    /// 行程完成要给乘客记账，因此与给定的乘客存储共享数据
    pub fn new(riders: &MemoryRiderStore) -> Self {
        Self {
            rides: Arc::default(),
            riders: riders.riders.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.rides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rides.is_empty()
    }
}

#[async_trait]
impl RideStore for MemoryRideStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<Ride>> {
        Ok(self.rides.get(id).map(|r| r.value().clone()))
    }

    async fn insert_if_absent(&self, ride: NewRide) -> Result<InsertOutcome<Ride>> {
        let outcome = match self.rides.entry(ride.id.clone()) {
            Entry::Occupied(entry) => InsertOutcome::Existing(entry.get().clone()),
            Entry::Vacant(entry) => {
                let inserted = entry.insert(ride.into_ride(Utc::now()));
                InsertOutcome::Inserted(inserted.value().clone())
            }
        };
        Ok(outcome)
    }

    async fn transition_state(
        &self,
        id: &str,
        from: RideState,
        to: RideState,
    ) -> Result<TransitionOutcome> {
        let Some(mut ride) = self.rides.get_mut(id) else {
            return Ok(TransitionOutcome::Absent);
        };

        if ride.state == from {
            ride.state = to;
            ride.updated_at = Utc::now();
            Ok(TransitionOutcome::Transitioned(ride.value().clone()))
        } else {
            Ok(TransitionOutcome::AlreadyInTarget(ride.value().clone()))
        }
    }

    async fn complete_and_award(
        &self,
        completion: RideCompletion,
        calculator: &LoyaltyCalculator,
    ) -> Result<CompletionOutcome> {
        let now = Utc::now();

        match self.rides.entry(completion.ride_id.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().state == RideState::Completed {
                    return Ok(CompletionOutcome::AlreadyCompleted(entry.get().clone()));
                }

                let mut rider = self
                    .riders
                    .get_mut(&entry.get().rider_id)
                    .ok_or_else(|| LoyaltyError::rider_not_found(&entry.get().rider_id))?;
                let previous_status = rider.status;
                let award = calculator.award_for_ride(&rider, entry.get().amount);
                award.apply(&mut rider);
                rider.updated_at = now;

                let ride = entry.get_mut();
                ride.state = RideState::Completed;
                ride.updated_at = now;

                Ok(CompletionOutcome::Awarded {
                    ride: ride.clone(),
                    rider: rider.value().clone(),
                    award,
                    previous_status,
                })
            }
            Entry::Vacant(entry) => {
                let mut rider = self
                    .riders
                    .get_mut(&completion.rider_id)
                    .ok_or_else(|| LoyaltyError::rider_not_found(&completion.rider_id))?;
                let previous_status = rider.status;
                let award = calculator.award_for_ride(&rider, completion.amount);
                award.apply(&mut rider);
                rider.updated_at = now;

                let ride = NewRide {
                    id: completion.ride_id,
                    rider_id: completion.rider_id,
                    amount: completion.amount,
                    rider_status: previous_status,
                    state: RideState::Completed,
                }
                .into_ride(now);
                entry.insert(ride.clone());

                Ok(CompletionOutcome::Awarded {
                    ride,
                    rider: rider.value().clone(),
                    award,
                    previous_status,
                })
            }
        }
    }

    async fn amount_summary(
        &self,
        rider_id: &str,
        status: LoyaltyStatus,
    ) -> Result<AmountSummary> {
        let summary = self
            .rides
            .iter()
            .filter(|ride| ride.rider_id == rider_id && ride.rider_status == status)
            .fold(AmountSummary::default(), |acc, ride| AmountSummary {
                count: acc.count + 1,
                total: acc.total + ride.amount,
            });
        Ok(summary)
    }
}
