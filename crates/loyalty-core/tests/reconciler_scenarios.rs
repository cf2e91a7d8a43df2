//! 事件对账场景测试
//!
//! 基于内存存储验证重复投递、乱序到达与并发处理下的最终状态。
//! 内存存储与 PostgreSQL 实现提供相同的原子性，场景结论对两者都成立。

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use loyalty_core::events::{RideCompletedEvent, RideCreatedEvent, RideEvent, SignupEvent};
use loyalty_core::models::{NewRide, NewRider, Ride, Rider};
use loyalty_core::store::{
    AmountSummary, CompletionOutcome, InsertOutcome, MemoryRideStore, MemoryRiderStore,
    RideCompletion, RideStore, RiderCondition, RiderIncrement, RiderPatch, RiderStore,
    TransitionOutcome,
};
use loyalty_core::{
    EventReconciler, HandleOutcome, LoyaltyCalculator, LoyaltyError, LoyaltyStatus, RideState,
    RiderQueryService,
};

type Reconciler = EventReconciler<MemoryRiderStore, MemoryRideStore>;

// ==================== 辅助函数 ====================

struct Harness {
    riders: Arc<MemoryRiderStore>,
    rides: Arc<MemoryRideStore>,
    reconciler: Reconciler,
    query: RiderQueryService<MemoryRiderStore, MemoryRideStore>,
}

fn harness() -> Harness {
    let riders = MemoryRiderStore::new();
    let rides = Arc::new(MemoryRideStore::new(&riders));
    let riders = Arc::new(riders);
    let reconciler = EventReconciler::new(
        riders.clone(),
        rides.clone(),
        LoyaltyCalculator::default(),
    );
    let query = RiderQueryService::new(riders.clone(), rides.clone(), LoyaltyCalculator::default());
    Harness {
        riders,
        rides,
        reconciler,
        query,
    }
}

/// 生成 24 位十六进制 ID
fn object_id(n: u64) -> String {
    format!("{n:024x}")
}

fn signup(rider: u64) -> SignupEvent {
    SignupEvent {
        id: object_id(rider),
        name: "John Doe".to_string(),
    }
}

fn ride(ride: u64, rider: u64, amount: f64) -> RideEvent {
    RideEvent {
        id: object_id(1_000_000 + ride),
        amount,
        rider_id: object_id(rider),
    }
}

fn created(event: &RideEvent) -> RideCreatedEvent {
    RideCreatedEvent(event.clone())
}

fn completed(event: &RideEvent) -> RideCompletedEvent {
    RideCompletedEvent(event.clone())
}

/// 比较时忽略时间戳
async fn rider_state(h: &Harness, rider: u64) -> (Option<String>, LoyaltyStatus, i64, i64) {
    let r = h
        .riders
        .find_by_id(&object_id(rider))
        .await
        .unwrap()
        .expect("乘客应存在");
    (r.name, r.status, r.points, r.ride_count)
}

// ==================== 端到端场景 ====================

#[tokio::test]
async fn signup_creates_rider_with_defaults() {
    let h = harness();

    let outcome = h.reconciler.handle_signup(&signup(1)).await.unwrap();
    assert_eq!(outcome, HandleOutcome::Applied);

    let info = h.query.loyalty_info(&object_id(1)).await.unwrap();
    assert_eq!(info.status, LoyaltyStatus::Bronze);
    assert_eq!(info.points, 0);
    assert_eq!(info.rides_to_next_status, 20);
}

#[tokio::test]
async fn create_then_complete_awards_points_once() {
    let h = harness();
    h.reconciler.handle_signup(&signup(1)).await.unwrap();
    let event = ride(1, 1, 20.0);

    h.reconciler
        .handle_ride_created(&created(&event))
        .await
        .unwrap();
    let outcome = h
        .reconciler
        .handle_ride_completed(&completed(&event))
        .await
        .unwrap();
    assert_eq!(outcome, HandleOutcome::Applied);

    let expected = h
        .reconciler
        .calculator()
        .points_for_ride(LoyaltyStatus::Bronze, 20.0);
    let (_, status, points, ride_count) = rider_state(&h, 1).await;
    assert_eq!(status, LoyaltyStatus::Bronze);
    assert_eq!(points, expected);
    assert_eq!(ride_count, 1);

    // 重复投递不改变任何状态
    let outcome = h
        .reconciler
        .handle_ride_completed(&completed(&event))
        .await
        .unwrap();
    assert_eq!(outcome, HandleOutcome::Duplicate);
    assert_eq!(rider_state(&h, 1).await.2, expected);
    assert_eq!(rider_state(&h, 1).await.3, 1);
}

#[tokio::test]
async fn average_spending_over_rides_in_tier() {
    let h = harness();
    h.reconciler.handle_signup(&signup(1)).await.unwrap();
    for (n, amount) in [(1, 20.0), (2, 30.0)] {
        h.reconciler
            .handle_ride_created(&created(&ride(n, 1, amount)))
            .await
            .unwrap();
    }

    let average = h
        .query
        .average_spending(&object_id(1), LoyaltyStatus::Bronze)
        .await
        .unwrap();
    assert!((average - 25.0).abs() < f64::EPSILON);

    let none = h
        .query
        .average_spending(&object_id(1), LoyaltyStatus::Gold)
        .await
        .unwrap();
    assert_eq!(none, 0.0);
}

#[tokio::test]
async fn average_spending_unknown_rider_is_not_found() {
    let h = harness();
    let err = h
        .query
        .average_spending(&object_id(42), LoyaltyStatus::Bronze)
        .await
        .unwrap_err();
    assert!(matches!(err, LoyaltyError::NotFound { .. }));
}

// ==================== 幂等与乱序 ====================

#[tokio::test]
async fn repeated_completion_equals_single_completion() {
    for repeats in 1..=5 {
        let h = harness();
        let event = ride(1, 1, 17.8);
        h.reconciler
            .handle_ride_created(&created(&event))
            .await
            .unwrap();
        for _ in 0..repeats {
            h.reconciler
                .handle_ride_completed(&completed(&event))
                .await
                .unwrap();
        }

        let (_, _, points, ride_count) = rider_state(&h, 1).await;
        assert_eq!(points, 17, "repeats = {repeats}");
        assert_eq!(ride_count, 1, "repeats = {repeats}");
    }
}

#[tokio::test]
async fn completion_before_creation_converges() {
    let in_order = harness();
    let out_of_order = harness();
    let event = ride(7, 3, 42.5);

    in_order
        .reconciler
        .handle_ride_created(&created(&event))
        .await
        .unwrap();
    in_order
        .reconciler
        .handle_ride_completed(&completed(&event))
        .await
        .unwrap();

    out_of_order
        .reconciler
        .handle_ride_completed(&completed(&event))
        .await
        .unwrap();
    let late_create = out_of_order
        .reconciler
        .handle_ride_created(&created(&event))
        .await
        .unwrap();
    assert_eq!(late_create, HandleOutcome::Duplicate);

    assert_eq!(
        rider_state(&in_order, 3).await,
        rider_state(&out_of_order, 3).await
    );

    // 迟到的创建事件不会把已完成的行程改回 created
    let stored = out_of_order
        .rides
        .find_by_id(&event.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.state, RideState::Completed);
}

#[tokio::test]
async fn ghost_rider_keeps_points_after_late_signup() {
    let h = harness();
    let event = ride(1, 9, 25.0);

    h.reconciler
        .handle_ride_created(&created(&event))
        .await
        .unwrap();
    let (name, _, _, _) = rider_state(&h, 9).await;
    assert!(name.is_none(), "先到的行程事件应创建幽灵乘客");

    h.reconciler
        .handle_ride_completed(&completed(&event))
        .await
        .unwrap();
    let outcome = h.reconciler.handle_signup(&signup(9)).await.unwrap();
    assert_eq!(outcome, HandleOutcome::Applied);

    let (name, status, points, ride_count) = rider_state(&h, 9).await;
    assert_eq!(name.as_deref(), Some("John Doe"));
    assert_eq!(status, LoyaltyStatus::Bronze);
    assert_eq!(points, 25);
    assert_eq!(ride_count, 1);

    // 再次注册是空操作
    let outcome = h.reconciler.handle_signup(&signup(9)).await.unwrap();
    assert_eq!(outcome, HandleOutcome::Duplicate);
    assert_eq!(h.riders.len(), 1);
}

#[tokio::test]
async fn signup_first_and_ride_first_converge() {
    let signup_first = harness();
    let ride_first = harness();
    let event = ride(1, 5, 10.0);

    signup_first.reconciler.handle_signup(&signup(5)).await.unwrap();
    signup_first
        .reconciler
        .handle_ride_completed(&completed(&event))
        .await
        .unwrap();

    ride_first
        .reconciler
        .handle_ride_completed(&completed(&event))
        .await
        .unwrap();
    ride_first.reconciler.handle_signup(&signup(5)).await.unwrap();

    assert_eq!(
        rider_state(&signup_first, 5).await,
        rider_state(&ride_first, 5).await
    );
}

#[tokio::test]
async fn ride_count_increases_once_per_distinct_ride() {
    let h = harness();
    let mut previous = 0;

    for n in 0..30 {
        let event = ride(n, 1, 5.0);
        // 每个行程的完成事件都投递两次
        for _ in 0..2 {
            h.reconciler
                .handle_ride_completed(&completed(&event))
                .await
                .unwrap();
        }
        let (_, _, _, ride_count) = rider_state(&h, 1).await;
        assert_eq!(ride_count, previous + 1);
        previous = ride_count;
    }
    assert_eq!(h.rides.len(), 30);
}

#[tokio::test]
async fn tier_upgrades_at_threshold_and_changes_multiplier() {
    let h = harness();

    for n in 0..20 {
        h.reconciler
            .handle_ride_completed(&completed(&ride(n, 1, 10.0)))
            .await
            .unwrap();
    }
    let (_, status, points, ride_count) = rider_state(&h, 1).await;
    assert_eq!(ride_count, 20);
    assert_eq!(status, LoyaltyStatus::Silver);
    // 前 20 单都按 bronze 倍率计算
    assert_eq!(points, 200);

    // 第 21 单按 silver 倍率
    h.reconciler
        .handle_ride_completed(&completed(&ride(20, 1, 10.0)))
        .await
        .unwrap();
    let (_, _, points, _) = rider_state(&h, 1).await;
    assert_eq!(points, 230);

    let info = h.query.loyalty_info(&object_id(1)).await.unwrap();
    assert_eq!(info.rides_to_next_status, 29);
}

#[tokio::test]
async fn ride_snapshot_uses_status_at_creation() {
    let h = harness();
    for n in 0..20 {
        h.reconciler
            .handle_ride_completed(&completed(&ride(n, 1, 10.0)))
            .await
            .unwrap();
    }

    h.reconciler
        .handle_ride_created(&created(&ride(100, 1, 40.0)))
        .await
        .unwrap();

    let silver = h
        .query
        .average_spending(&object_id(1), LoyaltyStatus::Silver)
        .await
        .unwrap();
    let bronze = h
        .query
        .average_spending(&object_id(1), LoyaltyStatus::Bronze)
        .await
        .unwrap();
    assert!((silver - 40.0).abs() < f64::EPSILON);
    assert!((bronze - 10.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn malformed_events_leave_stores_untouched() {
    let h = harness();

    let bad_amount = ride(1, 1, -1.0);
    let err = h
        .reconciler
        .handle_ride_created(&created(&bad_amount))
        .await
        .unwrap_err();
    assert!(matches!(err, LoyaltyError::MalformedMessage(_)));

    let bad_id = RideEvent {
        id: "not-an-object-id".to_string(),
        ..ride(1, 1, 10.0)
    };
    assert!(
        h.reconciler
            .handle_ride_completed(&completed(&bad_id))
            .await
            .is_err()
    );

    assert!(h.riders.is_empty());
    assert!(h.rides.is_empty());
}

// ==================== 积分扣减 ====================

#[tokio::test]
async fn remove_points_decrements_balance() {
    let h = harness();
    h.reconciler
        .handle_ride_completed(&completed(&ride(1, 1, 50.0)))
        .await
        .unwrap();

    let rider = h.query.remove_points(&object_id(1), 30).await.unwrap();
    assert_eq!(rider.points, 20);

    let err = h.query.remove_points(&object_id(1), 21).await.unwrap_err();
    assert!(matches!(
        err,
        LoyaltyError::InsufficientPoints {
            requested: 21,
            available: 20
        }
    ));

    let err = h.query.remove_points(&object_id(2), 1).await.unwrap_err();
    assert!(matches!(err, LoyaltyError::NotFound { .. }));
}

#[tokio::test]
async fn concurrent_point_removals_never_go_negative() {
    let h = harness();
    h.reconciler
        .handle_ride_completed(&completed(&ride(1, 1, 100.0)))
        .await
        .unwrap();
    let query = Arc::new(h.query);

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let query = query.clone();
            tokio::spawn(async move { query.remove_points(&object_id(1), 30).await })
        })
        .collect();

    let mut succeeded = 0;
    for task in tasks {
        if task.await.unwrap().is_ok() {
            succeeded += 1;
        }
    }

    assert_eq!(succeeded, 3);
    let rider = h.riders.find_by_id(&object_id(1)).await.unwrap().unwrap();
    assert_eq!(rider.points, 10);
}

// ==================== 并发 ====================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicate_completions_award_once() {
    let h = harness();
    let reconciler = Arc::new(h.reconciler.clone());
    let event = ride(1, 1, 33.0);
    reconciler
        .handle_ride_created(&created(&event))
        .await
        .unwrap();

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let reconciler = reconciler.clone();
            let event = completed(&event);
            tokio::spawn(async move { reconciler.handle_ride_completed(&event).await })
        })
        .collect();

    let mut applied = 0;
    for task in tasks {
        if task.await.unwrap().unwrap() == HandleOutcome::Applied {
            applied += 1;
        }
    }

    assert_eq!(applied, 1);
    let (_, _, points, ride_count) = rider_state(&h, 1).await;
    assert_eq!(points, 33);
    assert_eq!(ride_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_create_and_complete_converge() {
    for n in 0..50 {
        let h = harness();
        let reconciler = Arc::new(h.reconciler.clone());
        let event = ride(n, 1, 12.0);

        let create = {
            let reconciler = reconciler.clone();
            let event = created(&event);
            tokio::spawn(async move { reconciler.handle_ride_created(&event).await })
        };
        let complete = {
            let reconciler = reconciler.clone();
            let event = completed(&event);
            tokio::spawn(async move { reconciler.handle_ride_completed(&event).await })
        };

        let (create, complete) = tokio::join!(create, complete);
        create.unwrap().unwrap();
        assert_eq!(complete.unwrap().unwrap(), HandleOutcome::Applied);

        let stored = h.rides.find_by_id(&event.id).await.unwrap().unwrap();
        assert_eq!(stored.state, RideState::Completed);
        let (_, _, points, ride_count) = rider_state(&h, 1).await;
        assert_eq!((points, ride_count), (12, 1));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shuffled_duplicated_stream_matches_sequential_replay() {
    use futures::future::join_all;

    let sequential = harness();
    let concurrent = harness();

    let rides: Vec<RideEvent> = (0..40).map(|n| ride(n, n % 4, 3.0 + n as f64)).collect();

    for event in &rides {
        sequential
            .reconciler
            .handle_ride_created(&created(event))
            .await
            .unwrap();
        sequential
            .reconciler
            .handle_ride_completed(&completed(event))
            .await
            .unwrap();
    }

    // 每个事件投递三次，完成事件全部先于创建事件发起
    let reconciler = Arc::new(concurrent.reconciler.clone());
    let completions = rides.iter().flat_map(|e| std::iter::repeat_n(e.clone(), 3)).map(|e| {
        let reconciler = reconciler.clone();
        tokio::spawn(async move { reconciler.handle_ride_completed(&RideCompletedEvent(e)).await })
    });
    let creations = rides.iter().flat_map(|e| std::iter::repeat_n(e.clone(), 3)).map(|e| {
        let reconciler = reconciler.clone();
        tokio::spawn(async move { reconciler.handle_ride_created(&RideCreatedEvent(e)).await })
    });
    let handles: Vec<_> = completions.chain(creations).collect();
    for result in join_all(handles).await {
        result.unwrap().unwrap();
    }

    for rider in 0..4 {
        let (_, _, seq_points, seq_count) = rider_state(&sequential, rider).await;
        let (_, _, con_points, con_count) = rider_state(&concurrent, rider).await;
        assert_eq!(seq_count, con_count, "rider {rider}");
        assert_eq!(seq_points, con_points, "rider {rider}");
    }
}

// ==================== 存储故障后重投 ====================

fn unavailable() -> LoyaltyError {
    LoyaltyError::StoreUnavailable(sqlx::Error::PoolTimedOut)
}

/// 剩余次数大于零时消耗一次并返回 true
fn take_failure(remaining: &AtomicUsize) -> bool {
    remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// 故障发生的时机
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    /// 事务回滚：什么都没写入就报错
    BeforeCommit,
    /// 已提交但响应丢失：写入生效后仍报错
    AfterCommit,
}

/// 行程完成的前若干次调用失败的行程存储
struct FlakyRideStore {
    inner: MemoryRideStore,
    fault: Fault,
    remaining: AtomicUsize,
}

#[async_trait]
impl RideStore for FlakyRideStore {
    async fn find_by_id(&self, id: &str) -> loyalty_core::Result<Option<Ride>> {
        self.inner.find_by_id(id).await
    }

    async fn insert_if_absent(&self, ride: NewRide) -> loyalty_core::Result<InsertOutcome<Ride>> {
        self.inner.insert_if_absent(ride).await
    }

    async fn transition_state(
        &self,
        id: &str,
        from: RideState,
        to: RideState,
    ) -> loyalty_core::Result<TransitionOutcome> {
        self.inner.transition_state(id, from, to).await
    }

    async fn complete_and_award(
        &self,
        completion: RideCompletion,
        calculator: &LoyaltyCalculator,
    ) -> loyalty_core::Result<CompletionOutcome> {
        if take_failure(&self.remaining) {
            if self.fault == Fault::AfterCommit {
                self.inner.complete_and_award(completion, calculator).await?;
            }
            return Err(unavailable());
        }
        self.inner.complete_and_award(completion, calculator).await
    }

    async fn amount_summary(
        &self,
        rider_id: &str,
        status: LoyaltyStatus,
    ) -> loyalty_core::Result<AmountSummary> {
        self.inner.amount_summary(rider_id, status).await
    }
}

/// 前若干次插入失败的乘客存储
struct FlakyRiderStore {
    inner: MemoryRiderStore,
    remaining: AtomicUsize,
}

#[async_trait]
impl RiderStore for FlakyRiderStore {
    async fn find_by_id(&self, id: &str) -> loyalty_core::Result<Option<Rider>> {
        self.inner.find_by_id(id).await
    }

    async fn insert_if_absent(&self, rider: NewRider) -> loyalty_core::Result<InsertOutcome<Rider>> {
        if take_failure(&self.remaining) {
            return Err(unavailable());
        }
        self.inner.insert_if_absent(rider).await
    }

    async fn atomic_increment(
        &self,
        id: &str,
        increment: RiderIncrement,
    ) -> loyalty_core::Result<Option<Rider>> {
        self.inner.atomic_increment(id, increment).await
    }

    async fn conditional_update(
        &self,
        id: &str,
        condition: RiderCondition,
        patch: RiderPatch,
    ) -> loyalty_core::Result<Option<Rider>> {
        self.inner.conditional_update(id, condition, patch).await
    }
}

struct FlakyHarness {
    riders: MemoryRiderStore,
    rides: Arc<FlakyRideStore>,
    reconciler: EventReconciler<MemoryRiderStore, FlakyRideStore>,
}

fn flaky_rides(fault: Fault, failures: usize) -> FlakyHarness {
    let riders = MemoryRiderStore::new();
    let rides = Arc::new(FlakyRideStore {
        inner: MemoryRideStore::new(&riders),
        fault,
        remaining: AtomicUsize::new(failures),
    });
    let reconciler = EventReconciler::new(
        Arc::new(riders.clone()),
        rides.clone(),
        LoyaltyCalculator::default(),
    );
    FlakyHarness {
        riders,
        rides,
        reconciler,
    }
}

async fn stored_rider(riders: &MemoryRiderStore, rider: u64) -> (LoyaltyStatus, i64, i64) {
    let r = riders
        .find_by_id(&object_id(rider))
        .await
        .unwrap()
        .expect("乘客应存在");
    (r.status, r.points, r.ride_count)
}

#[tokio::test]
async fn rolled_back_completion_is_awarded_on_redelivery() {
    let h = flaky_rides(Fault::BeforeCommit, 1);
    let event = ride(1, 1, 20.0);
    h.reconciler
        .handle_ride_created(&created(&event))
        .await
        .unwrap();

    let err = h
        .reconciler
        .handle_ride_completed(&completed(&event))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    // 失败的投递不留下任何半成品
    assert_eq!(stored_rider(&h.riders, 1).await, (LoyaltyStatus::Bronze, 0, 0));
    let stored = h.rides.find_by_id(&event.id).await.unwrap().unwrap();
    assert_eq!(stored.state, RideState::Created);

    let outcome = h
        .reconciler
        .handle_ride_completed(&completed(&event))
        .await
        .unwrap();
    assert_eq!(outcome, HandleOutcome::Applied);
    assert_eq!(stored_rider(&h.riders, 1).await, (LoyaltyStatus::Bronze, 20, 1));
}

#[tokio::test]
async fn committed_completion_is_not_awarded_twice_on_redelivery() {
    let h = flaky_rides(Fault::AfterCommit, 1);
    let event = ride(1, 1, 20.0);

    assert!(
        h.reconciler
            .handle_ride_completed(&completed(&event))
            .await
            .is_err()
    );

    let outcome = h
        .reconciler
        .handle_ride_completed(&completed(&event))
        .await
        .unwrap();
    assert_eq!(outcome, HandleOutcome::Duplicate);
    assert_eq!(stored_rider(&h.riders, 1).await, (LoyaltyStatus::Bronze, 20, 1));
}

#[tokio::test]
async fn tier_upgrade_converges_after_failed_threshold_completion() {
    for fault in [Fault::BeforeCommit, Fault::AfterCommit] {
        let h = flaky_rides(fault, 0);
        for n in 0..19 {
            h.reconciler
                .handle_ride_completed(&completed(&ride(n, 1, 10.0)))
                .await
                .unwrap();
        }

        // 第 20 单跨过 silver 门槛，首次投递失败
        h.rides.remaining.store(1, Ordering::SeqCst);
        let event = ride(19, 1, 10.0);
        assert!(
            h.reconciler
                .handle_ride_completed(&completed(&event))
                .await
                .is_err(),
            "{fault:?}"
        );

        // 重投两次：第一次补齐（或确认已生效），第二次是空操作
        for _ in 0..2 {
            h.reconciler
                .handle_ride_completed(&completed(&event))
                .await
                .unwrap();
        }

        assert_eq!(
            stored_rider(&h.riders, 1).await,
            (LoyaltyStatus::Silver, 200, 20),
            "{fault:?}"
        );
    }
}

#[tokio::test]
async fn failed_ghost_insert_leaves_ride_uncompleted() {
    let riders = Arc::new(FlakyRiderStore {
        inner: MemoryRiderStore::new(),
        remaining: AtomicUsize::new(1),
    });
    let rides = Arc::new(MemoryRideStore::new(&riders.inner));
    let reconciler = EventReconciler::new(riders.clone(), rides.clone(), LoyaltyCalculator::default());
    let event = ride(1, 1, 20.0);

    let err = reconciler
        .handle_ride_completed(&completed(&event))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(rides.is_empty());
    assert!(riders.inner.is_empty());

    let outcome = reconciler
        .handle_ride_completed(&completed(&event))
        .await
        .unwrap();
    assert_eq!(outcome, HandleOutcome::Applied);
    assert_eq!(stored_rider(&riders.inner, 1).await, (LoyaltyStatus::Bronze, 20, 1));
}
