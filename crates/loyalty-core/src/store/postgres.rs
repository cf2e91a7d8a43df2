//! PostgreSQL 存储实现
//!
//! 单表写操作的原子性由单条 SQL 表达：
//! - insert-if-absent：`INSERT … ON CONFLICT DO NOTHING RETURNING`，冲突时再读一次
//! - 状态迁移：`UPDATE … WHERE state = $from RETURNING`
//! - 自增：`UPDATE … SET points = points + $2`
//!
//! 行程完成同时写两张表，在一个事务内先锁行程行、再锁乘客行。

use async_trait::async_trait;
use sqlx::{PgConnection, PgPool};
use tracing::debug;

use super::traits::{
    AmountSummary, CompletionOutcome, InsertOutcome, RideCompletion, RideStore, RiderCondition,
    RiderIncrement, RiderPatch, RiderStore, TransitionOutcome,
};
use crate::calculator::LoyaltyCalculator;
use crate::error::{LoyaltyError, Result};
use crate::models::{LoyaltyStatus, NewRide, NewRider, Ride, RideState, Rider};

const RIDER_COLUMNS: &str = "id, name, status, points, ride_count, created_at, updated_at";
const RIDE_COLUMNS: &str = "id, rider_id, amount, rider_status, state, created_at, updated_at";

/// 写操作输给并发插入后最多重来的次数
///
/// 同一行程 ID 只会被插入一次，第二轮必然看到已提交的行，第三轮只是余量。
const MAX_WRITE_ATTEMPTS: usize = 3;

/// 乘客存储
#[derive(Clone)]
pub struct PgRiderStore {
    pool: PgPool,
}

impl PgRiderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RiderStore for PgRiderStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<Rider>> {
        let rider = sqlx::query_as::<_, Rider>(&format!(
            "SELECT {RIDER_COLUMNS} FROM riders WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(rider)
    }

    async fn insert_if_absent(&self, rider: NewRider) -> Result<InsertOutcome<Rider>> {
        let inserted = sqlx::query_as::<_, Rider>(&format!(
            r#"
            INSERT INTO riders (id, name, status, points, ride_count, created_at, updated_at)
            VALUES ($1, $2, $3, 0, 0, NOW(), NOW())
            ON CONFLICT (id) DO NOTHING
            RETURNING {RIDER_COLUMNS}
            "#
        ))
        .bind(&rider.id)
        .bind(&rider.name)
        .bind(LoyaltyStatus::default())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(inserted) = inserted {
            return Ok(InsertOutcome::Inserted(inserted));
        }

        // 冲突：记录已存在，且从不删除
        let existing = sqlx::query_as::<_, Rider>(&format!(
            "SELECT {RIDER_COLUMNS} FROM riders WHERE id = $1"
        ))
        .bind(&rider.id)
        .fetch_one(&self.pool)
        .await?;

        Ok(InsertOutcome::Existing(existing))
    }

    async fn atomic_increment(
        &self,
        id: &str,
        increment: RiderIncrement,
    ) -> Result<Option<Rider>> {
        let rider = sqlx::query_as::<_, Rider>(&format!(
            r#"
            UPDATE riders
            SET points = points + $2, ride_count = ride_count + $3, updated_at = NOW()
            WHERE id = $1
            RETURNING {RIDER_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(increment.points)
        .bind(increment.ride_count)
        .fetch_optional(&self.pool)
        .await?;

        Ok(rider)
    }

    async fn conditional_update(
        &self,
        id: &str,
        condition: RiderCondition,
        patch: RiderPatch,
    ) -> Result<Option<Rider>> {
        let predicate = match condition {
            RiderCondition::StatusBelow(_) => "status = ANY($5)",
            RiderCondition::PointsAtLeast(_) => "points >= $5",
            RiderCondition::NameMissing => "name IS NULL",
        };

        let sql = format!(
            r#"
            UPDATE riders
            SET status = COALESCE($2, status),
                name = COALESCE($3, name),
                points = points + $4,
                updated_at = NOW()
            WHERE id = $1 AND {predicate}
            RETURNING {RIDER_COLUMNS}
            "#
        );

        let query = sqlx::query_as::<_, Rider>(&sql)
            .bind(id)
            .bind(patch.status)
            .bind(&patch.name)
            .bind(patch.points_delta);

        let query = match condition {
            RiderCondition::StatusBelow(target) => {
                // 等级以字符串存储，不能直接比较大小，改为枚举所有更低的等级
                let lower: Vec<String> = target.below().map(|s| s.as_str().to_string()).collect();
                query.bind(lower)
            }
            RiderCondition::PointsAtLeast(points) => query.bind(points),
            RiderCondition::NameMissing => query,
        };

        let rider = query.fetch_optional(&self.pool).await?;

        debug!(rider_id = id, ?condition, applied = rider.is_some(), "条件更新乘客");
        Ok(rider)
    }
}

/// 行程存储
#[derive(Clone)]
pub struct PgRideStore {
    pool: PgPool,
}

impl PgRideStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RideStore for PgRideStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<Ride>> {
        let ride = sqlx::query_as::<_, Ride>(&format!(
            "SELECT {RIDE_COLUMNS} FROM rides WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(ride)
    }

    async fn insert_if_absent(&self, ride: NewRide) -> Result<InsertOutcome<Ride>> {
        let inserted = sqlx::query_as::<_, Ride>(&format!(
            r#"
            INSERT INTO rides (id, rider_id, amount, rider_status, state, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW(), NOW())
            ON CONFLICT (id) DO NOTHING
            RETURNING {RIDE_COLUMNS}
            "#
        ))
        .bind(&ride.id)
        .bind(&ride.rider_id)
        .bind(ride.amount)
        .bind(ride.rider_status)
        .bind(ride.state)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(inserted) = inserted {
            return Ok(InsertOutcome::Inserted(inserted));
        }

        let existing = sqlx::query_as::<_, Ride>(&format!(
            "SELECT {RIDE_COLUMNS} FROM rides WHERE id = $1"
        ))
        .bind(&ride.id)
        .fetch_one(&self.pool)
        .await?;

        Ok(InsertOutcome::Existing(existing))
    }

    async fn transition_state(
        &self,
        id: &str,
        from: RideState,
        to: RideState,
    ) -> Result<TransitionOutcome> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let updated = sqlx::query_as::<_, Ride>(&format!(
                r#"
                UPDATE rides
                SET state = $3, updated_at = NOW()
                WHERE id = $1 AND state = $2
                RETURNING {RIDE_COLUMNS}
                "#
            ))
            .bind(id)
            .bind(from)
            .bind(to)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(ride) = updated {
                return Ok(TransitionOutcome::Transitioned(ride));
            }

            let current = self.find_by_id(id).await?;
            if let Some(outcome) = settle_missed_transition(current, to) {
                return Ok(outcome);
            }
        }

        Err(LoyaltyError::Contended {
            entity: "ride",
            id: id.to_string(),
        })
    }

    async fn complete_and_award(
        &self,
        completion: RideCompletion,
        calculator: &LoyaltyCalculator,
    ) -> Result<CompletionOutcome> {
        let mut tx = self.pool.begin().await?;

        // 1. 锁定行程行：翻转 created，或直接插入 completed
        let mut completed = None;
        for _ in 0..MAX_WRITE_ATTEMPTS {
            match lock_ride(&mut tx, &completion.ride_id).await? {
                Some(ride) if ride.state == RideState::Completed => {
                    tx.rollback().await?;
                    return Ok(CompletionOutcome::AlreadyCompleted(ride));
                }
                Some(_) => {
                    completed = Some(mark_completed(&mut tx, &completion.ride_id).await?);
                    break;
                }
                None => {
                    if let Some(ride) = insert_completed(&mut tx, &completion).await? {
                        completed = Some(ride);
                        break;
                    }
                    // ON CONFLICT 已等到并发插入提交，下一轮加锁读取必然能看到它
                }
            }
        }

        let Some(ride) = completed else {
            return Err(LoyaltyError::Contended {
                entity: "ride",
                id: completion.ride_id,
            });
        };

        // 2. 锁定行程所属乘客并记账
        let rider = lock_rider(&mut tx, &ride.rider_id)
            .await?
            .ok_or_else(|| LoyaltyError::rider_not_found(&ride.rider_id))?;
        let award = calculator.award_for_ride(&rider, ride.amount);

        let updated = sqlx::query_as::<_, Rider>(&format!(
            r#"
            UPDATE riders
            SET points = points + $2, ride_count = ride_count + 1, status = $3, updated_at = NOW()
            WHERE id = $1
            RETURNING {RIDER_COLUMNS}
            "#
        ))
        .bind(&rider.id)
        .bind(award.points)
        .bind(award.status)
        .fetch_one(&mut *tx)
        .await?;

        // 3. 提交事务
        tx.commit().await?;

        debug!(
            ride_id = %ride.id,
            rider_id = %ride.rider_id,
            points = award.points,
            "行程完成并已记账"
        );
        Ok(CompletionOutcome::Awarded {
            ride,
            rider: updated,
            award,
            previous_status: rider.status,
        })
    }

    async fn amount_summary(
        &self,
        rider_id: &str,
        status: LoyaltyStatus,
    ) -> Result<AmountSummary> {
        let (count, total): (i64, f64) = sqlx::query_as(
            r#"
            SELECT COUNT(*), COALESCE(SUM(amount), 0)::DOUBLE PRECISION
            FROM rides
            WHERE rider_id = $1 AND rider_status = $2
            "#,
        )
        .bind(rider_id)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        Ok(AmountSummary { count, total })
    }
}

/// 条件 UPDATE 落空后按重新读到的行程给出结果
///
/// 返回 None 表示行程刚以 `from` 状态被并发插入，应再试一次。
fn settle_missed_transition(current: Option<Ride>, to: RideState) -> Option<TransitionOutcome> {
    match current {
        None => Some(TransitionOutcome::Absent),
        Some(ride) if ride.state == to => Some(TransitionOutcome::AlreadyInTarget(ride)),
        Some(_) => None,
    }
}

async fn lock_ride(conn: &mut PgConnection, id: &str) -> Result<Option<Ride>> {
    let ride = sqlx::query_as::<_, Ride>(&format!(
        "SELECT {RIDE_COLUMNS} FROM rides WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(ride)
}

async fn mark_completed(conn: &mut PgConnection, id: &str) -> Result<Ride> {
    let ride = sqlx::query_as::<_, Ride>(&format!(
        r#"
        UPDATE rides
        SET state = $2, updated_at = NOW()
        WHERE id = $1
        RETURNING {RIDE_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(RideState::Completed)
    .fetch_one(&mut *conn)
    .await?;

    Ok(ride)
}

/// 以 completed 状态插入行程，等级快照取乘客当前等级；被并发插入抢先时返回 None
async fn insert_completed(
    conn: &mut PgConnection,
    completion: &RideCompletion,
) -> Result<Option<Ride>> {
    let rider = lock_rider(&mut *conn, &completion.rider_id)
        .await?
        .ok_or_else(|| LoyaltyError::rider_not_found(&completion.rider_id))?;

    let ride = sqlx::query_as::<_, Ride>(&format!(
        r#"
        INSERT INTO rides (id, rider_id, amount, rider_status, state, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, NOW(), NOW())
        ON CONFLICT (id) DO NOTHING
        RETURNING {RIDE_COLUMNS}
        "#
    ))
    .bind(&completion.ride_id)
    .bind(&completion.rider_id)
    .bind(completion.amount)
    .bind(rider.status)
    .bind(RideState::Completed)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(ride)
}

/// 锁定乘客行
///
/// 用 NO KEY UPDATE 而不是 UPDATE：插入行程时的外键检查会持有乘客行的 KEY SHARE 锁，
/// 两者不冲突，两个事务不会因为各自插入过行程而互相等待。
async fn lock_rider(conn: &mut PgConnection, id: &str) -> Result<Option<Rider>> {
    let rider = sqlx::query_as::<_, Rider>(&format!(
        "SELECT {RIDER_COLUMNS} FROM riders WHERE id = $1 FOR NO KEY UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(rider)
}
