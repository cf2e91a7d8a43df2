//! 积分领域实体
//!
//! 所有枚举都支持数据库（sqlx）和 JSON（serde）序列化，
//! 数据库中以小写字符串保存，便于直接查询。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LoyaltyError;

/// 会员等级
///
/// 声明顺序即等级高低，派生的 `Ord` 用于"只升不降"的比较
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum LoyaltyStatus {
    #[default]
    Bronze,
    Silver,
    Gold,
    Platinum,
}

impl LoyaltyStatus {
    /// 按从低到高排列的全部等级
    pub const ALL: [LoyaltyStatus; 4] = [Self::Bronze, Self::Silver, Self::Gold, Self::Platinum];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bronze => "bronze",
            Self::Silver => "silver",
            Self::Gold => "gold",
            Self::Platinum => "platinum",
        }
    }

    /// 严格低于当前等级的所有等级
    pub fn below(&self) -> impl Iterator<Item = LoyaltyStatus> + '_ {
        Self::ALL.into_iter().filter(move |s| s < self)
    }
}

impl std::fmt::Display for LoyaltyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LoyaltyStatus {
    type Err = LoyaltyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bronze" => Ok(Self::Bronze),
            "silver" => Ok(Self::Silver),
            "gold" => Ok(Self::Gold),
            "platinum" => Ok(Self::Platinum),
            other => Err(LoyaltyError::InvalidArgument(format!(
                "未知的会员等级: {other}"
            ))),
        }
    }
}

/// 行程状态，只会从 created 走到 completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum RideState {
    Created,
    Completed,
}

impl RideState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Completed => "completed",
        }
    }
}

/// 乘客
///
/// 可能由注册事件创建，也可能被先到的行程事件创建为"幽灵乘客"（没有 name）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Rider {
    pub id: String,
    /// 幽灵乘客在注册事件到达前没有名字
    #[sqlx(default)]
    pub name: Option<String>,
    pub status: LoyaltyStatus,
    pub points: i64,
    pub ride_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rider {
    pub fn is_ghost(&self) -> bool {
        self.name.is_none()
    }
}

/// 行程
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Ride {
    /// 行程 ID，同时是幂等键
    pub id: String,
    pub rider_id: String,
    /// 写入后不再修改
    pub amount: f64,
    /// 行程创建时乘客所在等级的快照
    pub rider_status: LoyaltyStatus,
    pub state: RideState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 待插入的乘客
#[derive(Debug, Clone, PartialEq)]
pub struct NewRider {
    pub id: String,
    pub name: Option<String>,
}

impl NewRider {
    /// 由行程事件隐式创建的乘客
    pub fn ghost(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }

    /// 由注册事件创建的乘客
    pub fn signup(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
        }
    }

    /// 新乘客从最低等级、零积分开始
    pub fn into_rider(self, now: DateTime<Utc>) -> Rider {
        Rider {
            id: self.id,
            name: self.name,
            status: LoyaltyStatus::default(),
            points: 0,
            ride_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 待插入的行程
#[derive(Debug, Clone, PartialEq)]
pub struct NewRide {
    pub id: String,
    pub rider_id: String,
    pub amount: f64,
    pub rider_status: LoyaltyStatus,
    pub state: RideState,
}

impl NewRide {
    pub fn into_ride(self, now: DateTime<Utc>) -> Ride {
        Ride {
            id: self.id,
            rider_id: self.rider_id,
            amount: self.amount,
            rider_status: self.rider_status,
            state: self.state,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 会员信息查询结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoyaltyInfo {
    pub status: LoyaltyStatus,
    pub points: i64,
    pub rides_to_next_status: i64,
}
