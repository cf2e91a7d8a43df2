//! 积分对账错误类型
//!
//! 处理器只区分两类失败：消息本身不合法（永远不会成功），
//! 以及存储不可用或写入冲突（原样透传，由消费端决定是否重投）。
//! 查询与扣减积分额外用到 NotFound / InsufficientPoints / InvalidArgument。

use thiserror::Error;

/// 积分服务错误类型
#[derive(Debug, Error)]
pub enum LoyaltyError {
    // === 消息错误 ===
    #[error("消息格式错误: {0}")]
    MalformedMessage(String),

    // === 业务错误 ===
    #[error("{entity} 不存在: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("积分不足: 需要 {requested}, 可用 {available}")]
    InsufficientPoints { requested: i64, available: i64 },

    #[error("参数校验失败: {0}")]
    InvalidArgument(String),

    // === 系统错误 ===
    #[error("存储不可用: {0}")]
    StoreUnavailable(#[from] sqlx::Error),

    #[error("{entity} 并发冲突，放弃本次写入: {id}")]
    Contended { entity: &'static str, id: String },

    #[error("积分规则配置错误: {0}")]
    Configuration(String),
}

/// 积分服务结果类型
pub type Result<T> = std::result::Result<T, LoyaltyError>;

impl LoyaltyError {
    pub fn rider_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "rider",
            id: id.into(),
        }
    }

    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedMessage(_) => "MALFORMED_MESSAGE",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InsufficientPoints { .. } => "INSUFFICIENT_POINTS",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            Self::Contended { .. } => "CONTENDED",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
        }
    }

    /// 只有存储故障与并发冲突值得重投，其余错误重试多少次结果都一样
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::Contended { .. })
    }
}

impl From<validator::ValidationErrors> for LoyaltyError {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::MalformedMessage(err.to_string())
    }
}
