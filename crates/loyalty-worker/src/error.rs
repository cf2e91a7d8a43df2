//! 消费端错误类型
//!
//! 在核心 LoyaltyError 与共享库 InfraError 的基础上增加消费端特有的
//! "未知 topic" 变体，用于区分路由配置错误与消息本身的问题。

use loyalty_core::LoyaltyError;
use loyalty_shared::error::InfraError;

/// 消费端错误
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// 订阅列表之外的 topic，说明路由配置有误
    #[error("未知的 topic: {topic}")]
    UnknownTopic { topic: String },

    #[error(transparent)]
    Loyalty(#[from] LoyaltyError),

    /// 透传共享库错误（Kafka、DLQ 投递等）
    #[error(transparent)]
    Infra(#[from] InfraError),
}

impl WorkerError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownTopic { .. } => "UNKNOWN_TOPIC",
            Self::Loyalty(e) => e.code(),
            Self::Infra(e) => e.code(),
        }
    }

    /// 只有存储与 Kafka 故障值得重试
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UnknownTopic { .. } => false,
            Self::Loyalty(e) => e.is_retryable(),
            Self::Infra(e) => e.is_retryable(),
        }
    }

    /// 消息本身不合法，重投多少次都不会成功
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::UnknownTopic { .. } | Self::Loyalty(LoyaltyError::MalformedMessage(_))
        )
    }
}
