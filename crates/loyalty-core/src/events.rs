//! 上游派单系统发布的事件负载
//!
//! 负载先经 serde 反序列化，再由 validator 校验字段约束；
//! 任一步失败都归为 `MalformedMessage`，在任何写操作之前拒绝。

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::{LoyaltyError, Result};

/// 24 位十六进制字符串（上游使用的对象 ID 格式）
pub fn validate_object_id(value: &str) -> std::result::Result<(), ValidationError> {
    if value.len() == 24 && value.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(ValidationError::new("object_id").with_message("必须是 24 位十六进制字符串".into()))
    }
}

/// 可从原始字节解码的事件
pub trait EventPayload: DeserializeOwned + Validate + Sized {
    /// 事件类型名，用于日志与指标标签
    const EVENT_TYPE: &'static str;

    fn decode(payload: &[u8]) -> Result<Self> {
        let event: Self = serde_json::from_slice(payload).map_err(|e| {
            LoyaltyError::MalformedMessage(format!("{} 反序列化失败: {e}", Self::EVENT_TYPE))
        })?;
        event.validate()?;
        Ok(event)
    }
}

/// 乘客注册事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SignupEvent {
    #[validate(length(equal = 24, message = "乘客 ID 必须为 24 个字符"))]
    pub id: String,
    #[validate(length(min = 6, message = "乘客姓名至少 6 个字符"))]
    pub name: String,
}

impl EventPayload for SignupEvent {
    const EVENT_TYPE: &'static str = "rider_signup";
}

/// 行程创建 / 完成事件，两者负载结构相同
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct RideEvent {
    #[validate(custom(function = "validate_object_id"))]
    pub id: String,
    #[validate(range(min = 0.0, message = "金额不能为负数"))]
    pub amount: f64,
    #[validate(custom(function = "validate_object_id"))]
    pub rider_id: String,
}

/// 行程创建事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RideCreatedEvent(pub RideEvent);

/// 行程完成事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RideCompletedEvent(pub RideEvent);

impl Validate for RideCreatedEvent {
    fn validate(&self) -> std::result::Result<(), validator::ValidationErrors> {
        self.0.validate()
    }
}

impl Validate for RideCompletedEvent {
    fn validate(&self) -> std::result::Result<(), validator::ValidationErrors> {
        self.0.validate()
    }
}

impl EventPayload for RideCreatedEvent {
    const EVENT_TYPE: &'static str = "ride_created";
}

impl EventPayload for RideCompletedEvent {
    const EVENT_TYPE: &'static str = "ride_completed";
}

impl std::ops::Deref for RideCreatedEvent {
    type Target = RideEvent;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::ops::Deref for RideCompletedEvent {
    type Target = RideEvent;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
