//! 积分事件消费进程
//!
//! 订阅注册、行程创建、行程完成三个 topic，把消息交给核心对账器处理，
//! 负责重试与死信这类投递层面的事务。

pub mod consumer;
pub mod error;

pub use consumer::{LoyaltyConsumer, MessageDispatcher, MessageOutcome};
pub use error::WorkerError;
