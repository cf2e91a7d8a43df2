//! 死信队列
//!
//! 消息处理失败且无法再重试时写入死信队列（DLQ），保留原始负载与失败上下文，
//! 不会因为一条坏消息阻塞整个分区，也不会静默丢弃。
//! 格式错误的消息永远不可能成功，直接以 0 次重试入队；
//! 存储故障在消费端按退避策略重试，耗尽后带着重试次数入队。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::InfraError;
use crate::kafka::{KafkaProducer, topics};

// ---------------------------------------------------------------------------
// DeadLetterMessage — 死信消息信封
// ---------------------------------------------------------------------------

/// 死信消息信封
///
/// 包装原始消息并附加失败原因、错误码和重试次数，便于排查与人工重放。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    /// 原始消息 key，缺失时使用 `topic/partition/offset`
    pub message_id: String,
    pub source_topic: String,
    pub source_partition: i32,
    pub source_offset: i64,
    /// 原始负载；非 UTF-8 字节做有损转换
    pub payload: String,
    pub error: String,
    pub error_code: String,
    /// 入队前已重试次数
    pub retry_count: u32,
    /// 是否有重放价值（格式错误的消息为 false）
    pub replayable: bool,
    pub failed_at: DateTime<Utc>,
    pub source_service: String,
}

impl DeadLetterMessage {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }
}

/// 构造死信消息所需的原始消息上下文
#[derive(Debug, Clone)]
pub struct FailedMessage<'a> {
    pub key: Option<&'a str>,
    pub topic: &'a str,
    pub partition: i32,
    pub offset: i64,
    pub payload: &'a [u8],
}

impl FailedMessage<'_> {
    fn message_id(&self) -> String {
        match self.key {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => format!("{}/{}/{}", self.topic, self.partition, self.offset),
        }
    }
}

/// 失败原因
#[derive(Debug, Clone)]
pub struct FailureReason<'a> {
    pub error: &'a str,
    pub error_code: &'a str,
    pub retry_count: u32,
    pub replayable: bool,
}

impl DeadLetterMessage {
    pub fn new(
        failed: &FailedMessage<'_>,
        reason: &FailureReason<'_>,
        source_service: impl Into<String>,
    ) -> Self {
        Self {
            message_id: failed.message_id(),
            source_topic: failed.topic.to_string(),
            source_partition: failed.partition,
            source_offset: failed.offset,
            payload: String::from_utf8_lossy(failed.payload).into_owned(),
            error: reason.error.to_string(),
            error_code: reason.error_code.to_string(),
            retry_count: reason.retry_count,
            replayable: reason.replayable,
            failed_at: Utc::now(),
            source_service: source_service.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// DlqProducer
// ---------------------------------------------------------------------------

/// 死信发送端抽象，消费者依赖它而不是具体的 Kafka 生产者
#[async_trait::async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send_to_dlq(
        &self,
        failed: &FailedMessage<'_>,
        reason: &FailureReason<'_>,
    ) -> Result<(), InfraError>;
}

/// 基于 Kafka 的死信生产者
#[derive(Clone)]
pub struct DlqProducer {
    producer: KafkaProducer,
    source_service: String,
}

impl DlqProducer {
    pub fn new(producer: KafkaProducer, source_service: &str) -> Self {
        Self {
            producer,
            source_service: source_service.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl DeadLetterSink for DlqProducer {
    async fn send_to_dlq(
        &self,
        failed: &FailedMessage<'_>,
        reason: &FailureReason<'_>,
    ) -> Result<(), InfraError> {
        let dlq_msg = DeadLetterMessage::new(failed, reason, &self.source_service);

        self.producer
            .send_json(topics::DEAD_LETTER_QUEUE, &dlq_msg.message_id, &dlq_msg)
            .await?;

        metrics::counter!(
            "loyalty_dead_letters_total",
            "topic" => failed.topic.to_string()
        )
        .increment(1);

        warn!(
            message_id = %dlq_msg.message_id,
            source_topic = failed.topic,
            error_code = reason.error_code,
            retry_count = reason.retry_count,
            error = reason.error,
            "消息已发送到死信队列"
        );

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
