//! Kafka 消费者与事件分发
//!
//! 按 topic 把消息路由到对应的对账处理器：
//! - 存储故障在本地按指数退避重试，重试耗尽后进入死信队列（可重放）
//! - 格式错误的消息直接进入死信队列，不做任何重试
//!
//! 处理成功或已进入死信队列时 offset 才会被存储，坏消息不会阻塞所在分区；
//! 死信投递本身失败时返回错误，offset 不存储，消息回退后重新投递。

use std::sync::Arc;
use std::time::Instant;

use loyalty_core::events::{EventPayload, RideCompletedEvent, RideCreatedEvent, SignupEvent};
use loyalty_core::store::{RideStore, RiderStore};
use loyalty_core::{EventReconciler, HandleOutcome};
use loyalty_shared::config::AppConfig;
use loyalty_shared::dlq::{DeadLetterSink, FailedMessage, FailureReason};
use loyalty_shared::kafka::{ConsumerMessage, KafkaConsumer, topics};
use loyalty_shared::observability::metrics;
use loyalty_shared::retry::{RetryPolicy, retry_with_policy};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::WorkerError;

/// 消费者订阅的全部 topic
pub const SUBSCRIBED_TOPICS: [&str; 3] = [
    topics::RIDER_SIGNUP,
    topics::RIDE_CREATED,
    topics::RIDE_COMPLETED,
];

/// 单条消息的最终去向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Handled(HandleOutcome),
    DeadLettered,
}

/// 消息分发器
///
/// 与 Kafka 连接解耦，单元测试可以直接构造 `ConsumerMessage` 调用。
pub struct MessageDispatcher<R: RiderStore, D: RideStore> {
    reconciler: EventReconciler<R, D>,
    dlq: Arc<dyn DeadLetterSink>,
    retry_policy: RetryPolicy,
}

impl<R: RiderStore, D: RideStore> MessageDispatcher<R, D> {
    pub fn new(
        reconciler: EventReconciler<R, D>,
        dlq: Arc<dyn DeadLetterSink>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            reconciler,
            dlq,
            retry_policy,
        }
    }

    /// 处理单条消息
    ///
    /// 只有死信投递本身失败时才返回错误，调用方不能确认这条消息，应重新投递。
    pub async fn handle_message(
        &self,
        msg: &ConsumerMessage,
    ) -> Result<MessageOutcome, WorkerError> {
        let started = Instant::now();
        let event_type = event_type_for(&msg.topic);

        debug!(
            topic = %msg.topic,
            partition = msg.partition,
            offset = msg.offset,
            timestamp = ?msg.timestamp,
            redelivery_count = msg.redelivery_count,
            "开始处理积分事件"
        );

        let result = retry_with_policy(
            &self.retry_policy,
            event_type,
            WorkerError::is_retryable,
            || self.dispatch(msg),
        )
        .await;

        match result {
            Ok(outcome) => {
                metrics::record_event(
                    event_type,
                    outcome.as_str(),
                    started.elapsed().as_secs_f64(),
                );
                Ok(MessageOutcome::Handled(outcome))
            }
            Err(e) => {
                self.dead_letter(msg, &e).await?;
                let label = if e.is_malformed() { "malformed" } else { "failed" };
                metrics::record_event(event_type, label, started.elapsed().as_secs_f64());
                Ok(MessageOutcome::DeadLettered)
            }
        }
    }

    async fn dispatch(&self, msg: &ConsumerMessage) -> Result<HandleOutcome, WorkerError> {
        let outcome = match msg.topic.as_str() {
            topics::RIDER_SIGNUP => {
                let event = SignupEvent::decode(&msg.payload)?;
                self.reconciler.handle_signup(&event).await?
            }
            topics::RIDE_CREATED => {
                let event = RideCreatedEvent::decode(&msg.payload)?;
                self.reconciler.handle_ride_created(&event).await?
            }
            topics::RIDE_COMPLETED => {
                let event = RideCompletedEvent::decode(&msg.payload)?;
                self.reconciler.handle_ride_completed(&event).await?
            }
            other => {
                return Err(WorkerError::UnknownTopic {
                    topic: other.to_string(),
                });
            }
        };
        Ok(outcome)
    }

    async fn dead_letter(
        &self,
        msg: &ConsumerMessage,
        err: &WorkerError,
    ) -> Result<(), WorkerError> {
        // 格式错误从未重试；其余错误走到这里说明重试预算已经用完
        let retry_count = if err.is_retryable() {
            self.retry_policy.max_retries
        } else {
            0
        };
        let error = err.to_string();

        warn!(
            topic = %msg.topic,
            partition = msg.partition,
            offset = msg.offset,
            error_code = err.code(),
            retry_count,
            error = %error,
            "积分事件处理失败，发送到死信队列"
        );

        let failed = FailedMessage {
            key: msg.key.as_deref(),
            topic: &msg.topic,
            partition: msg.partition,
            offset: msg.offset,
            payload: &msg.payload,
        };
        let reason = FailureReason {
            error: &error,
            error_code: err.code(),
            retry_count,
            replayable: !err.is_malformed(),
        };

        self.dlq.send_to_dlq(&failed, &reason).await?;
        Ok(())
    }
}

fn event_type_for(topic: &str) -> &'static str {
    match topic {
        topics::RIDER_SIGNUP => SignupEvent::EVENT_TYPE,
        topics::RIDE_CREATED => RideCreatedEvent::EVENT_TYPE,
        topics::RIDE_COMPLETED => RideCompletedEvent::EVENT_TYPE,
        _ => "unknown",
    }
}

/// 积分事件消费者
///
/// 组合 KafkaConsumer（消息拉取）与 MessageDispatcher（路由、重试、死信）。
pub struct LoyaltyConsumer<R: RiderStore, D: RideStore> {
    consumer: KafkaConsumer,
    dispatcher: MessageDispatcher<R, D>,
}

impl<R: RiderStore, D: RideStore> LoyaltyConsumer<R, D> {
    pub fn new(
        config: &AppConfig,
        dispatcher: MessageDispatcher<R, D>,
    ) -> Result<Self, WorkerError> {
        let consumer = KafkaConsumer::new(&config.kafka, None)?;
        Ok(Self {
            consumer,
            dispatcher,
        })
    }

    /// 启动消费循环，直到收到 shutdown 信号
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        self.consumer.subscribe(&SUBSCRIBED_TOPICS)?;

        info!(topics = ?SUBSCRIBED_TOPICS, "积分事件消费者已启动");

        let dispatcher = self.dispatcher;

        self.consumer
            .start(shutdown, |msg| {
                let dispatcher = &dispatcher;
                async move { dispatcher.handle_message(&msg).await.map(|_| ()) }
            })
            .await?;

        info!("积分事件消费者已停止");
        Ok(())
    }
}
