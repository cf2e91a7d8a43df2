//! Kafka 基础设施封装
//!
//! 将 rdkafka 的底层 API 封装为业务友好的 Producer/Consumer 抽象，
//! 统一消息序列化、错误映射和优雅关闭语义。
//!
//! 消费端采用"处理成功后再存储 offset"的至少一次语义：
//! handler 失败时回退到该消息重新投递；进程在处理中途崩溃时，
//! 未存储的消息同样会被重新投递，由下游处理器的幂等性兜底。

use std::collections::HashMap;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::Offset;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::InfraError;

// ---------------------------------------------------------------------------
// Topic 常量
// ---------------------------------------------------------------------------

/// 集中管理所有 Kafka topic 名称，与上游派单系统的路由键保持一致
pub mod topics {
    pub const RIDER_SIGNUP: &str = "rider.signup";
    pub const RIDE_CREATED: &str = "ride.created";
    pub const RIDE_COMPLETED: &str = "ride.completed";
    pub const DEAD_LETTER_QUEUE: &str = "loyalty.dlq";
}

/// handler 失败后、回退 offset 前的等待时间
const REDELIVERY_BACKOFF: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 消费到的 Kafka 消息的统一表示
///
/// 将 rdkafka 的 `BorrowedMessage`（带生命周期约束）转换为拥有所有权的结构体，
/// 使消息可以安全地跨 await 点传递给异步处理函数。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
    /// 本进程内因 handler 失败而回退重投的次数，首次投递为 0
    pub redelivery_count: u32,
}

impl ConsumerMessage {
    /// 从 rdkafka 的借用消息构造，提取并拥有所有字段
    fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from);

        let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

        let timestamp = msg.timestamp().to_millis();

        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for idx in 0..h.count() {
                let header = h.get(idx);
                if let Some(raw) = header.value
                    && let Ok(value) = std::str::from_utf8(raw)
                {
                    headers.insert(header.key.to_string(), value.to_string());
                }
            }
        }

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            payload,
            timestamp,
            headers,
            redelivery_count: 0,
        }
    }

    pub fn is_redelivery(&self) -> bool {
        self.redelivery_count > 0
    }
}

// ---------------------------------------------------------------------------
// RedeliveryTracker
// ---------------------------------------------------------------------------

/// 记录每个分区上因 handler 失败而回退的 offset
///
/// 同一分区在失败消息成功之前不会越过它，所以每个分区最多只有一条待重投的消息。
/// 进程重启后计数归零。
#[derive(Debug, Default)]
pub struct RedeliveryTracker {
    pending: HashMap<(String, i32), (i64, u32)>,
}

impl RedeliveryTracker {
    /// 该消息此前已失败的次数
    pub fn redelivery_count(&self, topic: &str, partition: i32, offset: i64) -> u32 {
        match self.pending.get(&(topic.to_string(), partition)) {
            Some((pending, count)) if *pending == offset => *count,
            _ => 0,
        }
    }

    /// 记录一次失败，返回该消息累计的失败次数
    pub fn record_failure(&mut self, topic: &str, partition: i32, offset: i64) -> u32 {
        let entry = self
            .pending
            .entry((topic.to_string(), partition))
            .or_insert((offset, 0));
        if entry.0 != offset {
            *entry = (offset, 0);
        }
        entry.1 += 1;
        entry.1
    }

    pub fn record_success(&mut self, topic: &str, partition: i32) {
        self.pending.remove(&(topic.to_string(), partition));
    }
}

// ---------------------------------------------------------------------------
// KafkaProducer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 生产者
///
/// 封装 `FutureProducer` 并提供类型安全的 JSON 发送方法，
/// `FutureProducer` 本身是 Arc 包装的，克隆开销很小。
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    /// 根据配置创建生产者
    pub fn new(config: &KafkaConfig) -> Result<Self, InfraError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| InfraError::Kafka(format!("创建生产者失败: {e}")))?;

        info!(brokers = %config.brokers, "Kafka 生产者已初始化");
        Ok(Self { producer })
    }

    /// 发送原始字节消息，返回写入的分区与 offset
    pub async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<(i32, i64), InfraError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        let delivery = self
            .producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| InfraError::Kafka(format!("发送消息失败: {e}")))?;

        debug!(
            topic,
            key,
            partition = delivery.partition,
            offset = delivery.offset,
            "消息已发送"
        );
        Ok((delivery.partition, delivery.offset))
    }

    /// 将值序列化为 JSON 后发送
    pub async fn send_json<T: Serialize>(
        &self,
        topic: &str,
        key: &str,
        value: &T,
    ) -> Result<(i32, i64), InfraError> {
        let payload = serde_json::to_vec(value)?;

        self.send(topic, key, &payload).await
    }
}

// ---------------------------------------------------------------------------
// KafkaConsumer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 消费者
///
/// 封装 `StreamConsumer` 并提供基于 `watch` channel 的优雅关闭语义。
pub struct KafkaConsumer {
    consumer: StreamConsumer,
}

impl KafkaConsumer {
    /// 创建消费者
    ///
    /// 关闭自动存储 offset（`enable.auto.offset.store=false`），
    /// 由消费循环在 handler 返回后显式存储，自动提交只提交已存储的 offset。
    pub fn new(config: &KafkaConfig, group_id_suffix: Option<&str>) -> Result<Self, InfraError> {
        let group_id = match group_id_suffix {
            Some(suffix) => format!("{}.{}", config.consumer_group, suffix),
            None => config.consumer_group.clone(),
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &group_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .create()
            .map_err(|e| InfraError::Kafka(format!("创建消费者失败: {e}")))?;

        info!(brokers = %config.brokers, group_id, "Kafka 消费者已初始化");
        Ok(Self { consumer })
    }

    /// 订阅指定的 topic 列表
    pub fn subscribe(&self, topics: &[&str]) -> Result<(), InfraError> {
        self.consumer
            .subscribe(topics)
            .map_err(|e| InfraError::Kafka(format!("订阅 topic 失败: {e}")))?;

        info!(?topics, "已订阅 Kafka topics");
        Ok(())
    }

    /// 启动消费循环
    ///
    /// 使用 `tokio::select!` 同时监听消息流和关闭信号：
    /// - 收到消息时调用 handler 处理，handler 成功后才存储该消息的 offset；
    ///   handler 返回错误时不存储，等待片刻后把分区回退到这条消息重新投递，
    ///   同一分区后续的消息在它成功之前都不会被存储。回退失败时退出循环并返回错误，
    ///   进程重启后从最后存储的 offset 继续。
    /// - 关闭信号变为 `true`（或发送端被 drop）时退出循环，正在执行的 handler 会自然完成。
    pub async fn start<F, Fut, E>(
        self,
        mut shutdown: watch::Receiver<bool>,
        handler: F,
    ) -> Result<(), InfraError>
    where
        F: Fn(ConsumerMessage) -> Fut,
        Fut: std::future::Future<Output = Result<(), E>>,
        E: std::fmt::Display,
    {
        use futures::StreamExt;

        let stream = self.consumer.stream();
        futures::pin_mut!(stream);
        let mut redeliveries = RedeliveryTracker::default();

        info!("Kafka 消费循环已启动");

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    // 发送端被 drop 也视为关闭，否则 changed() 会立即返回导致空转
                    if changed.is_err() || *shutdown.borrow() {
                        info!("收到关闭信号，Kafka 消费循环退出");
                        break;
                    }
                }

                msg_result = stream.next() => {
                    let Some(msg_result) = msg_result else {
                        warn!("Kafka 消息流意外结束");
                        break;
                    };

                    match msg_result {
                        Ok(borrowed_msg) => {
                            let mut msg = ConsumerMessage::from_borrowed(&borrowed_msg);
                            msg.redelivery_count =
                                redeliveries.redelivery_count(&msg.topic, msg.partition, msg.offset);
                            let (topic, partition, offset) =
                                (msg.topic.clone(), msg.partition, msg.offset);
                            debug!(
                                topic = %topic,
                                partition,
                                offset,
                                redelivery_count = msg.redelivery_count,
                                "收到 Kafka 消息"
                            );

                            match handler(msg).await {
                                Ok(()) => {
                                    redeliveries.record_success(&topic, partition);
                                    if let Err(e) = self.consumer.store_offset_from_message(&borrowed_msg) {
                                        warn!(error = %e, "存储 offset 失败，消息可能被重复投递");
                                    }
                                }
                                Err(e) => {
                                    let failures = redeliveries.record_failure(&topic, partition, offset);
                                    error!(
                                        error = %e,
                                        topic = %topic,
                                        partition,
                                        offset,
                                        failures,
                                        "处理 Kafka 消息失败，不存储 offset，回退后重新投递"
                                    );

                                    tokio::time::sleep(REDELIVERY_BACKOFF).await;
                                    self.consumer
                                        .seek(
                                            &topic,
                                            partition,
                                            Offset::Offset(offset),
                                            Duration::from_secs(5),
                                        )
                                        .map_err(|e| {
                                            InfraError::Kafka(format!("回退 offset 失败: {e}"))
                                        })?;
                                }
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "接收 Kafka 消息出错");
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------
