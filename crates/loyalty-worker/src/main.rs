//! 积分对账消费进程
//!
//! 消费派单系统的注册与行程事件，维护乘客积分、行程数与会员等级。

use std::sync::Arc;

use anyhow::Result;
use loyalty_core::LoyaltyCalculator;
use loyalty_core::reconciler::EventReconciler;
use loyalty_core::store::{PgRideStore, PgRiderStore};
use loyalty_shared::{
    config::AppConfig,
    database::Database,
    dlq::DlqProducer,
    kafka::KafkaProducer,
    observability,
    retry::RetryPolicy,
};
use loyalty_worker::{LoyaltyConsumer, MessageDispatcher};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

const SERVICE_NAME: &str = "loyalty-worker";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // 1. 统一加载配置：default.toml -> {env}.toml -> loyalty-worker.toml -> LOYALTY__* 环境变量
    let config = AppConfig::load(SERVICE_NAME)?;

    // 2. 从 AppConfig 中提取可观测性配置并注入服务名
    let obs_config = config
        .observability
        .clone()
        .with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config).await?;

    info!("Starting loyalty-worker...");
    info!(environment = %config.environment, "Configuration loaded");

    // 3. 等级阶梯配置不合法时直接拒绝启动
    let calculator = LoyaltyCalculator::new(&config.loyalty)?;

    // 4. 初始化数据库连接并执行迁移
    let db = Database::connect(&config.database).await?;
    if config.database.run_migrations {
        db.run_migrations().await?;
    }

    // 5. 创建存储与对账器
    let riders = Arc::new(PgRiderStore::new(db.pool().clone()));
    let rides = Arc::new(PgRideStore::new(db.pool().clone()));
    let reconciler = EventReconciler::new(riders, rides, calculator);

    // 6. 死信生产者与重试策略
    let producer = KafkaProducer::new(&config.kafka)?;
    let dlq = Arc::new(DlqProducer::new(producer, &config.service_name));
    let dispatcher = MessageDispatcher::new(reconciler, dlq, RetryPolicy::from(&config.retry));

    // 7. 监听 Ctrl-C，通过 watch 通道通知消费循环退出
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C, shutting down..."),
            Err(e) => error!(error = %e, "监听 Ctrl-C 失败，直接关闭消费者"),
        }
        let _ = shutdown_tx.send(true);
    });

    // 8. 运行消费循环，直到收到关闭信号
    let consumer = LoyaltyConsumer::new(&config, dispatcher)?;
    consumer.run(shutdown_rx).await?;

    db.close().await;
    info!("loyalty-worker stopped");
    Ok(())
}
