//! PostgreSQL 连接池与 schema 迁移
//!
//! 连接池建立后立即执行一次探活查询，数据库不可达时 worker 在启动阶段就失败，
//! 而不是等到第一条消息才暴露。

use crate::config::DatabaseConfig;
use crate::error::Result;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::{Duration, Instant};
use tracing::{info, instrument};

/// 仓库根目录下的 migrations，编译期嵌入二进制
static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// 乘客与行程存储共用的连接池
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// 建立连接池并探活
    #[instrument(skip(config), fields(target = %redact_url(&config.url)))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let started = Instant::now();

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .connect(&config.url)
            .await?;

        let db = Self { pool };
        db.health_check().await?;

        info!(
            max_connections = config.max_connections,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "数据库连接池已就绪"
        );
        Ok(db)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// 等待借出的连接归还后关闭连接池
    pub async fn close(self) {
        self.pool.close().await;
        info!("数据库连接池已关闭");
    }

    /// 执行 riders / rides 表迁移，已执行过的版本会被跳过
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await?;
        info!(migrations = MIGRATOR.iter().count(), "数据库迁移已完成");
        Ok(())
    }
}

/// 去掉连接串中的密码，只用于日志
fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((credentials, host)) = rest.rsplit_once('@') else {
        return url.to_string();
    };
    match credentials.split_once(':') {
        Some((user, _)) => format!("{scheme}://{user}:***@{host}"),
        None => url.to_string(),
    }
}
