//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::ObservabilityConfig;
use crate::error::InfraError;

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源守卫
pub struct MetricsHandle {
    server_handle: tokio::task::JoinHandle<()>,
}

impl MetricsHandle {
    /// 停止指标 HTTP 服务
    pub fn shutdown(self) {
        self.server_handle.abort();
    }
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 与 `/health` 端点。
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle, InfraError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| InfraError::Observability(format!("安装 Prometheus recorder 失败: {e}")))?;

    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    register_loyalty_metrics(&config.service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle { server_handle })
}

/// 注册积分对账相关的指标描述，出现在 /metrics 的 HELP 注释中
fn register_loyalty_metrics(service_name: &str) {
    metrics::describe_counter!(
        "loyalty_events_total",
        "Total number of loyalty events handled, by event type and outcome"
    );
    metrics::describe_histogram!(
        "loyalty_event_duration_seconds",
        "Loyalty event handling duration in seconds"
    );
    metrics::describe_counter!(
        "loyalty_points_awarded_total",
        "Total loyalty points awarded by ride completions"
    );
    metrics::describe_counter!(
        "loyalty_tier_upgrades_total",
        "Total number of rider tier upgrades"
    );
    metrics::describe_counter!(
        "loyalty_dead_letters_total",
        "Total number of messages sent to the dead-letter queue"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

fn router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }))
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>, InfraError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| InfraError::Observability(format!("绑定指标端口 {addr} 失败: {e}")))?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router(handle)).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

/// 获取全局 Prometheus handle（用于自定义渲染）
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录一次事件处理
///
/// outcome 取值：applied / duplicate / malformed / error
#[inline]
pub fn record_event(event_type: &str, outcome: &str, duration_secs: f64) {
    metrics::counter!(
        "loyalty_events_total",
        "event_type" => event_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "loyalty_event_duration_seconds",
        "event_type" => event_type.to_string()
    )
    .record(duration_secs);
}

/// 记录发放的积分
#[inline]
pub fn record_points_awarded(points: i64) {
    if points > 0 {
        metrics::counter!("loyalty_points_awarded_total").increment(points as u64);
    }
}

/// 记录等级升级
#[inline]
pub fn record_tier_upgrade(status: &str) {
    metrics::counter!(
        "loyalty_tier_upgrades_total",
        "status" => status.to_string()
    )
    .increment(1);
}
