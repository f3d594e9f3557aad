//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Metrics 资源守卫
pub struct MetricsHandle {
    _server_handle: tokio::task::JoinHandle<()>,
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(service_name: &str, port: u16) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    register_common_metrics(service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

/// 注册指标描述，出现在 /metrics 端点的 HELP 注释中
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(
        "events_received_total",
        "Total number of queue messages by event type and outcome"
    );
    metrics::describe_counter!("points_awarded_total", "Total points awarded");
    metrics::describe_histogram!(
        "ledger_update_duration_seconds",
        "Duration of a points ledger update in seconds"
    );
    metrics::describe_counter!(
        "ledger_compensations_total",
        "Compensating writes issued after a failed ranked index write"
    );
    metrics::describe_counter!(
        "ledger_divergence_repairs_total",
        "Ranked index entries rewritten by reconciliation"
    );
    metrics::describe_counter!("consumer_reconnects_total", "Broker reconnect attempts");
    metrics::describe_gauge!(
        "consumer_state",
        "Queue consumer state (0=disconnected,1=connecting,2=declaring,3=consuming)"
    );
    metrics::describe_counter!("dead_letters_total", "Messages published to the dead-letter queue");

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录一条消息的处理结果（acked / ignored / discarded）
#[inline]
pub fn record_event(event_type: &str, outcome: &str) {
    metrics::counter!(
        "events_received_total",
        "event_type" => event_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// 记录一次积分发放
#[inline]
pub fn record_points_awarded(event_type: &str, points: i64, duration_secs: f64) {
    metrics::counter!(
        "points_awarded_total",
        "event_type" => event_type.to_string()
    )
    .increment(points.unsigned_abs());

    metrics::histogram!("ledger_update_duration_seconds").record(duration_secs);
}

/// 记录补偿写入结果（restored / failed）
#[inline]
pub fn record_compensation(result: &str) {
    metrics::counter!("ledger_compensations_total", "result" => result.to_string()).increment(1);
}

#[inline]
pub fn record_divergence_repair() {
    metrics::counter!("ledger_divergence_repairs_total").increment(1);
}

#[inline]
pub fn record_reconnect() {
    metrics::counter!("consumer_reconnects_total").increment(1);
}

#[inline]
pub fn set_consumer_state(state: f64) {
    metrics::gauge!("consumer_state").set(state);
}

#[inline]
pub fn record_dead_letter(error_kind: &str) {
    metrics::counter!("dead_letters_total", "error_kind" => error_kind.to_string()).increment(1);
}
