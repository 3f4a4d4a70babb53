//! Prometheus metrics for the node service
//!
//! Node operations are counted and timed here; the connectivity engine
//! records its own reload, rescan and flush counters through the same
//! recorder once the exporter is installed.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: node operations by type and status
    pub const NODE_OPERATIONS_TOTAL: &str = "csi_node_operations_total";
    /// Histogram: duration of node operations in seconds
    pub const NODE_OPERATION_DURATION_SECONDS: &str = "csi_node_operation_duration_seconds";
    /// Counter: requests rejected because the volume was already being processed
    pub const VOLUME_BUSY_TOTAL: &str = "csi_node_volume_busy_total";
}

/// Initialize the Prometheus metrics exporter
///
/// Starts an HTTP server on the specified address that serves metrics
/// at the `/metrics` endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on http://{}/metrics", addr);
    Ok(())
}

pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::NODE_OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::NODE_OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

pub fn record_volume_busy(operation: &str) {
    counter!(names::VOLUME_BUSY_TOTAL, "operation" => operation.to_string()).increment(1);
}

/// Helper for timing operations
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.operation, "success", duration);
    }

    /// Complete the operation with a failure labelled by `status`
    pub fn failure(self, status: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.operation, status, duration);
    }
}
