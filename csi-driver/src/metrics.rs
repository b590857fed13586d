//! Prometheus metrics for the CSI driver
//!
//! Provides metrics for CSI operations, cloud agent connectivity, GID
//! allocation, published mounts and supervised processes.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: Total number of CSI operations by type and status
    pub const CSI_OPERATIONS_TOTAL: &str = "csi_operations_total";
    /// Histogram: Duration of CSI operations in seconds
    pub const CSI_OPERATION_DURATION_SECONDS: &str = "csi_operation_duration_seconds";
    /// Gauge: Cloud agent connection status (1 = connected, 0 = disconnected)
    pub const CSI_AGENT_CONNECTED: &str = "csi_agent_connected";
    /// Counter: Number of cloud agent connection attempts
    pub const CSI_AGENT_CONNECTION_ATTEMPTS: &str = "csi_agent_connection_attempts";
    /// Counter: Number of retried cloud calls
    pub const CSI_RETRIES_TOTAL: &str = "csi_retries_total";
    /// Gauge: GIDs currently allocated, per file system
    pub const CSI_ALLOCATED_GIDS: &str = "csi_allocated_gids";
    /// Gauge: Target paths currently tracked as mounted
    pub const CSI_PUBLISHED_MOUNTS: &str = "csi_published_mounts";
    /// Counter: Restarts of the mount tunnel helper by outcome
    pub const CSI_WATCHDOG_RESTARTS_TOTAL: &str = "csi_watchdog_restarts_total";
    /// Counter: Re-parented children collected by the reaper
    pub const CSI_REAPED_ORPHANS_TOTAL: &str = "csi_reaped_orphans_total";
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

/// Record a CSI operation with its result
pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::CSI_OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::CSI_OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

/// Record cloud agent connection status
pub fn set_agent_connected(connected: bool) {
    gauge!(names::CSI_AGENT_CONNECTED).set(if connected { 1.0 } else { 0.0 });
}

/// Record a cloud agent connection attempt
pub fn record_connection_attempt(success: bool) {
    counter!(names::CSI_AGENT_CONNECTION_ATTEMPTS, "success" => success.to_string()).increment(1);
}

/// Record a retry attempt
pub fn record_retry(operation: &str) {
    counter!(names::CSI_RETRIES_TOTAL, "operation" => operation.to_string()).increment(1);
}

pub fn set_allocated_gids(file_system_id: &str, count: usize) {
    gauge!(names::CSI_ALLOCATED_GIDS, "file_system_id" => file_system_id.to_string())
        .set(count as f64);
}

pub fn set_published_mounts(count: usize) {
    gauge!(names::CSI_PUBLISHED_MOUNTS).set(count as f64);
}

pub fn record_watchdog_restart(success: bool) {
    counter!(names::CSI_WATCHDOG_RESTARTS_TOTAL, "success" => success.to_string()).increment(1);
}

pub fn record_orphan_reaped() {
    counter!(names::CSI_REAPED_ORPHANS_TOTAL).increment(1);
}

/// Helper for timing operations
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    /// Start timing an operation
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    /// Complete the operation, labelled by the gRPC code of `result`
    pub fn finish<T>(self, result: &Result<T, tonic::Status>) {
        match result {
            Ok(_) => self.success(),
            Err(status) => self.failure(&format!("{:?}", status.code())),
        }
    }

    /// Complete the operation with success
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.operation, "success", duration);
    }

    /// Complete the operation with failure
    pub fn failure(self, error_code: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.operation, error_code, duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_timer() {
        // Recording without an installed exporter is a no-op
        OperationTimer::new("create_volume").finish(&Ok::<(), tonic::Status>(()));
        OperationTimer::new("create_volume")
            .finish(&Err::<(), _>(tonic::Status::not_found("missing")));
        set_allocated_gids("fs-1", 3);
        set_published_mounts(1);
        record_watchdog_restart(true);
        record_orphan_reaped();
    }
}
