//! Operation Metrics
//!
//! Prometheus collectors for operation progress, outcomes and pool size,
//! kept in a private registry and rendered by the metrics server.

use crate::error::{Error, Result};
use prometheus::{Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Collectors exported at `/metrics`
pub struct RaidMetrics {
    registry: Registry,
    operation_progress: IntGaugeVec,
    operations_total: IntCounterVec,
    pool_members: IntGauge,
}

impl RaidMetrics {
    /// Create and register all collectors
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let operation_progress = IntGaugeVec::new(
            Opts::new(
                "raid_operation_progress",
                "Progress (0-100) of the most recent operation of each kind",
            ),
            &["kind"],
        )
        .map_err(metrics_error)?;
        let operations_total = IntCounterVec::new(
            Opts::new(
                "raid_operations_total",
                "Operations that reached a terminal state",
            ),
            &["kind", "outcome"],
        )
        .map_err(metrics_error)?;
        let pool_members = IntGauge::new("raid_pool_members", "Devices in the pool descriptor")
            .map_err(metrics_error)?;

        registry
            .register(Box::new(operation_progress.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(operations_total.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(pool_members.clone()))
            .map_err(metrics_error)?;

        Ok(Arc::new(Self {
            registry,
            operation_progress,
            operations_total,
            pool_members,
        }))
    }

    pub fn observe_progress(&self, kind: &str, progress: u8) {
        self.operation_progress
            .with_label_values(&[kind])
            .set(i64::from(progress));
    }

    pub fn record_outcome(&self, kind: &str, outcome: &str) {
        self.operations_total
            .with_label_values(&[kind, outcome])
            .inc();
    }

    pub fn set_pool_members(&self, members: usize) {
        self.pool_members.set(members as i64);
    }

    /// Render in the Prometheus text format. Returns (content type, body).
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_collectors() {
        let metrics = RaidMetrics::new().unwrap();
        metrics.observe_progress("replace-device", 42);
        metrics.record_outcome("replace-device", "finished");
        metrics.set_pool_members(3);

        let (content_type, body) = metrics.encode().unwrap();
        let body = String::from_utf8(body).unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(body.contains("raid_operation_progress{kind=\"replace-device\"} 42"));
        assert!(body.contains("raid_operations_total{kind=\"replace-device\",outcome=\"finished\"} 1"));
        assert!(body.contains("raid_pool_members 3"));
    }
}
