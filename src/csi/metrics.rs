use prometheus::{CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;
use std::time::Instant;
use tonic::{Response, Status};

use crate::csi::error::CsiResult;

/// CSI metrics collector
pub struct CsiMetrics {
    /// Total CSI operations
    pub operations_total: CounterVec,
    /// CSI operation duration in seconds
    pub operation_duration: HistogramVec,
    /// CSI operation errors
    pub operation_errors: CounterVec,
    /// Volumes known to the controller
    pub volume_count: Gauge,
    /// Volumes staged on this node
    pub staged_volumes: Gauge,
    /// Bind mounts published on this node
    pub published_targets: Gauge,
}

impl CsiMetrics {
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        let operations_total = CounterVec::new(
            Opts::new("cephcsi_operations_total", "Total CSI operations"),
            &["method"],
        )?;

        let operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "cephcsi_operation_duration_seconds",
                "CSI operation duration in seconds",
            ),
            &["method"],
        )?;

        let operation_errors = CounterVec::new(
            Opts::new("cephcsi_operation_errors_total", "CSI operation errors"),
            &["method"],
        )?;

        let volume_count = Gauge::new("cephcsi_volume_count", "Volumes known to the controller")?;
        let staged_volumes = Gauge::new("cephcsi_staged_volumes", "Volumes staged on this node")?;
        let published_targets =
            Gauge::new("cephcsi_published_targets", "Bind mounts published on this node")?;

        registry.register(Box::new(operations_total.clone()))?;
        registry.register(Box::new(operation_duration.clone()))?;
        registry.register(Box::new(operation_errors.clone()))?;
        registry.register(Box::new(volume_count.clone()))?;
        registry.register(Box::new(staged_volumes.clone()))?;
        registry.register(Box::new(published_targets.clone()))?;

        Ok(Self {
            operations_total,
            operation_duration,
            operation_errors,
            volume_count,
            staged_volumes,
            published_targets,
        })
    }

    /// Metrics attached to a throwaway registry, for services built without a shared one.
    pub fn unregistered() -> Result<Self, prometheus::Error> {
        Self::new(Arc::new(Registry::new()))
    }

    /// Record an operation
    pub fn record_operation(&self, method: &str, duration_secs: f64, success: bool) {
        self.operations_total.with_label_values(&[method]).inc();
        self.operation_duration.with_label_values(&[method]).observe(duration_secs);
        if !success {
            self.operation_errors.with_label_values(&[method]).inc();
        }
    }

    pub fn observe(&self, method: &str, started: Instant, success: bool) {
        self.record_operation(method, started.elapsed().as_secs_f64(), success);
    }

    /// Record the outcome of an RPC and turn it into the gRPC reply.
    pub fn finish<T>(
        &self,
        method: &str,
        started: Instant,
        result: CsiResult<T>,
    ) -> Result<Response<T>, Status> {
        self.observe(method, started, result.is_ok());
        match result {
            Ok(reply) => Ok(Response::new(reply)),
            Err(e) => {
                tracing::error!(method, error = %e, "CSI call failed");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csi_metrics_creation() {
        let registry = Arc::new(Registry::new());
        let metrics = CsiMetrics::new(registry).unwrap();

        metrics.record_operation("CreateVolume", 1.5, true);
        assert_eq!(metrics.operations_total.with_label_values(&["CreateVolume"]).get(), 1.0);
        assert_eq!(metrics.operation_errors.with_label_values(&["CreateVolume"]).get(), 0.0);
    }

    #[test]
    fn test_failed_operation_counts_error() {
        let metrics = CsiMetrics::unregistered().unwrap();

        metrics.observe("NodeUnstageVolume", Instant::now(), false);
        assert_eq!(metrics.operation_errors.with_label_values(&["NodeUnstageVolume"]).get(), 1.0);
    }

    #[test]
    fn test_finish_maps_error() {
        let metrics = CsiMetrics::unregistered().unwrap();

        let ok = metrics.finish("Probe", Instant::now(), Ok(7));
        assert_eq!(ok.unwrap().into_inner(), 7);

        let err = metrics
            .finish::<()>(
                "DeleteVolume",
                Instant::now(),
                Err(crate::csi::error::CsiError::invalid_argument("Volume ID missing in request")),
            )
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        assert_eq!(metrics.operation_errors.with_label_values(&["DeleteVolume"]).get(), 1.0);
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Arc::new(Registry::new());
        CsiMetrics::new(registry.clone()).unwrap();
        assert!(CsiMetrics::new(registry).is_err());
    }
}
