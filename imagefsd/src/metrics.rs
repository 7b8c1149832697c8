//! Prometheus metrics for the driver.
//!
//! The registry is owned by an explicitly constructed [`Metrics`] value and
//! threaded through constructors; nothing here is process-global.

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

/// Label value for the `failed` dimension.
pub fn failed_label(failed: bool) -> &'static str {
    if failed {
        "true"
    } else {
        "false"
    }
}

/// Metrics surface of the driver.
pub struct Metrics {
    registry: Registry,

    /// Pull wall time, bucketed, labelled by outcome.
    pub image_pull_seconds: HistogramVec,
    /// Last pull wall time per image.
    pub image_pull_time: GaugeVec,
    /// Compressed size of the most recent successful pull per image.
    pub image_pull_size_bytes: GaugeVec,
    /// Operation errors by kind (`pull-error`, `size-error`, `mount-error`,
    /// `unmount-error`, `snapshot-error`).
    pub operation_errors: CounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let image_pull_seconds = HistogramVec::new(
            HistogramOpts::new("imagefs_image_pull_seconds", "Image pull duration").buckets(vec![
                0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
            ]),
            &["failed"],
        )
        .unwrap();
        registry
            .register(Box::new(image_pull_seconds.clone()))
            .unwrap();

        let image_pull_time = GaugeVec::new(
            Opts::new(
                "imagefs_image_pull_time_seconds",
                "Duration of the most recent pull per image",
            ),
            &["image", "failed"],
        )
        .unwrap();
        registry.register(Box::new(image_pull_time.clone())).unwrap();

        let image_pull_size_bytes = GaugeVec::new(
            Opts::new(
                "imagefs_image_pull_size_bytes",
                "Compressed size of the most recent successful pull per image",
            ),
            &["image"],
        )
        .unwrap();
        registry
            .register(Box::new(image_pull_size_bytes.clone()))
            .unwrap();

        let operation_errors = CounterVec::new(
            Opts::new("imagefs_operation_errors_total", "Operation errors"),
            &["kind"],
        )
        .unwrap();
        registry
            .register(Box::new(operation_errors.clone()))
            .unwrap();

        Metrics {
            registry,
            image_pull_seconds,
            image_pull_time,
            image_pull_size_bytes,
            operation_errors,
        }
    }

    /// Record a completed pull attempt.
    pub fn observe_pull(&self, image: &str, seconds: f64, failed: bool) {
        let failed = failed_label(failed);
        self.image_pull_seconds
            .with_label_values(&[failed])
            .observe(seconds);
        self.image_pull_time
            .with_label_values(&[image, failed])
            .set(seconds);
    }

    /// Record the size probe of a successfully pulled image.
    pub fn observe_pull_size(&self, image: &str, bytes: u64) {
        self.image_pull_size_bytes
            .with_label_values(&[image])
            .set(bytes as f64);
    }

    /// Count an operation error under `kind`.
    pub fn count_error(&self, kind: &str) {
        self.operation_errors.with_label_values(&[kind]).inc();
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pull_metrics_encode() {
        let metrics = Metrics::new();
        metrics.observe_pull("docker.io/library/nginx:1.25", 3.2, false);
        metrics.observe_pull_size("docker.io/library/nginx:1.25", 55_000_000);
        metrics.count_error("pull-error");

        let text = metrics.encode();
        assert!(text.contains("imagefs_image_pull_seconds"));
        assert!(text.contains("imagefs_image_pull_size_bytes"));
        assert!(text.contains("imagefs_operation_errors_total"));
    }
}
