//! Prometheus instrumentation: api server request timing plus per-cluster
//! reconcile counters, exposed by the http server in `server.rs`.

use prometheus::{
    exponential_buckets, Encoder, Histogram, HistogramOpts, HistogramTimer, IntCounter,
    IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use std::fmt::{self, Debug};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const NAMESPACE_AND_NAME: &[&str] = &["namespace", "name"];

pub struct Metrics {
    registry: Registry,
    client: ClientMetrics,
    reconcile_count: IntCounterVec,
    reconcile_errors: IntCounterVec,
    managed_clusters: IntGauge,
}

impl Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Metrics")
    }
}

impl Metrics {
    pub fn new() -> Metrics {
        let registry = Registry::new();

        let request_time_opts = HistogramOpts::new(
            "api_server_request_time",
            "Total time from sending a request to finishing the response body",
        )
        .subsystem("client")
        .buckets(exponential_buckets(0.005, 2.0, 12).unwrap());
        let request_times = Histogram::with_opts(request_time_opts).unwrap();
        registry.register(Box::new(request_times.clone())).unwrap();

        let request_error_opts = Opts::new(
            "api_server_request_errors",
            "Number of api server requests that failed",
        )
        .subsystem("client");
        let request_errors = IntCounter::with_opts(request_error_opts).unwrap();
        registry.register(Box::new(request_errors.clone())).unwrap();

        let reconcile_opts = Opts::new(
            "reconcile_count",
            "Number of reconcile runs per managed cluster",
        );
        let reconcile_count = IntCounterVec::new(reconcile_opts, NAMESPACE_AND_NAME).unwrap();
        registry.register(Box::new(reconcile_count.clone())).unwrap();

        let reconcile_error_opts = Opts::new(
            "reconcile_errors",
            "Number of reconcile runs that failed per managed cluster",
        );
        let reconcile_errors = IntCounterVec::new(reconcile_error_opts, NAMESPACE_AND_NAME).unwrap();
        registry
            .register(Box::new(reconcile_errors.clone()))
            .unwrap();

        let managed_opts = Opts::new("managed_clusters", "Number of clusters in the registry");
        let managed_clusters = IntGauge::with_opts(managed_opts).unwrap();
        registry
            .register(Box::new(managed_clusters.clone()))
            .unwrap();

        Metrics {
            registry,
            client: ClientMetrics {
                request_times,
                request_errors,
            },
            reconcile_count,
            reconcile_errors,
            managed_clusters,
        }
    }

    pub fn client_metrics(&self) -> ClientMetrics {
        self.client.clone()
    }

    pub fn reconcile_started(&self, namespace: &str, name: &str) {
        self.reconcile_count
            .with_label_values(&[namespace, name])
            .inc();
    }

    pub fn reconcile_failed(&self, namespace: &str, name: &str) {
        self.reconcile_errors
            .with_label_values(&[namespace, name])
            .inc();
    }

    pub fn set_managed_clusters(&self, count: i64) {
        self.managed_clusters.set(count);
    }

    pub fn encode_as_text(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer).expect("prometheus text output is utf8"))
    }
}

impl Default for Metrics {
    fn default() -> Metrics {
        Metrics::new()
    }
}

/// Timestamp of the watch loop's most recent observable progress: a
/// completed list, a received watch frame (bookmarks included) or a
/// successful reconnect. The operator loop writes it, the `/health`
/// endpoint reads it.
#[derive(Clone)]
pub struct Liveness(Arc<Mutex<Instant>>);

impl Debug for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Liveness")
    }
}

impl Liveness {
    pub fn new() -> Liveness {
        Liveness(Arc::new(Mutex::new(Instant::now())))
    }

    pub fn touch(&self) {
        *self.0.lock().expect("liveness lock poisoned") = Instant::now();
    }

    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.0.lock().expect("liveness lock poisoned").elapsed() > max_age
    }
}

impl Default for Liveness {
    fn default() -> Liveness {
        Liveness::new()
    }
}

/// The slice of metrics the KubeClient updates.
#[derive(Clone)]
pub struct ClientMetrics {
    request_times: Histogram,
    request_errors: IntCounter,
}

impl Debug for ClientMetrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("ClientMetrics")
    }
}

impl ClientMetrics {
    pub fn request_started(&self) -> HistogramTimer {
        self.request_times.start_timer()
    }

    pub fn request_failed(&self) {
        self.request_errors.inc();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn liveness_goes_stale_without_touches() {
        let liveness = Liveness::new();
        assert!(!liveness.is_stale(Duration::from_secs(3600)));

        std::thread::sleep(Duration::from_millis(5));
        assert!(liveness.is_stale(Duration::from_millis(1)));

        liveness.touch();
        assert!(!liveness.is_stale(Duration::from_secs(3600)));
    }

    #[test]
    fn encodes_registered_metrics_as_text() {
        let metrics = Metrics::new();
        metrics.reconcile_started("default", "example");
        metrics.set_managed_clusters(1);
        let text = metrics.encode_as_text().unwrap();
        assert!(text.contains("reconcile_count"));
        assert!(text.contains("managed_clusters"));
    }
}
