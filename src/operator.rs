//! The top-level operator loop: list the `OpenSearch` custom resources,
//! reconcile each, then watch from the list's resourceVersion and dispatch
//! events to the per-cluster reconcilers. The uid→reconciler registry is
//! owned by this single task; health-watcher callbacks capture their own
//! clones of whatever they need and never touch the registry.

use crate::client::{Error as ClientError, WatchEvent};
use crate::cluster::{ClusterReconciler, OperatorContext};
use crate::crd::ClusterManifest;
use crate::k8s_types;

use serde_json::Value;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// how often clusters whose last reconcile failed are retried
const RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Runs until a fatal watch error or a shutdown signal. Shutdown is hard:
/// in-flight reconciles are truncated, which is safe because reconciliation
/// is idempotent and resumes on restart.
pub async fn run(context: Arc<OperatorContext>) -> Result<(), ClientError> {
    let mut operator = Operator {
        context,
        registry: HashMap::new(),
    };
    tokio::select! {
        result = operator.run_watch_loop() => result,
        _ = shutdown_signal() => {
            log::info!("Received shutdown signal, exiting");
            Ok(())
        }
    }
}

struct Operator {
    context: Arc<OperatorContext>,
    registry: HashMap<String, ClusterReconciler>,
}

impl Operator {
    async fn run_watch_loop(&mut self) -> Result<(), ClientError> {
        let list = self.context.client.list(k8s_types::OpenSearch, None).await?;
        let resource_version = list.metadata.resource_version.clone().unwrap_or_default();
        log::info!(
            "Listed {} OpenSearch resources at resourceVersion {}",
            list.items.len(),
            resource_version
        );
        for item in list.items {
            self.handle_manifest(item).await;
        }
        self.context.liveness.touch();

        let liveness = self.context.liveness.clone();
        let mut events = self
            .context
            .client
            .watch(k8s_types::OpenSearch, None, &resource_version)
            .on_progress(Box::new(move || liveness.touch()));
        let mut retry_ticks = tokio::time::interval(RETRY_INTERVAL);
        retry_ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                event = events.next() => event,
                _ = retry_ticks.tick() => {
                    self.retry_failed_reconciles().await;
                    continue;
                }
            };
            match event {
                Ok(WatchEvent::Added(object)) | Ok(WatchEvent::Modified(object)) => {
                    self.handle_manifest(object).await;
                }
                Ok(WatchEvent::Deleted(object)) => {
                    self.handle_deleted(&object);
                }
                // bookmarks and error events are absorbed inside the stream
                Ok(WatchEvent::Bookmark(_)) | Ok(WatchEvent::Error(_)) => {}
                Err(ClientError::Expired) => {
                    // a fresh list after restart is cheaper than replaying an
                    // unbounded backlog, and we do not rely on DELETE-event
                    // completeness for correctness
                    log::error!("Watch resourceVersion expired, exiting for a fresh start");
                    std::process::exit(1);
                }
                Err(err) => {
                    log::error!("Watch for OpenSearch resources failed: {}", err);
                    return Err(err);
                }
            }
        }
    }

    /// A reconcile that failed partway leaves its cluster unconverged with no
    /// further watch events coming (the spec did not change). Retry all such
    /// clusters until they succeed.
    async fn retry_failed_reconciles(&mut self) {
        for (uid, reconciler) in self.registry.iter_mut() {
            if !reconciler.needs_retry() {
                continue;
            }
            let namespace = reconciler.manifest().namespace().to_owned();
            let name = reconciler.manifest().name().to_owned();
            log::info!(
                "Retrying reconcile for cluster {}/{} (uid {})",
                namespace,
                name,
                uid
            );
            if let Err(err) = reconciler.reconcile().await {
                self.context.metrics.reconcile_failed(&namespace, &name);
                log::error!(
                    "Retried reconcile for cluster {}/{} failed: {}",
                    namespace,
                    name,
                    err
                );
            }
        }
    }

    async fn handle_manifest(&mut self, object: Value) {
        let manifest = match ClusterManifest::from_value(object) {
            Ok(manifest) => manifest,
            Err(err) => {
                log::error!("Ignoring invalid OpenSearch resource: {}", err);
                return;
            }
        };
        let uid = manifest.uid().to_owned();
        let namespace = manifest.namespace().to_owned();
        let name = manifest.name().to_owned();

        let result = match self.registry.get_mut(&uid) {
            Some(reconciler) => reconciler.update(manifest).await,
            None => {
                let mut reconciler = ClusterReconciler::new(Arc::clone(&self.context), manifest);
                let result = reconciler.reconcile().await;
                self.registry.insert(uid, reconciler);
                self.context
                    .metrics
                    .set_managed_clusters(self.registry.len() as i64);
                result
            }
        };
        if let Err(err) = result {
            // the next event for this cluster retriggers the reconcile
            self.context.metrics.reconcile_failed(&namespace, &name);
            log::error!("Failed to reconcile cluster {}/{}: {}", namespace, name, err);
        }
    }

    fn handle_deleted(&mut self, object: &Value) {
        let uid = match object.pointer("/metadata/uid").and_then(Value::as_str) {
            Some(uid) => uid,
            None => {
                log::error!("Ignoring DELETED event without metadata.uid");
                return;
            }
        };
        match self.registry.remove(uid) {
            Some(mut reconciler) => {
                reconciler.finalize();
                self.context
                    .metrics
                    .set_managed_clusters(self.registry.len() as i64);
            }
            // a DELETE for a uid we never managed is silently ignored
            None => log::debug!("DELETED event for unknown uid {}", uid),
        }
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                log::error!("Failed to listen for SIGINT: {}", err);
            }
        }
        _ = sigterm.recv() => {}
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::KubeClient;
    use crate::config::{ClientConfig, Credentials};
    use crate::metrics::Metrics;
    use crate::template::TemplateSet;
    use serde_json::json;

    fn test_context() -> Arc<OperatorContext> {
        let config = ClientConfig {
            api_server_endpoint: "https://localhost:6443".to_owned(),
            credentials: Credentials::Header("Bearer test".to_owned()),
            ca_data: None,
            verify_ssl_certs: true,
            user_agent: "opensearch-operator".to_owned(),
            field_manager: "opensearch-operator".to_owned(),
        };
        let metrics = Metrics::new();
        let client = KubeClient::new(config, metrics.client_metrics()).unwrap();
        let templates = TemplateSet::load(tempfile::tempdir().unwrap().path()).unwrap();
        Arc::new(OperatorContext::new(
            client,
            templates,
            metrics,
            "opensearch-operator-system".to_owned(),
        ))
    }

    fn manifest_value(uid: &str) -> Value {
        json!({
            "apiVersion": "opensearch.reclaim-the-stack.com/v1alpha1",
            "kind": "OpenSearch",
            "metadata": {
                "name": "example",
                "namespace": "default",
                "uid": uid,
                "resourceVersion": "100",
            },
            "spec": {
                "image": "opensearchproject/opensearch:3.1.0",
                "replicas": 3,
                "diskSize": "5Gi",
                "resources": {"limits": {"memory": "4Gi"}},
            },
        })
    }

    #[tokio::test]
    async fn deleted_for_unknown_uid_is_a_silent_no_op() {
        let mut operator = Operator {
            context: test_context(),
            registry: HashMap::new(),
        };
        // must not panic or create registry entries
        operator.handle_deleted(&manifest_value("unknown"));
        assert!(operator.registry.is_empty());
    }

    #[tokio::test]
    async fn retry_pass_skips_converged_clusters() {
        let context = test_context();
        let mut operator = Operator {
            context: Arc::clone(&context),
            registry: HashMap::new(),
        };
        let manifest = ClusterManifest::from_value(manifest_value("u1")).unwrap();
        operator
            .registry
            .insert("u1".to_owned(), ClusterReconciler::new(context, manifest));

        // a freshly registered cluster has no failed attempt to retry, so
        // the pass must not touch the api server
        operator.retry_failed_reconciles().await;
        assert!(!operator.registry["u1"].needs_retry());
    }

    #[tokio::test]
    async fn deleted_finalizes_and_removes_the_registry_entry() {
        let context = test_context();
        let mut operator = Operator {
            context: Arc::clone(&context),
            registry: HashMap::new(),
        };
        let manifest = ClusterManifest::from_value(manifest_value("u1")).unwrap();
        operator
            .registry
            .insert("u1".to_owned(), ClusterReconciler::new(context, manifest));

        operator.handle_deleted(&manifest_value("u1"));
        assert!(operator.registry.is_empty());

        // a second DELETE for the same uid is ignored
        operator.handle_deleted(&manifest_value("u1"));
        assert!(operator.registry.is_empty());
    }
}
