//! Per-cluster health polling. One background task per managed cluster polls
//! the OpenSearch REST API, diffs the observed state against the previous
//! observation, fires a one-shot callback when the cluster reports green and
//! a state-change callback whenever anything changed.

use crate::opensearch::{CatNode, ClusterHealth, OpenSearchClient, OpenSearchError};

use tokio::task::JoinHandle;

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const CHECK_INTERVAL: Duration = Duration::from_secs(10);

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Whatever a green callback fails with is only ever logged by the watcher,
/// so the concrete type is erased at this boundary and nowhere else.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Invoked with the new state and the set of changed keys.
pub type StateChangeCallback =
    Box<dyn Fn(ClusterState, Vec<&'static str>) -> BoxFuture<()> + Send + Sync>;

/// One-shot callback fired the next time the cluster reports green.
/// Re-registered by every reconcile so snapshot configuration converges once
/// the cluster settles.
pub type GreenCallback = Box<dyn FnOnce() -> BoxFuture<Result<(), CallbackError>> + Send>;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClusterState {
    pub number_of_nodes: usize,
    pub master: Option<String>,
    pub cluster_manager: Option<String>,
    pub status: Option<String>,
    pub version: Option<String>,
}

impl ClusterState {
    pub fn from_observations(nodes: &[CatNode], health: &ClusterHealth) -> ClusterState {
        let master = nodes
            .iter()
            .find(|node| node.master.as_deref() == Some("*"))
            .map(|node| node.name.clone());
        let cluster_manager = nodes
            .iter()
            .find(|node| node.cluster_manager.as_deref() == Some("*"))
            .map(|node| node.name.clone());
        let version = nodes.iter().find_map(|node| node.version.clone());
        ClusterState {
            number_of_nodes: nodes.len(),
            master,
            cluster_manager,
            status: Some(health.status.clone()),
            version,
        }
    }

    /// The keys whose values differ between `self` and `next`.
    pub fn changed_keys(&self, next: &ClusterState) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.number_of_nodes != next.number_of_nodes {
            changed.push("number_of_nodes");
        }
        if self.master != next.master {
            changed.push("master");
        }
        if self.cluster_manager != next.cluster_manager {
            changed.push("cluster_manager");
        }
        if self.status != next.status {
            changed.push("status");
        }
        if self.version != next.version {
            changed.push("version");
        }
        changed
    }

    pub fn is_green(&self) -> bool {
        self.status.as_deref() == Some("green")
    }
}

struct WatcherShared {
    client: OpenSearchClient,
    on_green: Mutex<Option<GreenCallback>>,
}

impl WatcherShared {
    fn take_on_green(&self) -> Option<GreenCallback> {
        self.on_green
            .lock()
            .expect("on_green lock poisoned")
            .take()
    }
}

/// Handle to one running health-watcher task.
pub struct HealthWatcher {
    shared: Arc<WatcherShared>,
    handle: JoinHandle<()>,
}

impl HealthWatcher {
    /// Spawns the poll loop. `cluster` is only used for log context.
    pub fn start(
        client: OpenSearchClient,
        cluster: String,
        on_change: StateChangeCallback,
    ) -> HealthWatcher {
        let shared = Arc::new(WatcherShared {
            client,
            on_green: Mutex::new(None),
        });
        let handle = tokio::spawn(poll_loop(Arc::clone(&shared), cluster, on_change));
        HealthWatcher { shared, handle }
    }

    /// Replaces the pending one-shot green callback.
    pub fn register_on_green(&self, callback: GreenCallback) {
        *self
            .shared
            .on_green
            .lock()
            .expect("on_green lock poisoned") = Some(callback);
    }

    pub fn client(&self) -> OpenSearchClient {
        self.shared.client.clone()
    }

    /// Cancels the poll loop at its next await point.
    pub fn stop(&self) {
        self.handle.abort();
    }
}

async fn poll_loop(shared: Arc<WatcherShared>, cluster: String, on_change: StateChangeCallback) {
    let mut state = ClusterState::default();
    let mut ticks = tokio::time::interval(CHECK_INTERVAL);
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticks.tick().await;

        let new_state = match observe(&shared.client).await {
            Ok(new_state) => new_state,
            Err(err) => {
                log::warn!("Health check for cluster {} failed: {}", cluster, err);
                continue;
            }
        };

        if new_state.is_green() {
            if let Some(callback) = shared.take_on_green() {
                log::info!("Cluster {} is green, running pending green callback", cluster);
                if let Err(err) = callback().await {
                    log::error!("Green callback for cluster {} failed: {}", cluster, err);
                }
            }
        }

        let changed = state.changed_keys(&new_state);
        if !changed.is_empty() {
            log::info!(
                "Cluster {} state changed ({}): {:?} -> {:?}",
                cluster,
                changed.join(", "),
                state,
                new_state
            );
            state = new_state.clone();
            on_change(new_state, changed).await;
        }
    }
}

async fn observe(client: &OpenSearchClient) -> Result<ClusterState, OpenSearchError> {
    let nodes = client.cat_nodes().await?;
    let health = client.cluster_health().await?;
    Ok(ClusterState::from_observations(&nodes, &health))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn node(name: &str, manager: bool, version: &str) -> CatNode {
        let marker = if manager { "*" } else { "-" };
        CatNode {
            name: name.to_owned(),
            master: Some(marker.to_owned()),
            cluster_manager: Some(marker.to_owned()),
            version: Some(version.to_owned()),
        }
    }

    fn green_state(nodes: usize) -> ClusterState {
        ClusterState {
            number_of_nodes: nodes,
            master: Some("node-0".to_owned()),
            cluster_manager: Some("node-0".to_owned()),
            status: Some("green".to_owned()),
            version: Some("3.1.0".to_owned()),
        }
    }

    #[test]
    fn derives_state_from_cat_nodes_and_health() {
        let nodes = vec![
            node("node-0", true, "3.1.0"),
            node("node-1", false, "3.1.0"),
            node("node-2", false, "3.1.0"),
        ];
        let health = ClusterHealth {
            status: "yellow".to_owned(),
        };
        let state = ClusterState::from_observations(&nodes, &health);
        assert_eq!(3, state.number_of_nodes);
        assert_eq!(Some("node-0"), state.master.as_deref());
        assert_eq!(Some("node-0"), state.cluster_manager.as_deref());
        assert_eq!(Some("yellow"), state.status.as_deref());
        assert_eq!(Some("3.1.0"), state.version.as_deref());
    }

    #[test]
    fn changed_keys_name_exactly_what_differs() {
        let previous = green_state(3);
        assert!(previous.changed_keys(&previous).is_empty());

        let mut next = previous.clone();
        next.status = Some("yellow".to_owned());
        next.number_of_nodes = 2;
        assert_eq!(
            vec!["number_of_nodes", "status"],
            previous.changed_keys(&next)
        );

        let empty = ClusterState::default();
        let all = empty.changed_keys(&previous);
        assert_eq!(
            vec!["number_of_nodes", "master", "cluster_manager", "status", "version"],
            all
        );
    }

    #[tokio::test]
    async fn green_callback_fires_at_most_once() {
        let shared = WatcherShared {
            client: OpenSearchClient::new("http://localhost:9200".to_owned(), "admin", "x"),
            on_green: Mutex::new(None),
        };
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        *shared.on_green.lock().unwrap() = Some(Box::new(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }));

        // first green observation takes and runs the callback
        if let Some(callback) = shared.take_on_green() {
            callback().await.unwrap();
        }
        // a later green observation finds the slot empty
        assert!(shared.take_on_green().is_none());
        assert_eq!(1, fired.load(Ordering::SeqCst));
    }
}
