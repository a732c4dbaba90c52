//! Per-cluster reconciliation: derives the child resources (Secrets,
//! ConfigMap, Service, StatefulSet, Dashboards) from one `OpenSearch`
//! manifest, wires up the health watcher and writes observed state back to
//! the status subresource. `reconcile` is idempotent; everything it applies
//! goes through server-side apply with owner references back to the Cluster.

use crate::client::{self, KubeClient};
use crate::crd::{ClusterManifest, OpenSearchSpec};
use crate::health::{ClusterState, HealthWatcher, StateChangeCallback};
use crate::k8s_types;
use crate::metrics::{Liveness, Metrics};
use crate::opensearch::OpenSearchClient;
use crate::quantity::{self, InvalidQuantity};
use crate::security::{self, CredentialsError};
use crate::snapshots;
use crate::template::{yaml_value, TemplateError, TemplateSet};

use serde_json::{json, Value};
use tokio::sync::OnceCell;

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::Arc;

const METRICS_SECRET_NAME: &str = "opensearch-metrics-basic-auth";

/// status keys that are written back to the custom resource
const STATUS_KEYS: [&str; 3] = ["status", "number_of_nodes", "version"];

#[derive(Debug)]
pub enum ReconcileError {
    Client(client::Error),
    Template(TemplateError),
    Spec(serde_json::Error),
    Credentials(CredentialsError),
    Pki(openssl::error::ErrorStack),
    Quantity(InvalidQuantity),
}

impl Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReconcileError::Client(e) => write!(f, "Api server error: {}", e),
            ReconcileError::Template(e) => write!(f, "Template error: {}", e),
            ReconcileError::Spec(e) => write!(f, "Invalid OpenSearch spec: {}", e),
            ReconcileError::Credentials(e) => write!(f, "Credentials error: {}", e),
            ReconcileError::Pki(e) => write!(f, "Certificate generation failed: {}", e),
            ReconcileError::Quantity(e) => write!(f, "{}", e),
        }
    }
}
impl std::error::Error for ReconcileError {}

impl From<client::Error> for ReconcileError {
    fn from(e: client::Error) -> ReconcileError {
        ReconcileError::Client(e)
    }
}
impl From<TemplateError> for ReconcileError {
    fn from(e: TemplateError) -> ReconcileError {
        ReconcileError::Template(e)
    }
}
impl From<serde_json::Error> for ReconcileError {
    fn from(e: serde_json::Error) -> ReconcileError {
        ReconcileError::Spec(e)
    }
}
impl From<CredentialsError> for ReconcileError {
    fn from(e: CredentialsError) -> ReconcileError {
        ReconcileError::Credentials(e)
    }
}
impl From<openssl::error::ErrorStack> for ReconcileError {
    fn from(e: openssl::error::ErrorStack) -> ReconcileError {
        ReconcileError::Pki(e)
    }
}
impl From<InvalidQuantity> for ReconcileError {
    fn from(e: InvalidQuantity) -> ReconcileError {
        ReconcileError::Quantity(e)
    }
}

/// Shared dependencies of every reconciler, owned by the operator loop.
pub struct OperatorContext {
    pub client: KubeClient,
    pub templates: TemplateSet,
    pub metrics: Metrics,
    /// progress marker for the watch loop, read by the health endpoint
    pub liveness: Liveness,
    pub operator_namespace: String,
    metrics_password: OnceCell<String>,
}

impl OperatorContext {
    pub fn new(
        client: KubeClient,
        templates: TemplateSet,
        metrics: Metrics,
        operator_namespace: String,
    ) -> OperatorContext {
        OperatorContext {
            client,
            templates,
            metrics,
            liveness: Liveness::new(),
            operator_namespace,
            metrics_password: OnceCell::new(),
        }
    }

    /// The shared password of the `metrics` user, one per operator
    /// installation. Created in the operator's own namespace on first need
    /// and memoized for the life of the process.
    pub async fn metrics_password(&self) -> Result<String, ReconcileError> {
        self.metrics_password
            .get_or_try_init(|| async {
                let existing = self
                    .client
                    .get_optional(
                        k8s_types::core::v1::Secret,
                        &self.operator_namespace,
                        METRICS_SECRET_NAME,
                    )
                    .await?;
                if let Some(secret) = existing {
                    let encoded = secret
                        .pointer("/data/password")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            CredentialsError::MissingUser(security::METRICS_USER.to_owned())
                        })?;
                    return Ok(security::decode_secret_value("password", encoded)?);
                }

                let password = security::random_password();
                let secret = json!({
                    "apiVersion": "v1",
                    "kind": "Secret",
                    "metadata": {
                        "name": METRICS_SECRET_NAME,
                        "namespace": self.operator_namespace,
                    },
                    "type": "Opaque",
                    "stringData": {
                        "username": security::METRICS_USER,
                        "password": password,
                    },
                });
                self.client
                    .create(k8s_types::core::v1::Secret, &secret)
                    .await?;
                log::info!(
                    "Created shared metrics credentials secret in namespace {}",
                    self.operator_namespace
                );
                Ok(password)
            })
            .await
            .cloned()
    }
}

/// The live state for one managed cluster: the cached manifest and the
/// handle of its health watcher.
pub struct ClusterReconciler {
    context: Arc<OperatorContext>,
    manifest: ClusterManifest,
    watcher: Option<HealthWatcher>,
    needs_retry: bool,
}

impl ClusterReconciler {
    pub fn new(context: Arc<OperatorContext>, manifest: ClusterManifest) -> ClusterReconciler {
        ClusterReconciler {
            context,
            manifest,
            watcher: None,
            needs_retry: false,
        }
    }

    pub fn manifest(&self) -> &ClusterManifest {
        &self.manifest
    }

    /// True when the last reconcile attempt failed partway. The operator
    /// loop keeps retrying such clusters on its resync interval, since a
    /// cluster with a stable spec would otherwise never converge.
    pub fn needs_retry(&self) -> bool {
        self.needs_retry
    }

    /// The idempotent convergence function. Re-runnable at any time; the
    /// credentials and certificates Secrets are created exactly once, the
    /// rest converges through server-side apply.
    pub async fn reconcile(&mut self) -> Result<(), ReconcileError> {
        let result = self.run_reconcile().await;
        self.needs_retry = result.is_err();
        result
    }

    async fn run_reconcile(&mut self) -> Result<(), ReconcileError> {
        let spec = self.manifest.spec()?;
        log::info!(
            "Reconciling cluster {}/{} (uid {})",
            self.manifest.namespace(),
            self.manifest.name(),
            self.manifest.uid()
        );
        self.context
            .metrics
            .reconcile_started(self.manifest.namespace(), self.manifest.name());

        self.ensure_credentials_secret().await?;
        self.ensure_certificates_secret().await?;
        self.ensure_security_config().await?;
        self.ensure_service().await?;
        self.ensure_statefulset(&spec).await?;
        self.ensure_dashboards_deployment(&spec).await?;
        self.ensure_dashboards_service().await?;
        self.initialize_or_trigger_watcher(&spec).await?;
        Ok(())
    }

    /// Replaces the cached manifest; reconciles only when the spec actually
    /// differs. Metadata-only changes (labels, resourceVersion) are ignored.
    pub async fn update(&mut self, new_manifest: ClusterManifest) -> Result<(), ReconcileError> {
        let spec_changed = self.manifest.spec_value() != new_manifest.spec_value();
        self.manifest = new_manifest;
        if spec_changed {
            self.reconcile().await
        } else {
            log::debug!(
                "Spec of cluster {}/{} is unchanged, skipping reconcile",
                self.manifest.namespace(),
                self.manifest.name()
            );
            Ok(())
        }
    }

    /// Stops the health watcher. Child resources are cleaned up by the
    /// Kubernetes garbage collector via their owner references.
    pub fn finalize(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop();
        }
        log::info!(
            "Finalized cluster {}/{}",
            self.manifest.namespace(),
            self.manifest.name()
        );
    }

    async fn ensure_credentials_secret(&self) -> Result<(), ReconcileError> {
        let name = self.credentials_secret_name();
        let namespace = self.manifest.namespace();
        if self
            .context
            .client
            .exists(k8s_types::core::v1::Secret, namespace, &name)
            .await?
        {
            log::debug!("Credentials secret {} already exists", name);
            return Ok(());
        }

        let metrics_password = self.context.metrics_password().await?;
        let mut vars = self.base_vars(&name);
        for user in security::INTERNAL_USERS {
            let password = if user == security::METRICS_USER {
                metrics_password.clone()
            } else {
                security::random_password()
            };
            vars.insert(user, base64::encode(password));
        }
        let mut secret = self.context.templates.render_yaml("credentials_secret", &vars)?;
        self.apply_owned(k8s_types::core::v1::Secret, &name, &mut secret)
            .await?;
        log::info!("Created credentials secret {}", name);
        Ok(())
    }

    async fn ensure_certificates_secret(&self) -> Result<(), ReconcileError> {
        let name = self.certificates_secret_name();
        let namespace = self.manifest.namespace();
        if self
            .context
            .client
            .exists(k8s_types::core::v1::Secret, namespace, &name)
            .await?
        {
            log::debug!("Certificates secret {} already exists", name);
            return Ok(());
        }

        // RSA keygen takes whole seconds; keep it off the reconcile task
        let batch = tokio::task::spawn_blocking(crate::pki::generate)
            .await
            .expect("certificate generation task panicked")?;

        let mut vars = self.base_vars(&name);
        vars.insert("ca_crt", base64::encode(&batch.ca_cert));
        vars.insert("ca_key", base64::encode(&batch.ca_key));
        vars.insert("node_crt", base64::encode(&batch.node_cert));
        vars.insert("node_key", base64::encode(&batch.node_key));
        vars.insert("admin_crt", base64::encode(&batch.admin_cert));
        vars.insert("admin_key", base64::encode(&batch.admin_key));

        let mut secret = self
            .context
            .templates
            .render_yaml("certificates_secret", &vars)?;
        self.apply_owned(k8s_types::core::v1::Secret, &name, &mut secret)
            .await?;
        log::info!("Created certificates secret {}", name);
        Ok(())
    }

    /// Rendered and applied on every reconcile; cheap and idempotent through
    /// server-side apply.
    async fn ensure_security_config(&self) -> Result<(), ReconcileError> {
        let passwords = self.read_credentials().await?;

        // bcrypt at the default cost takes a noticeable slice of a second
        // per password; keep the batch off the reconcile task
        let user_vars = tokio::task::spawn_blocking(move || hash_internal_users(&passwords))
            .await
            .expect("password hashing task panicked")?;
        let internal_users = self
            .context
            .templates
            .render("_internal_users", &user_vars)?;
        let roles = self.context.templates.render("_roles", &HashMap::new())?;

        let name = self.security_config_name();
        let mut vars = self.base_vars(&name);
        vars.insert("internal_users", yaml_value(&Value::String(internal_users)));
        vars.insert("roles", yaml_value(&Value::String(roles)));

        let mut configmap = self
            .context
            .templates
            .render_yaml("security_configmap", &vars)?;
        self.apply_owned(k8s_types::core::v1::ConfigMap, &name, &mut configmap)
            .await
    }

    async fn ensure_service(&self) -> Result<(), ReconcileError> {
        let name = self.child_name();
        let mut vars = self.base_vars(&name);
        vars.insert("cluster", self.manifest.name().to_owned());
        let mut service = self.context.templates.render_yaml("service", &vars)?;
        self.apply_owned(k8s_types::core::v1::Service, &name, &mut service)
            .await
    }

    async fn ensure_statefulset(&self, spec: &OpenSearchSpec) -> Result<(), ReconcileError> {
        let name = self.child_name();
        let heap_size = quantity::heap_size(spec.memory_limit())?;
        let exporter_version = exporter_plugin_version(spec);
        let startup_script = self.render_startup_script(spec, &exporter_version)?;

        let mut vars = self.base_vars(&name);
        vars.insert("cluster", self.manifest.name().to_owned());
        vars.insert("image", spec.image.clone());
        vars.insert("replicas", spec.replicas.to_string());
        vars.insert("disk_size", spec.disk_size.clone());
        vars.insert("memory_limit", spec.memory_limit().to_owned());
        vars.insert("heap_size", heap_size);
        vars.insert(
            "creation_timestamp_epoch",
            self.manifest.creation_timestamp_epoch().to_string(),
        );
        vars.insert(
            "node_selector",
            yaml_value(spec.node_selector.as_ref().unwrap_or(&json!({}))),
        );
        vars.insert(
            "tolerations",
            yaml_value(spec.tolerations.as_ref().unwrap_or(&json!([]))),
        );
        vars.insert("s3_env", s3_env_fragment(spec));
        vars.insert("startup_script", yaml_value(&Value::String(startup_script)));
        vars.insert("credentials_secret", self.credentials_secret_name());
        vars.insert("certificates_secret", self.certificates_secret_name());
        vars.insert("security_config", self.security_config_name());

        let mut statefulset = self.context.templates.render_yaml("statefulset", &vars)?;
        self.apply_owned(k8s_types::apps::v1::StatefulSet, &name, &mut statefulset)
            .await
    }

    async fn ensure_dashboards_deployment(
        &self,
        spec: &OpenSearchSpec,
    ) -> Result<(), ReconcileError> {
        let name = self.dashboards_name();
        let mut vars = self.base_vars(&name);
        vars.insert("cluster", self.manifest.name().to_owned());
        vars.insert("image", dashboards_image(spec));
        vars.insert(
            "opensearch_url",
            format!("http://{}:9200", self.child_name()),
        );
        vars.insert("credentials_secret", self.credentials_secret_name());
        let mut deployment = self
            .context
            .templates
            .render_yaml("dashboards_deployment", &vars)?;
        self.apply_owned(k8s_types::apps::v1::Deployment, &name, &mut deployment)
            .await
    }

    async fn ensure_dashboards_service(&self) -> Result<(), ReconcileError> {
        let name = self.dashboards_name();
        let mut vars = self.base_vars(&name);
        vars.insert("cluster", self.manifest.name().to_owned());
        let mut service = self
            .context
            .templates
            .render_yaml("dashboards_service", &vars)?;
        self.apply_owned(k8s_types::core::v1::Service, &name, &mut service)
            .await
    }

    /// Starts the health watcher on first reconcile; on later reconciles it
    /// only re-arms the one-shot green callback, so snapshot configuration
    /// converges again once the cluster returns to green.
    async fn initialize_or_trigger_watcher(
        &mut self,
        spec: &OpenSearchSpec,
    ) -> Result<(), ReconcileError> {
        let namespace = self.manifest.namespace().to_owned();
        let name = self.manifest.name().to_owned();
        let cluster = format!("{}/{}", namespace, name);

        if self.watcher.is_none() {
            let passwords = self.read_credentials().await?;
            let os_client = OpenSearchClient::new(
                OpenSearchClient::service_url(&namespace, &name),
                "admin",
                &passwords["admin"],
            );

            let status_client = self.context.client.clone();
            let callback_namespace = namespace.clone();
            let callback_name = name.clone();
            let on_change: StateChangeCallback = Box::new(move |state, changed| {
                let client = status_client.clone();
                let namespace = callback_namespace.clone();
                let name = callback_name.clone();
                Box::pin(async move {
                    update_status(&client, &namespace, &name, &state, &changed).await;
                })
            });

            log::info!("Starting health watcher for cluster {}", cluster);
            self.watcher = Some(HealthWatcher::start(os_client, cluster.clone(), on_change));
        }

        if let Some(watcher) = self.watcher.as_ref() {
            let os_client = watcher.client();
            let repositories = spec.snapshot_repositories.clone();
            watcher.register_on_green(Box::new(move || {
                Box::pin(async move {
                    snapshots::upsert_snapshot_repositories(&os_client, &repositories, &cluster)
                        .await;
                    Ok(())
                })
            }));
        }
        Ok(())
    }

    async fn read_credentials(
        &self,
    ) -> Result<std::collections::BTreeMap<String, String>, ReconcileError> {
        let secret = self
            .context
            .client
            .get(
                k8s_types::core::v1::Secret,
                self.manifest.namespace(),
                &self.credentials_secret_name(),
            )
            .await?;
        Ok(security::decode_credentials_secret(&secret)?)
    }

    fn render_startup_script(
        &self,
        spec: &OpenSearchSpec,
        exporter_version: &str,
    ) -> Result<String, ReconcileError> {
        let mut vars: HashMap<&str, String> = HashMap::new();
        vars.insert("extra_config", opensearch_config_yaml(spec));
        vars.insert("keystore_setup", keystore_setup(spec));
        vars.insert("exporter_version", exporter_version.to_owned());
        Ok(self.context.templates.render("_startup_script", &vars)?)
    }

    async fn apply_owned(
        &self,
        k8s_type: &k8s_types::K8sType,
        name: &str,
        resource: &mut Value,
    ) -> Result<(), ReconcileError> {
        set_owner_reference(resource, &self.manifest);
        self.context
            .client
            .apply(k8s_type, self.manifest.namespace(), name, resource)
            .await?;
        Ok(())
    }

    fn base_vars(&self, name: &str) -> HashMap<&'static str, String> {
        let mut vars = HashMap::new();
        vars.insert("name", name.to_owned());
        vars.insert("namespace", self.manifest.namespace().to_owned());
        vars
    }

    fn child_name(&self) -> String {
        format!("opensearch-{}", self.manifest.name())
    }

    fn credentials_secret_name(&self) -> String {
        format!("opensearch-{}-credentials", self.manifest.name())
    }

    fn certificates_secret_name(&self) -> String {
        format!("opensearch-{}-certificates", self.manifest.name())
    }

    fn security_config_name(&self) -> String {
        format!("opensearch-{}-security-config", self.manifest.name())
    }

    fn dashboards_name(&self) -> String {
        format!("opensearch-{}-dashboards", self.manifest.name())
    }
}

/// Writes `{health, nodes, version}` to the status subresource, but only
/// when one of the status-relevant keys changed. Failures are logged and
/// swallowed; status is a derived view, not ground truth.
pub async fn update_status(
    client: &KubeClient,
    namespace: &str,
    name: &str,
    state: &ClusterState,
    changed: &[&'static str],
) {
    if !changed.iter().any(|key| STATUS_KEYS.contains(key)) {
        return;
    }
    let patch = status_patch(state);
    log::info!(
        "Updating status of cluster {}/{}: {}",
        namespace,
        name,
        patch["status"]
    );
    if let Err(err) = client
        .merge_patch(k8s_types::OpenSearch, namespace, name, Some("status"), &patch)
        .await
    {
        log::error!(
            "Failed to update status of cluster {}/{}: {}",
            namespace,
            name,
            err
        );
    }
}

fn status_patch(state: &ClusterState) -> Value {
    json!({
        "status": {
            "health": state.status.as_deref().map(capitalize),
            "nodes": state.number_of_nodes,
            "version": state.version,
        }
    })
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Exactly one owner reference, pointing at the Cluster, with
/// `controller=true` and `blockOwnerDeletion=true` so deletion cascades.
fn set_owner_reference(resource: &mut Value, manifest: &ClusterManifest) {
    let owner = json!([{
        "apiVersion": k8s_types::OpenSearch.format_api_version(),
        "kind": k8s_types::OpenSearch.kind,
        "name": manifest.name(),
        "uid": manifest.uid(),
        "controller": true,
        "blockOwnerDeletion": true,
    }]);
    if let Some(metadata) = resource
        .pointer_mut("/metadata")
        .and_then(Value::as_object_mut)
    {
        metadata.insert("ownerReferences".to_owned(), owner);
    }
}

/// The `<user>_hash` variable set for the internal-users template.
fn hash_internal_users(
    passwords: &std::collections::BTreeMap<String, String>,
) -> Result<HashMap<&'static str, String>, CredentialsError> {
    let mut vars = HashMap::new();
    for user in security::INTERNAL_USERS {
        let key: &'static str = match user {
            "admin" => "admin_hash",
            "kibanaserver" => "kibanaserver_hash",
            "kibanaro" => "kibanaro_hash",
            "logstash" => "logstash_hash",
            "readall" => "readall_hash",
            "snapshotrestore" => "snapshotrestore_hash",
            "metrics" => "metrics_hash",
            _ => unreachable!("unknown internal user"),
        };
        let password = passwords
            .get(user)
            .ok_or_else(|| CredentialsError::MissingUser(user.to_owned()))?;
        vars.insert(key, security::hash_password(password)?);
    }
    Ok(vars)
}

fn exporter_plugin_version(spec: &OpenSearchSpec) -> String {
    format!("{}.0", spec.version())
}

fn dashboards_image(spec: &OpenSearchSpec) -> String {
    format!("opensearchproject/opensearch-dashboards:{}", spec.version())
}

/// Settings appended to opensearch.yml by the startup script: the
/// normalized per-repository S3 client settings followed by the free-form
/// user config.
fn opensearch_config_yaml(spec: &OpenSearchSpec) -> String {
    let mut config = String::new();
    for repository in &spec.snapshot_repositories {
        config.push_str(&format!(
            "s3.client.{name}.endpoint: {endpoint}\ns3.client.{name}.protocol: {protocol}\ns3.client.{name}.region: {region}\n",
            name = repository.name,
            endpoint = repository.endpoint(),
            protocol = repository.protocol(),
            region = repository.region(),
        ));
    }
    if let Some(user_config) = &spec.config {
        match serde_yaml::to_string(user_config) {
            Ok(rendered) => config.push_str(&rendered),
            Err(err) => log::error!("Failed to serialize spec.config as YAML: {}", err),
        }
    }
    config
}

/// Keystore commands seeding the per-repository S3 credentials from the env
/// vars injected by `s3_env`.
fn keystore_setup(spec: &OpenSearchSpec) -> String {
    let mut script = String::new();
    for repository in &spec.snapshot_repositories {
        script.push_str(&format!(
            "echo \"${access}\" | bin/opensearch-keystore add --stdin --force s3.client.{name}.access_key\n\
             echo \"${secret}\" | bin/opensearch-keystore add --stdin --force s3.client.{name}.secret_key\n",
            access = s3_env_name(&repository.name, "ACCESS_KEY"),
            secret = s3_env_name(&repository.name, "SECRET_KEY"),
            name = repository.name,
        ));
    }
    script
}

/// Env entries wiring the referenced Secrets into the pod for the keystore
/// setup above.
fn s3_env(spec: &OpenSearchSpec) -> Value {
    let entries: Vec<Value> = spec
        .snapshot_repositories
        .iter()
        .flat_map(|repository| {
            vec![
                json!({
                    "name": s3_env_name(&repository.name, "ACCESS_KEY"),
                    "valueFrom": {"secretKeyRef": {
                        "name": repository.access_key_id.name,
                        "key": repository.access_key_id.key,
                    }},
                }),
                json!({
                    "name": s3_env_name(&repository.name, "SECRET_KEY"),
                    "valueFrom": {"secretKeyRef": {
                        "name": repository.secret_access_key.name,
                        "key": repository.secret_access_key.key,
                    }},
                }),
            ]
        })
        .collect();
    Value::Array(entries)
}

/// The same entries as an indented YAML fragment, spliced into the
/// container env list of the statefulset template. Empty when no
/// repositories are configured.
fn s3_env_fragment(spec: &OpenSearchSpec) -> String {
    let entries = match s3_env(spec) {
        Value::Array(entries) => entries,
        _ => unreachable!("s3_env always returns an array"),
    };
    entries
        .iter()
        .map(|entry| format!("        - {}", entry))
        .collect::<Vec<String>>()
        .join("\n")
}

fn s3_env_name(repository: &str, suffix: &str) -> String {
    format!(
        "S3_CLIENT_{}_{}",
        repository.to_uppercase().replace('-', "_"),
        suffix
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::{ClusterManifest, SecretKeyRef, SnapshotPolicy, SnapshotRepository};

    fn manifest() -> ClusterManifest {
        ClusterManifest::from_value(json!({
            "apiVersion": "opensearch.reclaim-the-stack.com/v1alpha1",
            "kind": "OpenSearch",
            "metadata": {
                "name": "example",
                "namespace": "default",
                "uid": "u1",
                "resourceVersion": "100",
            },
            "spec": {
                "image": "opensearchproject/opensearch:3.1.0",
                "replicas": 3,
                "diskSize": "5Gi",
                "resources": {"limits": {"memory": "4Gi"}},
            },
        }))
        .unwrap()
    }

    fn spec_with_repository() -> OpenSearchSpec {
        let mut spec = manifest().spec().unwrap();
        spec.snapshot_repositories = vec![SnapshotRepository {
            name: "backup".to_owned(),
            bucket: "bucket".to_owned(),
            base_path: None,
            region: Some("eu-north-1".to_owned()),
            endpoint: None,
            protocol: None,
            access_key_id: SecretKeyRef {
                name: "s3-creds".to_owned(),
                key: "id".to_owned(),
            },
            secret_access_key: SecretKeyRef {
                name: "s3-creds".to_owned(),
                key: "secret".to_owned(),
            },
            policies: vec![SnapshotPolicy {
                name: "daily".to_owned(),
                schedule: "0 3 * * *".to_owned(),
                max_age: "7d".to_owned(),
            }],
        }];
        spec
    }

    #[test]
    fn owner_reference_is_exactly_one_controller_ref() {
        let manifest = manifest();
        let mut resource = json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": "opensearch-example-credentials", "namespace": "default"},
        });
        set_owner_reference(&mut resource, &manifest);

        let refs = resource["metadata"]["ownerReferences"].as_array().unwrap();
        assert_eq!(1, refs.len());
        let owner = &refs[0];
        assert_eq!("opensearch.reclaim-the-stack.com/v1alpha1", owner["apiVersion"]);
        assert_eq!("OpenSearch", owner["kind"]);
        assert_eq!("example", owner["name"]);
        assert_eq!("u1", owner["uid"]);
        assert_eq!(true, owner["controller"]);
        assert_eq!(true, owner["blockOwnerDeletion"]);

        // a second application replaces rather than appends
        set_owner_reference(&mut resource, &manifest);
        assert_eq!(1, resource["metadata"]["ownerReferences"].as_array().unwrap().len());
    }

    #[test]
    fn status_patch_capitalizes_health() {
        let state = ClusterState {
            number_of_nodes: 3,
            master: Some("node-0".to_owned()),
            cluster_manager: Some("node-0".to_owned()),
            status: Some("green".to_owned()),
            version: Some("3.1.0".to_owned()),
        };
        let patch = status_patch(&state);
        assert_eq!("Green", patch["status"]["health"]);
        assert_eq!(3, patch["status"]["nodes"]);
        assert_eq!("3.1.0", patch["status"]["version"]);
    }

    #[test]
    fn status_keys_filter_matches_the_writeback_set() {
        assert!(["status"].iter().any(|k| STATUS_KEYS.contains(k)));
        assert!(["number_of_nodes"].iter().any(|k| STATUS_KEYS.contains(k)));
        assert!(["version"].iter().any(|k| STATUS_KEYS.contains(k)));
        assert!(!["master", "cluster_manager"]
            .iter()
            .any(|k| STATUS_KEYS.contains(k)));
    }

    #[test]
    fn derived_versions_follow_the_image_tag() {
        let spec = manifest().spec().unwrap();
        assert_eq!("3.1.0.0", exporter_plugin_version(&spec));
        assert_eq!(
            "opensearchproject/opensearch-dashboards:3.1.0",
            dashboards_image(&spec)
        );
    }

    #[test]
    fn config_yaml_carries_normalized_repositories_then_user_config() {
        let mut spec = spec_with_repository();
        spec.config = Some(json!({"cluster.routing.allocation.disk.watermark.low": "90%"}));
        let config = opensearch_config_yaml(&spec);
        assert!(config.contains("s3.client.backup.endpoint: s3.eu-north-1.amazonaws.com"));
        assert!(config.contains("s3.client.backup.protocol: https"));
        assert!(config.contains("s3.client.backup.region: eu-north-1"));
        assert!(config.contains("cluster.routing.allocation.disk.watermark.low: 90%"));
    }

    #[test]
    fn keystore_setup_references_the_injected_env_vars() {
        let spec = spec_with_repository();
        let script = keystore_setup(&spec);
        assert!(script.contains("echo \"$S3_CLIENT_BACKUP_ACCESS_KEY\" | bin/opensearch-keystore add --stdin --force s3.client.backup.access_key"));
        assert!(script.contains("s3.client.backup.secret_key"));
    }

    #[test]
    fn s3_env_injects_both_secret_key_refs() {
        let spec = spec_with_repository();
        let env = s3_env(&spec);
        let entries = env.as_array().unwrap();
        assert_eq!(2, entries.len());
        assert_eq!("S3_CLIENT_BACKUP_ACCESS_KEY", entries[0]["name"]);
        assert_eq!("s3-creds", entries[0]["valueFrom"]["secretKeyRef"]["name"]);
        assert_eq!("id", entries[0]["valueFrom"]["secretKeyRef"]["key"]);
        assert_eq!("S3_CLIENT_BACKUP_SECRET_KEY", entries[1]["name"]);
    }

    #[test]
    fn s3_env_fragment_is_indented_for_the_statefulset_template() {
        let spec = spec_with_repository();
        let fragment = s3_env_fragment(&spec);
        assert!(fragment.starts_with("        - {\"name\":\"S3_CLIENT_BACKUP_ACCESS_KEY\""));
        assert_eq!(2, fragment.lines().count());

        let empty = manifest().spec().unwrap();
        assert_eq!("", s3_env_fragment(&empty));
    }

    #[test]
    fn env_names_survive_dashed_repository_names() {
        assert_eq!(
            "S3_CLIENT_OFF_SITE_ACCESS_KEY",
            s3_env_name("off-site", "ACCESS_KEY")
        );
    }

    #[tokio::test]
    async fn failed_reconcile_marks_the_cluster_for_retry() {
        use crate::config::{ClientConfig, Credentials};

        // nothing listens here; the first api server call fails fast
        let config = ClientConfig {
            api_server_endpoint: "https://localhost:59999".to_owned(),
            credentials: Credentials::Header("Bearer test".to_owned()),
            ca_data: None,
            verify_ssl_certs: true,
            user_agent: "opensearch-operator".to_owned(),
            field_manager: "opensearch-operator".to_owned(),
        };
        let metrics = Metrics::new();
        let client = KubeClient::new(config, metrics.client_metrics()).unwrap();
        let templates =
            crate::template::TemplateSet::load(tempfile::tempdir().unwrap().path()).unwrap();
        let context = Arc::new(OperatorContext::new(
            client,
            templates,
            metrics,
            "opensearch-operator-system".to_owned(),
        ));

        let mut reconciler = ClusterReconciler::new(context, manifest());
        assert!(!reconciler.needs_retry());

        assert!(reconciler.reconcile().await.is_err());
        assert!(reconciler.needs_retry());

        // a metadata-only update skips the reconcile and leaves the flag armed
        let mut unchanged = manifest().as_value().clone();
        unchanged["metadata"]["resourceVersion"] = json!("101");
        let unchanged = ClusterManifest::from_value(unchanged).unwrap();
        reconciler.update(unchanged).await.unwrap();
        assert!(reconciler.needs_retry());
    }

    #[test]
    fn internal_user_hashes_cover_every_user() {
        let passwords: std::collections::BTreeMap<String, String> = security::INTERNAL_USERS
            .iter()
            .map(|user| (user.to_string(), format!("{}-pw", user)))
            .collect();
        let vars = hash_internal_users(&passwords).unwrap();
        assert_eq!(security::INTERNAL_USERS.len(), vars.len());
        assert!(vars["admin_hash"].starts_with("$2"));
        assert!(vars["metrics_hash"].starts_with("$2"));

        let mut incomplete = passwords;
        incomplete.remove("logstash");
        assert!(matches!(
            hash_internal_users(&incomplete),
            Err(CredentialsError::MissingUser(_))
        ));
    }

    #[test]
    fn capitalize_handles_the_health_colors() {
        assert_eq!("Green", capitalize("green"));
        assert_eq!("Yellow", capitalize("yellow"));
        assert_eq!("Red", capitalize("red"));
        assert_eq!("", capitalize(""));
    }
}
