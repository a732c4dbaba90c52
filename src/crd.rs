//! The `OpenSearch` custom resource: an untyped manifest wrapper with
//! validated accessors for the fields the operator relies on, plus the typed
//! view of `spec`. Free-form parts of the spec (`config`, `nodeSelector`,
//! `tolerations`) stay opaque and are passed through to the templates.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use std::fmt::{self, Debug};

#[derive(PartialEq, Clone)]
pub struct InvalidManifestError {
    pub message: &'static str,
    pub value: Value,
}

impl Debug for InvalidManifestError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "InvalidManifestError('{}', {})", self.message, self.value)
    }
}

impl fmt::Display for InvalidManifestError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Invalid OpenSearch manifest: {}", self.message)
    }
}
impl std::error::Error for InvalidManifestError {}

/// A validated `OpenSearch` custom resource as received from the api server.
/// Transparent wrapper around the raw json; the accessors for required
/// metadata fields are infallible after validation.
#[derive(PartialEq, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterManifest(Value);

impl Debug for ClusterManifest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ClusterManifest({}/{})", self.namespace(), self.name())
    }
}

impl ClusterManifest {
    pub fn from_value(value: Value) -> Result<ClusterManifest, InvalidManifestError> {
        for (pointer, message) in [
            ("/metadata/name", "missing metadata.name"),
            ("/metadata/namespace", "missing metadata.namespace"),
            ("/metadata/uid", "missing metadata.uid"),
            ("/metadata/resourceVersion", "missing metadata.resourceVersion"),
            ("/spec", "missing spec"),
        ] {
            if value.pointer(pointer).is_none() {
                return Err(InvalidManifestError { message, value });
            }
        }
        Ok(ClusterManifest(value))
    }

    pub fn name(&self) -> &str {
        self.str_value("/metadata/name").unwrap()
    }

    pub fn namespace(&self) -> &str {
        self.str_value("/metadata/namespace").unwrap()
    }

    /// canonical identity across renames and resource-version changes
    pub fn uid(&self) -> &str {
        self.str_value("/metadata/uid").unwrap()
    }

    pub fn resource_version(&self) -> &str {
        self.str_value("/metadata/resourceVersion").unwrap()
    }

    /// `metadata.creationTimestamp` as a unix epoch. Baked into the pod
    /// template so a delete/recreate of the Cluster forces a rollout while
    /// ordinary reconciles do not.
    pub fn creation_timestamp_epoch(&self) -> i64 {
        self.str_value("/metadata/creationTimestamp")
            .and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.timestamp())
            .unwrap_or(0)
    }

    /// the raw `spec` for deep-equality comparisons between manifests
    pub fn spec_value(&self) -> &Value {
        self.0.pointer("/spec").unwrap()
    }

    pub fn spec(&self) -> Result<OpenSearchSpec, serde_json::Error> {
        serde_json::from_value(self.spec_value().clone())
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    fn str_value(&self, pointer: &str) -> Option<&str> {
        self.0.pointer(pointer).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OpenSearchSpec {
    /// `repo:tag`; the tag is the OpenSearch version
    pub image: String,
    pub replicas: i64,
    #[serde(rename = "diskSize")]
    pub disk_size: String,
    pub resources: Resources,
    #[serde(rename = "nodeSelector", default)]
    pub node_selector: Option<Value>,
    #[serde(default)]
    pub tolerations: Option<Value>,
    /// free-form settings merged into opensearch.yml
    #[serde(default)]
    pub config: Option<Value>,
    #[serde(rename = "snapshotRepositories", default)]
    pub snapshot_repositories: Vec<SnapshotRepository>,
}

impl OpenSearchSpec {
    /// the OpenSearch version, taken from the image tag
    pub fn version(&self) -> &str {
        match self.image.rsplit_once(':') {
            Some((_, tag)) => tag,
            None => "latest",
        }
    }

    pub fn memory_limit(&self) -> &str {
        &self.resources.limits.memory
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Resources {
    pub limits: ResourceLimits,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ResourceLimits {
    pub memory: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SnapshotRepository {
    pub name: String,
    pub bucket: String,
    #[serde(default)]
    pub base_path: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(rename = "accessKeyId")]
    pub access_key_id: SecretKeyRef,
    #[serde(rename = "secretAccessKey")]
    pub secret_access_key: SecretKeyRef,
    #[serde(default)]
    pub policies: Vec<SnapshotPolicy>,
}

impl SnapshotRepository {
    pub fn region(&self) -> &str {
        self.region.as_deref().unwrap_or("us-east-1")
    }

    pub fn endpoint(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("s3.{}.amazonaws.com", self.region()))
    }

    pub fn protocol(&self) -> &str {
        self.protocol.as_deref().unwrap_or("https")
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SnapshotPolicy {
    pub name: String,
    /// cron expression, evaluated in UTC
    pub schedule: String,
    pub max_age: String,
}
