//! Client configuration: where the api server is, how to authenticate, and
//! which CA to trust. In-cluster service-account credentials are preferred;
//! a kubeconfig is the fallback for running the operator locally.

pub mod kubeconfig;

use std::fmt::{self, Display};
use std::io;
use std::path::PathBuf;

pub use self::kubeconfig::KubeConfigError;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Certificate authority material for verifying the api server.
#[derive(Debug, Clone, PartialEq)]
pub enum CAData {
    /// base64 PEM contents, as embedded in a kubeconfig
    Contents(String),
    /// path to a PEM file on disk
    File(String),
}

/// How each request authenticates to the api server.
#[derive(Debug, Clone, PartialEq)]
pub enum Credentials {
    /// a complete `Authorization` header value (`Bearer ...` or `Basic ...`)
    Header(String),
    /// a file containing a bearer token, re-read for every new connection so
    /// rotated service-account tokens are picked up
    TokenFile(PathBuf),
    /// client certificate and key, base64 PEM as embedded in a kubeconfig
    Pem {
        certificate_base64: String,
        private_key_base64: String,
    },
    /// client certificate and key as file paths
    PemPath {
        certificate_path: String,
        private_key_path: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub api_server_endpoint: String,
    pub credentials: Credentials,
    pub ca_data: Option<CAData>,
    pub verify_ssl_certs: bool,
    pub user_agent: String,
    /// identity used for server-side apply field ownership
    pub field_manager: String,
}

#[derive(Debug)]
pub enum ConfigError {
    /// neither in-cluster credentials nor a kubeconfig could be loaded
    NoCredentials {
        in_cluster: io::Error,
        kubeconfig: KubeConfigError,
    },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::NoCredentials {
                in_cluster,
                kubeconfig,
            } => write!(
                f,
                "No usable Kubernetes credentials. In-cluster: {}. Kubeconfig: {}",
                in_cluster, kubeconfig
            ),
        }
    }
}
impl std::error::Error for ConfigError {}

impl ClientConfig {
    /// Loads in-cluster service-account credentials from the standard mount
    /// path and the `KUBERNETES_SERVICE_*` environment variables.
    pub fn from_service_account(field_manager: &str) -> Result<ClientConfig, io::Error> {
        let host = require_env("KUBERNETES_SERVICE_HOST")?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT_HTTPS")
            .or_else(|_| std::env::var("KUBERNETES_SERVICE_PORT"))
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    "Missing environment variable: KUBERNETES_SERVICE_PORT",
                )
            })?;

        let token_path = PathBuf::from(format!("{}/token", SERVICE_ACCOUNT_DIR));
        // fail now if the token is unreadable rather than on the first request
        std::fs::read_to_string(&token_path)?;

        Ok(ClientConfig {
            api_server_endpoint: format!("https://{}:{}", host, port),
            credentials: Credentials::TokenFile(token_path),
            ca_data: Some(CAData::File(format!("{}/ca.crt", SERVICE_ACCOUNT_DIR))),
            verify_ssl_certs: true,
            user_agent: field_manager.to_owned(),
            field_manager: field_manager.to_owned(),
        })
    }

    /// Loads from a kubeconfig file (`KUBECONFIG` or `~/.kube/config`).
    pub fn from_kubeconfig(field_manager: &str) -> Result<ClientConfig, KubeConfigError> {
        kubeconfig::load_from_kubeconfig(field_manager)
    }

    /// In-cluster first, then kubeconfig. Failure here is fatal at startup.
    pub fn load(field_manager: &str) -> Result<ClientConfig, ConfigError> {
        match ClientConfig::from_service_account(field_manager) {
            Ok(config) => {
                log::info!("Using in-cluster service account credentials");
                Ok(config)
            }
            Err(in_cluster) => match ClientConfig::from_kubeconfig(field_manager) {
                Ok(config) => {
                    log::info!("Using kubeconfig credentials");
                    Ok(config)
                }
                Err(kubeconfig) => Err(ConfigError::NoCredentials {
                    in_cluster,
                    kubeconfig,
                }),
            },
        }
    }
}

/// The namespace the operator itself runs in, which is where the shared
/// metrics-password Secret lives. `OPERATOR_NAMESPACE` overrides for local
/// runs; in-cluster the service-account mount provides it.
pub fn operator_namespace() -> Result<String, io::Error> {
    if let Ok(namespace) = std::env::var("OPERATOR_NAMESPACE") {
        return Ok(namespace);
    }
    let path = format!("{}/namespace", SERVICE_ACCOUNT_DIR);
    let namespace = std::fs::read_to_string(path)?;
    Ok(namespace.trim().to_owned())
}

fn require_env(name: &'static str) -> Result<String, io::Error> {
    std::env::var(name).map_err(|_| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("Missing environment variable: {}", name),
        )
    })
}
