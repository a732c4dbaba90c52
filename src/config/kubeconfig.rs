use super::{CAData, ClientConfig, Credentials};

use dirs::home_dir;
use serde::Deserialize;

use std::fmt::{self, Display};
use std::fs::File;
use std::io;
use std::path::PathBuf;

const MISSING_CREDENTIAL_MESSAGE: &str = "No supported credentials found in kubeconfig file for the selected context. Only token, tokenFile, username/password and client certificates are supported";
const EXEC_REJECTED_MESSAGE: &str = "The selected kubeconfig user uses an exec credential plugin, which this operator does not support";
const NO_HOME_DIR_MESSAGE: &str = "Unable to determine HOME directory to load ~/.kube/config";

#[derive(Debug)]
pub enum KubeConfigError {
    Io(io::Error),
    Format(serde_yaml::Error),
    MissingCredentials,
    ExecRejected,
    NoHomeDir,
    InvalidKubeconfig(String),
}

impl From<serde_yaml::Error> for KubeConfigError {
    fn from(err: serde_yaml::Error) -> KubeConfigError {
        KubeConfigError::Format(err)
    }
}

impl From<io::Error> for KubeConfigError {
    fn from(err: io::Error) -> KubeConfigError {
        KubeConfigError::Io(err)
    }
}

impl Display for KubeConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            KubeConfigError::Io(ref e) => write!(f, "IO error: {}", e),
            KubeConfigError::Format(ref e) => write!(f, "Kubeconfig format error: {}", e),
            KubeConfigError::MissingCredentials => f.write_str(MISSING_CREDENTIAL_MESSAGE),
            KubeConfigError::ExecRejected => f.write_str(EXEC_REJECTED_MESSAGE),
            KubeConfigError::NoHomeDir => f.write_str(NO_HOME_DIR_MESSAGE),
            KubeConfigError::InvalidKubeconfig(ref msg) => {
                write!(f, "Invalid kubeconfig file: {}", msg)
            }
        }
    }
}
impl std::error::Error for KubeConfigError {}

/// `KUBECONFIG` may hold a colon-separated list of paths; the first one that
/// exists wins. Falls back to `~/.kube/config`.
fn get_kubeconfig_path() -> Result<PathBuf, KubeConfigError> {
    if let Ok(list) = std::env::var("KUBECONFIG") {
        for path in list.split(':').filter(|p| !p.is_empty()) {
            let path = PathBuf::from(path);
            if path.is_file() {
                return Ok(path);
            }
        }
    }
    home_dir()
        .map(|mut home| {
            home.push(".kube/config");
            home
        })
        .ok_or(KubeConfigError::NoHomeDir)
}

pub fn load_from_kubeconfig(field_manager: &str) -> Result<ClientConfig, KubeConfigError> {
    let path = get_kubeconfig_path()?;
    let reader = File::open(&path)?;
    let kubeconfig: KubeConfig = serde_yaml::from_reader(reader)?;
    resolve(kubeconfig, field_manager)
}

fn resolve(kubeconfig: KubeConfig, field_manager: &str) -> Result<ClientConfig, KubeConfigError> {
    let current_context = kubeconfig.current_context.as_deref().ok_or_else(|| {
        KubeConfigError::InvalidKubeconfig("no current-context is set".to_owned())
    })?;

    let found_context = kubeconfig
        .contexts
        .iter()
        .find(|ctx| ctx.name == current_context)
        .ok_or_else(|| {
            KubeConfigError::InvalidKubeconfig(format!(
                "No context found for current-context: '{}'",
                current_context
            ))
        })?;
    let found_cluster = kubeconfig
        .clusters
        .iter()
        .find(|cluster| cluster.name == found_context.context.cluster)
        .ok_or_else(|| {
            KubeConfigError::InvalidKubeconfig(format!(
                "No cluster found for name: '{}'",
                found_context.context.cluster
            ))
        })?;
    let found_user = kubeconfig
        .users
        .iter()
        .find(|user| user.name == found_context.context.user)
        .ok_or_else(|| {
            KubeConfigError::InvalidKubeconfig(format!(
                "No user found for name: '{}'",
                found_context.context.user
            ))
        })?;

    let credentials = get_credentials(&found_user.user)?;

    let cluster = &found_cluster.cluster;
    let ca_data = if let Some(contents) = cluster.certificate_authority_data.clone() {
        Some(CAData::Contents(contents))
    } else {
        cluster.certificate_authority.clone().map(CAData::File)
    };

    Ok(ClientConfig {
        api_server_endpoint: cluster.server.clone(),
        credentials,
        ca_data,
        verify_ssl_certs: !cluster.insecure_skip_tls_verify,
        user_agent: field_manager.to_owned(),
        field_manager: field_manager.to_owned(),
    })
}

fn get_credentials(user: &UserInfo) -> Result<Credentials, KubeConfigError> {
    if user.exec.is_some() {
        return Err(KubeConfigError::ExecRejected);
    }
    if let Some(token) = user.token.as_ref() {
        log::debug!("Using auth token from kubeconfig");
        return Ok(Credentials::Header(format!("Bearer {}", token)));
    }
    if let Some(token_file) = user.token_file.as_ref() {
        log::debug!("Using tokenFile from kubeconfig");
        return Ok(Credentials::TokenFile(PathBuf::from(token_file)));
    }
    if let Some(username) = user.username.as_ref() {
        let pass = user.password.as_ref().ok_or_else(|| {
            KubeConfigError::InvalidKubeconfig("Username is specified but not password".to_owned())
        })?;
        log::debug!("Using username/password from kubeconfig");
        let encoded = base64::encode(format!("{}:{}", username, pass));
        return Ok(Credentials::Header(format!("Basic {}", encoded)));
    }
    if let Some(certificate) = user.client_certificate_data.as_ref() {
        let private_key = user.client_key_data.as_ref().ok_or_else(|| {
            KubeConfigError::InvalidKubeconfig(
                "'client-certificate-data' is specified, but 'client-key-data' is missing"
                    .to_owned(),
            )
        })?;
        return Ok(Credentials::Pem {
            certificate_base64: certificate.clone(),
            private_key_base64: private_key.clone(),
        });
    }
    if let Some(certificate_path) = user.client_certificate.as_ref() {
        let private_key_path = user.client_key.as_ref().ok_or_else(|| {
            KubeConfigError::InvalidKubeconfig(
                "'client-certificate' is specified, but 'client-key' is missing".to_owned(),
            )
        })?;
        return Ok(Credentials::PemPath {
            certificate_path: certificate_path.clone(),
            private_key_path: private_key_path.clone(),
        });
    }

    Err(KubeConfigError::MissingCredentials)
}

// below are struct definitions used only for deserializing the kubeconfig.
// These are NOT complete definitions and should not leave this module.

#[derive(Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "kebab-case")]
struct ClusterInfo {
    server: String,
    certificate_authority_data: Option<String>,
    certificate_authority: Option<String>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct Cluster {
    name: String,
    cluster: ClusterInfo,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct UserInfo {
    username: Option<String>,
    password: Option<String>,
    token: Option<String>,
    #[serde(rename = "tokenFile")]
    token_file: Option<String>,

    #[serde(rename = "client-certificate-data")]
    client_certificate_data: Option<String>,
    #[serde(rename = "client-key-data")]
    client_key_data: Option<String>,
    #[serde(rename = "client-certificate")]
    client_certificate: Option<String>,
    #[serde(rename = "client-key")]
    client_key: Option<String>,

    exec: Option<serde_yaml::Value>,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct User {
    name: String,
    user: UserInfo,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct ContextInfo {
    cluster: String,
    user: String,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct Context {
    name: String,
    context: ContextInfo,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct KubeConfig {
    #[serde(rename = "current-context")]
    current_context: Option<String>,
    #[serde(default)]
    clusters: Vec<Cluster>,
    #[serde(default)]
    users: Vec<User>,
    #[serde(default)]
    contexts: Vec<Context>,
}

#[cfg(test)]
mod test {
    use super::*;

    fn kubeconfig(user_fragment: &str, cluster_fragment: &str) -> KubeConfig {
        let yaml = format!(
            r#"
current-context: test
clusters:
- name: test-cluster
  cluster:
    server: https://example.com:6443
{cluster}
contexts:
- name: test
  context:
    cluster: test-cluster
    user: test-user
users:
- name: test-user
  user:
{user}
"#,
            cluster = cluster_fragment,
            user = user_fragment,
        );
        serde_yaml::from_str(&yaml).expect("invalid test kubeconfig")
    }

    #[test]
    fn resolves_token_credentials_and_inline_ca() {
        let config = resolve(
            kubeconfig(
                "    token: abc123",
                "    certificate-authority-data: Zm9v",
            ),
            "opensearch-operator",
        )
        .unwrap();
        assert_eq!("https://example.com:6443", config.api_server_endpoint);
        assert_eq!(
            Credentials::Header("Bearer abc123".to_owned()),
            config.credentials
        );
        assert_eq!(Some(CAData::Contents("Zm9v".to_owned())), config.ca_data);
        assert!(config.verify_ssl_certs);
    }

    #[test]
    fn honors_insecure_skip_tls_verify_and_ca_file() {
        let config = resolve(
            kubeconfig(
                "    token: abc123",
                "    certificate-authority: /tmp/ca.crt\n    insecure-skip-tls-verify: true",
            ),
            "opensearch-operator",
        )
        .unwrap();
        assert_eq!(Some(CAData::File("/tmp/ca.crt".to_owned())), config.ca_data);
        assert!(!config.verify_ssl_certs);
    }

    #[test]
    fn supports_token_file_and_client_certificates() {
        let config = resolve(
            kubeconfig("    tokenFile: /tmp/token", ""),
            "opensearch-operator",
        )
        .unwrap();
        assert_eq!(
            Credentials::TokenFile(PathBuf::from("/tmp/token")),
            config.credentials
        );

        let config = resolve(
            kubeconfig(
                "    client-certificate-data: Y2VydA==\n    client-key-data: a2V5",
                "",
            ),
            "opensearch-operator",
        )
        .unwrap();
        assert!(matches!(config.credentials, Credentials::Pem { .. }));
    }

    #[test]
    fn rejects_exec_credential_plugins() {
        let result = resolve(
            kubeconfig("    exec:\n      command: aws", ""),
            "opensearch-operator",
        );
        assert!(matches!(result, Err(KubeConfigError::ExecRejected)));
    }

    #[test]
    fn missing_current_context_is_fatal() {
        let mut config = kubeconfig("    token: abc", "");
        config.current_context = None;
        assert!(matches!(
            resolve(config, "opensearch-operator"),
            Err(KubeConfigError::InvalidKubeconfig(_))
        ));
    }
}
