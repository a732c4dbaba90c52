//! A thin client for the managed OpenSearch REST API. The REST data path is
//! plain http (only the transport layer between nodes is TLS), authenticated
//! with the generated `admin` basic credentials.

use http::{header, Request, StatusCode};
use hyper::client::HttpConnector;
use hyper::{Body, Client as HyperClient};
use serde::Deserialize;
use serde_json::Value;
use tokio::time::timeout;

use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const REST_PORT: u16 = 9200;

#[derive(Debug)]
pub enum OpenSearchError {
    Io(hyper::Error),
    Serde(serde_json::Error),
    Http { status: StatusCode, body: String },
    Timeout,
}

impl std::fmt::Display for OpenSearchError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            OpenSearchError::Io(e) => write!(f, "OpenSearch transport error: {}", e),
            OpenSearchError::Serde(e) => write!(f, "OpenSearch response error: {}", e),
            OpenSearchError::Http { status, body } => {
                write!(f, "OpenSearch http error: {}: {}", status, body)
            }
            OpenSearchError::Timeout => f.write_str("OpenSearch request timed out"),
        }
    }
}

impl std::error::Error for OpenSearchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OpenSearchError::Io(e) => Some(e),
            OpenSearchError::Serde(e) => Some(e),
            _ => None,
        }
    }
}

impl From<hyper::Error> for OpenSearchError {
    fn from(e: hyper::Error) -> OpenSearchError {
        OpenSearchError::Io(e)
    }
}
impl From<serde_json::Error> for OpenSearchError {
    fn from(e: serde_json::Error) -> OpenSearchError {
        OpenSearchError::Serde(e)
    }
}

impl OpenSearchError {
    pub fn is_http_status(&self, code: u16) -> bool {
        matches!(self, OpenSearchError::Http { status, .. } if status.as_u16() == code)
    }
}

/// One row of `_cat/nodes`. Older clusters report the manager under the
/// `master` header, newer ones under `cluster_manager`; both mark the
/// current manager with `*`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CatNode {
    pub name: String,
    #[serde(default)]
    pub master: Option<String>,
    #[serde(default)]
    pub cluster_manager: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ClusterHealth {
    pub status: String,
}

#[derive(Clone)]
pub struct OpenSearchClient {
    http: HyperClient<HttpConnector>,
    base_url: String,
    auth_header: String,
}

impl std::fmt::Debug for OpenSearchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "OpenSearchClient({})", self.base_url)
    }
}

impl OpenSearchClient {
    pub fn new(base_url: String, username: &str, password: &str) -> OpenSearchClient {
        let credentials = base64::encode(format!("{}:{}", username, password));
        OpenSearchClient {
            http: HyperClient::new(),
            base_url,
            auth_header: format!("Basic {}", credentials),
        }
    }

    /// The REST URL of a managed cluster, derived from its Service DNS name.
    /// `CLUSTER_HOST_OVERRIDE` substitutes the host for out-of-cluster runs.
    pub fn service_url(namespace: &str, name: &str) -> String {
        let host = std::env::var("CLUSTER_HOST_OVERRIDE").unwrap_or_else(|_| {
            format!("opensearch-{}.{}.svc.cluster.local", name, namespace)
        });
        format!("http://{}:{}", host, REST_PORT)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn cat_nodes(&self) -> Result<Vec<CatNode>, OpenSearchError> {
        let body = self
            .request(
                "GET",
                "/_cat/nodes?h=name,cluster_manager,master,version&format=json",
                None,
            )
            .await?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub async fn cluster_health(&self) -> Result<ClusterHealth, OpenSearchError> {
        let body = self.request("GET", "/_cluster/health", None).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub async fn get_json(&self, path: &str) -> Result<Value, OpenSearchError> {
        let body = self.request("GET", path, None).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub async fn put_json(&self, path: &str, body: &Value) -> Result<(), OpenSearchError> {
        self.request("PUT", path, Some(body)).await?;
        Ok(())
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> Result<(), OpenSearchError> {
        self.request("POST", path, Some(body)).await?;
        Ok(())
    }

    pub async fn delete(&self, path: &str) -> Result<(), OpenSearchError> {
        self.request("DELETE", path, None).await?;
        Ok(())
    }

    async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<&Value>,
    ) -> Result<bytes::Bytes, OpenSearchError> {
        let uri = format!("{}{}", self.base_url, path);
        let mut builder = Request::builder()
            .method(method)
            .uri(&uri)
            .header(header::AUTHORIZATION, &self.auth_header);
        let body = match body {
            Some(value) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(serde_json::to_vec(value)?)
            }
            None => Body::empty(),
        };
        let request = builder.body(body).expect("request construction is infallible");

        log::debug!("OpenSearch {} {}", method, uri);
        let response = timeout(REQUEST_TIMEOUT, self.http.request(request))
            .await
            .map_err(|_| OpenSearchError::Timeout)??;
        let status = response.status();
        let body = timeout(REQUEST_TIMEOUT, hyper::body::to_bytes(response.into_body()))
            .await
            .map_err(|_| OpenSearchError::Timeout)??;

        if status.is_success() {
            Ok(body)
        } else {
            Err(OpenSearchError::Http {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            })
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cat_nodes_rows_tolerate_missing_columns() {
        let rows: Vec<CatNode> = serde_json::from_str(
            r#"[
                {"name": "node-0", "cluster_manager": "*", "master": "*", "version": "3.1.0"},
                {"name": "node-1", "cluster_manager": "-", "master": "-"}
            ]"#,
        )
        .unwrap();
        assert_eq!(2, rows.len());
        assert_eq!(Some("*"), rows[0].master.as_deref());
        assert_eq!(None, rows[1].version);
    }

    #[test]
    fn service_url_uses_the_cluster_dns_name() {
        // no env override in unit tests
        std::env::remove_var("CLUSTER_HOST_OVERRIDE");
        assert_eq!(
            "http://opensearch-example.default.svc.cluster.local:9200",
            OpenSearchClient::service_url("default", "example")
        );
    }
}
