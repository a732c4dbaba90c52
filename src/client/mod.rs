//! The Kubernetes api client: CRUD, server-side apply, merge/JSON patch and
//! resumable streaming watches, on top of an explicit non-reentrant
//! connection pool.

mod conn;
mod pool;
mod request;

use crate::config::ClientConfig;
use crate::k8s_types::K8sType;
use crate::metrics::ClientMetrics;

use bytes::{Bytes, BytesMut};
use http::StatusCode;
use hyper::body::HttpBody;
use hyper::Body;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::timeout;

use std::sync::Arc;
use std::time::Duration;

use self::conn::{Connection, ConnectionFactory, READ_TIMEOUT};
use self::pool::{Checked, Pool};

/// back-off before retrying a watch after a transient failure
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum Error {
    /// protocol-level error from hyper (includes EOF and bad responses)
    Io(hyper::Error),
    /// socket-level error (connect, file reads for credentials)
    Socket(std::io::Error),
    /// openssl configuration error
    Tls(openssl::error::ErrorStack),
    /// TLS handshake failure
    Handshake(openssl::ssl::Error),
    Serde(serde_json::Error),
    Http(StatusCode),
    /// a client-side timeout fired ("open", "tls handshake", "read", "write")
    Timeout(&'static str),
    /// the watch resourceVersion is too old (410 Gone); fatal by design
    Expired,
    /// an ERROR event from a watch stream that is not a 410
    Api(ApiError),
    Config(String),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Socket(e) => Some(e),
            Error::Tls(e) => Some(e),
            Error::Handshake(e) => Some(e),
            Error::Serde(e) => Some(e),
            Error::Api(e) => Some(e),
            _ => None,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "Io error: {}", e),
            Error::Socket(e) => write!(f, "Socket error: {}", e),
            Error::Tls(e) => write!(f, "TLS error: {}", e),
            Error::Handshake(e) => write!(f, "TLS handshake error: {}", e),
            Error::Serde(e) => write!(f, "(De)Serialization error: {}", e),
            Error::Http(status) => write!(f, "Http error: {}", status),
            Error::Timeout(what) => write!(f, "Timed out waiting for {}", what),
            Error::Expired => f.write_str("Watch resourceVersion expired (410 Gone)"),
            Error::Api(e) => write!(f, "{}", e),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl From<hyper::Error> for Error {
    fn from(e: hyper::Error) -> Error {
        Error::Io(e)
    }
}
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Error {
        Error::Serde(e)
    }
}

impl Error {
    pub fn is_http_status(&self, code: u16) -> bool {
        matches!(self, Error::Http(status) if status.as_u16() == code)
    }

    /// Errors the caller recovers from by waiting and retrying: connection
    /// resets, closed sockets, timeouts, truncated responses.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Socket(_) | Error::Timeout(_))
    }
}

/// The payload of a watch `ERROR` event.
#[derive(Deserialize, Serialize, Debug, Clone, Eq, PartialEq)]
pub struct ApiError {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub reason: String,
    pub code: u16,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Api error: status: '{}', code: {}, reason: '{}', message: '{}'",
            self.status, self.code, self.reason, self.message
        )
    }
}
impl std::error::Error for ApiError {}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent {
    Added(Value),
    Modified(Value),
    Deleted(Value),
    Bookmark(Value),
    Error(ApiError),
}

#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct ListMeta {
    #[serde(rename = "resourceVersion")]
    pub resource_version: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct ObjectList<T> {
    pub metadata: ListMeta,
    pub items: Vec<T>,
}

struct Inner {
    factory: ConnectionFactory,
    pool: Pool<Connection>,
    field_manager: String,
    metrics: ClientMetrics,
}

#[derive(Clone)]
pub struct KubeClient(Arc<Inner>);

impl KubeClient {
    pub fn new(config: ClientConfig, metrics: ClientMetrics) -> Result<KubeClient, Error> {
        let field_manager = config.field_manager.clone();
        let factory = ConnectionFactory::new(&config)?;
        Ok(KubeClient(Arc::new(Inner {
            factory,
            pool: Pool::new(),
            field_manager,
            metrics,
        })))
    }

    pub async fn list(
        &self,
        k8s_type: &K8sType,
        namespace: Option<&str>,
    ) -> Result<ObjectList<Value>, Error> {
        let req = request::list_request(k8s_type, namespace)?;
        let body = self.execute_ensure_success(req).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub async fn get(&self, k8s_type: &K8sType, namespace: &str, name: &str) -> Result<Value, Error> {
        let req = request::get_request(k8s_type, namespace, name)?;
        let body = self.execute_ensure_success(req).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// 404 is "absent", not an error.
    pub async fn get_optional(
        &self,
        k8s_type: &K8sType,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Value>, Error> {
        match self.get(k8s_type, namespace, name).await {
            Ok(value) => Ok(Some(value)),
            Err(ref e) if e.is_http_status(404) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn exists(
        &self,
        k8s_type: &K8sType,
        namespace: &str,
        name: &str,
    ) -> Result<bool, Error> {
        Ok(self.get_optional(k8s_type, namespace, name).await?.is_some())
    }

    pub async fn create(&self, k8s_type: &K8sType, resource: &Value) -> Result<(), Error> {
        let req = request::create_request(k8s_type, resource)?;
        self.execute_ensure_success(req).await?;
        Ok(())
    }

    pub async fn update(
        &self,
        k8s_type: &K8sType,
        namespace: &str,
        name: &str,
        resource: &Value,
    ) -> Result<(), Error> {
        let req = request::update_request(k8s_type, namespace, name, resource)?;
        self.execute_ensure_success(req).await?;
        Ok(())
    }

    /// Server-side apply with this client's field manager.
    pub async fn apply(
        &self,
        k8s_type: &K8sType,
        namespace: &str,
        name: &str,
        resource: &Value,
    ) -> Result<(), Error> {
        let req = request::apply_request(
            k8s_type,
            namespace,
            name,
            resource,
            &self.0.field_manager,
        )?;
        self.execute_ensure_success(req).await?;
        Ok(())
    }

    pub async fn merge_patch(
        &self,
        k8s_type: &K8sType,
        namespace: &str,
        name: &str,
        subresource: Option<&str>,
        patch: &Value,
    ) -> Result<(), Error> {
        let req = request::merge_patch_request(k8s_type, namespace, name, subresource, patch)?;
        self.execute_ensure_success(req).await?;
        Ok(())
    }

    pub async fn json_patch(
        &self,
        k8s_type: &K8sType,
        namespace: &str,
        name: &str,
        operations: &Value,
    ) -> Result<(), Error> {
        let req = request::json_patch_request(k8s_type, namespace, name, operations)?;
        self.execute_ensure_success(req).await?;
        Ok(())
    }

    pub async fn delete(&self, k8s_type: &K8sType, namespace: &str, name: &str) -> Result<(), Error> {
        log::info!("Deleting resource '{}/{}' with type: {}", namespace, name, k8s_type);
        let req = request::delete_request(k8s_type, namespace, name)?;
        let (status, body) = self.execute(req, Some(READ_TIMEOUT)).await?;
        match status.as_u16() {
            // 404: already gone. 409: already being deleted. Both fine by us.
            200..=299 | 404 | 409 => Ok(()),
            other => {
                log_error_body(status, &body);
                log::error!(
                    "Delete request for {} : {}/{} failed with status: {}",
                    k8s_type,
                    namespace,
                    name,
                    other
                );
                Err(Error::Http(status))
            }
        }
    }

    /// Opens a resumable watch. The returned stream handles bookmarks and
    /// transient reconnects internally; only `ADDED`/`MODIFIED`/`DELETED`
    /// events are surfaced.
    pub fn watch(
        &self,
        k8s_type: &'static K8sType,
        namespace: Option<&str>,
        resource_version: &str,
    ) -> WatchEvents {
        WatchEvents {
            client: self.clone(),
            k8s_type,
            namespace: namespace.map(str::to_owned),
            resource_version: resource_version.to_owned(),
            stream: None,
            progress: None,
        }
    }

    async fn open_watch_stream(
        &self,
        k8s_type: &K8sType,
        namespace: Option<&str>,
        resource_version: &str,
    ) -> Result<EventStream, Error> {
        let req = request::watch_request(k8s_type, namespace, Some(resource_version))?;
        let mut conn = self.acquire().await?;
        // a watch connection is consumed by its stream and never reused
        conn.discard();
        let response = match conn.send(&self.0.factory, req, Some(READ_TIMEOUT)).await {
            Ok(response) => response,
            Err(err) => {
                self.0.metrics.request_failed();
                return Err(err);
            }
        };
        if !response.status().is_success() {
            if response.status().as_u16() == 410 {
                return Err(Error::Expired);
            }
            return Err(Error::Http(response.status()));
        }
        Ok(EventStream::new(response.into_body(), conn))
    }

    async fn acquire(&self) -> Result<Checked<Connection>, Error> {
        while let Some(mut conn) = self.0.pool.checkout() {
            if conn.is_expired() {
                conn.discard();
                continue;
            }
            return Ok(conn);
        }
        let conn = self.0.factory.connect().await?;
        Ok(self.0.pool.admit(conn))
    }

    async fn execute_ensure_success(&self, req: http::Request<Body>) -> Result<Bytes, Error> {
        let (status, body) = self.execute(req, Some(READ_TIMEOUT)).await?;
        if status.is_success() {
            Ok(body)
        } else {
            log_error_body(status, &body);
            Err(Error::Http(status))
        }
    }

    /// Runs one request on one pooled connection. Any error discards the
    /// connection; success returns it to the idle set.
    async fn execute(
        &self,
        req: http::Request<Body>,
        head_timeout: Option<Duration>,
    ) -> Result<(StatusCode, Bytes), Error> {
        let method = req.method().to_string();
        let uri = req.uri().to_string();
        log::debug!("Starting {} request to: {}", method, uri);

        let mut conn = self.acquire().await?;
        let timer = self.0.metrics.request_started();
        let result = async {
            let response = conn.send(&self.0.factory, req, head_timeout).await?;
            let status = response.status();
            let body = timeout(READ_TIMEOUT, hyper::body::to_bytes(response.into_body()))
                .await
                .map_err(|_| Error::Timeout("read"))??;
            Ok((status, body))
        }
        .await;
        timer.observe_duration();

        match result {
            Ok((status, body)) => {
                log::debug!(
                    "Finished {} request to: {}, status: {}",
                    method,
                    uri,
                    status
                );
                conn.touch();
                Ok((status, body))
            }
            Err(err) => {
                log::error!("Failed {} request to: {}, err: {}", method, uri, err);
                conn.discard();
                self.0.metrics.request_failed();
                Err(err)
            }
        }
    }
}

fn log_error_body(status: StatusCode, body: &Bytes) {
    if let Ok(as_str) = std::str::from_utf8(body) {
        log::error!("Response status: {}, body: {}", status, as_str);
    } else {
        log::error!(
            "Response status: {}, binary body with {} bytes",
            status,
            body.len()
        );
    }
}

/// Splits a streaming response body into newline-delimited chunks.
struct JsonLines {
    body: Body,
    buffer: BytesMut,
    done: bool,
}

impl JsonLines {
    fn new(body: Body) -> JsonLines {
        JsonLines {
            body,
            buffer: BytesMut::new(),
            done: false,
        }
    }

    async fn next_line(&mut self) -> Option<Result<Bytes, Error>> {
        loop {
            if let Some(position) = self.buffer.iter().position(|b| *b == b'\n') {
                let mut line = self.buffer.split_to(position + 1);
                while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                if line.is_empty() {
                    continue;
                }
                return Some(Ok(line.freeze()));
            }
            if self.done {
                if self.buffer.is_empty() {
                    return None;
                }
                let line = self.buffer.split().freeze();
                return Some(Ok(line));
            }
            match self.body.data().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(err)) => return Some(Err(err.into())),
                None => self.done = true,
            }
        }
    }
}

/// One open watch connection: the response body plus the exclusive checkout
/// that backs it.
struct EventStream {
    lines: JsonLines,
    // held so the connection stays checked out for the stream's lifetime
    _conn: Checked<Connection>,
}

impl EventStream {
    fn new(body: Body, conn: Checked<Connection>) -> EventStream {
        EventStream {
            lines: JsonLines::new(body),
            _conn: conn,
        }
    }

    async fn next_event(&mut self) -> Option<Result<WatchEvent, Error>> {
        let line = self.lines.next_line().await?;
        Some(line.and_then(|line| serde_json::from_slice(&line).map_err(Into::into)))
    }
}

/// What to do with one decoded watch event: bookmarks advance the cursor and
/// are consumed, 410 errors are fatal, everything else is surfaced. The
/// cursor advances for every event so a resumed watch neither skips nor
/// replays.
fn absorb_event(
    resource_version: &mut String,
    event: WatchEvent,
) -> Result<Option<WatchEvent>, Error> {
    fn advance(resource_version: &mut String, object: &Value) {
        if let Some(version) = object
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
        {
            *resource_version = version.to_owned();
        }
    }

    match event {
        WatchEvent::Bookmark(object) => {
            advance(resource_version, &object);
            Ok(None)
        }
        WatchEvent::Error(err) if err.code == 410 => Err(Error::Expired),
        WatchEvent::Error(err) => Err(Error::Api(err)),
        other => {
            let object = match &other {
                WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => o,
                _ => unreachable!(),
            };
            advance(resource_version, object);
            Ok(Some(other))
        }
    }
}

/// A resumable stream of watch events for one resource type.
pub struct WatchEvents {
    client: KubeClient,
    k8s_type: &'static K8sType,
    namespace: Option<String>,
    resource_version: String,
    stream: Option<EventStream>,
    progress: Option<Box<dyn Fn() + Send>>,
}

impl WatchEvents {
    /// The cursor the next (re)connect will resume from.
    pub fn resource_version(&self) -> &str {
        &self.resource_version
    }

    /// Registers a callback invoked whenever the stream makes observable
    /// progress: a successful (re)connect or any received frame, bookmarks
    /// included. A stream stuck in its transient-retry loop stops calling it.
    pub fn on_progress(mut self, callback: Box<dyn Fn() + Send>) -> WatchEvents {
        self.progress = Some(callback);
        self
    }

    fn mark_progress(&self) {
        if let Some(callback) = &self.progress {
            callback();
        }
    }

    /// Yields the next `ADDED`/`MODIFIED`/`DELETED` event. Transient
    /// failures and end-of-stream reconnect internally after a 5s pause;
    /// `Error::Expired` and non-410 api errors are returned to the caller.
    pub async fn next(&mut self) -> Result<WatchEvent, Error> {
        loop {
            if self.stream.is_none() {
                self.open().await?;
            }
            match self.stream.as_mut().unwrap().next_event().await {
                None => {
                    log::info!(
                        "Watch stream for {} ended, resuming from resourceVersion: {}",
                        self.k8s_type,
                        self.resource_version
                    );
                    self.stream = None;
                    tokio::time::sleep(WATCH_RETRY_DELAY).await;
                }
                Some(Err(err)) if err.is_transient() => {
                    log::warn!(
                        "Transient watch error for {}: {}, retrying from resourceVersion: {}",
                        self.k8s_type,
                        err,
                        self.resource_version
                    );
                    self.stream = None;
                    tokio::time::sleep(WATCH_RETRY_DELAY).await;
                }
                Some(Err(err)) => return Err(err),
                Some(Ok(event)) => {
                    self.mark_progress();
                    if let Some(event) = absorb_event(&mut self.resource_version, event)? {
                        return Ok(event);
                    }
                }
            }
        }
    }

    async fn open(&mut self) -> Result<(), Error> {
        loop {
            let result = self
                .client
                .open_watch_stream(
                    self.k8s_type,
                    self.namespace.as_deref(),
                    &self.resource_version,
                )
                .await;
            match result {
                Ok(stream) => {
                    self.stream = Some(stream);
                    self.mark_progress();
                    return Ok(());
                }
                Err(err) if err.is_transient() => {
                    log::warn!(
                        "Failed to open watch for {}: {}, retrying in {:?}",
                        self.k8s_type,
                        err,
                        WATCH_RETRY_DELAY
                    );
                    tokio::time::sleep(WATCH_RETRY_DELAY).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use futures_util::StreamExt;
    use serde_json::json;

    fn fabricated_body(chunks: Vec<&'static [u8]>) -> Body {
        let stream = tokio_stream::iter(chunks).map(|chunk| {
            let result: Result<Bytes, std::io::Error> = Ok(Bytes::from_static(chunk));
            result
        });
        Body::wrap_stream(stream)
    }

    #[tokio::test]
    async fn lines_split_across_chunk_boundaries() {
        let body = fabricated_body(vec![
            &b"{\"a\":1}\n{\"b\""[..],
            &b":2}\r\n\r\n{\"c\":3}"[..],
        ]);
        let mut lines = JsonLines::new(body);

        let expected = [r#"{"a":1}"#, r#"{"b":2}"#, r#"{"c":3}"#];
        for want in expected {
            let line = lines.next_line().await.unwrap().unwrap();
            assert_eq!(want.as_bytes(), &line[..]);
        }
        assert!(lines.next_line().await.is_none());
    }

    #[tokio::test]
    async fn event_stream_decodes_watch_frames() {
        let body = fabricated_body(vec![
            &b"{\"type\":\"ADDED\",\"object\":{\"metadata\":{\"resourceVersion\":\"101\"}}}\n"[..],
            &b"{\"type\":\"BOOKMARK\",\"object\":{\"metadata\":{\"resourceVersion\":\"105\"}}}\n"[..],
        ]);
        let mut lines = JsonLines::new(body);

        let added: WatchEvent =
            serde_json::from_slice(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert!(matches!(added, WatchEvent::Added(_)));
        let bookmark: WatchEvent =
            serde_json::from_slice(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert!(matches!(bookmark, WatchEvent::Bookmark(_)));
    }

    #[test]
    fn bookmarks_advance_the_cursor_without_surfacing() {
        let mut version = "100".to_owned();
        let event = WatchEvent::Bookmark(json!({"metadata": {"resourceVersion": "200"}}));
        let surfaced = absorb_event(&mut version, event).unwrap();
        assert!(surfaced.is_none());
        assert_eq!("200", version);
    }

    #[test]
    fn events_surface_in_order_and_advance_the_cursor() {
        let mut version = "100".to_owned();

        let first = WatchEvent::Added(json!({"metadata": {"resourceVersion": "101"}}));
        let surfaced = absorb_event(&mut version, first).unwrap().unwrap();
        assert!(matches!(surfaced, WatchEvent::Added(_)));
        assert_eq!("101", version);

        let second = WatchEvent::Deleted(json!({"metadata": {"resourceVersion": "107"}}));
        let surfaced = absorb_event(&mut version, second).unwrap().unwrap();
        assert!(matches!(surfaced, WatchEvent::Deleted(_)));
        assert_eq!("107", version);
    }

    #[test]
    fn progress_callback_fires_on_marks() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let config = crate::config::ClientConfig {
            api_server_endpoint: "https://localhost:6443".to_owned(),
            credentials: crate::config::Credentials::Header("Bearer test".to_owned()),
            ca_data: None,
            verify_ssl_certs: true,
            user_agent: "opensearch-operator".to_owned(),
            field_manager: "opensearch-operator".to_owned(),
        };
        let metrics = crate::metrics::Metrics::new();
        let client = KubeClient::new(config, metrics.client_metrics()).unwrap();

        let marks = Arc::new(AtomicUsize::new(0));
        let marks_clone = Arc::clone(&marks);
        let events = client
            .watch(crate::k8s_types::OpenSearch, None, "100")
            .on_progress(Box::new(move || {
                marks_clone.fetch_add(1, Ordering::SeqCst);
            }));

        events.mark_progress();
        events.mark_progress();
        assert_eq!(2, marks.load(Ordering::SeqCst));
    }

    #[test]
    fn gone_events_are_fatal() {
        let mut version = "100".to_owned();
        let event = WatchEvent::Error(ApiError {
            status: "Failure".to_owned(),
            message: "too old resource version".to_owned(),
            reason: "Expired".to_owned(),
            code: 410,
        });
        assert!(matches!(
            absorb_event(&mut version, event),
            Err(Error::Expired)
        ));
    }

    #[test]
    fn non_gone_error_events_carry_the_api_error() {
        let mut version = "100".to_owned();
        let event = WatchEvent::Error(ApiError {
            status: "Failure".to_owned(),
            message: "internal".to_owned(),
            reason: "InternalError".to_owned(),
            code: 500,
        });
        match absorb_event(&mut version, event) {
            Err(Error::Api(err)) => assert_eq!(500, err.code),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }
}
