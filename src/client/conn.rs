//! A single HTTP/1.1 connection to the api server, built from a TCP dial
//! plus an optional TLS handshake and driven through hyper's low-level
//! connection API. Each `Connection` is used by exactly one request at a
//! time; the pool in `pool.rs` enforces that.

use crate::client::Error;
use crate::config::{CAData, ClientConfig, Credentials};

use http::header::{self, HeaderValue};
use http::{Request, Response};
use hyper::client::conn::{Builder as ConnBuilder, SendRequest};
use hyper::Body;
use openssl::pkey::PKey;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use openssl::x509::X509;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_openssl::SslStream;

use std::fs::File;
use std::io::Read;
use std::pin::Pin;
use std::time::{Duration, Instant};

pub(crate) const OPEN_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const READ_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// idle connections older than this are closed instead of reused
pub(crate) const KEEP_ALIVE: Duration = Duration::from_secs(75);

/// Everything needed to dial new api server connections.
pub(crate) struct ConnectionFactory {
    host: String,
    port: u16,
    tls: bool,
    host_header: HeaderValue,
    user_agent: HeaderValue,
    credentials: Credentials,
    ssl: Option<SslConnector>,
}

impl ConnectionFactory {
    pub fn new(config: &ClientConfig) -> Result<ConnectionFactory, Error> {
        let url = url::Url::parse(&config.api_server_endpoint)
            .map_err(|e| Error::Config(format!("Invalid api server endpoint: {}", e)))?;
        let tls = match url.scheme() {
            "https" => true,
            "http" => false,
            other => {
                return Err(Error::Config(format!(
                    "Unsupported api server scheme: '{}'",
                    other
                )))
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::Config("api server endpoint has no host".to_owned()))?
            .to_owned();
        let port = url.port().unwrap_or(if tls { 443 } else { 80 });

        let host_header = HeaderValue::from_str(&format!("{}:{}", host, port))
            .map_err(|_| Error::Config("api server host is not a valid header value".to_owned()))?;
        let user_agent = HeaderValue::from_str(&config.user_agent)
            .map_err(|_| Error::Config("user agent is not a valid header value".to_owned()))?;

        let ssl = if tls {
            Some(build_ssl_connector(config)?)
        } else {
            None
        };

        Ok(ConnectionFactory {
            host,
            port,
            tls,
            host_header,
            user_agent,
            credentials: config.credentials.clone(),
            ssl,
        })
    }

    pub async fn connect(&self) -> Result<Connection, Error> {
        let auth = self.resolve_auth_header()?;
        let tcp = timeout(OPEN_TIMEOUT, TcpStream::connect((self.host.as_str(), self.port)))
            .await
            .map_err(|_| Error::Timeout("open"))?
            .map_err(Error::Socket)?;
        tcp.set_nodelay(true).map_err(Error::Socket)?;

        let sender = if let Some(connector) = self.ssl.as_ref() {
            let ssl = connector
                .configure()
                .map_err(Error::Tls)?
                .into_ssl(&self.host)
                .map_err(Error::Tls)?;
            let mut stream = SslStream::new(ssl, tcp).map_err(Error::Tls)?;
            timeout(OPEN_TIMEOUT, Pin::new(&mut stream).connect())
                .await
                .map_err(|_| Error::Timeout("tls handshake"))?
                .map_err(Error::Handshake)?;
            handshake(stream).await?
        } else {
            handshake(tcp).await?
        };

        Ok(Connection {
            sender,
            auth,
            released_at: Instant::now(),
        })
    }

    /// Tokens from files are re-read on every connect so rotated
    /// service-account tokens take effect without a restart.
    fn resolve_auth_header(&self) -> Result<Option<HeaderValue>, Error> {
        let value = match &self.credentials {
            Credentials::Header(value) => Some(value.clone()),
            Credentials::TokenFile(path) => {
                let token = std::fs::read_to_string(path).map_err(Error::Socket)?;
                Some(format!("Bearer {}", token.trim()))
            }
            // mTLS authenticates at the TLS layer
            Credentials::Pem { .. } | Credentials::PemPath { .. } => None,
        };
        value
            .map(|v| {
                HeaderValue::from_str(&v)
                    .map_err(|_| Error::Config("credentials are not a valid header value".to_owned()))
            })
            .transpose()
    }

    fn decorate(&self, req: &mut Request<Body>, auth: &Option<HeaderValue>) {
        let headers = req.headers_mut();
        headers.insert(header::HOST, self.host_header.clone());
        headers.insert(header::USER_AGENT, self.user_agent.clone());
        if let Some(auth) = auth {
            headers.insert(header::AUTHORIZATION, auth.clone());
        }
    }
}

async fn handshake<S>(io: S) -> Result<SendRequest<Body>, Error>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (sender, connection) = ConnBuilder::new().handshake::<S, Body>(io).await?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            log::debug!("Api server connection closed: {}", err);
        }
    });
    Ok(sender)
}

pub(crate) struct Connection {
    sender: SendRequest<Body>,
    auth: Option<HeaderValue>,
    released_at: Instant,
}

impl Connection {
    /// Sends one request and waits for the response head. `head_timeout` is
    /// `None` for watch requests, whose streaming read is effectively
    /// unbounded.
    pub async fn send(
        &mut self,
        factory: &ConnectionFactory,
        mut req: Request<Body>,
        head_timeout: Option<Duration>,
    ) -> Result<Response<Body>, Error> {
        factory.decorate(&mut req, &self.auth);

        let ready = std::future::poll_fn(|cx| self.sender.poll_ready(cx));
        timeout(WRITE_TIMEOUT, ready)
            .await
            .map_err(|_| Error::Timeout("write"))??;

        let response_future = self.sender.send_request(req);
        match head_timeout {
            Some(limit) => timeout(limit, response_future)
                .await
                .map_err(|_| Error::Timeout("read"))?
                .map_err(Error::Io),
            None => response_future.await.map_err(Error::Io),
        }
    }

    pub fn touch(&mut self) {
        self.released_at = Instant::now();
    }

    pub fn is_expired(&self) -> bool {
        self.released_at.elapsed() > KEEP_ALIVE
    }
}

fn build_ssl_connector(config: &ClientConfig) -> Result<SslConnector, Error> {
    let mut ssl = SslConnector::builder(SslMethod::tls_client()).map_err(Error::Tls)?;

    match &config.ca_data {
        Some(CAData::Contents(contents)) => {
            // inline CA certs from a kubeconfig are base64 PEM; add them to
            // the store by hand
            let decoded = base64::decode(contents).map_err(|err| {
                Error::Config(format!(
                    "Invalid base64 content of certificate-authority-data: {}",
                    err
                ))
            })?;
            let certs = X509::stack_from_pem(&decoded).map_err(Error::Tls)?;
            let cert_store = ssl.cert_store_mut();
            for cert in certs {
                cert_store.add_cert(cert).map_err(Error::Tls)?;
            }
        }
        Some(CAData::File(path)) => {
            ssl.set_ca_file(path).map_err(Error::Tls)?;
        }
        None => {}
    }

    match &config.credentials {
        Credentials::PemPath {
            certificate_path,
            private_key_path,
        } => {
            let cert = X509::from_pem(&read_file(certificate_path)?).map_err(Error::Tls)?;
            let pkey =
                PKey::private_key_from_pem(&read_file(private_key_path)?).map_err(Error::Tls)?;
            set_client_cert(&mut ssl, &cert, &pkey)?;
        }
        Credentials::Pem {
            certificate_base64,
            private_key_base64,
        } => {
            let decoded_cert = base64::decode(certificate_base64).map_err(|err| {
                Error::Config(format!(
                    "Invalid base64 content of client-certificate-data: {}",
                    err
                ))
            })?;
            let decoded_key = base64::decode(private_key_base64).map_err(|err| {
                Error::Config(format!("Invalid base64 content of client-key-data: {}", err))
            })?;
            let cert = X509::from_pem(&decoded_cert).map_err(Error::Tls)?;
            let pkey = PKey::private_key_from_pem(&decoded_key).map_err(Error::Tls)?;
            set_client_cert(&mut ssl, &cert, &pkey)?;
        }
        Credentials::Header(_) | Credentials::TokenFile(_) => {}
    }

    if config.verify_ssl_certs {
        ssl.set_verify(SslVerifyMode::PEER);
    } else {
        log::warn!("TLS certificate verification has been disabled! All connections to the Kubernetes api server will be insecure!");
        ssl.set_verify(SslVerifyMode::NONE);
    }

    Ok(ssl.build())
}

fn set_client_cert(
    ssl: &mut openssl::ssl::SslConnectorBuilder,
    cert: &X509,
    pkey: &PKey<openssl::pkey::Private>,
) -> Result<(), Error> {
    ssl.set_certificate(cert).map_err(Error::Tls)?;
    ssl.set_private_key(pkey).map_err(Error::Tls)?;
    // ensures that the provided private key and certificate actually go together
    ssl.check_private_key().map_err(Error::Tls)?;
    Ok(())
}

fn read_file(path: &str) -> Result<Vec<u8>, Error> {
    let mut file = File::open(path).map_err(Error::Socket)?;
    let mut contents = vec![];
    file.read_to_end(&mut contents).map_err(Error::Socket)?;
    Ok(contents)
}
