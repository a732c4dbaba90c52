//! Tiny http server exposing `/health` and `/metrics`.

use crate::cluster::OperatorContext;

use hyper::server::Server;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

type Error = Box<dyn std::error::Error + Send + Sync>;

/// An idle watch still produces bookmark frames and periodic reconnects
/// well inside this window; a loop that has made no observable progress for
/// this long is considered wedged.
const LIVENESS_MAX_AGE: Duration = Duration::from_secs(600);

pub async fn start(port: u16, context: Arc<OperatorContext>) {
    let address: SocketAddr = ([0u8; 4], port).into();
    log::info!("Serving '/health' and '/metrics' on {}", address);

    let make_svc = make_service_fn(move |_| {
        let context = Arc::clone(&context);
        async move {
            Ok::<_, hyper::Error>(service_fn(move |request| {
                let context = Arc::clone(&context);
                async move { handle_request(request, context) }
            }))
        }
    });
    if let Err(err) = Server::bind(&address).serve(make_svc).await {
        log::error!("Metrics server failed: {:?}", err);
    }
}

fn handle_request(
    request: Request<Body>,
    context: Arc<OperatorContext>,
) -> Result<Response<Body>, Error> {
    let path = request.uri().path().trim_end_matches('/');
    log::debug!("Got http request {} {}", request.method(), request.uri());

    match (request.method(), path) {
        (&Method::GET, "/health") => {
            if context.liveness.is_stale(LIVENESS_MAX_AGE) {
                Ok(Response::builder()
                    .status(503)
                    .body(Body::from("watch loop has stalled"))?)
            } else {
                Ok(Response::builder().status(200).body(Body::empty())?)
            }
        }
        (&Method::GET, "/metrics") => {
            let body = context.metrics.encode_as_text()?;
            Ok(Response::builder()
                .status(200)
                .header(http::header::CONTENT_TYPE, prometheus::TEXT_FORMAT)
                .body(Body::from(body))?)
        }
        _ => Ok(Response::builder().status(404).body(Body::empty())?),
    }
}
