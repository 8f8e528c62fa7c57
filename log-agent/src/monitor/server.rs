//! HTTP query surface: `GET /monitor` (JSON snapshot) and `GET /metrics`
//! (Prometheus text). Failures here are logged and never reach the pipeline.

use super::Monitor;
use crate::metrics;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Binds `addr` and serves until `cancel` fires. A bind failure is logged and
/// the function returns.
pub async fn serve(addr: SocketAddr, monitor: Monitor, cancel: CancellationToken) {
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("Failed to bind monitor server to {}: {}", addr, err);
            return;
        }
    };

    info!(
        "Monitor server listening on http://{}/monitor and /metrics",
        addr
    );

    serve_listener(listener, monitor, cancel).await;
}

pub(crate) async fn serve_listener(
    listener: TcpListener,
    monitor: Monitor,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Monitor server shutting down");
                break;
            }
            accept_result = listener.accept() => {
                let (stream, _) = match accept_result {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!("Failed to accept monitor connection: {}", err);
                        continue;
                    }
                };

                let monitor = monitor.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                        let response = route(&req, &monitor);
                        async move { Ok::<_, Infallible>(response) }
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        debug!("Error serving monitor connection: {}", err);
                    }
                });
            }
        }
    }
}

pub fn route<B>(req: &Request<B>, monitor: &Monitor) -> Response<Full<Bytes>> {
    match req.uri().path() {
        "/monitor" => match monitor.snapshot().to_json() {
            Ok(body) => with_content_type(
                Response::new(Full::new(Bytes::from(body))),
                HeaderValue::from_static("application/json"),
            ),
            Err(err) => {
                warn!(error = %err, "failed to serialize monitor snapshot");
                status_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        },
        "/metrics" => match metrics::encode() {
            Ok((content_type, body)) => {
                let content_type = HeaderValue::from_str(&content_type)
                    .unwrap_or_else(|_| HeaderValue::from_static("text/plain"));
                with_content_type(Response::new(Full::new(Bytes::from(body))), content_type)
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "failed to export metrics");
                status_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        },
        _ => status_response(StatusCode::NOT_FOUND, "Not Found"),
    }
}

fn with_content_type(
    mut response: Response<Full<Bytes>>,
    content_type: HeaderValue,
) -> Response<Full<Bytes>> {
    response.headers_mut().insert(CONTENT_TYPE, content_type);
    response
}

fn status_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}
