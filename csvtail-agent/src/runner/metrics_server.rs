//! `GET /metrics` endpoint over HTTP/1.

use crate::metrics;
use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
    let addr: SocketAddr = listen_addr
        .parse()
        .with_context(|| format!("invalid metrics listen address {listen_addr}"))?;
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics server to {addr}"))
}

/// Accept connections until `cancel_token` fires.
pub async fn serve(listener: TcpListener, cancel_token: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        info!("metrics server listening on http://{}/metrics", addr);
    }

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                info!("metrics server shutting down");
                break;
            }
            accept_result = listener.accept() => {
                let (stream, _) = match accept_result {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(error = %err, "failed to accept metrics connection");
                        continue;
                    }
                };

                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                        Ok::<_, Infallible>(respond(req.uri().path()))
                    });
                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        debug!(error = %err, "error serving metrics connection");
                    }
                });
            }
        }
    }
}

fn respond(path: &str) -> Response<Full<Bytes>> {
    if path != "/metrics" {
        return plain(StatusCode::NOT_FOUND, "Not Found");
    }
    match metrics::render() {
        Ok((content_type, body)) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            if let Ok(value) = content_type.parse::<hyper::header::HeaderValue>() {
                response
                    .headers_mut()
                    .insert(hyper::header::CONTENT_TYPE, value);
            }
            response
        }
        Err(err) => {
            warn!(error = %err, "failed to encode metrics");
            plain(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
        }
    }
}

fn plain(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}
