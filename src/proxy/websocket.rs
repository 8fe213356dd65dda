//! WebSocket upgrade forwarding.
//!
//! Upgrade requests follow the same routing resolution as plain HTTP.
//! After both handshakes complete the proxy degrades to a raw byte tunnel
//! between the two upgraded connections; frames, pings, and close are the
//! endpoints' business.

use std::path::PathBuf;

use axum::body::Body;
use axum::http::{header, Request, Response, StatusCode};
use axum::response::IntoResponse;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;

/// Whether this request asks for a protocol upgrade.
pub fn is_upgrade_request(req: &Request<Body>) -> bool {
    req.headers().contains_key(header::UPGRADE)
}

/// Forward an upgrade handshake to the module socket and, on 101, splice
/// the two connections together.
pub async fn tunnel(socket_path: PathBuf, mut req: Request<Body>, upstream_path: &str) -> Response<Body> {
    let client_upgrade = hyper::upgrade::on(&mut req);

    let (parts, _body) = req.into_parts();
    let mut upstream_req = Request::builder()
        .method(parts.method.clone())
        .uri(upstream_path);
    if let Some(headers) = upstream_req.headers_mut() {
        for (key, value) in parts.headers.iter() {
            headers.insert(key.clone(), value.clone());
        }
    }
    let upstream_req = match upstream_req.body(Body::empty()) {
        Ok(req) => req,
        Err(e) => {
            tracing::error!(error = %e, "failed to build upstream upgrade request");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let stream = match UnixStream::connect(&socket_path).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(path = %socket_path.display(), error = %e, "upgrade target refused connection");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let (mut sender, conn) = match hyper::client::conn::http1::handshake(TokioIo::new(stream)).await
    {
        Ok(pair) => pair,
        Err(e) => {
            tracing::error!(error = %e, "upstream HTTP handshake failed");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            tracing::debug!(error = %e, "upstream connection ended");
        }
    });

    let mut upstream_resp = match sender.send_request(upstream_req).await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::error!(error = %e, "upstream rejected upgrade request");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    if upstream_resp.status() == StatusCode::SWITCHING_PROTOCOLS {
        let upstream_upgrade = hyper::upgrade::on(&mut upstream_resp);
        tokio::spawn(async move {
            match tokio::try_join!(client_upgrade, upstream_upgrade) {
                Ok((client_io, upstream_io)) => {
                    let mut client_io = TokioIo::new(client_io);
                    let mut upstream_io = TokioIo::new(upstream_io);
                    match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
                        Ok((up, down)) => {
                            tracing::debug!(bytes_up = up, bytes_down = down, "websocket tunnel closed");
                        }
                        Err(e) => tracing::debug!(error = %e, "websocket tunnel error"),
                    }
                }
                Err(e) => tracing::warn!(error = %e, "upgrade completion failed"),
            }
        });
    }

    let (parts, body) = upstream_resp.into_parts();
    Response::from_parts(parts, Body::new(body))
}
