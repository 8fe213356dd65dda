//! Public HTTP/HTTPS termination and dispatch.
//!
//! # Responsibilities
//! - Bind the public HTTP (and, certificates permitting, HTTPS) listeners
//! - Serve the built-in responses: favicon, modules.json, HTTPS redirect
//! - Resolve each request to its owning module and gate on readiness
//! - Forward requests (and WebSocket handshakes) to the module's socket
//!   with `X-Forwarded-*` semantics
//!
//! Routing failures surface to the client as a generic server error and a
//! detailed operator log line; they never take the router down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderValue, Request, StatusCode, Uri},
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Json, Router,
};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::ConfigService;
use crate::context::AppContext;
use crate::ipc::IpcHub;
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::proxy::agent::AgentCache;
use crate::proxy::router::{module_urls, resolve, RouteMode};
use crate::proxy::{tls, websocket};
use crate::supervisor::Supervisor;

static FAVICON: &[u8] = include_bytes!("favicon.ico");

#[derive(Clone)]
pub struct ProxyState {
    pub ctx: Arc<AppContext>,
    pub hub: Arc<IpcHub>,
    pub supervisor: Arc<Supervisor>,
    pub config: Arc<ConfigService>,
    pub agents: Arc<AgentCache>,
    /// Whether this listener terminated TLS itself.
    pub via_https: bool,
    /// Whether an HTTPS listener exists at all (drives redirects).
    pub https_available: bool,
}

pub struct ProxyServer {
    ctx: Arc<AppContext>,
    hub: Arc<IpcHub>,
    supervisor: Arc<Supervisor>,
    config: Arc<ConfigService>,
    agents: Arc<AgentCache>,
}

impl ProxyServer {
    pub fn new(
        ctx: Arc<AppContext>,
        hub: Arc<IpcHub>,
        supervisor: Arc<Supervisor>,
        config: Arc<ConfigService>,
    ) -> Self {
        Self {
            ctx,
            hub,
            supervisor,
            config,
            agents: Arc::new(AgentCache::new()),
        }
    }

    fn app(&self, via_https: bool, https_available: bool) -> Router {
        let state = ProxyState {
            ctx: self.ctx.clone(),
            hub: self.hub.clone(),
            supervisor: self.supervisor.clone(),
            config: self.config.clone(),
            agents: self.agents.clone(),
            via_https,
            https_available,
        };
        let request_timeout = self
            .config
            .current()
            .get_u64("core.request_timeout_secs")
            .unwrap_or(30);
        Router::new()
            .route("/favicon.ico", get(favicon))
            .route("/modules.json", get(modules_json))
            .fallback(proxy_handler)
            .with_state(state)
            .layer(TimeoutLayer::new(Duration::from_secs(request_timeout)))
            .layer(TraceLayer::new_for_http())
    }

    /// Bind and run the public listeners until shutdown. A failed HTTP
    /// bind is fatal; a missing certificate pair only skips HTTPS.
    pub async fn run(self, shutdown: &Shutdown) -> Result<(), std::io::Error> {
        let snapshot = self.config.current();
        let http_port = snapshot.get_u16("core.http_port").unwrap_or(8120);
        let https_port = snapshot.get_u16("core.https_port").unwrap_or(8443);

        let tls_settings = tls::TlsSettings::from_snapshot(&snapshot);
        let tls_config = match &tls_settings {
            Some(settings) => tls::load(settings).await,
            None => None,
        };
        let https_available = tls_config.is_some();

        if let Some(tls_config) = tls_config {
            let settings = tls_settings.expect("settings exist when config loaded");
            tls::spawn_reload(tls_config.clone(), settings, tls::RELOAD_INTERVAL);

            let addr = SocketAddr::from(([0, 0, 0, 0], https_port));
            let app = self.app(true, true);
            let handle = axum_server::Handle::new();
            {
                let handle = handle.clone();
                let mut rx = shutdown.subscribe();
                tokio::spawn(async move {
                    let _ = rx.recv().await;
                    handle.graceful_shutdown(None);
                });
            }
            tokio::spawn(async move {
                tracing::info!(%addr, "HTTPS listener starting");
                if let Err(e) = axum_server::bind_rustls(addr, tls_config)
                    .handle(handle)
                    .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                    .await
                {
                    tracing::error!(error = %e, "HTTPS listener failed");
                }
            });
        } else {
            tracing::info!("no usable certificate pair, HTTPS listener not started");
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], http_port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(%addr, "HTTP listener starting");

        let app = self.app(false, https_available);
        let mut rx = shutdown.subscribe();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = rx.recv().await;
        })
        .await?;

        tracing::info!("proxy router stopped");
        Ok(())
    }
}

async fn favicon() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "image/x-icon")], FAVICON)
}

/// JSON listing of registered modules and their externally-reachable URLs.
async fn modules_json(State(state): State<ProxyState>) -> impl IntoResponse {
    let snapshot = state.config.current();
    let mode = RouteMode::from_snapshot(&snapshot);
    let host = snapshot.get_str("core.host").unwrap_or("localhost");
    let (https, port) = if state.https_available {
        (true, snapshot.get_u16("core.https_port").unwrap_or(8443))
    } else {
        (false, snapshot.get_u16("core.http_port").unwrap_or(8120))
    };

    let listing: Vec<(String, Vec<String>)> = state
        .supervisor
        .modules()
        .names()
        .map(|name| (name.to_string(), module_urls(mode, name, host, https, port)))
        .collect();
    Json(listing)
}

async fn proxy_handler(
    State(state): State<ProxyState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    mut req: Request<Body>,
) -> Response {
    let start = Instant::now();
    let snapshot = state.config.current();
    let mode = RouteMode::from_snapshot(&snapshot);

    if let Some(redirect) = https_redirect(&state, &snapshot, &req) {
        return redirect;
    }

    if mode == RouteMode::Off {
        // Standalone mode: modules bind their own public ports.
        return (StatusCode::NOT_FOUND, "proxy routing is not configured").into_response();
    }

    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h).to_string());
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();

    let Some(route) = resolve(mode, &path_and_query, host.as_deref()) else {
        tracing::warn!(path = %path_and_query, host = ?host, "no module resolvable for request");
        metrics::record_proxy_request("none", 502, start);
        return (StatusCode::BAD_GATEWAY, "no module for this request").into_response();
    };

    if !state.supervisor.modules().contains(&route.module) {
        tracing::warn!(module = %route.module, "request for unregistered module");
        metrics::record_proxy_request(&route.module, 502, start);
        return (StatusCode::BAD_GATEWAY, "unknown module").into_response();
    }

    // Readiness gate: answer immediately rather than parking the request.
    if !state.hub.is_ready(&route.module) {
        tracing::warn!(module = %route.module, "request before readiness handshake");
        metrics::record_proxy_request(&route.module, 503, start);
        return (StatusCode::SERVICE_UNAVAILABLE, "module not ready").into_response();
    }

    let socket_path = state.hub.socket_registry().module_http_socket(&route.module);

    // Applied before the upgrade branch so WebSocket handshakes carry the
    // same X-Forwarded-* headers as plain requests.
    forwarded_headers(req.headers_mut(), peer, state.via_https, host.as_deref());

    if websocket::is_upgrade_request(&req) {
        return websocket::tunnel(socket_path, req, &route.upstream_path).await;
    }

    let agent = state.agents.agent_for(&route.module, &socket_path);
    let (mut parts, body) = req.into_parts();

    parts.uri = match Uri::builder()
        .scheme("http")
        .authority(route.module.as_str())
        .path_and_query(route.upstream_path.as_str())
        .build()
    {
        Ok(uri) => uri,
        Err(e) => {
            tracing::error!(module = %route.module, error = %e, "upstream uri rebuild failed");
            metrics::record_proxy_request(&route.module, 502, start);
            return (StatusCode::BAD_GATEWAY, "bad upstream path").into_response();
        }
    };

    match agent.request(Request::from_parts(parts, body)).await {
        Ok(resp) => {
            metrics::record_proxy_request(&route.module, resp.status().as_u16(), start);
            let (parts, body) = resp.into_parts();
            Response::from_parts(parts, Body::new(body))
        }
        Err(e) => {
            tracing::error!(module = %route.module, error = %e, "forwarding to module failed");
            // The pooled client may hold connections to a dead socket.
            state.agents.invalidate(&route.module);
            metrics::record_proxy_request(&route.module, 502, start);
            (StatusCode::BAD_GATEWAY, "module unreachable").into_response()
        }
    }
}

/// Redirect plain HTTP to HTTPS when configured, except when the request
/// already arrived via an HTTPS-originated referrer (loop avoidance).
fn https_redirect(
    state: &ProxyState,
    snapshot: &crate::config::ConfigSnapshot,
    req: &Request<Body>,
) -> Option<Response> {
    if state.via_https
        || !state.https_available
        || snapshot.get_bool("core.redirect_https") != Some(true)
    {
        return None;
    }
    let referred_from_https = req
        .headers()
        .get(header::REFERER)
        .and_then(|v| v.to_str().ok())
        .map(|r| r.starts_with("https://"))
        .unwrap_or(false);
    if referred_from_https {
        return None;
    }

    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h))?;
    let https_port = snapshot.get_u16("core.https_port").unwrap_or(8443);
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    // The Host header already carries the mode-appropriate name (the
    // subdomain label in subdomain mode), so the target keeps it.
    let target = if https_port == 443 {
        format!("https://{host}{path}")
    } else {
        format!("https://{host}:{https_port}{path}")
    };
    Some(Redirect::permanent(&target).into_response())
}

/// Apply `X-Forwarded-*` semantics before handing the request upstream.
fn forwarded_headers(
    headers: &mut axum::http::HeaderMap,
    peer: SocketAddr,
    via_https: bool,
    original_host: Option<&str>,
) {
    let peer_ip = peer.ip().to_string();
    let forwarded_for = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{prior}, {peer_ip}"),
        None => peer_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert("x-forwarded-for", value);
    }
    headers.insert(
        "x-forwarded-proto",
        HeaderValue::from_static(if via_https { "https" } else { "http" }),
    );
    if let Some(host) = original_host {
        if let Ok(value) = HeaderValue::from_str(host) {
            headers.insert("x-forwarded-host", value);
        }
    }
}
