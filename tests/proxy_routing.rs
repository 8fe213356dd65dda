//! End-to-end proxy routing over a real listener: path and subdomain
//! resolution, readiness gating, and the built-in responses.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use orchd::ipc::WorkerEndpoint;
use orchd::lifecycle::Shutdown;
use orchd::modules::{ModuleDescriptor, ModuleSet};
use orchd::proxy::ProxyServer;
use orchd::supervisor::Supervisor;

async fn start_proxy(m: &common::TestMaster, modules: ModuleSet) -> (SocketAddr, Arc<Shutdown>) {
    let backend = common::MockBackend::new();
    let sup = Supervisor::new(
        m.ctx.clone(),
        modules,
        m.hub.clone(),
        m.config.clone(),
        backend,
    );
    let server = ProxyServer::new(m.ctx.clone(), m.hub.clone(), sup, m.config.clone());

    let shutdown = Arc::new(Shutdown::new());
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            server.run(&shutdown).await.unwrap();
        });
    }

    let port = m.config.current().get_u16("core.http_port").unwrap();
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    common::wait_for_listener(addr).await;
    (addr, shutdown)
}

#[tokio::test]
async fn path_mode_routes_and_gates_on_readiness() {
    let m = common::master_with_overrides(vec![("core.http_port".into(), json!(28311))]).await;
    let modules = ModuleSet::new([ModuleDescriptor::new("media", "/opt/mods/media")]);
    let (addr, shutdown) = start_proxy(&m, modules).await;

    // Unresolvable module name.
    let (status, _) = common::http_get(addr, "/nosuch/x", "localhost").await;
    assert_eq!(status, 502);

    // Known module, readiness handshake not yet seen.
    let (status, _) = common::http_get(addr, "/media/api", "localhost").await;
    assert_eq!(status, 503);

    let worker = WorkerEndpoint::connect(&m.ctx, "media").await.unwrap();
    common::wait_until("worker registration", || m.hub.is_connected("media")).await;
    worker.announce_ready();
    common::wait_until("readiness", || m.hub.is_ready("media")).await;

    // Ready but the private socket is not serving yet: the forward fails,
    // the cached agent is dropped, and later requests recover cleanly.
    let (status, _) = common::http_get(addr, "/media/api", "localhost").await;
    assert_eq!(status, 502);

    // Bring the module online behind its private socket.
    common::serve_module_http(m.sockets.module_http_socket("media"));

    // First path segment selects the module and is stripped upstream.
    let (status, body) = common::http_get(addr, "/media/api/ls?target=x", "localhost").await;
    assert_eq!(status, 200);
    assert!(body.contains("GET /api/ls?target=x"), "{body}");

    // Bare module path forwards as the root.
    let (status, body) = common::http_get(addr, "/media", "localhost").await;
    assert_eq!(status, 200);
    assert!(body.contains("GET / "), "{body}");

    shutdown.trigger();
}

#[tokio::test]
async fn subdomain_mode_routes_by_host_label() {
    let m = common::master_with_overrides(vec![
        ("core.http_port".into(), json!(28312)),
        ("core.proxy_mode".into(), json!("subdomain")),
    ])
    .await;
    let modules = ModuleSet::new([ModuleDescriptor::new("media", "/opt/mods/media")]);
    let (addr, shutdown) = start_proxy(&m, modules).await;

    common::serve_module_http(m.sockets.module_http_socket("media"));
    let worker = WorkerEndpoint::connect(&m.ctx, "media").await.unwrap();
    common::wait_until("worker registration", || m.hub.is_connected("media")).await;
    worker.announce_ready();
    common::wait_until("readiness", || m.hub.is_ready("media")).await;

    // The first host label owns the request; the path passes unchanged.
    let (status, body) = common::http_get(addr, "/api/ls", "media.example.com").await;
    assert_eq!(status, 200);
    assert!(body.contains("GET /api/ls"), "{body}");

    // A bare host has no module label to route on.
    let (status, _) = common::http_get(addr, "/api/ls", "localhost").await;
    assert_eq!(status, 502);

    shutdown.trigger();
}

#[tokio::test]
async fn websocket_upgrade_tunnels_bytes_and_forwarded_headers() {
    let m = common::master_with_overrides(vec![("core.http_port".into(), json!(28314))]).await;
    let modules = ModuleSet::new([ModuleDescriptor::new("media", "/opt/mods/media")]);
    let (addr, shutdown) = start_proxy(&m, modules).await;

    common::serve_module_upgrade(m.sockets.module_http_socket("media"));
    let worker = WorkerEndpoint::connect(&m.ctx, "media").await.unwrap();
    common::wait_until("worker registration", || m.hub.is_connected("media")).await;
    worker.announce_ready();
    common::wait_until("readiness", || m.hub.is_ready("media")).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let req = "GET /media/ws HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n";
    stream.write_all(req.as_bytes()).await.unwrap();

    // Handshake response, then the upstream's banner carrying the
    // X-Forwarded-For value it saw during the handshake.
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed during handshake");
        buf.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&buf);
        if let Some(idx) = text.find("\r\n\r\n") {
            if text[idx + 4..].contains('\n') {
                break;
            }
        }
    }
    let text = String::from_utf8_lossy(&buf).to_string();
    assert!(text.starts_with("HTTP/1.1 101"), "{text}");
    let banner = text.split("\r\n\r\n").nth(1).unwrap().lines().next().unwrap();
    assert!(banner.starts_with("xff:"), "{banner}");
    assert!(banner.contains("127.0.0.1"), "{banner}");

    // Bytes flow in both directions over the raw tunnel.
    stream.write_all(b"ping-1").await.unwrap();
    let mut echo = [0u8; 6];
    stream.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo, b"ping-1");

    shutdown.trigger();
}

#[tokio::test]
async fn built_in_responses_are_served() {
    let m = common::master_with_overrides(vec![
        ("core.http_port".into(), json!(28313)),
        ("core.host".into(), json!("box.lan")),
    ])
    .await;
    let modules = ModuleSet::new([
        ModuleDescriptor::new("media", "/opt/mods/media"),
        ModuleDescriptor::new("filemanager", "/opt/mods/filemanager"),
    ]);
    let (addr, shutdown) = start_proxy(&m, modules).await;

    let (status, body) = common::http_get(addr, "/modules.json", "localhost").await;
    assert_eq!(status, 200);
    assert!(body.contains("filemanager"), "{body}");
    assert!(body.contains("http://box.lan:28313/media"), "{body}");

    let (status, _) = common::http_get(addr, "/favicon.ico", "localhost").await;
    assert_eq!(status, 200);

    shutdown.trigger();
}
