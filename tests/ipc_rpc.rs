//! Control-channel integration: registration, RPC in both directions,
//! event fan-out, and the readiness handshake.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use orchd::error::IpcError;
use orchd::ipc::WorkerEndpoint;

#[tokio::test]
async fn rpc_round_trip_both_directions() {
    let m = common::master().await;
    let worker = WorkerEndpoint::connect(&m.ctx, "media").await.unwrap();
    common::wait_until("worker registration", || m.hub.is_connected("media")).await;

    worker.respond("echo", |args| async move { Ok(args) });
    let reply = m
        .hub
        .request("media", "echo", json!({"n": 7}), Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(reply, json!({"n": 7}));

    m.hub.respond("sum", |args| async move {
        let a = args["a"].as_i64().unwrap_or(0);
        let b = args["b"].as_i64().unwrap_or(0);
        Ok(json!(a + b))
    });
    let reply = worker
        .request("sum", json!({"a": 2, "b": 3}), Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(reply, json!(5));
}

#[tokio::test]
async fn unknown_peer_and_method_surface_as_errors() {
    let m = common::master().await;
    let worker = WorkerEndpoint::connect(&m.ctx, "fs").await.unwrap();
    common::wait_until("worker registration", || m.hub.is_connected("fs")).await;

    let err = m
        .hub
        .request("nobody", "anything", Value::Null, Some(Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, IpcError::UnknownPeer(_)), "{err}");

    let err = m
        .hub
        .request("fs", "no.such.method", Value::Null, Some(Duration::from_secs(2)))
        .await
        .unwrap_err();
    assert!(matches!(err, IpcError::Remote(_)), "{err}");

    drop(worker);
}

#[tokio::test]
async fn request_timeout_leaves_handler_running() {
    let m = common::master().await;
    let worker = WorkerEndpoint::connect(&m.ctx, "media").await.unwrap();
    common::wait_until("worker registration", || m.hub.is_connected("media")).await;

    let invoked = Arc::new(AtomicUsize::new(0));
    let hits = invoked.clone();
    worker.respond("slow", move |_args| {
        let hits = hits.clone();
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        }
    });

    let started = Instant::now();
    let err = m
        .hub
        .request("media", "slow", Value::Null, Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, IpcError::Timeout(_)), "{err}");
    assert!(started.elapsed() < Duration::from_secs(2));

    // The timeout cancelled our wait, not the remote handler.
    common::wait_until("handler invoked", || invoked.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn disconnect_fails_in_flight_requests() {
    let m = common::master().await;
    let worker = WorkerEndpoint::connect(&m.ctx, "media").await.unwrap();
    common::wait_until("worker registration", || m.hub.is_connected("media")).await;

    worker.respond("hang", |_args| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Value::Null)
    });

    let hub = m.hub.clone();
    let pending =
        tokio::spawn(async move { hub.request("media", "hang", Value::Null, None).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    worker.close();
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, IpcError::ConnectionClosed), "{err}");
    common::wait_until("peer deregistered", || !m.hub.is_connected("media")).await;
}

#[tokio::test]
async fn events_fan_out_to_master_and_other_workers() {
    let m = common::master().await;
    let a = WorkerEndpoint::connect(&m.ctx, "media").await.unwrap();
    let b = WorkerEndpoint::connect(&m.ctx, "fs").await.unwrap();
    common::wait_until("both registered", || {
        m.hub.is_connected("media") && m.hub.is_connected("fs")
    })
    .await;

    let master_hits = Arc::new(AtomicUsize::new(0));
    let worker_hits = Arc::new(AtomicUsize::new(0));
    {
        let hits = master_hits.clone();
        m.hub.on("media.scan", move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let hits = worker_hits.clone();
        b.on("media.scan", move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        });
    }

    a.emit("media.scan", json!({"dir": "/srv"}));
    common::wait_until("master listener", || master_hits.load(Ordering::SeqCst) == 1).await;
    common::wait_until("other worker listener", || {
        worker_hits.load(Ordering::SeqCst) == 1
    })
    .await;

    // Targeted delivery reaches only the named peer.
    let targeted = Arc::new(AtomicUsize::new(0));
    {
        let hits = targeted.clone();
        b.on("ping", move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        });
    }
    a.emit_to("fs", "ping", json!(1));
    common::wait_until("targeted event", || targeted.load(Ordering::SeqCst) == 1).await;
    assert_eq!(master_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn readiness_handshake_unblocks_waiters_and_clears_on_disconnect() {
    let m = common::master().await;
    assert!(!m.hub.is_ready("media"));

    let worker = WorkerEndpoint::connect(&m.ctx, "media").await.unwrap();
    common::wait_until("worker registration", || m.hub.is_connected("media")).await;

    let hub = m.hub.clone();
    let waiter = tokio::spawn(async move { hub.wait_for_process("media").await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    worker.announce_ready();
    assert!(waiter.await.unwrap());
    common::wait_until("ready flag", || m.hub.is_ready("media")).await;

    worker.close();
    common::wait_until("readiness cleared", || !m.hub.is_ready("media")).await;
}
