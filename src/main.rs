//! orchd master process.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌──────────────────────── master ────────────────────────┐
//!  public traffic │  ┌───────────┐   ┌────────────┐   ┌─────────────────┐  │
//!  ───────────────┼─▶│   proxy   │──▶│ readiness  │──▶│ module socket   │──┼─▶ worker
//!                 │  │  router   │   │   gate     │   │ forwarding      │  │
//!                 │  └───────────┘   └────────────┘   └─────────────────┘  │
//!                 │  ┌───────────┐   ┌────────────┐   ┌─────────────────┐  │
//!   control       │  │  ipc hub  │◀─▶│ supervisor │──▶│ process backend │──┼─▶ spawn/kill
//!   channel  ◀────┼─▶│ (rpc+bus) │   │ (registry) │   │ native/external │  │
//!                 │  └───────────┘   └────────────┘   └─────────────────┘  │
//!                 │  ┌──────────────────────────────────────────────────┐  │
//!                 │  │ config service: defaults + files + overrides →   │  │
//!                 │  │ one snapshot, pushed whole on every reload       │  │
//!                 │  └──────────────────────────────────────────────────┘  │
//!                 └──────────────────────────────────────────────────────--┘
//! ```
//!
//! Startup order: context → control socket → config → supervisor →
//! workers → proxy listeners. Shutdown on SIGINT/SIGTERM stops workers in
//! reverse order, closes the hub, removes socket files, and exits 0.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use orchd::config::loader::parse_override;
use orchd::config::{ConfigService, ConfigSources};
use orchd::context::AppContext;
use orchd::ipc::{IpcHub, SocketRegistry};
use orchd::lifecycle::{signals, Shutdown};
use orchd::modules::{ModuleDescriptor, ModuleSet};
use orchd::proxy::{ProxyServer, RouteMode};
use orchd::supervisor::{ExternalBackend, NativeBackend, ProcessBackend, Supervisor};

#[derive(Debug, Parser)]
#[command(name = "orchd", about = "Single-host module orchestrator")]
struct Cli {
    /// Module to supervise, NAME=PATH (repeatable)
    #[arg(long = "module", value_name = "NAME=PATH", value_parser = ModuleDescriptor::parse)]
    modules: Vec<ModuleDescriptor>,

    /// Extra config file path (repeatable, applied after discovered files)
    #[arg(long = "config", value_name = "PATH")]
    configs: Vec<PathBuf>,

    /// Inline config override, KEY=VALUE (repeatable, applied last)
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_override)]
    overrides: Vec<(String, Value)>,

    /// Delegate process supervision to the external service at this socket
    #[arg(long = "external-supervisor", value_name = "SOCKET")]
    external_supervisor: Option<PathBuf>,

    /// Worker entry script; when present this process execs it instead of
    /// running as the master
    script: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "orchd=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    if let Some(script) = cli.script {
        return run_worker_entry(script);
    }

    tracing::info!("orchd v0.1.0 starting");
    let ctx = Arc::new(AppContext::from_env());

    let mut explicit_paths = Vec::new();
    if let Some(path) = AppContext::env_config_path() {
        explicit_paths.push(path);
    }
    explicit_paths.extend(cli.configs);
    let sources = ConfigSources {
        discovery_dir: std::env::current_dir()?,
        explicit_paths,
        overrides: cli.overrides,
    };

    let sockets = Arc::new(SocketRegistry::new(&ctx));
    // Fatal when the control socket cannot be bound.
    let hub = IpcHub::bind(&ctx, sockets.clone()).await?;

    let config = ConfigService::new(ctx.clone(), sources, hub.clone());
    let _watch = match config.watch() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "config hot-reload unavailable");
            None
        }
    };

    let snapshot = config.current();
    tracing::info!(
        appspace = %ctx.appspace,
        http_port = snapshot.get_u16("core.http_port").unwrap_or(8120),
        proxy_mode = snapshot.get_str("core.proxy_mode").unwrap_or("off"),
        modules = cli.modules.len(),
        "configuration loaded"
    );

    if let Some(addr) = snapshot.get_str("core.metrics_address") {
        match addr.parse() {
            Ok(addr) => orchd::observability::metrics::init_metrics(addr),
            Err(e) => tracing::error!(addr, error = %e, "invalid metrics address"),
        }
    }

    let backend: Arc<dyn ProcessBackend> = match cli.external_supervisor {
        Some(socket) => Arc::new(ExternalBackend::connect(socket, ctx.appspace.clone()).await?),
        None => Arc::new(NativeBackend),
    };

    let module_set = ModuleSet::new(cli.modules);
    let supervisor = Supervisor::new(
        ctx.clone(),
        module_set.clone(),
        hub.clone(),
        config.clone(),
        backend,
    );

    let start_order: Vec<String> = module_set.names().map(str::to_string).collect();
    for name in &start_order {
        if let Err(e) = supervisor.start(name).await {
            tracing::error!(module = %name, error = %e, "module failed to start");
        }
    }

    let shutdown = Arc::new(Shutdown::new());
    let mode = RouteMode::from_snapshot(&config.current());
    let proxy_handle = if mode != RouteMode::Off {
        let server = ProxyServer::new(ctx.clone(), hub.clone(), supervisor.clone(), config.clone());
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move { server.run(&shutdown).await }))
    } else {
        tracing::info!("proxy routing off, modules bind their own ports");
        None
    };

    // Run until a signal arrives or the proxy dies of a fatal bind error.
    let fatal = match proxy_handle {
        Some(mut handle) => tokio::select! {
            _ = signals::wait_for_shutdown_signal() => {
                shutdown.trigger();
                None
            }
            joined = &mut handle => match joined {
                Ok(Err(e)) => Some(e),
                _ => None,
            },
        },
        None => {
            signals::wait_for_shutdown_signal().await;
            None
        }
    };

    supervisor.stop_all().await;
    hub.close();
    sockets.cleanup();

    if let Some(e) = fatal {
        tracing::error!(error = %e, "proxy listener failed fatally");
        return Err(Box::new(e));
    }
    tracing::info!("shutdown complete");
    Ok(())
}

/// Entry-point pass-through: a forked worker cannot inherit the parent's
/// parsed CLI, so it is re-invoked with its entry script as a positional
/// argument and exec'd here.
fn run_worker_entry(script: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let args = AppContext::child_args();
    tracing::info!(entry = %script.display(), "running as worker entry");
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        let err = std::process::Command::new(&script).args(&args).exec();
        Err(Box::new(err))
    }
    #[cfg(not(unix))]
    {
        let status = std::process::Command::new(&script).args(&args).status()?;
        std::process::exit(status.code().unwrap_or(1));
    }
}
