//! Request-to-module resolution.
//!
//! Two exclusive routing modes, selected by configuration: path-based
//! (first URL path segment names the module and is stripped before
//! forwarding) and subdomain-based (first Host label names the module,
//! path untouched). `Off` disables the router entirely; modules then bind
//! their own public ports.

use crate::config::ConfigSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMode {
    Path,
    Subdomain,
    Off,
}

impl RouteMode {
    /// Read the active mode from `core.proxy_mode`.
    pub fn from_snapshot(snapshot: &ConfigSnapshot) -> Self {
        match snapshot.get_str("core.proxy_mode") {
            Some("path") => RouteMode::Path,
            Some("subdomain") => RouteMode::Subdomain,
            Some("off") | None => RouteMode::Off,
            Some(other) => {
                tracing::warn!(mode = other, "unknown core.proxy_mode, router disabled");
                RouteMode::Off
            }
        }
    }
}

/// A resolved route: the owning module and the path+query to forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteResolution {
    pub module: String,
    pub upstream_path: String,
}

/// Resolve a request by the active mode. `path_and_query` must begin with
/// `/`; `host` is the Host header without port.
pub fn resolve(mode: RouteMode, path_and_query: &str, host: Option<&str>) -> Option<RouteResolution> {
    match mode {
        RouteMode::Off => None,
        RouteMode::Path => {
            let rest = path_and_query.strip_prefix('/')?;
            let (module, upstream) = match rest.find(['/', '?']) {
                Some(idx) if rest.as_bytes()[idx] == b'/' => {
                    (&rest[..idx], rest[idx..].to_string())
                }
                Some(idx) => (&rest[..idx], format!("/{}", &rest[idx..])),
                None => (rest, "/".to_string()),
            };
            if module.is_empty() {
                return None;
            }
            Some(RouteResolution {
                module: module.to_string(),
                upstream_path: if upstream.is_empty() { "/".into() } else { upstream },
            })
        }
        RouteMode::Subdomain => {
            let host = host?;
            let (label, rest) = host.split_once('.')?;
            if label.is_empty() || rest.is_empty() {
                return None;
            }
            Some(RouteResolution {
                module: label.to_string(),
                upstream_path: path_and_query.to_string(),
            })
        }
    }
}

/// Externally-reachable URLs for one module, for `/modules.json`.
pub fn module_urls(mode: RouteMode, module: &str, host: &str, https: bool, port: u16) -> Vec<String> {
    let scheme = if https { "https" } else { "http" };
    let default_port = if https { 443 } else { 80 };
    let authority = |h: &str| {
        if port == default_port {
            h.to_string()
        } else {
            format!("{h}:{port}")
        }
    };
    match mode {
        RouteMode::Path => vec![format!("{scheme}://{}/{}/", authority(host), module)],
        RouteMode::Subdomain => vec![format!("{scheme}://{}/", authority(&format!("{module}.{host}")))],
        RouteMode::Off => Vec::new(),
    }
}
