//! Configuration loading and merging.
//!
//! Load order, later wins per key with whole-value replacement:
//! built-in defaults → discovered `config.*` files in stable name order →
//! explicitly supplied config paths → inline overrides. Nested tables are
//! flattened to dotted keys; there is no deep merge. A missing or
//! unreadable source is warned about and skipped.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};

use crate::config::snapshot::ConfigSnapshot;
use crate::context::AppContext;
use crate::error::ConfigError;

/// Marker in string values resolved against the resource search path.
pub const RESOURCE_PLACEHOLDER: &str = "%res%";

/// Everything that feeds one snapshot build.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Directory scanned for `config.*` files (usually the working dir).
    pub discovery_dir: PathBuf,
    /// Explicitly supplied config file paths, applied after discovery.
    pub explicit_paths: Vec<PathBuf>,
    /// Inline `key=value` overrides, applied last.
    pub overrides: Vec<(String, Value)>,
}

/// Built-in defaults, the lowest-priority source.
pub fn defaults() -> BTreeMap<String, Value> {
    let mut map = BTreeMap::new();
    map.insert("core.http_port".into(), json!(8120));
    map.insert("core.https_port".into(), json!(8443));
    map.insert("core.proxy_mode".into(), json!("path"));
    map.insert("core.redirect_https".into(), json!(false));
    map.insert("core.host".into(), json!("localhost"));
    map.insert("core.cert_file".into(), Value::Null);
    map.insert("core.key_file".into(), Value::Null);
    map.insert("core.metrics_address".into(), Value::Null);
    map.insert("core.start_timeout_secs".into(), json!(30));
    map.insert("core.request_timeout_secs".into(), json!(30));
    map
}

/// Build one merged snapshot from all sources.
pub fn build_snapshot(
    ctx: &AppContext,
    sources: &ConfigSources,
    generation: u64,
) -> ConfigSnapshot {
    let mut values = defaults();

    for path in discover(&sources.discovery_dir) {
        apply_file(&mut values, &path);
    }
    for path in &sources.explicit_paths {
        apply_file(&mut values, path);
    }
    for (key, value) in &sources.overrides {
        values.insert(key.clone(), value.clone());
    }

    for value in values.values_mut() {
        resolve_resources(value, &ctx.resource_dirs);
    }

    ConfigSnapshot::new(generation, values)
}

/// Discover `config.*` files in the given directory, in stable name order.
pub fn discover(dir: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.file_stem().and_then(|s| s.to_str()) == Some("config"))
            .collect(),
        Err(_) => Vec::new(),
    };
    found.sort();
    found
}

fn apply_file(values: &mut BTreeMap<String, Value>, path: &Path) {
    match load_file(path) {
        Ok(loaded) => {
            tracing::info!(path = %path.display(), keys = loaded.len(), "config source applied");
            values.extend(loaded);
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "skipping config source");
        }
    }
}

/// Parse one config file into flat dotted keys.
pub fn load_file(path: &Path) -> Result<BTreeMap<String, Value>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let parsed: Value = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?,
        // TOML is the default config dialect.
        _ => {
            let table: toml::Value = toml::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
            serde_json::to_value(table).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        }
    };

    let mut flat = BTreeMap::new();
    flatten("", &parsed, &mut flat);
    Ok(flat)
}

/// Flatten nested objects into dotted keys. Arrays and scalars are stored
/// whole, so a later source replaces them as one value.
fn flatten(prefix: &str, value: &Value, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                let full = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten(&full, nested, out);
            }
        }
        other => {
            if !prefix.is_empty() {
                out.insert(prefix.to_string(), other.clone());
            }
        }
    }
}

/// Resolve `%res%` markers against the resource-directory search path,
/// preferring a directory under which the resulting path exists.
fn resolve_resources(value: &mut Value, resource_dirs: &[PathBuf]) {
    let Value::String(s) = value else { return };
    if !s.contains(RESOURCE_PLACEHOLDER) || resource_dirs.is_empty() {
        return;
    }

    let mut chosen = None;
    for dir in resource_dirs {
        let candidate = s.replace(RESOURCE_PLACEHOLDER, &dir.to_string_lossy());
        if Path::new(&candidate).exists() {
            chosen = Some(candidate);
            break;
        }
    }
    let resolved = chosen
        .unwrap_or_else(|| s.replace(RESOURCE_PLACEHOLDER, &resource_dirs[0].to_string_lossy()));
    *value = Value::String(resolved);
}

/// Parse one inline `KEY=VALUE` override; the value is JSON if it parses
/// as such, a plain string otherwise.
pub fn parse_override(spec: &str) -> Result<(String, Value), String> {
    match spec.split_once('=') {
        Some((key, raw)) if !key.is_empty() => {
            let value =
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            Ok((key.to_string(), value))
        }
        _ => Err(format!("expected KEY=VALUE, got '{spec}'")),
    }
}
