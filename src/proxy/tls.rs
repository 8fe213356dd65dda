//! TLS certificate loading and rotation.
//!
//! Certificates come from the `core.cert_file` / `core.key_file` config
//! keys. When no valid pair is available the HTTPS listener is simply not
//! started. A background task reloads the pair on a fixed interval and
//! swaps it into the live TLS context without dropping connections; a
//! failed reload keeps serving the last-known-good material.

use std::path::PathBuf;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;

use crate::config::ConfigSnapshot;

/// Reference rotation interval: daily.
pub const RELOAD_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl TlsSettings {
    /// Read the configured pair, if both paths are present.
    pub fn from_snapshot(snapshot: &ConfigSnapshot) -> Option<Self> {
        let cert = snapshot.get_str("core.cert_file")?;
        let key = snapshot.get_str("core.key_file")?;
        Some(Self {
            cert_path: PathBuf::from(cert),
            key_path: PathBuf::from(key),
        })
    }

    /// Parse-check the pair without touching the live context.
    fn validate(&self) -> Result<(), String> {
        let cert_bytes = std::fs::read(&self.cert_path)
            .map_err(|e| format!("read {}: {e}", self.cert_path.display()))?;
        let certs: Vec<_> = rustls_pemfile::certs(&mut cert_bytes.as_slice())
            .collect::<Result<_, _>>()
            .map_err(|e| format!("parse {}: {e}", self.cert_path.display()))?;
        if certs.is_empty() {
            return Err(format!("no certificates in {}", self.cert_path.display()));
        }

        let key_bytes = std::fs::read(&self.key_path)
            .map_err(|e| format!("read {}: {e}", self.key_path.display()))?;
        rustls_pemfile::private_key(&mut key_bytes.as_slice())
            .map_err(|e| format!("parse {}: {e}", self.key_path.display()))?
            .ok_or_else(|| format!("no private key in {}", self.key_path.display()))?;
        Ok(())
    }
}

/// Load the initial TLS context. `None` (with a warning) when the pair is
/// missing or unreadable; the caller then skips the HTTPS listener.
pub async fn load(settings: &TlsSettings) -> Option<RustlsConfig> {
    if let Err(e) = settings.validate() {
        tracing::warn!(error = %e, "certificate pair unusable, HTTPS listener disabled");
        return None;
    }
    match RustlsConfig::from_pem_file(&settings.cert_path, &settings.key_path).await {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!(error = %e, "failed to build TLS context, HTTPS listener disabled");
            None
        }
    }
}

/// Periodically reload certificate material into the live context.
pub fn spawn_reload(config: RustlsConfig, settings: TlsSettings, interval: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = settings.validate() {
                tracing::warn!(error = %e, "certificate reload skipped, serving last-known-good");
                continue;
            }
            match config
                .reload_from_pem_file(&settings.cert_path, &settings.key_path)
                .await
            {
                Ok(()) => tracing::info!(
                    cert = %settings.cert_path.display(),
                    "certificate material reloaded"
                ),
                Err(e) => {
                    tracing::warn!(error = %e, "certificate reload failed, serving last-known-good");
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::snapshot::ConfigSnapshot;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn settings_need_both_paths() {
        let mut values = BTreeMap::new();
        values.insert("core.cert_file".into(), json!("/tls/cert.pem"));
        let snap = ConfigSnapshot::new(1, values.clone());
        assert!(TlsSettings::from_snapshot(&snap).is_none());

        values.insert("core.key_file".into(), json!("/tls/key.pem"));
        let snap = ConfigSnapshot::new(1, values);
        let settings = TlsSettings::from_snapshot(&snap).unwrap();
        assert_eq!(settings.cert_path, PathBuf::from("/tls/cert.pem"));
    }

    #[test]
    fn missing_files_fail_validation() {
        let settings = TlsSettings {
            cert_path: "/nonexistent/cert.pem".into(),
            key_path: "/nonexistent/key.pem".into(),
        };
        assert!(settings.validate().is_err());
    }
}
