//! Shared application context.
//!
//! Every component (hub, supervisor, router, config service) receives an
//! `Arc<AppContext>` at construction instead of reaching for process-wide
//! globals. The context is immutable for the process lifetime.

use std::env;
use std::path::PathBuf;

/// Environment variable naming the appspace (socket/pipe namespace).
pub const ENV_APPSPACE: &str = "ORCHD_APPSPACE";
/// Portable mode: keep runtime state next to the working directory.
pub const ENV_PORTABLE: &str = "ORCHD_PORTABLE";
/// Debug mode: workers are spawned with their inspect flags.
pub const ENV_DEBUG: &str = "ORCHD_DEBUG";
/// Whether request authentication is enabled for proxied modules.
pub const ENV_AUTH: &str = "ORCHD_AUTH";
/// Explicit config file path, equivalent to one `--config` occurrence.
pub const ENV_CONFIG: &str = "ORCHD_CONFIG";
/// CLI arguments serialized for spawned children, which cannot inherit the
/// parent's parsed command line.
pub const ENV_ARGS: &str = "ORCHD_ARGS";

const DEFAULT_APPSPACE: &str = "orchd";

/// Immutable per-process context handle.
#[derive(Debug, Clone)]
pub struct AppContext {
    /// Namespace prefix scoping socket names to one application instance.
    pub appspace: String,
    /// Portable mode keeps sockets and state under the working directory.
    pub portable: bool,
    /// Debug mode enables inspect-flag pass-through on spawned workers.
    pub debug: bool,
    /// Whether request authentication is enabled. The master does not
    /// enforce it itself; the flag is forwarded to spawned workers in
    /// their environment so each module can gate its own endpoints.
    pub auth_enabled: bool,
    /// Directory under which this instance's sockets are created.
    pub socket_dir: PathBuf,
    /// Search path for `%res%` placeholder resolution in config values.
    pub resource_dirs: Vec<PathBuf>,
}

impl AppContext {
    /// Build a context from the process environment.
    pub fn from_env() -> Self {
        let appspace = env::var(ENV_APPSPACE)
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_APPSPACE.to_string());
        let portable = flag(ENV_PORTABLE);

        let socket_dir = if portable {
            env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        } else {
            env::temp_dir()
        };

        let mut resource_dirs = Vec::new();
        if let Ok(cwd) = env::current_dir() {
            resource_dirs.push(cwd.join("resources"));
            resource_dirs.push(cwd);
        }

        Self {
            appspace,
            portable,
            debug: flag(ENV_DEBUG),
            auth_enabled: flag(ENV_AUTH),
            socket_dir,
            resource_dirs,
        }
    }

    /// Explicit config path from the environment, if any.
    pub fn env_config_path() -> Option<PathBuf> {
        env::var(ENV_CONFIG).ok().filter(|s| !s.is_empty()).map(PathBuf::from)
    }

    /// The serialized CLI argument string handed to spawned children.
    pub fn child_args() -> Vec<String> {
        env::var(ENV_ARGS)
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

fn flag(name: &str) -> bool {
    matches!(
        env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("yes") | Ok("on")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_parsing() {
        env::set_var("ORCHD_TEST_FLAG", "true");
        assert!(flag("ORCHD_TEST_FLAG"));
        env::set_var("ORCHD_TEST_FLAG", "0");
        assert!(!flag("ORCHD_TEST_FLAG"));
        env::remove_var("ORCHD_TEST_FLAG");
        assert!(!flag("ORCHD_TEST_FLAG"));
    }
}
