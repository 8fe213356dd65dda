//! Module registration.
//!
//! Modules are declared explicitly at startup (CLI or embedding code)
//! rather than discovered by scanning the filesystem for entry files.
//! A descriptor is immutable for the process lifetime; the set of
//! descriptors is the supervisor's source of truth for what may run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A worker's identity and its entry-point location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    pub name: String,
    pub path: PathBuf,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self { name: name.into(), path: path.into() }
    }

    /// Parse a `NAME=PATH` CLI argument.
    pub fn parse(spec: &str) -> Result<Self, String> {
        match spec.split_once('=') {
            Some((name, path)) if !name.is_empty() && !path.is_empty() => {
                Ok(Self::new(name, path))
            }
            _ => Err(format!("expected NAME=PATH, got '{spec}'")),
        }
    }
}

/// The fixed set of registered modules, ordered by name.
#[derive(Debug, Clone, Default)]
pub struct ModuleSet {
    modules: BTreeMap<String, ModuleDescriptor>,
}

impl ModuleSet {
    pub fn new(descriptors: impl IntoIterator<Item = ModuleDescriptor>) -> Self {
        let mut modules = BTreeMap::new();
        for desc in descriptors {
            if let Some(prev) = modules.insert(desc.name.clone(), desc) {
                tracing::warn!(module = %prev.name, "duplicate module registration, later wins");
            }
        }
        Self { modules }
    }

    pub fn get(&self, name: &str) -> Option<&ModuleDescriptor> {
        self.modules.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleDescriptor> {
        self.modules.values()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn entry_path(&self, name: &str) -> Option<&Path> {
        self.modules.get(name).map(|d| d.path.as_path())
    }
}
