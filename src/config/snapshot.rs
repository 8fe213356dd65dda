//! Immutable configuration snapshots.
//!
//! A snapshot is a flat `"<namespace>.<key>" → value` map plus the reload
//! generation that produced it. Snapshots are rebuilt whole on every
//! reload and distributed as a unit; workers replace their entire local
//! copy atomically, never merging partial updates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    generation: u64,
    values: BTreeMap<String, Value>,
}

impl ConfigSnapshot {
    pub fn new(generation: u64, values: BTreeMap<String, Value>) -> Self {
        Self { generation, values }
    }

    /// The reload generation this snapshot came from. Every key in one
    /// snapshot object is from the same generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_u64)
    }

    pub fn get_u16(&self, key: &str) -> Option<u16> {
        self.get_u64(key).and_then(|v| u16::try_from(v).ok())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Wire form for the `config.get` response and `config.update` event.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn typed_getters() {
        let mut values = BTreeMap::new();
        values.insert("core.http_port".into(), json!(8120));
        values.insert("core.proxy_mode".into(), json!("path"));
        values.insert("core.redirect_https".into(), json!(true));
        let snap = ConfigSnapshot::new(3, values);

        assert_eq!(snap.generation(), 3);
        assert_eq!(snap.get_u16("core.http_port"), Some(8120));
        assert_eq!(snap.get_str("core.proxy_mode"), Some("path"));
        assert_eq!(snap.get_bool("core.redirect_https"), Some(true));
        assert_eq!(snap.get("missing"), None);
    }

    #[test]
    fn wire_roundtrip() {
        let mut values = BTreeMap::new();
        values.insert("media.threads".into(), json!(4));
        let snap = ConfigSnapshot::new(1, values);
        let back = ConfigSnapshot::from_value(snap.to_value()).unwrap();
        assert_eq!(back, snap);
    }
}
