//! Process-wide named roots the bridges may reach.

use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::bridge::value::HostValue;

static GLOBAL: Lazy<Arc<Registry>> = Lazy::new(|| Arc::new(Registry::new()));

#[derive(Default)]
pub struct Registry {
    roots: RwLock<BTreeMap<String, HostValue>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by everything in this process.
    pub fn global() -> Arc<Registry> {
        Arc::clone(&GLOBAL)
    }

    /// Install `value` under `name` unless the name is taken. Returns whether it was installed.
    pub fn install(&self, name: &str, value: HostValue) -> bool {
        let mut roots = self.roots.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if roots.contains_key(name) {
            log::debug!("global {name} already installed");
            return false;
        }
        roots.insert(name.to_string(), value);
        true
    }

    pub fn get(&self, name: &str) -> Option<HostValue> {
        self.roots
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.roots
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(name)
    }

    pub fn keys(&self) -> Vec<String> {
        self.roots
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Every installed global as one object.
    pub fn snapshot(&self) -> HostValue {
        let roots = self.roots.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        HostValue::object(roots.iter().map(|(k, v)| (k.clone(), v.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_install_once() {
        let reg = Registry::new();
        assert!(reg.install("ST_API", HostValue::Data(json!(1))));
        assert!(!reg.install("ST_API", HostValue::Data(json!(2))));
        assert!(matches!(reg.get("ST_API"), Some(HostValue::Data(ref v)) if v == &json!(1)));
        assert!(reg.contains("ST_API"));
        assert!(!reg.contains("Higanbana"));
    }

    #[test]
    fn test_keys_and_snapshot() {
        let reg = Registry::new();
        reg.install("b", HostValue::Data(json!(null)));
        reg.install("a", HostValue::Data(json!(true)));
        assert_eq!(reg.keys(), vec!["a", "b"]);
        let snap = reg.snapshot();
        assert!(snap.child("a").is_some());
        assert!(snap.child("c").is_none());
    }

    #[test]
    fn test_global_is_shared() {
        assert!(Arc::ptr_eq(&Registry::global(), &Registry::global()));
    }
}
