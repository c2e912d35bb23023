// Copyright 2022 Alibaba Cloud. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Process-wide registry of mounted RAFS instances.
//!
//! The registry is the single place that knows which snapshot is served by
//! which daemon. It holds daemon ids, not daemon objects; the supervisor
//! remains the only owner of daemon state. Memory-only: a restart rebuilds
//! it from the supervisor's recovery pass.

use std::collections::HashMap;
use std::sync::RwLock;

use snapshotter_api::error::{Error, Result};
use snapshotter_api::types::RafsInstance;

#[derive(Default)]
pub struct RafsInstanceRegistry {
    inner: RwLock<HashMap<String, RafsInstance>>,
}

impl RafsInstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance; at most one may exist per snapshot id.
    pub fn add(&self, instance: RafsInstance) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.contains_key(&instance.snapshot_id) {
            return Err(Error::already_exists(format!(
                "rafs instance {}",
                instance.snapshot_id
            )));
        }
        inner.insert(instance.snapshot_id.clone(), instance);
        Ok(())
    }

    pub fn get(&self, snapshot_id: &str) -> Option<RafsInstance> {
        self.inner.read().unwrap().get(snapshot_id).cloned()
    }

    pub fn remove(&self, snapshot_id: &str) -> Option<RafsInstance> {
        self.inner.write().unwrap().remove(snapshot_id)
    }

    pub fn list(&self) -> Vec<RafsInstance> {
        self.inner.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str) -> RafsInstance {
        RafsInstance {
            snapshot_id: id.to_string(),
            daemon_id: "d1".to_string(),
            snapshot_dir: format!("/r/snapshots/{}", id).into(),
            mountpoint: format!("/r/mnt/{}", id).into(),
            config_path: "/r/config/d1.json".into(),
        }
    }

    #[test]
    fn test_single_instance_per_snapshot() {
        let registry = RafsInstanceRegistry::new();
        registry.add(instance("7")).unwrap();
        let err = registry.add(instance("7")).unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_exactly_once() {
        let registry = RafsInstanceRegistry::new();
        registry.add(instance("7")).unwrap();
        assert!(registry.remove("7").is_some());
        assert!(registry.remove("7").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_list() {
        let registry = RafsInstanceRegistry::new();
        registry.add(instance("1")).unwrap();
        registry.add(instance("2")).unwrap();
        assert_eq!(registry.list().len(), 2);
        assert_eq!(registry.get("2").unwrap().daemon_id, "d1");
    }
}
