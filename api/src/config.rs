// Copyright 2022 Alibaba Cloud. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The configuration document an FS daemon ingests.
//!
//! The daemon treats most of it as its own business; the snapshotter only
//! fills in the per-image registry coordinates and the cache working
//! directory before handing the document over. Unknown fields from the
//! operator-provided template are preserved verbatim.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub device: DeviceConfig,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub digest_validate: bool,
    #[serde(default)]
    pub iostats_files: bool,
    /// Fields we do not interpret but must not lose.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

fn default_mode() -> String {
    "direct".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub backend: BackendConfig,
    #[serde(default)]
    pub cache: CacheSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(rename = "type")]
    pub backend_type: String,
    #[serde(rename = "config", default)]
    pub backend_config: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(rename = "type", default)]
    pub cache_type: String,
    #[serde(rename = "config", default)]
    pub cache_config: Value,
}

impl DaemonConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::internal(format!(
                "read daemon config template {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| Error::invalid_argument(format!("daemon config template: {}", e)))
    }

    /// Point a `registry` backend at the repository of `image_ref`.
    ///
    /// Other backend types are left untouched; they carry their full
    /// coordinates in the template.
    pub fn populate_image(&mut self, image_ref: &str) -> Result<()> {
        if self.device.backend.backend_type != "registry" {
            return Ok(());
        }
        let (host, repo) = split_image_ref(image_ref)?;
        let cfg = self
            .device
            .backend
            .backend_config
            .as_object_mut()
            .ok_or_else(|| Error::invalid_argument("registry backend config is not an object"))?;
        cfg.insert("host".to_string(), Value::String(host));
        cfg.insert("repo".to_string(), Value::String(repo));
        Ok(())
    }

    /// Set the blob cache working directory for cache types that use one.
    pub fn set_cache_work_dir(&mut self, dir: &str) {
        if self.device.cache.cache_type.is_empty() {
            return;
        }
        if !self.device.cache.cache_config.is_object() {
            self.device.cache.cache_config = Value::Object(Default::default());
        }
        if let Some(cfg) = self.device.cache.cache_config.as_object_mut() {
            cfg.insert("work_dir".to_string(), Value::String(dir.to_string()));
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::from)
    }

    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_json()?;
        fs::write(path.as_ref(), content).map_err(|e| {
            Error::internal(format!(
                "write daemon config {}: {}",
                path.as_ref().display(),
                e
            ))
        })
    }
}

/// Split an image reference into registry host and repository path.
///
/// `registry.test/ns/app:tag` becomes `("registry.test", "ns/app")`. The tag
/// or digest part is dropped; blobs are addressed by digest anyway.
pub fn split_image_ref(image_ref: &str) -> Result<(String, String)> {
    let (host, rest) = image_ref
        .split_once('/')
        .ok_or_else(|| Error::invalid_argument(format!("image reference {}", image_ref)))?;
    let rest = match rest.split_once('@') {
        Some((r, _)) => r,
        None => rest,
    };
    // A ':' after the last '/' separates the tag, otherwise it is a port.
    let repo = match rest.rsplit_once(':') {
        Some((r, tag)) if !tag.contains('/') => r,
        _ => rest,
    };
    if repo.is_empty() {
        return Err(Error::invalid_argument(format!(
            "image reference {}",
            image_ref
        )));
    }
    Ok((host.to_string(), repo.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = r###"
    {
        "device": {
            "backend": {
                "type": "registry",
                "config": {
                    "scheme": "https",
                    "timeout": 5
                }
            },
            "cache": {
                "type": "blobcache",
                "config": {
                    "compressed": false
                }
            }
        },
        "mode": "direct",
        "digest_validate": false,
        "enable_xattr": true
    }
    "###;

    #[test]
    fn test_populate_image() {
        let mut config: DaemonConfig = serde_json::from_str(TEMPLATE).unwrap();
        config
            .populate_image("registry.test/library/nginx:latest")
            .unwrap();
        config.set_cache_work_dir("/var/lib/snapshots/cache");

        let out = config.to_json().unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["device"]["backend"]["config"]["host"], "registry.test");
        assert_eq!(v["device"]["backend"]["config"]["repo"], "library/nginx");
        assert_eq!(v["device"]["backend"]["config"]["scheme"], "https");
        assert_eq!(
            v["device"]["cache"]["config"]["work_dir"],
            "/var/lib/snapshots/cache"
        );
        // Unknown template fields survive the round trip.
        assert_eq!(v["enable_xattr"], true);
    }

    #[test]
    fn test_split_image_ref() {
        assert_eq!(
            split_image_ref("registry.test/ns/app:v1").unwrap(),
            ("registry.test".to_string(), "ns/app".to_string())
        );
        assert_eq!(
            split_image_ref("registry.test:5000/app").unwrap(),
            ("registry.test:5000".to_string(), "app".to_string())
        );
        assert_eq!(
            split_image_ref("registry.test/app@sha256:abcd").unwrap(),
            ("registry.test".to_string(), "app".to_string())
        );
        assert!(split_image_ref("no-slash").is_err());
    }
}
