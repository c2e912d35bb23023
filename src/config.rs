// Copyright 2022 Alibaba Cloud. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Runtime configuration of the snapshotter process.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use snapshotter_api::error::{Error, Result};
use snapshotter_api::types::{DaemonMode, FsDriver, RecoverPolicy};

/// Longest root path we accept. Daemon api sockets live under
/// `<root>/socket/<daemon-id>/apiN.sock` and the whole path has to fit in
/// `sockaddr_un.sun_path`.
pub const ROOT_PATH_MAX: usize = 76;

fn default_nydusd_path() -> PathBuf {
    PathBuf::from("/usr/local/bin/nydusd")
}

fn default_builder_path() -> PathBuf {
    PathBuf::from("/usr/local/bin/nydus-image")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_overlay_type() -> String {
    "fuse.nydus-overlayfs".to_string()
}

fn default_wait_timeout() -> u64 {
    30
}

fn default_startup_timeout() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_gc_period() -> u64 {
    3600
}

fn default_cache_max_age() -> u64 {
    24 * 3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotterConfig {
    pub root: PathBuf,
    #[serde(default = "default_nydusd_path")]
    pub nydusd_path: PathBuf,
    #[serde(default = "default_builder_path")]
    pub nydus_image_path: PathBuf,
    /// Template for the configuration document handed to daemons.
    pub daemon_config_path: PathBuf,
    #[serde(default)]
    pub daemon_mode: DaemonMode,
    #[serde(default)]
    pub fs_driver: FsDriver,
    #[serde(default)]
    pub recover_policy: RecoverPolicy,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub sync_remove: bool,
    #[serde(default)]
    pub cleanup_on_close: bool,
    #[serde(default)]
    pub enable_referrer_detect: bool,
    #[serde(default)]
    pub enable_tarfs: bool,
    /// Emit `fuse.nydus-overlayfs` mounts with an `extraoption` trailer
    /// instead of plain overlay mounts.
    #[serde(default)]
    pub enable_nydus_overlayfs: bool,
    /// Attach Kata virtual volume descriptors to remote mounts.
    #[serde(default)]
    pub enable_kata_volume: bool,
    #[serde(default = "default_overlay_type")]
    pub fuse_overlay_type: String,
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_secs: u64,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
    #[serde(default)]
    pub cache: CacheRuntimeConfig,
    #[serde(default)]
    pub system: SystemConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheRuntimeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Zero disables the periodic GC.
    #[serde(default = "default_gc_period")]
    pub gc_period_secs: u64,
    #[serde(default = "default_cache_max_age")]
    pub max_age_secs: u64,
}

impl Default for CacheRuntimeConfig {
    fn default() -> Self {
        CacheRuntimeConfig {
            enabled: true,
            gc_period_secs: default_gc_period(),
            max_age_secs: default_cache_max_age(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SystemConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Defaults to `<root>/system.sock`.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
}

impl SnapshotterConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::invalid_argument(format!(
                "read config {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let config: SnapshotterConfig = serde_json::from_str(&content)
            .map_err(|e| Error::invalid_argument(format!("parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(Error::invalid_argument("root path is empty"));
        }
        if !self.root.is_absolute() {
            return Err(Error::invalid_argument(format!(
                "root path {} is not absolute",
                self.root.display()
            )));
        }
        if self.root.as_os_str().len() > ROOT_PATH_MAX {
            return Err(Error::invalid_argument(format!(
                "root path {} exceeds {} bytes, daemon sockets would not fit",
                self.root.display(),
                ROOT_PATH_MAX
            )));
        }
        if self.daemon_config_path.as_os_str().is_empty() {
            return Err(Error::invalid_argument("daemon config template path is empty"));
        }
        Ok(())
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn system_socket(&self) -> PathBuf {
        self.system
            .socket_path
            .clone()
            .unwrap_or_else(|| self.root.join("system.sock"))
    }
}

#[cfg(test)]
pub(crate) fn test_config(root: &Path) -> SnapshotterConfig {
    SnapshotterConfig {
        root: root.to_path_buf(),
        nydusd_path: PathBuf::from("/bin/true"),
        nydus_image_path: PathBuf::from("/bin/true"),
        daemon_config_path: root.join("nydusd-config.json"),
        daemon_mode: DaemonMode::Shared,
        fs_driver: FsDriver::Fusedev,
        recover_policy: RecoverPolicy::None,
        log_level: "info".to_string(),
        sync_remove: true,
        cleanup_on_close: true,
        enable_referrer_detect: false,
        enable_tarfs: false,
        enable_nydus_overlayfs: false,
        enable_kata_volume: false,
        fuse_overlay_type: default_overlay_type(),
        wait_timeout_secs: 1,
        startup_timeout_secs: 1,
        cache: CacheRuntimeConfig {
            enabled: true,
            gc_period_secs: 0,
            max_age_secs: 0,
        },
        system: SystemConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_length_cap() {
        let long = format!("/{}", "x".repeat(ROOT_PATH_MAX + 1));
        let mut config = test_config(Path::new("/var/lib/nydus"));
        config.root = PathBuf::from(long);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_relative_root_rejected() {
        let mut config = test_config(Path::new("/var/lib/nydus"));
        config.root = PathBuf::from("relative/root");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_minimal_file() {
        let raw = r#"{
            "root": "/var/lib/containerd/io.containerd.snapshotter.v1.nydus",
            "daemon_config_path": "/etc/nydus/nydusd-config.json"
        }"#;
        let config: SnapshotterConfig = serde_json::from_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.daemon_mode, DaemonMode::Shared);
        assert!(config.cache.enabled);
        assert_eq!(config.cache.gc_period_secs, 3600);
        assert_eq!(
            config.system_socket(),
            PathBuf::from("/var/lib/containerd/io.containerd.snapshotter.v1.nydus/system.sock")
        );
    }
}
