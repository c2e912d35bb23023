// Copyright 2022 Alibaba Cloud. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Bridge from snapshots to FS daemons.
//!
//! Turns "snapshot `id` with these labels needs its RAFS tree visible" into
//! daemon lifecycle calls: pick or create the daemon, attach the instance,
//! register it, and the reverse on unmount. All daemon state stays with the
//! supervisor; all snapshot state stays with the metastore; this layer owns
//! only the wiring between them.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};

use snapshotter_api::config::DaemonConfig;
use snapshotter_api::error::{Error, Result};
use snapshotter_api::label::{self, Labels};
use snapshotter_api::types::{DaemonMode, RafsInstance};
use snapshotter_service::{Supervisor, SHARED_DAEMON_ID};
use snapshotter_storage::CacheManager;

use crate::config::SnapshotterConfig;
use crate::metrics;
use crate::rafs::RafsInstanceRegistry;

/// Where the runtime unpacks the bootstrap within a meta-layer snapshot.
pub const BOOTSTRAP_RELATIVE_PATH: &str = "fs/image/image.boot";

pub struct Filesystem {
    config: SnapshotterConfig,
    supervisor: Arc<Supervisor>,
    registry: Arc<RafsInstanceRegistry>,
    cache: Option<Arc<CacheManager>>,
    template: DaemonConfig,
    /// Serializes registry mutation so concurrent mounts of the same
    /// snapshot observe each other.
    mount_lock: Mutex<()>,
}

impl Filesystem {
    pub fn new(
        config: SnapshotterConfig,
        supervisor: Arc<Supervisor>,
        registry: Arc<RafsInstanceRegistry>,
        cache: Option<Arc<CacheManager>>,
    ) -> Result<Self> {
        let template = DaemonConfig::from_file(&config.daemon_config_path)?;
        Ok(Filesystem {
            config,
            supervisor,
            registry,
            cache,
            template,
            mount_lock: Mutex::new(()),
        })
    }

    pub fn registry(&self) -> &Arc<RafsInstanceRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn bootstrap_path(snapshot_dir: &Path) -> Result<PathBuf> {
        let path = snapshot_dir.join(BOOTSTRAP_RELATIVE_PATH);
        if !path.is_file() {
            return Err(Error::not_found(format!(
                "bootstrap {} is missing",
                path.display()
            )));
        }
        Ok(path)
    }

    fn instance_config(&self, labels: &Labels) -> Result<DaemonConfig> {
        let mut config = self.template.clone();
        if let Some(image_ref) = label::image_ref(labels) {
            config.populate_image(image_ref)?;
        }
        config.set_cache_work_dir(&self.config.root.join("cache").to_string_lossy());
        Ok(config)
    }

    fn shared_daemon_config_path(&self) -> Result<PathBuf> {
        let path = self
            .config
            .root
            .join("config")
            .join(format!("{}.json", SHARED_DAEMON_ID));
        if !path.exists() {
            let mut config = self.template.clone();
            config.set_cache_work_dir(&self.config.root.join("cache").to_string_lossy());
            config.write_to(&path)?;
        }
        Ok(path)
    }

    /// Make the RAFS tree of `snapshot_id` visible on the host. Idempotent:
    /// a registered instance is left untouched.
    pub fn mount(&self, snapshot_id: &str, snapshot_dir: &Path, labels: &Labels) -> Result<()> {
        let _guard = self.mount_lock.lock().unwrap();
        if self.registry.get(snapshot_id).is_some() {
            return Ok(());
        }

        let bootstrap = Self::bootstrap_path(snapshot_dir)?;
        let instance_config = self.instance_config(labels)?;

        let (daemon, instance) = match self.config.daemon_mode {
            DaemonMode::Shared => {
                let config_path = self.shared_daemon_config_path()?;
                let daemon = self.supervisor.ensure_shared_daemon(&config_path)?;
                let instance = RafsInstance {
                    snapshot_id: snapshot_id.to_string(),
                    daemon_id: daemon.id.clone(),
                    snapshot_dir: snapshot_dir.to_path_buf(),
                    mountpoint: daemon.mountpoint.join(snapshot_id),
                    config_path,
                };
                (daemon, instance)
            }
            DaemonMode::Dedicated => {
                let config_path = self
                    .config
                    .root
                    .join("config")
                    .join(format!("nydusd-{}.json", snapshot_id));
                instance_config.write_to(&config_path)?;
                let mountpoint = snapshot_dir.join("mnt");
                let daemon = self.supervisor.create_dedicated_daemon(
                    snapshot_id,
                    mountpoint.clone(),
                    bootstrap.clone(),
                    config_path.clone(),
                )?;
                let instance = RafsInstance {
                    snapshot_id: snapshot_id.to_string(),
                    daemon_id: daemon.id.clone(),
                    snapshot_dir: snapshot_dir.to_path_buf(),
                    mountpoint,
                    config_path,
                };
                (daemon, instance)
            }
            DaemonMode::None => {
                return Err(Error::failed_precondition(
                    "daemon mode none cannot serve remote layers",
                ))
            }
        };

        let config_json = instance_config.to_json()?;
        self.supervisor
            .attach_instance(&daemon, &instance, &bootstrap, &config_json)?;
        self.registry.add(instance)?;
        metrics::INSTANCE_COUNT.set(self.registry.len() as i64);
        metrics::DAEMON_COUNT.set(self.supervisor.list().len() as i64);
        Ok(())
    }

    /// Tear down the instance of `snapshot_id`. Unknown snapshots are fine.
    pub fn umount(&self, snapshot_id: &str) -> Result<()> {
        let _guard = self.mount_lock.lock().unwrap();
        let instance = match self.registry.get(snapshot_id) {
            Some(i) => i,
            None => return Ok(()),
        };
        match self.supervisor.detach_instance(&instance) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!("daemon for instance {} already gone: {}", snapshot_id, e);
            }
            Err(e) => return Err(e),
        }
        self.registry.remove(snapshot_id);
        metrics::INSTANCE_COUNT.set(self.registry.len() as i64);
        metrics::DAEMON_COUNT.set(self.supervisor.list().len() as i64);
        Ok(())
    }

    /// Wait until the daemon serving `snapshot_id` can answer reads.
    pub fn wait_until_ready(&self, snapshot_id: &str) -> Result<()> {
        let instance = self
            .registry
            .get(snapshot_id)
            .ok_or_else(|| Error::not_found(format!("rafs instance {}", snapshot_id)))?;
        let daemon = self
            .supervisor
            .get(&instance.daemon_id)
            .ok_or_else(|| Error::not_found(format!("daemon {}", instance.daemon_id)))?;
        daemon.wait_ready(self.config.wait_timeout())
    }

    /// Host path where the RAFS tree of `snapshot_id` is exported.
    pub fn exported_path(&self, snapshot_id: &str) -> Result<PathBuf> {
        self.registry
            .get(snapshot_id)
            .map(|i| i.mountpoint)
            .ok_or_else(|| Error::not_found(format!("rafs instance {}", snapshot_id)))
    }

    /// Rebuild registry state from the supervisor's recovery pass.
    pub fn recover(&self) -> Result<()> {
        for instance in self.supervisor.recover()? {
            let id = instance.snapshot_id.clone();
            if let Err(e) = self.registry.add(instance) {
                warn!("skip recovered instance {}: {}", id, e);
            }
        }
        metrics::INSTANCE_COUNT.set(self.registry.len() as i64);
        metrics::DAEMON_COUNT.set(self.supervisor.list().len() as i64);
        Ok(())
    }

    /// Build a bootstrap for an eStargz layer so it can be served like a
    /// nydus meta layer.
    pub fn prepare_stargz_meta_layer(&self, snapshot_dir: &Path, labels: &Labels) -> Result<()> {
        let cache = self
            .cache
            .as_ref()
            .ok_or_else(|| Error::failed_precondition("stargz layers need the blob cache"))?;
        let digest = label::layer_digest(labels)
            .ok_or_else(|| Error::invalid_argument("stargz layer has no digest label"))?;
        let image_ref = label::image_ref(labels)
            .ok_or_else(|| Error::invalid_argument("stargz layer has no image reference label"))?;

        cache.prepare_blob(image_ref, digest)?;
        let toc = cache.blob_path(digest);

        let bootstrap = snapshot_dir.join(BOOTSTRAP_RELATIVE_PATH);
        if let Some(parent) = bootstrap.parent() {
            fs::create_dir_all(parent)?;
        }
        let status = Command::new(&self.config.nydus_image_path)
            .arg("create")
            .arg("--source-type")
            .arg("stargz_index")
            .arg("--bootstrap")
            .arg(&bootstrap)
            .arg(&toc)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| {
                Error::internal(format!(
                    "spawn builder {}: {}",
                    self.config.nydus_image_path.display(),
                    e
                ))
            })?;
        if !status.success() {
            return Err(Error::internal(format!(
                "builder exited with {} for stargz layer {}",
                status, digest
            )));
        }
        Ok(())
    }

    /// Unmount every instance and stop every daemon.
    pub fn teardown(&self) {
        for instance in self.registry.list() {
            if let Err(e) = self.umount(&instance.snapshot_id) {
                error!("umount instance {}: {}", instance.snapshot_id, e);
                self.registry.remove(&instance.snapshot_id);
            }
        }
        self.supervisor.teardown();
        metrics::INSTANCE_COUNT.set(0);
        metrics::DAEMON_COUNT.set(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmm_sys_util::tempdir::TempDir;

    #[test]
    fn test_bootstrap_path_requires_file() {
        let dir = TempDir::new().unwrap();
        let err = Filesystem::bootstrap_path(dir.as_path()).unwrap_err();
        assert!(err.is_not_found());

        let boot = dir.as_path().join(BOOTSTRAP_RELATIVE_PATH);
        fs::create_dir_all(boot.parent().unwrap()).unwrap();
        fs::write(&boot, b"boot").unwrap();
        assert_eq!(Filesystem::bootstrap_path(dir.as_path()).unwrap(), boot);
    }
}
