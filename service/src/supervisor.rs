// Copyright 2022 Alibaba Cloud. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The daemon supervisor.
//!
//! Owns every daemon object and the persisted daemon/instance records.
//! Attach/detach maintain the per-daemon reference count; the supervisor
//! never stops a daemon whose count is above zero. On startup the
//! recovery pass re-adopts daemons whose processes survived a snapshotter
//! restart and discards stale records.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;

use snapshotter_api::error::{Error, Result};
use snapshotter_api::types::{DaemonMode, DaemonState, FsDriver, RafsInstance, RecoverPolicy};
use snapshotter_storage::MetaStore;

use crate::daemon::{Daemon, DaemonLifecycleInput, DaemonOptions};

/// Identifier of the one shared daemon.
pub const SHARED_DAEMON_ID: &str = "nydusd-shared";

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub root: PathBuf,
    pub nydusd_path: PathBuf,
    pub daemon_mode: DaemonMode,
    pub fs_driver: FsDriver,
    pub recover_policy: RecoverPolicy,
    pub log_level: String,
    pub wait_timeout: Duration,
    pub startup_timeout: Duration,
}

/// Daemon description exported on the system controller socket.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonExport {
    pub id: String,
    pub pid: i32,
    pub state: String,
    pub mode: DaemonMode,
    pub fs_driver: FsDriver,
    pub mountpoint: PathBuf,
    pub api_socket: PathBuf,
    pub instance_count: i32,
}

pub struct Supervisor {
    config: SupervisorConfig,
    store: Arc<MetaStore>,
    daemons: RwLock<HashMap<String, Arc<Daemon>>>,
    /// Serializes shared daemon creation.
    shared_lock: Mutex<()>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, store: Arc<MetaStore>) -> Arc<Self> {
        Arc::new(Supervisor {
            config,
            store,
            daemons: RwLock::new(HashMap::new()),
            shared_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    fn daemon_options(&self) -> DaemonOptions {
        DaemonOptions {
            binary: self.config.nydusd_path.clone(),
            log_dir: self.config.root.join("logs"),
            log_level: self.config.log_level.clone(),
            wait_timeout: self.config.wait_timeout,
            startup_timeout: self.config.startup_timeout,
            recover_policy: self.config.recover_policy,
        }
    }

    pub fn socket_path(&self, daemon_id: &str, index: u32) -> PathBuf {
        self.config
            .root
            .join("socket")
            .join(daemon_id)
            .join(format!("api{}.sock", index))
    }

    pub fn get(&self, daemon_id: &str) -> Option<Arc<Daemon>> {
        self.daemons.read().unwrap().get(daemon_id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<Daemon>> {
        self.daemons.read().unwrap().values().cloned().collect()
    }

    pub fn exports(&self) -> Vec<DaemonExport> {
        self.list()
            .iter()
            .map(|d| DaemonExport {
                id: d.id.clone(),
                pid: d.pid(),
                state: d.state().to_string(),
                mode: d.mode,
                fs_driver: d.fs_driver,
                mountpoint: d.mountpoint.clone(),
                api_socket: d.api_socket(),
                instance_count: d.ref_count(),
            })
            .collect()
    }

    /// The shared daemon, spawned on first use.
    pub fn ensure_shared_daemon(&self, config_path: &Path) -> Result<Arc<Daemon>> {
        let _guard = self.shared_lock.lock().unwrap();
        if let Some(d) = self.get(SHARED_DAEMON_ID) {
            return Ok(d);
        }

        let daemon = Daemon::new(
            SHARED_DAEMON_ID.to_string(),
            DaemonMode::Shared,
            self.config.fs_driver,
            self.config.root.join("mnt"),
            config_path.to_path_buf(),
            self.socket_path(SHARED_DAEMON_ID, 0),
            None,
            self.daemon_options(),
        )?;
        daemon.start()?;
        self.store.add_daemon(&daemon.record())?;
        self.daemons
            .write()
            .unwrap()
            .insert(SHARED_DAEMON_ID.to_string(), daemon.clone());
        Ok(daemon)
    }

    /// A dedicated daemon serving exactly one bootstrap.
    pub fn create_dedicated_daemon(
        &self,
        snapshot_id: &str,
        mountpoint: PathBuf,
        bootstrap: PathBuf,
        config_path: PathBuf,
    ) -> Result<Arc<Daemon>> {
        let id = format!("nydusd-{}", snapshot_id);
        if let Some(d) = self.get(&id) {
            return Ok(d);
        }

        let daemon = Daemon::new(
            id.clone(),
            DaemonMode::Dedicated,
            self.config.fs_driver,
            mountpoint,
            config_path,
            self.socket_path(&id, 0),
            Some(bootstrap),
            self.daemon_options(),
        )?;
        daemon.start()?;
        self.store.add_daemon(&daemon.record())?;
        self.daemons.write().unwrap().insert(id, daemon.clone());
        Ok(daemon)
    }

    /// Attach one RAFS instance to `daemon`: wait for readiness, issue the
    /// API mount for shared daemons, take a reference and persist the
    /// instance record. The reference is released again if anything fails.
    pub fn attach_instance(
        &self,
        daemon: &Arc<Daemon>,
        instance: &RafsInstance,
        bootstrap: &Path,
        daemon_config: &str,
    ) -> Result<()> {
        daemon.wait_ready(self.config.wait_timeout)?;

        if daemon.mode == DaemonMode::Shared {
            daemon
                .client()
                .mount(&format!("/{}", instance.snapshot_id), bootstrap, daemon_config)?;
        }

        let prev = daemon.inc_ref();
        let r = (|| -> Result<()> {
            if prev == 0 && daemon.state() == DaemonState::Ready {
                daemon.on_event(DaemonLifecycleInput::Attach)?;
            }
            self.store.add_instance(instance)?;
            Ok(())
        })();
        if r.is_err() {
            daemon.dec_ref();
            if daemon.mode == DaemonMode::Shared {
                let _ = daemon.client().umount(&format!("/{}", instance.snapshot_id));
            }
        }
        r
    }

    /// Detach one RAFS instance; stops a dedicated daemon when its last
    /// instance goes away, while a shared daemon is retained for reuse.
    pub fn detach_instance(&self, instance: &RafsInstance) -> Result<()> {
        let daemon = self
            .get(&instance.daemon_id)
            .ok_or_else(|| Error::not_found(format!("daemon {}", instance.daemon_id)))?;

        if daemon.mode == DaemonMode::Shared && daemon.state() != DaemonState::Dead {
            daemon
                .client()
                .umount(&format!("/{}", instance.snapshot_id))?;
        }

        let count = daemon.dec_ref();
        if count == 0 {
            match daemon.mode {
                DaemonMode::Shared => {
                    if daemon.state() == DaemonState::Running {
                        daemon.on_event(DaemonLifecycleInput::Detach)?;
                    }
                }
                _ => {
                    self.destroy_daemon(&daemon)?;
                }
            }
        }
        self.store.remove_instance(&instance.snapshot_id)?;
        Ok(())
    }

    /// Re-persist the record of a daemon whose pid or socket changed.
    pub fn store_record(&self, daemon: &Arc<Daemon>) -> Result<()> {
        self.store.add_daemon(&daemon.record())
    }

    fn destroy_daemon(&self, daemon: &Arc<Daemon>) -> Result<()> {
        if daemon.ref_count() > 0 {
            return Err(Error::failed_precondition(format!(
                "daemon {} still owns {} instances",
                daemon.id,
                daemon.ref_count()
            )));
        }
        daemon.stop(self.config.wait_timeout)?;
        self.store.remove_daemon(&daemon.id)?;
        self.daemons.write().unwrap().remove(&daemon.id);
        Ok(())
    }

    /// Re-adopt daemons from persisted records, discard records of dead
    /// processes, and return the instances that are still served so the
    /// caller can rebuild the in-memory registry.
    pub fn recover(&self) -> Result<Vec<RafsInstance>> {
        for record in self.store.list_daemons()? {
            let alive = kill(Pid::from_raw(record.pid), None::<Signal>).is_ok();
            if !alive {
                warn!(
                    "daemon {} pid {} is gone, dropping its record",
                    record.id, record.pid
                );
                self.store.remove_daemon(&record.id)?;
                continue;
            }

            let client = snapshotter_api::client::DaemonClient::new(
                &record.api_socket,
                self.config.wait_timeout,
            )?;
            let state = match client.info() {
                Ok(info) => info.state(),
                Err(e) => {
                    warn!(
                        "daemon {} pid {} does not answer ({}), dropping its record",
                        record.id, record.pid, e
                    );
                    self.store.remove_daemon(&record.id)?;
                    continue;
                }
            };

            match Daemon::recovered(&record, state, self.daemon_options()) {
                Ok(daemon) => {
                    info!("recovered daemon {} pid {} ({})", record.id, record.pid, state);
                    self.daemons
                        .write()
                        .unwrap()
                        .insert(record.id.clone(), daemon);
                }
                Err(e) => {
                    error!("rebuild daemon {}: {}", record.id, e);
                    self.store.remove_daemon(&record.id)?;
                }
            }
        }

        let mut instances = Vec::new();
        for instance in self.store.list_instances()? {
            match self.get(&instance.daemon_id) {
                Some(daemon) => {
                    daemon.inc_ref();
                    instances.push(instance);
                }
                None => {
                    warn!(
                        "instance {} references missing daemon {}, dropping",
                        instance.snapshot_id, instance.daemon_id
                    );
                    self.store.remove_instance(&instance.snapshot_id)?;
                }
            }
        }
        Ok(instances)
    }

    /// Stop every daemon. Instances are assumed to be torn down already.
    pub fn teardown(&self) {
        let daemons: Vec<Arc<Daemon>> = self.daemons.write().unwrap().drain().map(|(_, d)| d).collect();
        for daemon in daemons {
            if let Err(e) = daemon.stop(self.config.wait_timeout) {
                error!("stop daemon {}: {}", daemon.id, e);
                daemon.disconnect();
            }
        }
    }

    /// Whether `pid` refers to a live process.
    pub fn pid_alive(pid: i32) -> bool {
        match kill(Pid::from_raw(pid), None::<Signal>) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            Err(_) => true,
        }
    }

    /// Create the directory skeleton under the snapshotter root.
    pub fn prepare_root(root: &Path) -> Result<()> {
        for sub in ["snapshots", "cache", "config", "socket", "mnt", "logs"] {
            fs::create_dir_all(root.join(sub))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmm_sys_util::tempdir::TempDir;

    fn supervisor(root: &Path) -> (Arc<Supervisor>, Arc<MetaStore>) {
        let store = Arc::new(MetaStore::new(root.join("metadata.db")).unwrap());
        let config = SupervisorConfig {
            root: root.to_path_buf(),
            nydusd_path: PathBuf::from("/bin/true"),
            daemon_mode: DaemonMode::Shared,
            fs_driver: FsDriver::Fusedev,
            recover_policy: RecoverPolicy::None,
            log_level: "info".to_string(),
            wait_timeout: Duration::from_millis(300),
            startup_timeout: Duration::from_millis(500),
        };
        (Supervisor::new(config, store.clone()), store)
    }

    #[test]
    fn test_prepare_root_layout() {
        let dir = TempDir::new().unwrap();
        Supervisor::prepare_root(dir.as_path()).unwrap();
        for sub in ["snapshots", "cache", "config", "socket", "mnt", "logs"] {
            assert!(dir.as_path().join(sub).is_dir(), "{} missing", sub);
        }
    }

    #[test]
    fn test_shared_daemon_is_singleton() {
        let dir = TempDir::new().unwrap();
        let (sup, store) = supervisor(dir.as_path());
        let config_path = dir.as_path().join("config").join("shared.json");
        fs::create_dir_all(config_path.parent().unwrap()).unwrap();
        fs::write(&config_path, "{}").unwrap();

        let d1 = sup.ensure_shared_daemon(&config_path).unwrap();
        let d2 = sup.ensure_shared_daemon(&config_path).unwrap();
        assert_eq!(d1.id, d2.id);
        assert_eq!(sup.list().len(), 1);
        assert_eq!(store.list_daemons().unwrap().len(), 1);

        sup.teardown();
    }

    #[test]
    fn test_recover_drops_dead_records() {
        let dir = TempDir::new().unwrap();
        let (sup, store) = supervisor(dir.as_path());
        store
            .add_daemon(&snapshotter_api::types::DaemonRecord {
                id: "stale".to_string(),
                // A pid that cannot exist.
                pid: i32::MAX - 1,
                api_socket: dir.as_path().join("api0.sock"),
                fs_driver: FsDriver::Fusedev,
                mode: DaemonMode::Shared,
                mountpoint: dir.as_path().join("mnt"),
                config_path: dir.as_path().join("cfg.json"),
            })
            .unwrap();
        store
            .add_instance(&RafsInstance {
                snapshot_id: "9".to_string(),
                daemon_id: "stale".to_string(),
                snapshot_dir: dir.as_path().join("snapshots/9"),
                mountpoint: dir.as_path().join("mnt/9"),
                config_path: dir.as_path().join("cfg.json"),
            })
            .unwrap();

        let instances = sup.recover().unwrap();
        assert!(instances.is_empty());
        assert!(store.list_daemons().unwrap().is_empty());
        assert!(store.list_instances().unwrap().is_empty());
    }

    #[test]
    fn test_pid_alive() {
        assert!(Supervisor::pid_alive(std::process::id() as i32));
        assert!(!Supervisor::pid_alive(i32::MAX - 1));
    }
}
