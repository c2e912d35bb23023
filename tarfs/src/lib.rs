// Copyright 2023 Alibaba Cloud. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Conversion of OCI tar layers into loop-mounted EROFS filesystems.
//!
//! Each layer moves through Init -> Preparing -> Ready/Failed. Preparation
//! runs on its own worker: the compressed blob is fetched, decompressed and
//! teed into an on-disk tar copy and the image builder, which emits a
//! per-layer bootstrap. The teed digest must match the diffID recorded in
//! the image config. Merging concatenates the per-layer bootstraps and
//! pins every artifact to a loop device; the kernel mount itself is a
//! plain `erofs` mount over those devices.

#[macro_use]
extern crate log;

pub mod image;
pub mod loopdev;

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use flate2::read::GzDecoder;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use sha2::{Digest, Sha256};

use snapshotter_api::error::{Error, Result};

use crate::image::RegistryClient;
use crate::loopdev::LoopDevice;

/// On-disk tar copy of a prepared layer, inside its storage directory.
pub const LAYER_TAR_NAME: &str = "layer.tar";
/// Per-layer bootstrap emitted by the builder.
pub const LAYER_BOOTSTRAP_NAME: &str = "layer.boot";
/// Merged bootstrap of a whole parent chain.
pub const MERGED_BOOTSTRAP_NAME: &str = "image.boot";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerState {
    Init,
    Preparing,
    Ready,
    Failed,
}

pub struct LayerStatus {
    state: Mutex<LayerState>,
    cond: Condvar,
    cancel: AtomicBool,
    empty: AtomicBool,
    loops: Mutex<Vec<LoopDevice>>,
    mount_options: Mutex<String>,
    mountpoint: Mutex<Option<PathBuf>>,
    storage_dir: PathBuf,
}

impl LayerStatus {
    fn new(state: LayerState, storage_dir: PathBuf) -> Arc<Self> {
        Arc::new(LayerStatus {
            state: Mutex::new(state),
            cond: Condvar::new(),
            cancel: AtomicBool::new(false),
            empty: AtomicBool::new(false),
            loops: Mutex::new(Vec::new()),
            mount_options: Mutex::new(String::new()),
            mountpoint: Mutex::new(None),
            storage_dir,
        })
    }

    fn set_state(&self, state: LayerState) {
        *self.state.lock().unwrap() = state;
        self.cond.notify_all();
    }

    pub fn state(&self) -> LayerState {
        *self.state.lock().unwrap()
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub fn is_empty_layer(&self) -> bool {
        self.empty.load(Ordering::Acquire)
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn bootstrap_path(&self) -> PathBuf {
        self.storage_dir.join(LAYER_BOOTSTRAP_NAME)
    }

    pub fn tar_path(&self) -> PathBuf {
        self.storage_dir.join(LAYER_TAR_NAME)
    }
}

pub struct TarfsManager {
    builder: PathBuf,
    registry: RegistryClient,
    layers: Mutex<HashMap<String, Arc<LayerStatus>>>,
    /// Loop device attachment is not reentrant.
    losetup: Mutex<()>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl TarfsManager {
    pub fn new(builder: PathBuf) -> Result<Arc<Self>> {
        Ok(Arc::new(TarfsManager {
            builder,
            registry: RegistryClient::new()?,
            layers: Mutex::new(HashMap::new()),
            losetup: Mutex::new(()),
            workers: Mutex::new(Vec::new()),
        }))
    }

    fn status_of(&self, snapshot_id: &str) -> Result<Arc<LayerStatus>> {
        self.layers
            .lock()
            .unwrap()
            .get(snapshot_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("tarfs layer {}", snapshot_id)))
    }

    /// Start converting one layer. Returns immediately; callers observe the
    /// outcome through [`TarfsManager::wait_layer_ready`]. A second prepare
    /// of the same snapshot is refused.
    pub fn prepare_layer(
        self: &Arc<Self>,
        snapshot_id: &str,
        image_ref: &str,
        manifest_digest: &str,
        layer_digest: &str,
        storage_dir: PathBuf,
    ) -> Result<()> {
        let status = {
            let mut layers = self.layers.lock().unwrap();
            if layers.contains_key(snapshot_id) {
                return Err(Error::already_exists(format!(
                    "tarfs layer {} already prepared",
                    snapshot_id
                )));
            }
            let status = LayerStatus::new(LayerState::Preparing, storage_dir);
            layers.insert(snapshot_id.to_string(), status.clone());
            status
        };

        let mgr = self.clone();
        let id = snapshot_id.to_string();
        let image_ref = image_ref.to_string();
        let manifest_digest = manifest_digest.to_string();
        let layer_digest = layer_digest.to_string();
        let handle = thread::Builder::new()
            .name(format!("tarfs-{}", snapshot_id))
            .spawn(move || {
                match mgr.do_prepare(&status, &image_ref, &manifest_digest, &layer_digest) {
                    Ok(()) => status.set_state(LayerState::Ready),
                    Err(e) => {
                        error!("prepare tarfs layer {}: {}", id, e);
                        status.set_state(LayerState::Failed);
                    }
                }
            })
            .map_err(|e| Error::internal(format!("spawn tarfs worker: {}", e)))?;
        self.workers.lock().unwrap().push(handle);
        Ok(())
    }

    fn do_prepare(
        &self,
        status: &LayerStatus,
        image_ref: &str,
        manifest_digest: &str,
        layer_digest: &str,
    ) -> Result<()> {
        fs::create_dir_all(&status.storage_dir)?;
        let (diff_id, media_type) =
            self.registry
                .layer_diff_id(image_ref, manifest_digest, layer_digest)?;
        let resp = self.registry.open_blob(image_ref, layer_digest)?;
        let mut src: Box<dyn Read> = if media_type.ends_with("gzip") {
            Box::new(GzDecoder::new(resp))
        } else {
            Box::new(resp)
        };

        let mut tar_file = File::create(status.tar_path())?;
        let blob_id = layer_digest.split(':').last().unwrap_or(layer_digest);
        let mut child = Command::new(&self.builder)
            .arg("create")
            .arg("--type")
            .arg("tar-tarfs")
            .arg("--bootstrap")
            .arg(status.bootstrap_path())
            .arg("--blob-id")
            .arg(blob_id)
            .arg("--blob-dir")
            .arg(&status.storage_dir)
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::internal(format!("spawn builder {}: {}", self.builder.display(), e)))?;
        let mut builder_in = child
            .stdin
            .take()
            .ok_or_else(|| Error::internal("builder stdin not piped"))?;

        let mut hasher = Sha256::new();
        let mut total: u64 = 0;
        let mut buf = [0u8; 64 * 1024];
        let tee = (|| -> Result<()> {
            loop {
                if status.cancelled() {
                    return Err(Error::internal("layer preparation cancelled"));
                }
                let n = src
                    .read(&mut buf)
                    .map_err(|e| Error::internal(format!("read layer {}: {}", layer_digest, e)))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                tar_file.write_all(&buf[..n])?;
                builder_in.write_all(&buf[..n])?;
                total += n as u64;
            }
            Ok(())
        })();
        drop(builder_in);
        if let Err(e) = tee {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }

        let builder_status = child
            .wait()
            .map_err(|e| Error::internal(format!("wait builder: {}", e)))?;
        if !builder_status.success() {
            return Err(Error::internal(format!(
                "builder exited with {} for layer {}",
                builder_status, layer_digest
            )));
        }
        tar_file.sync_all()?;

        let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
        if actual != diff_id {
            return Err(Error::internal(format!(
                "layer {} digest mismatch: teed {}, image config says {}",
                layer_digest, actual, diff_id
            )));
        }
        if total == 0 {
            status.empty.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Block until a layer leaves the Preparing state.
    pub fn wait_layer_ready(&self, snapshot_id: &str, timeout: Duration) -> Result<()> {
        let status = self.status_of(snapshot_id)?;
        let deadline = Instant::now() + timeout;
        let mut state = status.state.lock().unwrap();
        loop {
            match *state {
                LayerState::Ready => return Ok(()),
                LayerState::Failed => {
                    return Err(Error::internal(format!(
                        "tarfs layer {} preparation failed",
                        snapshot_id
                    )))
                }
                _ => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::unavailable(format!(
                    "tarfs layer {} still preparing after {:?}",
                    snapshot_id, timeout
                )));
            }
            let (guard, _) = status.cond.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
    }

    /// Merge the bootstraps of a parent chain (deepest layer first) and pin
    /// everything to loop devices. The result is tracked under
    /// `snapshot_id` for the eventual erofs mount. Idempotent: a chain that
    /// is already merged and Ready is left alone.
    pub fn merge_layers(
        &self,
        snapshot_id: &str,
        chain: &[(String, PathBuf)],
        output_dir: &Path,
        timeout: Duration,
    ) -> Result<()> {
        if let Some(status) = self.layers.lock().unwrap().get(snapshot_id) {
            if status.state() == LayerState::Ready {
                return Ok(());
            }
        }
        if chain.is_empty() {
            return Err(Error::invalid_argument("empty tarfs parent chain"));
        }
        for (id, _) in chain {
            self.wait_layer_ready(id, timeout)?;
        }

        fs::create_dir_all(output_dir)?;
        let merged = output_dir.join(MERGED_BOOTSTRAP_NAME);
        let mut cmd = Command::new(&self.builder);
        cmd.arg("merge").arg("--bootstrap").arg(&merged);
        for (_, dir) in chain {
            cmd.arg(dir.join(LAYER_BOOTSTRAP_NAME));
        }
        let out = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| Error::internal(format!("spawn builder merge: {}", e)))?;
        if !out.success() {
            return Err(Error::internal(format!("builder merge exited with {}", out)));
        }

        let status = LayerStatus::new(LayerState::Init, output_dir.to_path_buf());
        {
            let _guard = self.losetup.lock().unwrap();
            let r = (|| -> Result<()> {
                let mut loops = status.loops.lock().unwrap();
                let boot = LoopDevice::attach_ro(&merged)
                    .map_err(|e| Error::internal(format!("attach {}: {}", merged.display(), e)))?;
                loops.push(boot);

                let mut options = Vec::new();
                for (id, dir) in chain {
                    let layer = self.status_of(id)?;
                    if layer.is_empty_layer() {
                        continue;
                    }
                    let tar = dir.join(LAYER_TAR_NAME);
                    let dev = LoopDevice::attach_ro(&tar)
                        .map_err(|e| Error::internal(format!("attach {}: {}", tar.display(), e)))?;
                    options.push(format!("device={}", dev.path().display()));
                    loops.push(dev);
                }
                *status.mount_options.lock().unwrap() = options.join(",");
                Ok(())
            })();
            if let Err(e) = r {
                for dev in status.loops.lock().unwrap().drain(..) {
                    let _ = dev.detach();
                }
                return Err(e);
            }
        }
        status.set_state(LayerState::Ready);
        self.layers
            .lock()
            .unwrap()
            .insert(snapshot_id.to_string(), status);
        Ok(())
    }

    /// Kernel-mount the merged EROFS image of `snapshot_id`.
    pub fn mount_erofs(&self, snapshot_id: &str, mountpoint: &Path) -> Result<()> {
        let status = self.status_of(snapshot_id)?;
        if status.state() != LayerState::Ready {
            return Err(Error::failed_precondition(format!(
                "tarfs layer {} is not ready",
                snapshot_id
            )));
        }
        fs::create_dir_all(mountpoint)?;

        let loops = status.loops.lock().unwrap();
        let source = loops
            .first()
            .map(|d| d.path().to_path_buf())
            .ok_or_else(|| Error::internal(format!("tarfs layer {} has no device", snapshot_id)))?;
        let options = status.mount_options.lock().unwrap().clone();
        drop(loops);

        mount(
            Some(source.as_path()),
            mountpoint,
            Some("erofs"),
            MsFlags::MS_RDONLY,
            Some(options.as_str()),
        )
        .map_err(|e| {
            Error::internal(format!(
                "mount erofs {} at {}: {}",
                source.display(),
                mountpoint.display(),
                e
            ))
        })?;
        *status.mountpoint.lock().unwrap() = Some(mountpoint.to_path_buf());
        Ok(())
    }

    /// Unmount, free loop devices, cancel any in-flight preparation and
    /// forget the layer. Safe to call for unknown snapshots.
    pub fn detach_layer(&self, snapshot_id: &str) -> Result<()> {
        let status = match self.layers.lock().unwrap().remove(snapshot_id) {
            Some(s) => s,
            None => return Ok(()),
        };
        status.cancel.store(true, Ordering::Release);

        if let Some(mp) = status.mountpoint.lock().unwrap().take() {
            match umount2(&mp, MntFlags::MNT_DETACH) {
                Ok(()) => {}
                Err(nix::errno::Errno::ENOENT) | Err(nix::errno::Errno::EINVAL) => {}
                Err(e) => warn!("umount {}: {}", mp.display(), e),
            }
        }
        for dev in status.loops.lock().unwrap().drain(..) {
            if let Err(e) = dev.detach() {
                warn!("detach loop{}: {}", dev.index(), e);
            }
        }
        Ok(())
    }

    /// Reap finished worker threads; called from the owner's close path.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.layers.lock().unwrap().keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.detach_layer(&id) {
                warn!("detach tarfs layer {}: {}", id, e);
            }
        }
        let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for handle in workers {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmm_sys_util::tempdir::TempDir;

    fn manager() -> Arc<TarfsManager> {
        TarfsManager::new(PathBuf::from("/usr/bin/nydus-image")).unwrap()
    }

    #[test]
    fn test_double_prepare_is_refused() {
        let dir = TempDir::new().unwrap();
        let mgr = manager();
        mgr.prepare_layer(
            "11",
            "registry.invalid/app:v1",
            "sha256:m",
            "sha256:l",
            dir.as_path().join("11"),
        )
        .unwrap();
        let err = mgr
            .prepare_layer(
                "11",
                "registry.invalid/app:v1",
                "sha256:m",
                "sha256:l",
                dir.as_path().join("11"),
            )
            .unwrap_err();
        assert!(err.is_already_exists());
        mgr.shutdown();
    }

    #[test]
    fn test_failed_preparation_is_observed() {
        let dir = TempDir::new().unwrap();
        let mgr = manager();
        // registry.invalid never resolves, so the worker must fail.
        mgr.prepare_layer(
            "12",
            "registry.invalid/app:v1",
            "sha256:m",
            "sha256:l",
            dir.as_path().join("12"),
        )
        .unwrap();
        let err = mgr
            .wait_layer_ready("12", Duration::from_secs(30))
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        mgr.shutdown();
    }

    #[test]
    fn test_detach_unknown_layer_is_ok() {
        let mgr = manager();
        mgr.detach_layer("does-not-exist").unwrap();
        mgr.shutdown();
    }

    #[test]
    fn test_wait_on_unknown_layer() {
        let mgr = manager();
        let err = mgr
            .wait_layer_ready("nope", Duration::from_millis(10))
            .unwrap_err();
        assert!(err.is_not_found());
        mgr.shutdown();
    }

    #[test]
    fn test_merge_rejects_empty_chain() {
        let dir = TempDir::new().unwrap();
        let mgr = manager();
        let err = mgr
            .merge_layers("20", &[], dir.as_path(), Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        mgr.shutdown();
    }
}
