// Copyright 2022 Alibaba Cloud. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The runtime-facing snapshotter.
//!
//! Every operation follows the same shape: a metastore transaction for the
//! snapshot graph, then daemon or disk work strictly outside of it so a
//! slow daemon never blocks unrelated keys behind the store lock. Layer
//! classification is read off the labels; the handlers below mirror the
//! classification table one to one.

use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use nix::unistd::{chown, Gid, Uid};

use snapshotter_api::error::{Error, Result};
use snapshotter_api::label::{self, Labels};
use snapshotter_api::types::{FsDriver, Snapshot, SnapshotInfo, SnapshotKind, Usage};
use snapshotter_service::{Supervisor, SupervisorConfig};
use snapshotter_storage::{CacheManager, MetaStore, ReferrerDetector, SnapshotTx};
use snapshotter_tarfs::TarfsManager;

use crate::config::SnapshotterConfig;
use crate::filesystem::{Filesystem, BOOTSTRAP_RELATIVE_PATH};
use crate::metrics;
use crate::mount::{self, ExtraOption, Mount};
use crate::rafs::RafsInstanceRegistry;
use crate::volume::{KataVirtualVolume, TYPE_IMAGE_NYDUS_FS};

/// Distinguishes concurrent in-flight snapshot directories.
static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Everything the mount paths need from one metastore read.
struct MountContext {
    id: u64,
    info: SnapshotInfo,
    /// Full ancestor chain, direct parent first.
    parents: Vec<(u64, SnapshotInfo)>,
}

pub struct Snapshotter {
    config: SnapshotterConfig,
    store: Arc<MetaStore>,
    fs: Filesystem,
    cache: Option<Arc<CacheManager>>,
    tarfs: Option<Arc<TarfsManager>>,
    referrer: Option<ReferrerDetector>,
    background: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Snapshotter {
    pub fn new(config: SnapshotterConfig) -> Result<Self> {
        config.validate()?;
        Supervisor::prepare_root(&config.root)?;

        let store = Arc::new(MetaStore::new(config.root.join("metadata.db"))?);
        let cache = if config.cache.enabled {
            Some(CacheManager::new(
                config.root.join("cache"),
                Duration::from_secs(config.cache.gc_period_secs),
                Duration::from_secs(config.cache.max_age_secs),
            )?)
        } else {
            None
        };
        let supervisor = Supervisor::new(
            SupervisorConfig {
                root: config.root.clone(),
                nydusd_path: config.nydusd_path.clone(),
                daemon_mode: config.daemon_mode,
                fs_driver: config.fs_driver,
                recover_policy: config.recover_policy,
                log_level: config.log_level.clone(),
                wait_timeout: config.wait_timeout(),
                startup_timeout: config.startup_timeout(),
            },
            store.clone(),
        );
        let registry = Arc::new(RafsInstanceRegistry::new());
        let fs = Filesystem::new(config.clone(), supervisor, registry, cache.clone())?;
        let tarfs = if config.enable_tarfs {
            Some(TarfsManager::new(config.nydus_image_path.clone())?)
        } else {
            None
        };
        let referrer = if config.enable_referrer_detect {
            Some(ReferrerDetector::new()?)
        } else {
            None
        };

        let snapshotter = Snapshotter {
            config,
            store,
            fs,
            cache,
            tarfs,
            referrer,
            background: Mutex::new(Vec::new()),
        };
        snapshotter.fs.recover()?;
        Ok(snapshotter)
    }

    /// Start background work: the cache eviction worker and GC timer.
    pub fn run(&self) {
        if let Some(cache) = &self.cache {
            let store = self.store.clone();
            let handles = cache.start(Arc::new(move || referenced_digests(&store)));
            self.background.lock().unwrap().extend(handles);
        }
    }

    fn snapshots_root(&self) -> PathBuf {
        self.config.root.join("snapshots")
    }

    fn snapshot_dir(&self, id: u64) -> PathBuf {
        self.snapshots_root().join(id.to_string())
    }

    fn upper_path(&self, id: u64) -> PathBuf {
        self.snapshot_dir(id).join("fs")
    }

    fn work_path(&self, id: u64) -> PathBuf {
        self.snapshot_dir(id).join("work")
    }

    /// Mountpoint of the merged EROFS tree for tarfs chains.
    fn erofs_lower_path(&self, id: u64) -> PathBuf {
        self.snapshot_dir(id).join("lower")
    }

    fn tarfs_storage_dir(&self, digest: &str) -> PathBuf {
        let hex = digest.split(':').last().unwrap_or(digest);
        self.config.root.join("cache").join(hex)
    }

    // ------------------------------------------------------------------
    // Runtime-facing operations.
    // ------------------------------------------------------------------

    pub fn stat(&self, key: &str) -> Result<SnapshotInfo> {
        let r = self.store.view(|tx| tx.get_info(key).map(|(_, info)| info));
        metrics::observe("stat", r.is_ok());
        r
    }

    pub fn update(&self, info: &SnapshotInfo, fieldpaths: &[String]) -> Result<SnapshotInfo> {
        let r = self.store.update(|tx| tx.update_info(info, fieldpaths));
        metrics::observe("update", r.is_ok());
        r
    }

    pub fn usage(&self, key: &str) -> Result<Usage> {
        let r = self.usage_inner(key);
        metrics::observe("usage", r.is_ok());
        r
    }

    fn usage_inner(&self, key: &str) -> Result<Usage> {
        let (id, info, stored) = self.store.view(|tx| {
            let (id, info) = tx.get_info(key)?;
            let usage = tx.get_usage(key)?;
            Ok((id, info, usage))
        })?;

        match info.kind {
            SnapshotKind::Active => directory_usage(&self.upper_path(id)),
            SnapshotKind::Committed if label::is_remote_data_layer(&info.labels) => {
                let mut usage = stored;
                if let (Some(cache), Some(digest)) =
                    (&self.cache, label::layer_digest(&info.labels))
                {
                    usage.add(cache.usage(digest));
                }
                Ok(usage)
            }
            _ => Ok(stored),
        }
    }

    pub fn mounts(&self, key: &str) -> Result<Vec<Mount>> {
        let r = self.compose_mounts(key);
        metrics::observe("mounts", r.is_ok());
        r
    }

    pub fn prepare(&self, key: &str, parent: &str, labels: Labels) -> Result<Vec<Mount>> {
        let r = self.prepare_inner(key, parent, labels);
        metrics::observe("prepare", r.is_ok());
        r
    }

    fn prepare_inner(&self, key: &str, parent: &str, labels: Labels) -> Result<Vec<Mount>> {
        let snapshot = self.create_snapshot(SnapshotKind::Active, key, parent, &labels)?;

        if let Some(target) = label::target_ref(&labels).map(str::to_string) {
            return self.prepare_remote_layer(key, &target, snapshot, &labels);
        }
        // A container writable layer.
        self.compose_mounts(key)
    }

    /// Handle Prepare of a layer the runtime offered to commit directly
    /// (`target-snapshot-ref` present). Success is reported as
    /// `AlreadyExists(target)` so the runtime skips unpacking.
    fn prepare_remote_layer(
        &self,
        key: &str,
        target: &str,
        snapshot: Snapshot,
        labels: &Labels,
    ) -> Result<Vec<Mount>> {
        if label::is_nydus_meta_layer(labels) {
            // The bootstrap is small; let the runtime unpack it into fs/.
            return self.compose_mounts(key);
        }

        if label::is_nydus_data_layer(labels) {
            // Blob contents are pulled on demand; fscache additionally
            // wants the blob staged locally, which can happen off-path.
            if self.config.fs_driver == FsDriver::Fscache {
                if let Some(cache) = &self.cache {
                    let cache = cache.clone();
                    let labels = labels.clone();
                    let handle = thread::Builder::new()
                        .name("blob-prepare".to_string())
                        .spawn(move || {
                            if let Err(e) = cache.prepare(&labels) {
                                warn!("background blob prepare: {}", e);
                            }
                        })
                        .map_err(|e| Error::internal(format!("spawn blob prepare: {}", e)))?;
                    self.background.lock().unwrap().push(handle);
                }
            }
            self.commit_target(key, target)?;
            return Err(Error::already_exists(target));
        }

        if label::is_stargz_layer(labels) {
            self.fs
                .prepare_stargz_meta_layer(&self.snapshot_dir(snapshot.id), labels)?;
            self.commit_target(key, target)?;
            return Err(Error::already_exists(target));
        }

        if self.config.enable_tarfs {
            let tarfs = self
                .tarfs
                .as_ref()
                .ok_or_else(|| Error::failed_precondition("tarfs is disabled"))?;
            let digest = label::layer_digest(labels)
                .ok_or_else(|| Error::invalid_argument("tarfs layer has no digest label"))?;
            let image_ref = label::image_ref(labels)
                .ok_or_else(|| Error::invalid_argument("tarfs layer has no image reference"))?;
            let manifest = label::manifest_digest(labels)
                .ok_or_else(|| Error::invalid_argument("tarfs layer has no manifest digest"))?;
            tarfs.prepare_layer(
                &snapshot.id.to_string(),
                image_ref,
                manifest,
                digest,
                self.tarfs_storage_dir(digest),
            )?;
            // Mark the layer so Usage and Remove can find its artifacts.
            self.store.update(|tx| {
                let mut info = tx.get_info(key)?.1;
                info.labels
                    .insert(label::TARFS_LAYER.to_string(), "true".to_string());
                tx.update_info(&info, &[format!("labels.{}", label::TARFS_LAYER)])?;
                Ok(())
            })?;
            self.commit_target(key, target)?;
            return Err(Error::already_exists(target));
        }

        // Not a layer we serve remotely; the runtime unpacks it normally.
        self.compose_mounts(key)
    }

    pub fn view(&self, key: &str, parent: &str, labels: Labels) -> Result<Vec<Mount>> {
        let r = self.view_inner(key, parent, labels);
        metrics::observe("view", r.is_ok());
        r
    }

    fn view_inner(&self, key: &str, parent: &str, labels: Labels) -> Result<Vec<Mount>> {
        if !parent.is_empty() {
            let (_, pinfo) = self.store.view(|tx| tx.get_info(parent))?;
            let meta_like = label::is_nydus_meta_layer(&pinfo.labels)
                || label::is_stargz_layer(&pinfo.labels)
                || label::is_tarfs_layer(&pinfo.labels);
            if label::is_nydus_data_layer(&pinfo.labels) {
                return Err(Error::failed_precondition(format!(
                    "cannot view data layer {}",
                    parent
                )));
            }
            if !meta_like && label::is_remote_data_layer(&pinfo.labels) {
                return Err(Error::failed_precondition(format!(
                    "cannot view data layer {}",
                    parent
                )));
            }
        }
        self.create_snapshot(SnapshotKind::View, key, parent, &labels)?;
        self.compose_mounts(key)
    }

    pub fn commit(&self, name: &str, key: &str) -> Result<()> {
        let r = self.store.update(|tx| {
            let (id, _) = tx.get_info(key)?;
            let usage = directory_usage(&self.upper_path(id))?;
            tx.commit_active(key, name, usage)?;
            Ok(())
        });
        metrics::observe("commit", r.is_ok());
        r
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let r = self.remove_inner(key);
        metrics::observe("remove", r.is_ok());
        r
    }

    fn remove_inner(&self, key: &str) -> Result<()> {
        let (id, info) = self.store.update(|tx| {
            let (id, info) = tx.get_info(key)?;
            tx.remove(key)?;
            Ok((id, info))
        })?;
        let id_str = id.to_string();

        // Directory-level cleanup happens after the transaction and never
        // turns into a returned error.
        if let Err(e) = self.fs.umount(&id_str) {
            warn!("umount removed snapshot {}: {}", id_str, e);
        }
        if let Some(tarfs) = &self.tarfs {
            if let Err(e) = tarfs.detach_layer(&id_str) {
                warn!("detach tarfs layer {}: {}", id_str, e);
            }
        }
        if self.config.sync_remove {
            if let Err(e) = self.remove_orphan_dirs(false) {
                warn!("sync remove of {}: {}", key, e);
            }
        }
        if label::is_remote_data_layer(&info.labels) {
            if let (Some(cache), Some(digest)) = (&self.cache, label::layer_digest(&info.labels)) {
                if let Err(e) = cache.remove_blob_async(digest) {
                    warn!("queue cache eviction for {}: {}", digest, e);
                }
            }
        }
        Ok(())
    }

    /// Visit every snapshot, optionally restricted by `filter`.
    pub fn walk(
        &self,
        filter: Option<&dyn Fn(&SnapshotInfo) -> bool>,
        mut f: impl FnMut(u64, &SnapshotInfo, Usage) -> Result<()>,
    ) -> Result<()> {
        let r = self.store.view(|tx| {
            tx.walk(|id, info, usage| {
                if filter.map_or(true, |flt| flt(info)) {
                    f(id, info, usage)
                } else {
                    Ok(())
                }
            })
        });
        metrics::observe("walk", r.is_ok());
        r
    }

    /// Remove directories whose name no longer corresponds to a live
    /// snapshot id.
    pub fn cleanup(&self) -> Result<()> {
        let r = self.remove_orphan_dirs(true);
        metrics::observe("cleanup", r.is_ok());
        r
    }

    fn remove_orphan_dirs(&self, umount_first: bool) -> Result<()> {
        // The id set is captured inside a write transaction so no snapshot
        // can be created or removed while the orphan list is computed.
        let orphans = self.store.update(|tx| {
            let ids = tx.id_map()?;
            self.collect_orphans(&ids)
        })?;

        for dir in orphans {
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if umount_first {
                if let Err(e) = self.fs.umount(&name) {
                    warn!("cleanup umount {}: {}", name, e);
                }
                if let Some(tarfs) = &self.tarfs {
                    if let Err(e) = tarfs.detach_layer(&name) {
                        warn!("cleanup tarfs detach {}: {}", name, e);
                    }
                }
            }
            info!("removing orphan snapshot directory {}", dir.display());
            if let Err(e) = fs::remove_dir_all(&dir) {
                warn!("remove orphan {}: {}", dir.display(), e);
            }
        }
        Ok(())
    }

    fn collect_orphans(&self, ids: &HashSet<u64>) -> Result<Vec<PathBuf>> {
        let mut orphans = Vec::new();
        for entry in fs::read_dir(self.snapshots_root())? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let live = name
                .parse::<u64>()
                .map(|id| ids.contains(&id))
                .unwrap_or(false);
            if !live {
                orphans.push(entry.path());
            }
        }
        Ok(orphans)
    }

    /// Final teardown. Blocks until every daemon subprocess is reaped.
    pub fn close(&self) -> Result<()> {
        if self.config.cleanup_on_close {
            self.fs.teardown();
        } else {
            self.fs.supervisor().teardown();
        }
        if let Some(cache) = &self.cache {
            cache.stop();
        }
        if let Some(tarfs) = &self.tarfs {
            tarfs.shutdown();
        }
        let handles: Vec<_> = self.background.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        self.store.close()
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        self.fs.supervisor()
    }

    // ------------------------------------------------------------------
    // Snapshot creation.
    // ------------------------------------------------------------------

    fn create_snapshot(
        &self,
        kind: SnapshotKind,
        key: &str,
        parent: &str,
        labels: &Labels,
    ) -> Result<Snapshot> {
        let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let td = self
            .snapshots_root()
            .join(format!("new-{}-{}", std::process::id(), seq));

        let fs_dir = td.join("fs");
        fs::create_dir_all(&fs_dir)?;
        fs::set_permissions(&fs_dir, fs::Permissions::from_mode(0o755))?;
        if kind == SnapshotKind::Active {
            let work_dir = td.join("work");
            fs::create_dir_all(&work_dir)?;
            fs::set_permissions(&work_dir, fs::Permissions::from_mode(0o711))?;
        }

        let r = self.store.update(|tx| {
            let snapshot = tx.create_snapshot(kind, key, parent, labels)?;
            if let Some(parent_id) = snapshot.parent_ids.first() {
                let parent_upper = self.upper_path(*parent_id);
                if let Ok(meta) = fs::metadata(&parent_upper) {
                    let uid = Some(Uid::from_raw(meta.uid()));
                    let gid = Some(Gid::from_raw(meta.gid()));
                    for dir in [&td, &td.join("fs")] {
                        chown(dir.as_path(), uid, gid).map_err(|e| {
                            Error::internal(format!("chown {}: {}", dir.display(), e))
                        })?;
                    }
                }
            }
            fs::rename(&td, self.snapshot_dir(snapshot.id))?;
            Ok(snapshot)
        });
        if r.is_err() {
            let _ = fs::remove_dir_all(&td);
        }
        r
    }

    fn commit_target(&self, key: &str, target: &str) -> Result<()> {
        // Remote layers hold no runtime-visible upper data; their bytes are
        // accounted to the blob cache instead.
        self.store
            .update(|tx| tx.commit_active(key, target, Usage::default()))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Mount composition.
    // ------------------------------------------------------------------

    fn collect_mount_context(&self, tx: &SnapshotTx, key: &str) -> Result<MountContext> {
        let (id, info) = tx.get_info(key)?;
        let parents = tx.parents(key)?;
        Ok(MountContext { id, info, parents })
    }

    fn compose_mounts(&self, key: &str) -> Result<Vec<Mount>> {
        let ctx = self.store.view(|tx| self.collect_mount_context(tx, key))?;

        if let Some((meta_id, meta_info)) = self.find_meta_snapshot(&ctx) {
            return self.remote_mounts(&ctx, meta_id, &meta_info);
        }
        if self.tarfs.is_some() && self.is_tarfs_chain(&ctx) {
            return self.tarfs_mounts(&ctx);
        }
        self.overlay_mounts(&ctx)
    }

    fn is_meta_like(labels: &Labels) -> bool {
        label::is_nydus_meta_layer(labels) || label::is_stargz_layer(labels)
    }

    /// The snapshot carrying the bootstrap for `ctx`, if any: the snapshot
    /// itself, an ancestor, or (with referrer detection on) an ancestor
    /// whose image has an associated nydus image in the registry.
    fn find_meta_snapshot(&self, ctx: &MountContext) -> Option<(u64, SnapshotInfo)> {
        if Self::is_meta_like(&ctx.info.labels) {
            return Some((ctx.id, ctx.info.clone()));
        }
        for (pid, pinfo) in &ctx.parents {
            if Self::is_meta_like(&pinfo.labels) {
                return Some((*pid, pinfo.clone()));
            }
        }
        if let Some(detector) = &self.referrer {
            for (pid, pinfo) in &ctx.parents {
                let (image_ref, manifest) = match (
                    label::image_ref(&pinfo.labels),
                    label::manifest_digest(&pinfo.labels),
                ) {
                    (Some(r), Some(m)) => (r, m),
                    _ => continue,
                };
                match detector.check(image_ref, manifest) {
                    Ok(Some(referrer)) => {
                        debug!(
                            "snapshot {} matched referrer {} via {}",
                            pid, referrer, manifest
                        );
                        return Some((*pid, pinfo.clone()));
                    }
                    Ok(None) => {}
                    Err(e) => warn!("referrer check for {}: {}", manifest, e),
                }
            }
        }
        None
    }

    fn is_tarfs_chain(&self, ctx: &MountContext) -> bool {
        ctx.parents
            .first()
            .map(|(_, info)| label::is_tarfs_layer(&info.labels))
            .unwrap_or(false)
    }

    fn remote_mounts(
        &self,
        ctx: &MountContext,
        meta_id: u64,
        meta_info: &SnapshotInfo,
    ) -> Result<Vec<Mount>> {
        let meta_id_str = meta_id.to_string();
        let meta_dir = self.snapshot_dir(meta_id);

        if self.fs.registry().get(&meta_id_str).is_none() {
            match ctx.info.kind {
                SnapshotKind::Active | SnapshotKind::View => {
                    self.fs.mount(&meta_id_str, &meta_dir, &meta_info.labels)?;
                }
                _ => {
                    // A lookup on a committed layer with no live daemon is
                    // not a container start; serve the plain overlay.
                    debug!(
                        "no rafs instance for {} on a non-container lookup, using overlay",
                        meta_id_str
                    );
                    return self.overlay_mounts(ctx);
                }
            }
        }
        self.fs.wait_until_ready(&meta_id_str)?;
        let exported = self.fs.exported_path(&meta_id_str)?;

        // Uppermost first; the exported RAFS tree is the deepest layer.
        let mut lowers = Vec::new();
        if self.referrer.is_some() {
            for (pid, _) in &ctx.parents {
                if *pid == meta_id {
                    break;
                }
                lowers.push(self.upper_path(*pid).to_string_lossy().to_string());
            }
        }
        lowers.push(exported.to_string_lossy().to_string());

        let writable = ctx.info.kind == SnapshotKind::Active && ctx.id != meta_id;
        let upper = writable.then(|| self.upper_path(ctx.id));
        let work = writable.then(|| self.work_path(ctx.id));
        let volatile = writable && label::is_volatile(&ctx.info.labels);

        // A read-only consumer of a single RAFS tree does not need an
        // overlay at all.
        if !writable && lowers.len() == 1 && !self.config.enable_nydus_overlayfs {
            let mut mount = mount::bind_mount(&exported);
            if self.config.enable_kata_volume {
                let bootstrap = meta_dir.join(BOOTSTRAP_RELATIVE_PATH);
                let volume = KataVirtualVolume::new_fs(
                    TYPE_IMAGE_NYDUS_FS,
                    &bootstrap.to_string_lossy(),
                    "rafs",
                );
                mount.options.push(volume.to_option()?);
            }
            return Ok(vec![mount]);
        }

        let mut mount = if self.config.enable_nydus_overlayfs {
            let bootstrap = meta_dir.join(BOOTSTRAP_RELATIVE_PATH);
            let fs_version = mount::detect_fs_version(&bootstrap)?;
            let instance = self
                .fs
                .registry()
                .get(&meta_id_str)
                .ok_or_else(|| Error::not_found(format!("rafs instance {}", meta_id_str)))?;
            let config = fs::read_to_string(&instance.config_path).map_err(|e| {
                Error::internal(format!(
                    "read daemon config {}: {}",
                    instance.config_path.display(),
                    e
                ))
            })?;
            let extra = ExtraOption {
                source: bootstrap.to_string_lossy().to_string(),
                config,
                snapshotdir: meta_dir.to_string_lossy().to_string(),
                fs_version: fs_version.as_str().to_string(),
            };
            mount::fuse_overlay_mount(
                &self.config.fuse_overlay_type,
                &lowers,
                upper.as_deref(),
                work.as_deref(),
                volatile,
                &extra,
            )?
        } else {
            mount::overlay_mount(&lowers, upper.as_deref(), work.as_deref(), volatile)
        };

        if self.config.enable_kata_volume {
            let bootstrap = meta_dir.join(BOOTSTRAP_RELATIVE_PATH);
            let volume = KataVirtualVolume::new_fs(
                TYPE_IMAGE_NYDUS_FS,
                &bootstrap.to_string_lossy(),
                "rafs",
            );
            mount.options.push(volume.to_option()?);
        }

        Ok(vec![mount])
    }

    fn tarfs_mounts(&self, ctx: &MountContext) -> Result<Vec<Mount>> {
        let tarfs = self
            .tarfs
            .as_ref()
            .ok_or_else(|| Error::failed_precondition("tarfs is disabled"))?;
        let id_str = ctx.id.to_string();

        // Deepest layer first for the bootstrap merge.
        let mut chain = Vec::new();
        for (pid, pinfo) in ctx.parents.iter().rev() {
            if !label::is_tarfs_layer(&pinfo.labels) {
                continue;
            }
            let digest = label::layer_digest(&pinfo.labels).ok_or_else(|| {
                Error::internal(format!("tarfs layer {} lost its digest label", pid))
            })?;
            chain.push((pid.to_string(), self.tarfs_storage_dir(digest)));
        }

        tarfs.merge_layers(
            &id_str,
            &chain,
            &self.snapshot_dir(ctx.id),
            self.config.wait_timeout(),
        )?;
        let lower = self.erofs_lower_path(ctx.id);
        tarfs.mount_erofs(&id_str, &lower)?;

        let lowers = vec![lower.to_string_lossy().to_string()];
        let (upper, work) = if ctx.info.kind == SnapshotKind::Active {
            (Some(self.upper_path(ctx.id)), Some(self.work_path(ctx.id)))
        } else {
            (None, None)
        };
        let volatile =
            ctx.info.kind == SnapshotKind::Active && label::is_volatile(&ctx.info.labels);
        Ok(vec![mount::overlay_mount(
            &lowers,
            upper.as_deref(),
            work.as_deref(),
            volatile,
        )])
    }

    fn overlay_mounts(&self, ctx: &MountContext) -> Result<Vec<Mount>> {
        let uppers: Vec<String> = ctx
            .parents
            .iter()
            .map(|(pid, _)| self.upper_path(*pid).to_string_lossy().to_string())
            .collect();

        if ctx.info.kind == SnapshotKind::Active {
            if uppers.is_empty() {
                return Ok(vec![Mount {
                    fs_type: "bind".to_string(),
                    source: self.upper_path(ctx.id).to_string_lossy().to_string(),
                    options: vec!["rw".to_string(), "rbind".to_string()],
                }]);
            }
            let volatile = label::is_volatile(&ctx.info.labels);
            return Ok(vec![mount::overlay_mount(
                &uppers,
                Some(&self.upper_path(ctx.id)),
                Some(&self.work_path(ctx.id)),
                volatile,
            )]);
        }

        // Committed and view snapshots are read-only.
        match uppers.len() {
            0 => Ok(vec![mount::bind_mount(&self.upper_path(ctx.id))]),
            1 => Ok(vec![mount::bind_mount(&self.upper_path(
                ctx.parents[0].0,
            ))]),
            _ => Ok(vec![mount::overlay_mount(&uppers, None, None, false)]),
        }
    }
}

/// Recursive disk usage of one directory tree.
pub fn directory_usage(dir: &Path) -> Result<Usage> {
    let mut usage = Usage::default();
    if !dir.exists() {
        return Ok(usage);
    }
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(&current)? {
            let entry = entry?;
            usage.inodes += 1;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                usage.size += meta.len() as i64;
            }
        }
    }
    Ok(usage)
}

/// Digests still referenced by live committed snapshots; everything else
/// is fair game for the cache GC.
fn referenced_digests(store: &MetaStore) -> Result<HashSet<String>> {
    let mut digests = HashSet::new();
    store.view(|tx| {
        tx.walk(|_, info, _| {
            if info.kind == SnapshotKind::Committed {
                if let Some(digest) = label::layer_digest(&info.labels) {
                    digests.insert(digest.to_string());
                }
            }
            Ok(())
        })
    })?;
    Ok(digests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use vmm_sys_util::tempdir::TempDir;

    const DAEMON_TEMPLATE: &str = r#"{
        "device": {
            "backend": {"type": "registry", "config": {"scheme": "https"}},
            "cache": {"type": "blobcache", "config": {}}
        },
        "mode": "direct"
    }"#;

    fn snapshotter(dir: &TempDir) -> Snapshotter {
        let config = test_config(dir.as_path());
        fs::write(&config.daemon_config_path, DAEMON_TEMPLATE).unwrap();
        Snapshotter::new(config).unwrap()
    }

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_prepare_creates_directories() {
        let dir = TempDir::new().unwrap();
        let s = snapshotter(&dir);

        let mounts = s.prepare("k1", "", Labels::new()).unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].fs_type, "bind");
        assert!(mounts[0].options.contains(&"rw".to_string()));

        let info = s.stat("k1").unwrap();
        assert_eq!(info.kind, SnapshotKind::Active);

        // Directory layout and modes match the overlay contract.
        let id = s.store.view(|tx| tx.get_info("k1").map(|(id, _)| id)).unwrap();
        let fs_dir = s.upper_path(id);
        let work_dir = s.work_path(id);
        assert!(fs_dir.is_dir());
        assert!(work_dir.is_dir());
        assert_eq!(
            fs::metadata(&fs_dir).unwrap().permissions().mode() & 0o777,
            0o755
        );
        assert_eq!(
            fs::metadata(&work_dir).unwrap().permissions().mode() & 0o777,
            0o711
        );
        // No temporary directory left behind.
        let leftovers: Vec<_> = fs::read_dir(s.snapshots_root())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("new-"))
            .collect();
        assert!(leftovers.is_empty());

        s.close().unwrap();
    }

    #[test]
    fn test_prepare_data_layer_commits_target() {
        let dir = TempDir::new().unwrap();
        let s = snapshotter(&dir);

        let err = s
            .prepare(
                "sha256:aa",
                "",
                labels(&[
                    (label::TARGET_SNAPSHOT_REF, "t1"),
                    (label::NYDUS_DATA_LAYER, "true"),
                ]),
            )
            .unwrap_err();
        assert!(err.is_already_exists());

        // The snapshot now lives under the target name, committed.
        let info = s.stat("t1").unwrap();
        assert_eq!(info.kind, SnapshotKind::Committed);
        assert!(s.stat("sha256:aa").unwrap_err().is_not_found());

        // Disk shows an empty upper directory.
        let id = s.store.view(|tx| tx.get_info("t1").map(|(id, _)| id)).unwrap();
        assert!(s.upper_path(id).is_dir());
        assert_eq!(fs::read_dir(s.upper_path(id)).unwrap().count(), 0);

        s.close().unwrap();
    }

    #[test]
    fn test_prepare_duplicate_key() {
        let dir = TempDir::new().unwrap();
        let s = snapshotter(&dir);
        s.prepare("k1", "", Labels::new()).unwrap();
        let err = s.prepare("k1", "", Labels::new()).unwrap_err();
        assert!(err.is_already_exists());
        s.close().unwrap();
    }

    #[test]
    fn test_native_overlay_chain() {
        let dir = TempDir::new().unwrap();
        let s = snapshotter(&dir);

        s.prepare("l1-a", "", Labels::new()).unwrap();
        s.commit("l1", "l1-a").unwrap();
        s.prepare("l2-a", "l1", Labels::new()).unwrap();
        s.commit("l2", "l2-a").unwrap();
        let mounts = s.prepare("c1", "l2", Labels::new()).unwrap();

        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].fs_type, "overlay");
        let lower = mounts[0]
            .options
            .iter()
            .find(|o| o.starts_with("lowerdir="))
            .unwrap();
        // Two ancestors contribute two lowerdir components, direct parent
        // first.
        let components: Vec<&str> = lower.trim_start_matches("lowerdir=").split(':').collect();
        assert_eq!(components.len(), 2);
        let l2_id = s.store.view(|tx| tx.get_info("l2").map(|(id, _)| id)).unwrap();
        assert!(components[0].ends_with(&format!("{}/fs", l2_id)));

        s.close().unwrap();
    }

    #[test]
    fn test_volatile_option() {
        let dir = TempDir::new().unwrap();
        let s = snapshotter(&dir);
        s.prepare("base-a", "", Labels::new()).unwrap();
        s.commit("base", "base-a").unwrap();
        let mounts = s
            .prepare("c1", "base", labels(&[(label::OVERLAY_VOLATILE, "true")]))
            .unwrap();
        assert!(mounts[0].options.contains(&"volatile".to_string()));
        s.close().unwrap();
    }

    #[test]
    fn test_commit_records_usage() {
        let dir = TempDir::new().unwrap();
        let s = snapshotter(&dir);
        s.prepare("a1", "", Labels::new()).unwrap();
        let id = s.store.view(|tx| tx.get_info("a1").map(|(id, _)| id)).unwrap();
        fs::write(s.upper_path(id).join("data"), vec![0u8; 1024]).unwrap();

        s.commit("c1", "a1").unwrap();
        let usage = s.usage("c1").unwrap();
        assert_eq!(usage.size, 1024);
        assert_eq!(usage.inodes, 1);

        // Committing a committed snapshot fails.
        let err = s.commit("c2", "c1").unwrap_err();
        assert!(matches!(err, Error::FailedPrecondition(_)));
        s.close().unwrap();
    }

    #[test]
    fn test_remove_sync_removes_directories() {
        let dir = TempDir::new().unwrap();
        let s = snapshotter(&dir);
        s.prepare("k1", "", Labels::new()).unwrap();
        let id = s.store.view(|tx| tx.get_info("k1").map(|(id, _)| id)).unwrap();
        assert!(s.snapshot_dir(id).exists());

        s.remove("k1").unwrap();
        assert!(!s.snapshot_dir(id).exists());
        assert!(s.stat("k1").unwrap_err().is_not_found());
        s.close().unwrap();
    }

    #[test]
    fn test_remove_with_children_fails() {
        let dir = TempDir::new().unwrap();
        let s = snapshotter(&dir);
        s.prepare("p-a", "", Labels::new()).unwrap();
        s.commit("p", "p-a").unwrap();
        s.prepare("c", "p", Labels::new()).unwrap();

        let err = s.remove("p").unwrap_err();
        assert!(matches!(err, Error::FailedPrecondition(_)));
        // Both snapshots still present.
        assert!(s.stat("p").is_ok());
        assert!(s.stat("c").is_ok());
        s.close().unwrap();
    }

    #[test]
    fn test_cleanup_removes_orphans() {
        let dir = TempDir::new().unwrap();
        let s = snapshotter(&dir);
        s.prepare("keep", "", Labels::new()).unwrap();

        let orphan = s.snapshots_root().join("999");
        fs::create_dir_all(orphan.join("fs")).unwrap();

        s.cleanup().unwrap();
        assert!(!orphan.exists());
        // The live snapshot survived.
        let id = s.store.view(|tx| tx.get_info("keep").map(|(id, _)| id)).unwrap();
        assert!(s.snapshot_dir(id).exists());
        s.close().unwrap();
    }

    #[test]
    fn test_view_of_data_layer_rejected() {
        let dir = TempDir::new().unwrap();
        let s = snapshotter(&dir);
        let err = s
            .prepare(
                "sha256:bb",
                "",
                labels(&[
                    (label::TARGET_SNAPSHOT_REF, "data"),
                    (label::NYDUS_DATA_LAYER, "true"),
                ]),
            )
            .unwrap_err();
        assert!(err.is_already_exists());

        let err = s.view("v1", "data", Labels::new()).unwrap_err();
        assert!(matches!(err, Error::FailedPrecondition(_)));
        s.close().unwrap();
    }

    #[test]
    fn test_view_of_committed_plain_layer() {
        let dir = TempDir::new().unwrap();
        let s = snapshotter(&dir);
        s.prepare("b-a", "", Labels::new()).unwrap();
        s.commit("b", "b-a").unwrap();

        let mounts = s.view("v1", "b", Labels::new()).unwrap();
        assert_eq!(mounts[0].fs_type, "bind");
        assert!(mounts[0].options.contains(&"ro".to_string()));
        s.close().unwrap();
    }

    #[test]
    fn test_walk_with_filter() {
        let dir = TempDir::new().unwrap();
        let s = snapshotter(&dir);
        s.prepare("a", "", Labels::new()).unwrap();
        s.prepare("b", "", Labels::new()).unwrap();

        let mut seen = Vec::new();
        let filter = |info: &SnapshotInfo| info.name == "a";
        s.walk(Some(&filter), |_, info, _| {
            seen.push(info.name.clone());
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec!["a".to_string()]);
        s.close().unwrap();
    }

    #[test]
    fn test_update_labels_roundtrip() {
        let dir = TempDir::new().unwrap();
        let s = snapshotter(&dir);
        s.prepare("k", "", Labels::new()).unwrap();
        let mut info = s.stat("k").unwrap();
        info.labels.insert("x".to_string(), "y".to_string());
        let updated = s.update(&info, &[]).unwrap();
        assert_eq!(updated.labels.get("x").map(String::as_str), Some("y"));
        assert_eq!(s.stat("k").unwrap().labels.get("x").map(String::as_str), Some("y"));
        s.close().unwrap();
    }

    #[test]
    fn test_meta_layer_prepare_returns_mounts_for_unpack() {
        let dir = TempDir::new().unwrap();
        let s = snapshotter(&dir);
        // A meta layer with a target ref is unpacked by the runtime, so
        // Prepare must hand back mounts rather than already-exists.
        let mounts = s
            .prepare(
                "m1",
                "",
                labels(&[
                    (label::TARGET_SNAPSHOT_REF, "meta"),
                    (label::NYDUS_META_LAYER, "true"),
                ]),
            )
            .unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].fs_type, "bind");
        s.close().unwrap();
    }

    #[test]
    fn test_usage_active_counts_upper_dir() {
        let dir = TempDir::new().unwrap();
        let s = snapshotter(&dir);
        s.prepare("k", "", Labels::new()).unwrap();
        let id = s.store.view(|tx| tx.get_info("k").map(|(id, _)| id)).unwrap();
        fs::write(s.upper_path(id).join("f"), b"12345678").unwrap();
        let usage = s.usage("k").unwrap();
        assert_eq!(usage.size, 8);
        s.close().unwrap();
    }
}
