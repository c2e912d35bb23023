// Copyright 2022 Alibaba Cloud. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Per-digest local blob cache.
//!
//! Downloads land in a temporary file first and are renamed into place with
//! read-only permissions, so a crash never leaves a half-written blob under
//! a valid name. Eviction requests are queued on a bounded channel drained
//! by one worker; the periodic GC and concurrent `prepare` calls on the
//! same digest are serialized through a single-flight set.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, SystemTime};

use nix::sys::stat::utimes;
use nix::sys::time::{TimeVal, TimeValLike};

use snapshotter_api::error::{Error, Result};
use snapshotter_api::label::{self, Labels};
use snapshotter_api::types::Usage;

/// Depth of the eviction queue; beyond this the caller evicts inline.
const EVICT_QUEUE_DEPTH: usize = 512;

/// Pending downloads keyed by digest.
#[derive(Default)]
struct Flight {
    busy: Mutex<HashSet<String>>,
    cond: Condvar,
}

impl Flight {
    fn acquire(&self, key: &str) -> FlightGuard {
        let mut busy = self.busy.lock().unwrap();
        while busy.contains(key) {
            busy = self.cond.wait(busy).unwrap();
        }
        busy.insert(key.to_string());
        FlightGuard {
            flight: self,
            key: key.to_string(),
        }
    }
}

struct FlightGuard<'a> {
    flight: &'a Flight,
    key: String,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flight.busy.lock().unwrap().remove(&self.key);
        self.flight.cond.notify_all();
    }
}

pub struct CacheManager {
    dir: PathBuf,
    client: reqwest::blocking::Client,
    flight: Flight,
    evict_tx: Mutex<Option<SyncSender<String>>>,
    evict_rx: Mutex<Option<Receiver<String>>>,
    shutdown: AtomicBool,
    gc_period: Duration,
    max_age: Duration,
}

impl CacheManager {
    /// A zero `gc_period` disables the periodic GC entirely.
    pub fn new(dir: PathBuf, gc_period: Duration, max_age: Duration) -> Result<Arc<Self>> {
        fs::create_dir_all(&dir)
            .map_err(|e| Error::internal(format!("create cache dir {}: {}", dir.display(), e)))?;
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::internal(format!("cache http client: {}", e)))?;
        let (tx, rx) = sync_channel(EVICT_QUEUE_DEPTH);
        Ok(Arc::new(CacheManager {
            dir,
            client,
            flight: Flight::default(),
            evict_tx: Mutex::new(Some(tx)),
            evict_rx: Mutex::new(Some(rx)),
            shutdown: AtomicBool::new(false),
            gc_period,
            max_age,
        }))
    }

    /// Start the eviction worker and, unless the period is zero, the GC
    /// timer. `referenced` reports the digests still referenced by live
    /// committed snapshots.
    pub fn start(
        self: &Arc<Self>,
        referenced: Arc<dyn Fn() -> Result<HashSet<String>> + Send + Sync>,
    ) -> Vec<thread::JoinHandle<()>> {
        let mut handles = Vec::new();

        let rx = self.evict_rx.lock().unwrap().take();
        if let Some(rx) = rx {
            let mgr = self.clone();
            let h = thread::Builder::new()
                .name("cache-evict".to_string())
                .spawn(move || {
                    while let Ok(digest) = rx.recv() {
                        if let Err(e) = mgr.remove_blob(&digest) {
                            warn!("evict blob {}: {}", digest, e);
                        }
                    }
                })
                .expect("spawn cache eviction worker");
            handles.push(h);
        }

        if !self.gc_period.is_zero() {
            let mgr = self.clone();
            let h = thread::Builder::new()
                .name("cache-gc".to_string())
                .spawn(move || {
                    let mut elapsed = Duration::ZERO;
                    loop {
                        if mgr.shutdown.load(Ordering::Acquire) {
                            break;
                        }
                        thread::sleep(Duration::from_secs(1));
                        elapsed += Duration::from_secs(1);
                        if elapsed < mgr.gc_period {
                            continue;
                        }
                        elapsed = Duration::ZERO;
                        match referenced() {
                            Ok(refs) => {
                                if let Err(e) = mgr.gc(&refs) {
                                    warn!("cache gc: {}", e);
                                }
                            }
                            Err(e) => warn!("cache gc reference scan: {}", e),
                        }
                    }
                })
                .expect("spawn cache gc");
            handles.push(h);
        }

        handles
    }

    /// Stop background work; returns once the queue sender is gone so the
    /// worker drains and exits.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.evict_tx.lock().unwrap().take();
    }

    /// Where the blob for `digest` lives (or would live) on disk.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        self.dir.join(digest_name(digest))
    }

    /// Disk usage of the cache entry for `digest`, zero if absent.
    pub fn usage(&self, digest: &str) -> Usage {
        path_usage(&self.blob_path(digest))
    }

    /// Ensure the blob named by the snapshot labels is present in the cache.
    pub fn prepare(&self, labels: &Labels) -> Result<()> {
        let digest = label::layer_digest(labels)
            .ok_or_else(|| Error::invalid_argument("snapshot has no layer digest label"))?;
        let image_ref = label::image_ref(labels)
            .ok_or_else(|| Error::invalid_argument("snapshot has no image reference label"))?;
        self.prepare_blob(image_ref, digest)
    }

    pub fn prepare_blob(&self, image_ref: &str, digest: &str) -> Result<()> {
        let path = self.blob_path(digest);
        if path.exists() {
            touch(&path);
            return Ok(());
        }

        let _guard = self.flight.acquire(digest);
        if path.exists() {
            // Somebody else fetched it while we waited.
            touch(&path);
            return Ok(());
        }

        let url = blob_url(image_ref, digest)?;
        debug!("fetching blob {} from {}", digest, url);
        let mut resp = self
            .client
            .get(&url)
            .send()
            .map_err(|e| Error::internal(format!("fetch blob {}: {}", digest, e)))?;
        if !resp.status().is_success() {
            return Err(Error::internal(format!(
                "fetch blob {}: status {}",
                digest,
                resp.status()
            )));
        }

        let tmp = self.dir.join(format!(".{}.dwl", digest_name(digest)));
        let r = (|| -> Result<()> {
            let mut file = fs::File::create(&tmp)?;
            io::copy(&mut resp, &mut file)
                .map_err(|e| Error::internal(format!("write blob {}: {}", digest, e)))?;
            file.sync_all()?;
            let mut perm = file.metadata()?.permissions();
            perm.set_mode(0o440);
            fs::set_permissions(&tmp, perm)?;
            fs::rename(&tmp, &path)?;
            Ok(())
        })();
        if r.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        r
    }

    /// Queue an eviction; falls back to inline removal when the queue is
    /// full or already shut down.
    pub fn remove_blob_async(&self, digest: &str) -> Result<()> {
        let tx = self.evict_tx.lock().unwrap().clone();
        match tx {
            Some(tx) => match tx.try_send(digest.to_string()) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(d)) => {
                    warn!("eviction queue full, removing {} inline", d);
                    self.remove_blob(&d)
                }
                Err(TrySendError::Disconnected(d)) => self.remove_blob(&d),
            },
            None => self.remove_blob(digest),
        }
    }

    pub fn remove_blob(&self, digest: &str) -> Result<()> {
        let _guard = self.flight.acquire(digest);
        let path = self.blob_path(digest);
        remove_path(&path)
    }

    /// Drop cache entries that are not referenced and have not been used
    /// within the age limit.
    pub fn gc(&self, referenced: &HashSet<String>) -> Result<()> {
        let referenced: HashSet<String> = referenced.iter().map(|d| digest_name(d)).collect();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                // In-flight download.
                continue;
            }
            if referenced.contains(&name) {
                continue;
            }
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| SystemTime::now().duration_since(t).ok())
                .unwrap_or(Duration::ZERO);
            if age < self.max_age {
                continue;
            }
            let _guard = self.flight.acquire(&name);
            info!("cache gc removes {} (idle {}s)", name, age.as_secs());
            if let Err(e) = remove_path(&entry.path()) {
                warn!("cache gc remove {}: {}", name, e);
            }
        }
        Ok(())
    }
}

fn digest_name(digest: &str) -> String {
    match digest.split_once(':') {
        Some((_, hex)) => hex.to_string(),
        None => digest.to_string(),
    }
}

fn blob_url(image_ref: &str, digest: &str) -> Result<String> {
    let (host, repo) = snapshotter_api::config::split_image_ref(image_ref)?;
    Ok(format!("https://{}/v2/{}/blobs/{}", host, repo, digest))
}

fn touch(path: &Path) {
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let tv = TimeVal::seconds(now);
    if let Err(e) = utimes(path, &tv, &tv) {
        debug!("touch {}: {}", path.display(), e);
    }
}

fn remove_path(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}

fn path_usage(path: &Path) -> Usage {
    let mut usage = Usage::default();
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(_) => return usage,
    };
    if meta.is_dir() {
        let mut stack = vec![path.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(e) => e,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                usage.inodes += 1;
                if let Ok(m) = entry.metadata() {
                    if m.is_dir() {
                        stack.push(entry.path());
                    } else {
                        usage.size += m.len() as i64;
                    }
                }
            }
        }
    } else {
        usage.inodes = 1;
        usage.size = meta.len() as i64;
    }
    usage
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmm_sys_util::tempdir::TempDir;

    fn manager(gc_period: Duration) -> (Arc<CacheManager>, TempDir) {
        let dir = TempDir::new().unwrap();
        let mgr = CacheManager::new(dir.as_path().join("cache"), gc_period, Duration::ZERO).unwrap();
        (mgr, dir)
    }

    #[test]
    fn test_blob_path_strips_algorithm() {
        let (mgr, _dir) = manager(Duration::ZERO);
        let p = mgr.blob_path("sha256:abcd");
        assert_eq!(p.file_name().unwrap().to_str().unwrap(), "abcd");
    }

    #[test]
    fn test_usage_of_file_and_dir() {
        let (mgr, _dir) = manager(Duration::ZERO);
        fs::write(mgr.blob_path("sha256:f1"), b"12345").unwrap();
        assert_eq!(mgr.usage("sha256:f1"), Usage { size: 5, inodes: 1 });

        let dir = mgr.blob_path("sha256:d1");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("layer.tar"), b"123").unwrap();
        fs::write(dir.join("layer.boot"), b"4567").unwrap();
        assert_eq!(mgr.usage("sha256:d1"), Usage { size: 7, inodes: 2 });

        assert_eq!(mgr.usage("sha256:none"), Usage::default());
    }

    #[test]
    fn test_remove_blob_is_idempotent() {
        let (mgr, _dir) = manager(Duration::ZERO);
        fs::write(mgr.blob_path("sha256:x"), b"x").unwrap();
        mgr.remove_blob("sha256:x").unwrap();
        mgr.remove_blob("sha256:x").unwrap();
        assert!(!mgr.blob_path("sha256:x").exists());
    }

    #[test]
    fn test_gc_keeps_referenced_and_inflight() {
        let (mgr, _dir) = manager(Duration::ZERO);
        fs::write(mgr.blob_path("sha256:keep"), b"k").unwrap();
        fs::write(mgr.blob_path("sha256:drop"), b"d").unwrap();
        fs::write(mgr.dir.join(".partial.dwl"), b"p").unwrap();

        let refs: HashSet<String> = ["sha256:keep".to_string()].into_iter().collect();
        mgr.gc(&refs).unwrap();

        assert!(mgr.blob_path("sha256:keep").exists());
        assert!(!mgr.blob_path("sha256:drop").exists());
        assert!(mgr.dir.join(".partial.dwl").exists());
    }

    #[test]
    fn test_gc_disabled_with_zero_period() {
        let (mgr, _dir) = manager(Duration::ZERO);
        let handles = mgr.start(Arc::new(|| Ok(HashSet::new())));
        // Only the eviction worker runs; no gc timer was scheduled.
        assert_eq!(handles.len(), 1);
        mgr.stop();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_async_evict_falls_back_after_stop() {
        let (mgr, _dir) = manager(Duration::ZERO);
        fs::write(mgr.blob_path("sha256:y"), b"y").unwrap();
        mgr.stop();
        mgr.remove_blob_async("sha256:y").unwrap();
        assert!(!mgr.blob_path("sha256:y").exists());
    }
}
