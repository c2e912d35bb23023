// Copyright 2022 Alibaba Cloud. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Transactional snapshot metastore.
//!
//! One SQLite database under the snapshotter root holds the authoritative
//! snapshot graph plus the supervisor's persisted daemon and instance
//! records. All access goes through [`MetaStore::view`] or
//! [`MetaStore::update`]; an error from the closure rolls the transaction
//! back. The store-wide lock serializes writers, which is also what the
//! underlying database would enforce.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension, Transaction};

use snapshotter_api::error::{Error, Result};
use snapshotter_api::types::{
    DaemonRecord, RafsInstance, Snapshot, SnapshotInfo, SnapshotKind, Usage,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL UNIQUE,
    parent TEXT NOT NULL DEFAULT '',
    kind INTEGER NOT NULL,
    labels TEXT NOT NULL DEFAULT '{}',
    size INTEGER NOT NULL DEFAULT 0,
    inodes INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_snapshots_parent ON snapshots (parent);
CREATE TABLE IF NOT EXISTS daemons (
    id TEXT PRIMARY KEY,
    record TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS instances (
    snapshot_id TEXT PRIMARY KEY,
    record TEXT NOT NULL
);
"#;

fn db_err(e: rusqlite::Error) -> Error {
    Error::internal(format!("metastore: {}", e))
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub struct MetaStore {
    conn: Mutex<Option<Connection>>,
}

impl MetaStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(db_err)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(MetaStore {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn with_tx<T>(&self, write: bool, f: impl FnOnce(&SnapshotTx) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock().unwrap();
        let conn = guard
            .as_mut()
            .ok_or_else(|| Error::internal("metastore is closed"))?;
        let tx = conn.transaction().map_err(db_err)?;
        let r = f(&SnapshotTx { tx: &tx });
        match r {
            Ok(v) => {
                if write {
                    tx.commit().map_err(db_err)?;
                }
                // Read-only transactions roll back on drop; nothing changed.
                Ok(v)
            }
            Err(e) => Err(e),
        }
    }

    /// Run `f` inside a read-only transaction.
    pub fn view<T>(&self, f: impl FnOnce(&SnapshotTx) -> Result<T>) -> Result<T> {
        self.with_tx(false, f)
    }

    /// Run `f` inside a read-write transaction, committing on success and
    /// rolling back on any error.
    pub fn update<T>(&self, f: impl FnOnce(&SnapshotTx) -> Result<T>) -> Result<T> {
        self.with_tx(true, f)
    }

    pub fn close(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap().take();
        if let Some(c) = conn {
            c.close().map_err(|(_, e)| db_err(e))?;
        }
        Ok(())
    }

    // Daemon and instance records live outside the snapshot transaction
    // shape: the supervisor updates them on its own cadence.

    pub fn add_daemon(&self, record: &DaemonRecord) -> Result<()> {
        let blob = serde_json::to_string(record)?;
        self.update(|tx| {
            tx.tx
                .execute(
                    "INSERT OR REPLACE INTO daemons (id, record) VALUES (?1, ?2)",
                    params![record.id, blob],
                )
                .map_err(db_err)?;
            Ok(())
        })
    }

    pub fn remove_daemon(&self, id: &str) -> Result<()> {
        self.update(|tx| {
            tx.tx
                .execute("DELETE FROM daemons WHERE id = ?1", params![id])
                .map_err(db_err)?;
            Ok(())
        })
    }

    pub fn list_daemons(&self) -> Result<Vec<DaemonRecord>> {
        self.view(|tx| {
            let mut stmt = tx
                .tx
                .prepare("SELECT record FROM daemons")
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(db_err)?;
            let mut out = Vec::new();
            for blob in rows {
                let blob = blob.map_err(db_err)?;
                out.push(serde_json::from_str(&blob)?);
            }
            Ok(out)
        })
    }

    pub fn add_instance(&self, record: &RafsInstance) -> Result<()> {
        let blob = serde_json::to_string(record)?;
        self.update(|tx| {
            tx.tx
                .execute(
                    "INSERT OR REPLACE INTO instances (snapshot_id, record) VALUES (?1, ?2)",
                    params![record.snapshot_id, blob],
                )
                .map_err(db_err)?;
            Ok(())
        })
    }

    pub fn remove_instance(&self, snapshot_id: &str) -> Result<()> {
        self.update(|tx| {
            tx.tx
                .execute(
                    "DELETE FROM instances WHERE snapshot_id = ?1",
                    params![snapshot_id],
                )
                .map_err(db_err)?;
            Ok(())
        })
    }

    pub fn list_instances(&self) -> Result<Vec<RafsInstance>> {
        self.view(|tx| {
            let mut stmt = tx
                .tx
                .prepare("SELECT record FROM instances")
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(db_err)?;
            let mut out = Vec::new();
            for blob in rows {
                let blob = blob.map_err(db_err)?;
                out.push(serde_json::from_str(&blob)?);
            }
            Ok(out)
        })
    }
}

/// Snapshot operations available inside a metastore transaction.
pub struct SnapshotTx<'a> {
    tx: &'a Transaction<'a>,
}

struct Row {
    id: u64,
    info: SnapshotInfo,
    usage: Usage,
}

impl<'a> SnapshotTx<'a> {
    fn row_by_key(&self, key: &str) -> Result<Option<Row>> {
        self.tx
            .query_row(
                "SELECT id, key, parent, kind, labels, size, inodes, created_at, updated_at \
                 FROM snapshots WHERE key = ?1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, i64>(8)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?
            .map(|(id, name, parent, kind, labels, size, inodes, created_at, updated_at)| -> Result<Row> {
                let labels: HashMap<String, String> = serde_json::from_str(&labels)?;
                Ok(Row {
                    id: id as u64,
                    info: SnapshotInfo {
                        name,
                        parent,
                        kind: SnapshotKind::from_index(kind),
                        labels,
                        created_at,
                        updated_at,
                    },
                    usage: Usage { size, inodes },
                })
            })
            .transpose()
    }

    fn must_row(&self, key: &str) -> Result<Row> {
        self.row_by_key(key)?
            .ok_or_else(|| Error::not_found(format!("snapshot {}", key)))
    }

    /// Look up `(id, info)` for a snapshot key.
    pub fn get_info(&self, key: &str) -> Result<(u64, SnapshotInfo)> {
        let row = self.must_row(key)?;
        Ok((row.id, row.info))
    }

    /// Look up the stored usage for a snapshot key.
    pub fn get_usage(&self, key: &str) -> Result<Usage> {
        Ok(self.must_row(key)?.usage)
    }

    /// Insert a snapshot and return its identity. The parent, when given,
    /// must exist and be committed.
    pub fn create_snapshot(
        &self,
        kind: SnapshotKind,
        key: &str,
        parent: &str,
        labels: &HashMap<String, String>,
    ) -> Result<Snapshot> {
        if !matches!(kind, SnapshotKind::Active | SnapshotKind::View) {
            return Err(Error::invalid_argument(format!(
                "snapshot kind {} cannot be created",
                kind
            )));
        }
        if self.row_by_key(key)?.is_some() {
            return Err(Error::already_exists(format!("snapshot {}", key)));
        }

        let mut parent_ids = Vec::new();
        if !parent.is_empty() {
            let prow = self
                .row_by_key(parent)?
                .ok_or_else(|| Error::not_found(format!("parent snapshot {}", parent)))?;
            if prow.info.kind != SnapshotKind::Committed {
                return Err(Error::failed_precondition(format!(
                    "parent snapshot {} is {}, not committed",
                    parent, prow.info.kind
                )));
            }
            parent_ids.push(prow.id);
            parent_ids.extend(self.ancestor_ids(&prow.info.parent)?);
        }

        let now = now_secs();
        let labels = serde_json::to_string(labels)?;
        self.tx
            .execute(
                "INSERT INTO snapshots (key, parent, kind, labels, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![key, parent, kind.to_index(), labels, now],
            )
            .map_err(db_err)?;
        let id = self.tx.last_insert_rowid() as u64;

        Ok(Snapshot {
            id,
            kind,
            parent_ids,
        })
    }

    /// Ids of every ancestor of `key`, direct parent first.
    pub fn parent_ids(&self, key: &str) -> Result<Vec<u64>> {
        let row = self.must_row(key)?;
        self.ancestor_ids(&row.info.parent)
    }

    fn ancestor_ids(&self, start: &str) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        let mut key = start.to_string();
        while !key.is_empty() {
            let row = self
                .row_by_key(&key)?
                .ok_or_else(|| Error::internal(format!("broken parent chain at {}", key)))?;
            ids.push(row.id);
            key = row.info.parent;
        }
        Ok(ids)
    }

    /// Turn the active snapshot `key` into the committed snapshot `name`.
    pub fn commit_active(&self, key: &str, name: &str, usage: Usage) -> Result<u64> {
        let row = self.must_row(key)?;
        if row.info.kind != SnapshotKind::Active {
            return Err(Error::failed_precondition(format!(
                "snapshot {} is {}, not active",
                key, row.info.kind
            )));
        }
        if self.row_by_key(name)?.is_some() {
            return Err(Error::already_exists(format!("snapshot {}", name)));
        }
        self.tx
            .execute(
                "UPDATE snapshots SET key = ?1, kind = ?2, size = ?3, inodes = ?4, updated_at = ?5 \
                 WHERE id = ?6",
                params![
                    name,
                    SnapshotKind::Committed.to_index(),
                    usage.size,
                    usage.inodes,
                    now_secs(),
                    row.id as i64
                ],
            )
            .map_err(db_err)?;
        Ok(row.id)
    }

    /// Delete a snapshot. Fails while children reference it.
    pub fn remove(&self, key: &str) -> Result<(u64, SnapshotKind)> {
        let row = self.must_row(key)?;
        let children: i64 = self
            .tx
            .query_row(
                "SELECT COUNT(*) FROM snapshots WHERE parent = ?1",
                params![key],
                |r| r.get(0),
            )
            .map_err(db_err)?;
        if children > 0 {
            return Err(Error::failed_precondition(format!(
                "snapshot {} has {} children",
                key, children
            )));
        }
        self.tx
            .execute("DELETE FROM snapshots WHERE id = ?1", params![row.id as i64])
            .map_err(db_err)?;
        Ok((row.id, row.info.kind))
    }

    /// Apply a sparse update to mutable fields. With no field paths the
    /// labels are replaced wholesale; `labels` and `labels.<key>` paths are
    /// honored, anything else is rejected.
    pub fn update_info(&self, info: &SnapshotInfo, fieldpaths: &[String]) -> Result<SnapshotInfo> {
        let row = self.must_row(&info.name)?;
        let mut labels = row.info.labels.clone();

        if fieldpaths.is_empty() {
            labels = info.labels.clone();
        } else {
            for path in fieldpaths {
                if path == "labels" {
                    labels = info.labels.clone();
                } else if let Some(k) = path.strip_prefix("labels.") {
                    match info.labels.get(k) {
                        Some(v) => {
                            labels.insert(k.to_string(), v.clone());
                        }
                        None => {
                            labels.remove(k);
                        }
                    }
                } else {
                    return Err(Error::invalid_argument(format!(
                        "cannot update field {}",
                        path
                    )));
                }
            }
        }

        let now = now_secs();
        let blob = serde_json::to_string(&labels)?;
        self.tx
            .execute(
                "UPDATE snapshots SET labels = ?1, updated_at = ?2 WHERE id = ?3",
                params![blob, now, row.id as i64],
            )
            .map_err(db_err)?;

        let mut out = row.info;
        out.labels = labels;
        out.updated_at = now;
        Ok(out)
    }

    /// Invoke `f` on every snapshot. Callback errors are logged and the walk
    /// continues.
    pub fn walk(&self, mut f: impl FnMut(u64, &SnapshotInfo, Usage) -> Result<()>) -> Result<()> {
        let mut stmt = self
            .tx
            .prepare(
                "SELECT id, key, parent, kind, labels, size, inodes, created_at, updated_at \
                 FROM snapshots ORDER BY id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, i64>(8)?,
                ))
            })
            .map_err(db_err)?;

        for row in rows {
            let (id, name, parent, kind, labels, size, inodes, created_at, updated_at) =
                row.map_err(db_err)?;
            let labels: HashMap<String, String> = serde_json::from_str(&labels)?;
            let info = SnapshotInfo {
                name,
                parent,
                kind: SnapshotKind::from_index(kind),
                labels,
                created_at,
                updated_at,
            };
            if let Err(e) = f(id as u64, &info, Usage { size, inodes }) {
                debug!("walk callback failed on {}: {}", info.name, e);
            }
        }
        Ok(())
    }

    /// The set of ids of live snapshots; directories whose name is not in
    /// this set are orphans.
    pub fn id_map(&self) -> Result<HashSet<u64>> {
        let mut stmt = self
            .tx
            .prepare("SELECT id FROM snapshots")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, i64>(0))
            .map_err(db_err)?;
        let mut out = HashSet::new();
        for id in rows {
            out.insert(id.map_err(db_err)? as u64);
        }
        Ok(out)
    }

    /// The full ancestor chain of `key` (excluding `key` itself), direct
    /// parent first.
    pub fn parents(&self, key: &str) -> Result<Vec<(u64, SnapshotInfo)>> {
        let mut out = Vec::new();
        let mut current = self.must_row(key)?.info.parent;
        while !current.is_empty() {
            let row = self
                .row_by_key(&current)?
                .ok_or_else(|| Error::internal(format!("broken parent chain at {}", current)))?;
            current = row.info.parent.clone();
            out.push((row.id, row.info));
        }
        Ok(out)
    }

    /// Walk the parent chain of `key` (excluding `key` itself) until
    /// `pred` matches, returning the matched snapshot.
    pub fn iterate_parents(
        &self,
        key: &str,
        pred: impl Fn(&SnapshotInfo) -> bool,
    ) -> Result<Option<(u64, SnapshotInfo)>> {
        let mut current = self.must_row(key)?.info.parent;
        while !current.is_empty() {
            let row = self
                .row_by_key(&current)?
                .ok_or_else(|| Error::internal(format!("broken parent chain at {}", current)))?;
            if pred(&row.info) {
                return Ok(Some((row.id, row.info)));
            }
            current = row.info.parent;
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapshotter_api::label;
    use vmm_sys_util::tempdir::TempDir;

    fn store() -> (MetaStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::new(dir.as_path().join("metadata.db")).unwrap();
        (store, dir)
    }

    fn no_labels() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn test_create_and_stat() {
        let (store, _dir) = store();
        let snap = store
            .update(|tx| tx.create_snapshot(SnapshotKind::Active, "k1", "", &no_labels()))
            .unwrap();
        assert!(snap.parent_ids.is_empty());

        let (id, info) = store.view(|tx| tx.get_info("k1")).unwrap();
        assert_eq!(id, snap.id);
        assert_eq!(info.kind, SnapshotKind::Active);
        assert!(info.created_at > 0);

        let err = store.view(|tx| tx.get_info("missing")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_duplicate_create() {
        let (store, _dir) = store();
        store
            .update(|tx| tx.create_snapshot(SnapshotKind::Active, "k1", "", &no_labels()))
            .unwrap();
        let err = store
            .update(|tx| tx.create_snapshot(SnapshotKind::Active, "k1", "", &no_labels()))
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn test_parent_must_be_committed() {
        let (store, _dir) = store();
        store
            .update(|tx| tx.create_snapshot(SnapshotKind::Active, "a1", "", &no_labels()))
            .unwrap();
        let err = store
            .update(|tx| tx.create_snapshot(SnapshotKind::Active, "c1", "a1", &no_labels()))
            .unwrap_err();
        assert!(matches!(err, Error::FailedPrecondition(_)));

        let err = store
            .update(|tx| tx.create_snapshot(SnapshotKind::Active, "c1", "nope", &no_labels()))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_commit_and_parent_chain() {
        let (store, _dir) = store();
        store
            .update(|tx| {
                tx.create_snapshot(SnapshotKind::Active, "l1-active", "", &no_labels())?;
                tx.commit_active("l1-active", "l1", Usage { size: 7, inodes: 2 })
            })
            .unwrap();
        store
            .update(|tx| {
                tx.create_snapshot(SnapshotKind::Active, "l2-active", "l1", &no_labels())?;
                tx.commit_active("l2-active", "l2", Usage::default())
            })
            .unwrap();
        let snap = store
            .update(|tx| tx.create_snapshot(SnapshotKind::Active, "c1", "l2", &no_labels()))
            .unwrap();
        assert_eq!(snap.parent_ids.len(), 2);

        let usage = store.view(|tx| tx.get_usage("l1")).unwrap();
        assert_eq!(usage, Usage { size: 7, inodes: 2 });

        // Committing a committed snapshot must be refused.
        let err = store
            .update(|tx| tx.commit_active("l1", "l1-again", Usage::default()))
            .unwrap_err();
        assert!(matches!(err, Error::FailedPrecondition(_)));
    }

    #[test]
    fn test_remove_with_children() {
        let (store, _dir) = store();
        store
            .update(|tx| {
                tx.create_snapshot(SnapshotKind::Active, "p-active", "", &no_labels())?;
                tx.commit_active("p-active", "p", Usage::default())?;
                tx.create_snapshot(SnapshotKind::Active, "c", "p", &no_labels())
            })
            .unwrap();

        let err = store.update(|tx| tx.remove("p")).unwrap_err();
        assert!(matches!(err, Error::FailedPrecondition(_)));

        store.update(|tx| tx.remove("c")).unwrap();
        let (_, kind) = store.update(|tx| tx.remove("p")).unwrap();
        assert_eq!(kind, SnapshotKind::Committed);
    }

    #[test]
    fn test_rollback_on_error() {
        let (store, _dir) = store();
        let r: Result<()> = store.update(|tx| {
            tx.create_snapshot(SnapshotKind::Active, "gone", "", &no_labels())?;
            Err(Error::internal("boom"))
        });
        assert!(r.is_err());
        assert!(store.view(|tx| tx.get_info("gone")).unwrap_err().is_not_found());
    }

    #[test]
    fn test_iterate_parents() {
        let (store, _dir) = store();
        let mut labels = no_labels();
        labels.insert(label::NYDUS_META_LAYER.to_string(), "true".to_string());
        store
            .update(|tx| {
                tx.create_snapshot(SnapshotKind::Active, "m-active", "", &labels)?;
                tx.commit_active("m-active", "meta", Usage::default())?;
                tx.create_snapshot(SnapshotKind::Active, "c1", "meta", &no_labels())
            })
            .unwrap();

        let hit = store
            .view(|tx| tx.iterate_parents("c1", |info| label::is_nydus_meta_layer(&info.labels)))
            .unwrap();
        assert_eq!(hit.unwrap().1.name, "meta");

        let miss = store
            .view(|tx| tx.iterate_parents("meta", |info| label::is_nydus_meta_layer(&info.labels)))
            .unwrap();
        assert!(miss.is_none());
    }

    #[test]
    fn test_update_labels() {
        let (store, _dir) = store();
        store
            .update(|tx| tx.create_snapshot(SnapshotKind::Active, "k", "", &no_labels()))
            .unwrap();

        let mut info = SnapshotInfo::new("k", "", SnapshotKind::Active, no_labels());
        info.labels.insert("a".to_string(), "1".to_string());
        let out = store
            .update(|tx| tx.update_info(&info, &["labels.a".to_string()]))
            .unwrap();
        assert_eq!(out.labels.get("a").map(String::as_str), Some("1"));

        let err = store
            .update(|tx| tx.update_info(&info, &["kind".to_string()]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_id_map_and_walk() {
        let (store, _dir) = store();
        store
            .update(|tx| {
                tx.create_snapshot(SnapshotKind::Active, "a", "", &no_labels())?;
                tx.create_snapshot(SnapshotKind::Active, "b", "", &no_labels())
            })
            .unwrap();
        let ids = store.view(|tx| tx.id_map()).unwrap();
        assert_eq!(ids.len(), 2);

        let mut seen = Vec::new();
        store
            .view(|tx| {
                tx.walk(|id, info, _| {
                    seen.push((id, info.name.clone()));
                    // Callback errors do not stop the walk.
                    Err(Error::internal("ignored"))
                })
            })
            .unwrap();
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_daemon_and_instance_records() {
        let (store, _dir) = store();
        let rec = DaemonRecord {
            id: "d1".to_string(),
            pid: 4242,
            api_socket: "/run/d1/api0.sock".into(),
            fs_driver: Default::default(),
            mode: Default::default(),
            mountpoint: "/mnt".into(),
            config_path: "/cfg/d1.json".into(),
        };
        store.add_daemon(&rec).unwrap();
        assert_eq!(store.list_daemons().unwrap().len(), 1);
        store.remove_daemon("d1").unwrap();
        assert!(store.list_daemons().unwrap().is_empty());

        let inst = RafsInstance {
            snapshot_id: "7".to_string(),
            daemon_id: "d1".to_string(),
            snapshot_dir: "/snapshots/7".into(),
            mountpoint: "/mnt/7".into(),
            config_path: "/cfg/d1.json".into(),
        };
        store.add_instance(&inst).unwrap();
        assert_eq!(store.list_instances().unwrap().len(), 1);
        store.remove_instance("7").unwrap();
        assert!(store.list_instances().unwrap().is_empty());
    }
}
