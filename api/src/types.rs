// Copyright 2022 Alibaba Cloud. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Data types shared between the snapshotter façade, the metastore and the
//! daemon supervisor.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Kind of a snapshot node in the runtime's filesystem graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotKind {
    #[default]
    Unknown,
    View,
    Active,
    Committed,
}

impl SnapshotKind {
    pub fn to_index(self) -> i64 {
        match self {
            SnapshotKind::Unknown => 0,
            SnapshotKind::View => 1,
            SnapshotKind::Active => 2,
            SnapshotKind::Committed => 3,
        }
    }

    pub fn from_index(v: i64) -> Self {
        match v {
            1 => SnapshotKind::View,
            2 => SnapshotKind::Active,
            3 => SnapshotKind::Committed,
            _ => SnapshotKind::Unknown,
        }
    }
}

impl Display for SnapshotKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let s = match self {
            SnapshotKind::Unknown => "unknown",
            SnapshotKind::View => "view",
            SnapshotKind::Active => "active",
            SnapshotKind::Committed => "committed",
        };
        write!(f, "{}", s)
    }
}

/// Caller-visible information about a snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Opaque key chosen by the runtime.
    pub name: String,
    /// Key of the parent snapshot, empty for roots.
    pub parent: String,
    pub kind: SnapshotKind,
    pub labels: HashMap<String, String>,
    /// Seconds since the unix epoch.
    pub created_at: i64,
    pub updated_at: i64,
}

impl SnapshotInfo {
    pub fn new(name: &str, parent: &str, kind: SnapshotKind, labels: HashMap<String, String>) -> Self {
        SnapshotInfo {
            name: name.to_string(),
            parent: parent.to_string(),
            kind,
            labels,
            created_at: 0,
            updated_at: 0,
        }
    }
}

/// Disk resources consumed by a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub size: i64,
    pub inodes: i64,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.size += other.size;
        self.inodes += other.inodes;
    }
}

/// Internal identity of a snapshot: the metastore-assigned id plus the id
/// chain of its ancestors, deepest ancestor last.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: u64,
    pub kind: SnapshotKind,
    /// Direct parent first.
    pub parent_ids: Vec<u64>,
}

/// Lifecycle state of a supervised FS daemon.
///
/// `Init/Ready/Running/Dead/Unknown` mirror what the daemon itself reports
/// over its admin socket; `Starting` and `Stopping` exist only on the
/// supervisor side while a transition is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DaemonState {
    Init,
    Starting,
    Ready,
    Running,
    Stopping,
    Dead,
    Unknown,
}

impl FromStr for DaemonState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "INIT" => Ok(DaemonState::Init),
            "READY" => Ok(DaemonState::Ready),
            "RUNNING" => Ok(DaemonState::Running),
            "DIED" | "DEAD" | "STOPPED" => Ok(DaemonState::Dead),
            _ => Ok(DaemonState::Unknown),
        }
    }
}

impl Display for DaemonState {
    // The daemon reports states in upper case; format ours the same way.
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", format!("{:?}", self).to_uppercase())
    }
}

/// Which kernel-facing driver a daemon serves RAFS with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsDriver {
    #[default]
    Fusedev,
    Fscache,
}

impl Display for FsDriver {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            FsDriver::Fusedev => write!(f, "fusedev"),
            FsDriver::Fscache => write!(f, "fscache"),
        }
    }
}

/// How daemons are allocated to RAFS instances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonMode {
    /// One daemon serves every instance under sub-paths of its mountpoint.
    #[default]
    Shared,
    /// One daemon per instance.
    Dedicated,
    /// No daemon at all (tarfs or plain overlay usage).
    None,
}

/// Reaction to an unexpected daemon death.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoverPolicy {
    #[default]
    Restart,
    Failover,
    None,
}

impl FromStr for RecoverPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "restart" => Ok(RecoverPolicy::Restart),
            "failover" => Ok(RecoverPolicy::Failover),
            "none" => Ok(RecoverPolicy::None),
            _ => Err(Error::invalid_argument(format!("recover policy {}", s))),
        }
    }
}

/// Persisted description of a supervised daemon, enough to re-adopt the
/// process after a snapshotter restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonRecord {
    pub id: String,
    pub pid: i32,
    pub api_socket: PathBuf,
    pub fs_driver: FsDriver,
    pub mode: DaemonMode,
    pub mountpoint: PathBuf,
    pub config_path: PathBuf,
}

/// A RAFS filesystem exported by a daemon on behalf of one snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RafsInstance {
    pub snapshot_id: String,
    pub daemon_id: String,
    pub snapshot_dir: PathBuf,
    /// Host path where the RAFS tree is visible.
    pub mountpoint: PathBuf,
    pub config_path: PathBuf,
}

/// Daemon self-description returned by the admin socket INFO request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    pub state: String,
}

impl DaemonInfo {
    pub fn state(&self) -> DaemonState {
        // FromStr above never fails.
        self.state.parse().unwrap_or(DaemonState::Unknown)
    }
}

/// Body of the admin socket MOUNT request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountRequest {
    pub source: String,
    pub fs_type: String,
    pub config: String,
}

impl MountRequest {
    pub fn rafs(bootstrap: &str, config: &str) -> Self {
        MountRequest {
            source: bootstrap.to_string(),
            fs_type: "rafs".to_string(),
            config: config.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        for kind in [
            SnapshotKind::Unknown,
            SnapshotKind::View,
            SnapshotKind::Active,
            SnapshotKind::Committed,
        ] {
            assert_eq!(SnapshotKind::from_index(kind.to_index()), kind);
        }
        assert_eq!(SnapshotKind::from_index(42), SnapshotKind::Unknown);
    }

    #[test]
    fn test_daemon_state_parse() {
        assert_eq!("RUNNING".parse::<DaemonState>().unwrap(), DaemonState::Running);
        assert_eq!("ready".parse::<DaemonState>().unwrap(), DaemonState::Ready);
        assert_eq!("DIED".parse::<DaemonState>().unwrap(), DaemonState::Dead);
        assert_eq!("whatever".parse::<DaemonState>().unwrap(), DaemonState::Unknown);
    }

    #[test]
    fn test_usage_add() {
        let mut u = Usage { size: 10, inodes: 1 };
        u.add(Usage { size: 5, inodes: 2 });
        assert_eq!(u, Usage { size: 15, inodes: 3 });
    }
}
