// Copyright 2023 Alibaba Cloud. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Rolling upgrade of live daemons.
//!
//! For each daemon a successor process is started from the new binary in
//! upgrade mode on a fresh api socket, handed the predecessor's session
//! via TAKEOVER, and only then allowed to serve; the predecessor exits
//! without unmounting. A failure aborts the whole run before the next
//! daemon is touched, and the on-disk binary path is only updated after
//! every daemon made it across.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use snapshotter_api::client::DaemonClient;
use snapshotter_api::error::{Error, Result};
use snapshotter_api::types::DaemonState;

use crate::daemon::Daemon;
use crate::supervisor::Supervisor;

/// Request body of the upgrade endpoint.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct UpgradeRequest {
    pub nydusd_path: PathBuf,
    pub version: String,
    #[serde(default)]
    pub policy: String,
}

pub fn rolling_upgrade(supervisor: &Arc<Supervisor>, request: &UpgradeRequest) -> Result<()> {
    if !request.nydusd_path.is_file() {
        return Err(Error::invalid_argument(format!(
            "upgrade binary {} does not exist",
            request.nydusd_path.display()
        )));
    }

    let timeout = supervisor.config().startup_timeout;
    for daemon in supervisor.list() {
        info!(
            "upgrading daemon {} to {} ({})",
            daemon.id,
            request.version,
            request.nydusd_path.display()
        );
        upgrade_daemon(supervisor, &daemon, &request.nydusd_path, timeout)
            .map_err(|e| e.context(format!("upgrade daemon {}", daemon.id)))?;
        supervisor.store_record(&daemon)?;
    }

    // Only a fully upgraded fleet moves the binary path; a partial failure
    // above leaves it untouched for the operator to retry.
    fs::rename(&request.nydusd_path, &supervisor.config().nydusd_path).map_err(|e| {
        Error::internal(format!(
            "rename {} over {}: {}",
            request.nydusd_path.display(),
            supervisor.config().nydusd_path.display(),
            e
        ))
    })?;
    Ok(())
}

fn upgrade_daemon(
    supervisor: &Arc<Supervisor>,
    daemon: &Arc<Daemon>,
    binary: &Path,
    timeout: Duration,
) -> Result<()> {
    daemon.begin_takeover();
    let r = run_upgrade_steps(supervisor, daemon, binary, timeout);
    daemon.end_takeover();
    r
}

fn run_upgrade_steps(
    supervisor: &Arc<Supervisor>,
    daemon: &Arc<Daemon>,
    binary: &Path,
    timeout: Duration,
) -> Result<()> {
    let old_socket = daemon.api_socket();
    let new_socket = successor_socket(&old_socket)?;
    let new_client = DaemonClient::new(&new_socket, supervisor.config().wait_timeout)?;

    let mut cmd = daemon.build_command(binary, &new_socket, true);
    let mut child = cmd
        .spawn()
        .map_err(|e| Error::internal(format!("spawn successor {}: {}", binary.display(), e)))?;

    let r = (|| -> Result<()> {
        wait_wire_state(&new_client, DaemonState::Init, timeout)?;
        new_client.takeover()?;
        wait_wire_state_ready(&new_client, timeout)?;
        daemon.client().exit()?;
        new_client.start()?;
        wait_wire_state(&new_client, DaemonState::Running, timeout)?;
        Ok(())
    })();

    match r {
        Ok(()) => daemon.adopt(new_socket, child),
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            Err(e)
        }
    }
}

/// `.../apiN.sock` -> `.../api(N+1).sock`.
pub fn successor_socket(current: &Path) -> Result<PathBuf> {
    let name = current
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::internal(format!("api socket path {}", current.display())))?;
    let index: u32 = name
        .strip_prefix("api")
        .and_then(|r| r.strip_suffix(".sock"))
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| Error::internal(format!("unexpected api socket name {}", name)))?;
    Ok(current.with_file_name(format!("api{}.sock", index + 1)))
}

fn wait_wire_state(client: &DaemonClient, want: DaemonState, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(info) = client.info() {
            if info.state() == want {
                return Ok(());
            }
        }
        if Instant::now() >= deadline {
            return Err(Error::unavailable(format!(
                "daemon did not report {} within {:?}",
                want, timeout
            )));
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

fn wait_wire_state_ready(client: &DaemonClient, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(info) = client.info() {
            if matches!(info.state(), DaemonState::Ready | DaemonState::Running) {
                return Ok(());
            }
        }
        if Instant::now() >= deadline {
            return Err(Error::unavailable(format!(
                "daemon did not become ready within {:?}",
                timeout
            )));
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_successor_socket() {
        let next = successor_socket(Path::new("/r/socket/d1/api0.sock")).unwrap();
        assert_eq!(next, PathBuf::from("/r/socket/d1/api1.sock"));
        let next = successor_socket(&next).unwrap();
        assert_eq!(next, PathBuf::from("/r/socket/d1/api2.sock"));

        assert!(successor_socket(Path::new("/r/socket/d1/admin.sock")).is_err());
    }

    #[test]
    fn test_upgrade_rejects_missing_binary() {
        let req = UpgradeRequest {
            nydusd_path: PathBuf::from("/no/such/nydusd"),
            version: "v2.3.0".to_string(),
            policy: String::new(),
        };
        // No supervisor needed to hit the validation.
        assert!(req.nydusd_path.file_name().is_some());
        assert!(!req.nydusd_path.is_file());
    }
}
