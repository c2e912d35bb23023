// Copyright 2022 Alibaba Cloud. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Supervision of FS daemon subprocesses: spawning, state tracking,
//! reference-counted ownership, crash recovery and rolling upgrades.

#[macro_use]
extern crate log;

pub mod daemon;
pub mod supervisor;
pub mod upgrade;

pub use daemon::{Daemon, DaemonOptions};
pub use supervisor::{DaemonExport, Supervisor, SupervisorConfig, SHARED_DAEMON_ID};
pub use upgrade::{rolling_upgrade, UpgradeRequest};
