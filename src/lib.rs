// Copyright 2022 Alibaba Cloud. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Remote snapshotter for Nydus (RAFS) container images.
//!
//! Instead of unpacking every layer, image layers are materialized by
//! user-space FS daemons serving content-addressed RAFS data on demand;
//! the runtime receives overlay mounts whose lowest layer is the daemon's
//! export. This crate ties together the snapshot metastore, the daemon
//! supervisor, the blob cache and the mount composer behind the runtime's
//! snapshot lifecycle operations.

#[macro_use]
extern crate log;

pub mod config;
pub mod filesystem;
pub mod metrics;
pub mod mount;
pub mod rafs;
pub mod snapshotter;
pub mod system;
pub mod volume;

pub use config::SnapshotterConfig;
pub use snapshotter::Snapshotter;
pub use system::SystemController;

pub use snapshotter_api::error::{Error, Result};
