// Copyright 2022 Alibaba Cloud. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Persistent state for the Nydus snapshotter: the transactional snapshot
//! metastore and the local blob cache.

#[macro_use]
extern crate log;

pub mod cache;
pub mod meta;
pub mod referrer;

pub use cache::CacheManager;
pub use meta::{MetaStore, SnapshotTx};
pub use referrer::ReferrerDetector;
