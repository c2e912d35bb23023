// Copyright 2022 Alibaba Cloud. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Shared data types, error kinds, daemon configuration documents and the
//! FS daemon admin-socket client for the Nydus snapshotter workspace.

#[macro_use]
extern crate log;

pub mod client;
pub mod config;
pub mod error;
pub mod label;
pub mod types;

pub use error::{Error, Result};
