// Copyright 2023 Alibaba Cloud. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Kata virtual volume descriptors.
//!
//! A typed, self-describing mount-option trailer consumed by the guest
//! agent. The snapshotter only builds and validates these; interpretation
//! happens inside the guest.

use std::collections::HashMap;

use base64::prelude::{Engine, BASE64_STANDARD};
use serde::{Deserialize, Serialize};

use snapshotter_api::error::{Error, Result};

/// Mount option key carrying the encoded volume.
pub const KATA_VOLUME_OPTION: &str = "io.katacontainers.volume";

pub const TYPE_DIRECT_BLOCK: &str = "direct_block";
pub const TYPE_IMAGE_RAW_BLOCK: &str = "image_raw_block";
pub const TYPE_IMAGE_NYDUS_BLOCK: &str = "image_nydus_block";
pub const TYPE_IMAGE_NYDUS_FS: &str = "image_nydus_fs";
pub const TYPE_IMAGE_GUEST_PULL: &str = "image_guest_pull";

const HASH_TYPES: [(&str, usize); 2] = [("sha256", 64), ("sha1", 40)];
const MIN_BLOCK_SIZE: u64 = 1 << 9;
const MAX_BLOCK_SIZE: u64 = 1 << 19;

/// dm-verity description of a block volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmVerityInfo {
    pub hashtype: String,
    pub hash: String,
    pub blocknum: u64,
    pub blocksize: u64,
    pub hashsize: u64,
    pub offset: u64,
}

impl DmVerityInfo {
    pub fn validate(&self) -> Result<()> {
        let hash_len = HASH_TYPES
            .iter()
            .find(|(name, _)| *name == self.hashtype.as_str())
            .map(|(_, len)| *len)
            .ok_or_else(|| {
                Error::invalid_argument(format!("dm-verity hash type {}", self.hashtype))
            })?;
        if self.hash.len() != hash_len || hex::decode(&self.hash).is_err() {
            return Err(Error::invalid_argument(format!(
                "dm-verity hash {} is not a {} digest",
                self.hash, self.hashtype
            )));
        }
        if self.blocknum == 0 {
            return Err(Error::invalid_argument("dm-verity data block count is zero"));
        }
        for (name, value) in [("data", self.blocksize), ("hash", self.hashsize)] {
            if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&value) || !value.is_power_of_two() {
                return Err(Error::invalid_argument(format!(
                    "dm-verity {} block size {}",
                    name, value
                )));
            }
        }
        if self.offset % self.hashsize != 0 {
            return Err(Error::invalid_argument(format!(
                "dm-verity hash offset {} is not aligned to {}",
                self.offset, self.hashsize
            )));
        }
        if self.offset < self.blocksize * self.blocknum {
            return Err(Error::invalid_argument(format!(
                "dm-verity hash offset {} overlaps data ({} blocks of {})",
                self.offset, self.blocknum, self.blocksize
            )));
        }
        Ok(())
    }
}

/// Metadata for volumes pulled inside the guest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePullVolume {
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KataVirtualVolume {
    pub volume_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fs_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dm_verity: Option<DmVerityInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull: Option<ImagePullVolume>,
}

impl KataVirtualVolume {
    pub fn new_fs(volume_type: &str, source: &str, fs_type: &str) -> Self {
        KataVirtualVolume {
            volume_type: volume_type.to_string(),
            source: source.to_string(),
            fs_type: fs_type.to_string(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.volume_type.as_str() {
            TYPE_DIRECT_BLOCK | TYPE_IMAGE_RAW_BLOCK | TYPE_IMAGE_NYDUS_BLOCK
            | TYPE_IMAGE_NYDUS_FS => {
                if self.source.is_empty() {
                    return Err(Error::invalid_argument(format!(
                        "kata volume {} has no source",
                        self.volume_type
                    )));
                }
            }
            TYPE_IMAGE_GUEST_PULL => {
                if self.image_pull.is_none() {
                    return Err(Error::invalid_argument(
                        "kata guest-pull volume has no image metadata",
                    ));
                }
            }
            other => {
                return Err(Error::invalid_argument(format!(
                    "kata volume type {}",
                    other
                )))
            }
        }
        if let Some(verity) = &self.dm_verity {
            verity.validate()?;
        }
        Ok(())
    }

    /// Serialize into the mount-option trailer.
    pub fn to_option(&self) -> Result<String> {
        self.validate()?;
        let raw = serde_json::to_string(self)?;
        Ok(format!(
            "{}={}",
            KATA_VOLUME_OPTION,
            BASE64_STANDARD.encode(raw.as_bytes())
        ))
    }

    pub fn from_option(option: &str) -> Result<Self> {
        let encoded = option
            .strip_prefix(KATA_VOLUME_OPTION)
            .and_then(|r| r.strip_prefix('='))
            .ok_or_else(|| Error::invalid_argument("not a kata volume option"))?;
        let raw = BASE64_STANDARD
            .decode(encoded)
            .map_err(|e| Error::invalid_argument(format!("kata volume encoding: {}", e)))?;
        let volume: KataVirtualVolume = serde_json::from_slice(&raw)
            .map_err(|e| Error::invalid_argument(format!("kata volume json: {}", e)))?;
        volume.validate()?;
        Ok(volume)
    }
}
