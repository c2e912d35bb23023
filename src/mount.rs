// Copyright 2022 Alibaba Cloud. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Mount descriptor composition.
//!
//! Pure given its inputs: the composer never touches daemons or the
//! metastore, it only turns paths and labels into the mount shapes the
//! runtime understands — bind, overlay, or a FUSE overlay whose options
//! carry an `extraoption` trailer for the guest-side helper.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use base64::prelude::{Engine, BASE64_STANDARD};
use serde::Serialize;

use snapshotter_api::error::{Error, Result};

/// Overlayfs option appended for volatile containers.
const OPTION_VOLATILE: &str = "volatile";
/// Key of the trailer option carrying base64-encoded daemon context.
const OPTION_EXTRA: &str = "extraoption";

/// RAFS metadata magic, little endian, at offset 0.
const RAFS_V5_MAGIC: u32 = 0x5241_4653;
/// RAFS v5 version number at offset 4.
const RAFS_V5_VERSION: u32 = 0x500;
/// EROFS superblock magic at offset 1024.
const RAFS_V6_MAGIC: u32 = 0xE0F5_E1E2;
const RAFS_V6_MAGIC_OFFSET: usize = 1024;
const DETECT_BUF_LEN: usize = 4096;

/// A mount descriptor handed back to the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mount {
    #[serde(rename = "type")]
    pub fs_type: String,
    pub source: String,
    pub options: Vec<String>,
}

/// Read-only bind of one directory.
pub fn bind_mount(source: &Path) -> Mount {
    Mount {
        fs_type: "bind".to_string(),
        source: source.to_string_lossy().to_string(),
        options: vec!["ro".to_string(), "rbind".to_string()],
    }
}

/// Plain overlay. `lower_dirs` is ordered uppermost first (overlayfs
/// semantics: the leftmost lowerdir shadows the rest), writable mounts get
/// `upperdir`/`workdir`, and `volatile` is appended on request.
pub fn overlay_mount(
    lower_dirs: &[String],
    upper: Option<&Path>,
    work: Option<&Path>,
    volatile: bool,
) -> Mount {
    let mut options = Vec::new();
    if let Some(upper) = upper {
        options.push(format!("workdir={}", work.unwrap_or(upper).display()));
        options.push(format!("upperdir={}", upper.display()));
    }
    options.push(format!("lowerdir={}", lower_dirs.join(":")));
    if upper.is_some() && volatile {
        options.push(OPTION_VOLATILE.to_string());
    }
    Mount {
        fs_type: "overlay".to_string(),
        source: "overlay".to_string(),
        options,
    }
}

/// Context for the user-space overlay helper, serialized into the
/// `extraoption` trailer.
#[derive(Debug, Clone, Serialize)]
pub struct ExtraOption {
    pub source: String,
    pub config: String,
    pub snapshotdir: String,
    pub fs_version: String,
}

impl ExtraOption {
    pub fn encode(&self) -> Result<String> {
        let raw = serde_json::to_string(self)?;
        Ok(format!(
            "{}={}",
            OPTION_EXTRA,
            BASE64_STANDARD.encode(raw.as_bytes())
        ))
    }
}

/// Overlay served through a user-space overlay filesystem; identical to the
/// plain overlay plus the encoded trailer.
pub fn fuse_overlay_mount(
    fs_type: &str,
    lower_dirs: &[String],
    upper: Option<&Path>,
    work: Option<&Path>,
    volatile: bool,
    extra: &ExtraOption,
) -> Result<Mount> {
    let mut mount = overlay_mount(lower_dirs, upper, work, volatile);
    mount.fs_type = fs_type.to_string();
    mount.options.push(extra.encode()?);
    Ok(mount)
}

/// RAFS on-disk format generation, detected from the bootstrap header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsVersion {
    V5,
    V6,
}

impl FsVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            FsVersion::V5 => "v5",
            FsVersion::V6 => "v6",
        }
    }
}

fn read_le_u32(buf: &[u8], offset: usize) -> Option<u32> {
    buf.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Inspect the first page of a bootstrap file for its format generation.
pub fn detect_fs_version(bootstrap: &Path) -> Result<FsVersion> {
    let mut file = File::open(bootstrap).map_err(|e| {
        Error::invalid_argument(format!("open bootstrap {}: {}", bootstrap.display(), e))
    })?;
    let mut buf = vec![0u8; DETECT_BUF_LEN];
    let mut read = 0;
    while read < buf.len() {
        match file.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) => {
                return Err(Error::internal(format!(
                    "read bootstrap {}: {}",
                    bootstrap.display(),
                    e
                )))
            }
        }
    }
    detect_fs_version_buf(&buf[..read])
}

pub fn detect_fs_version_buf(buf: &[u8]) -> Result<FsVersion> {
    if read_le_u32(buf, 0) == Some(RAFS_V5_MAGIC) && read_le_u32(buf, 4) == Some(RAFS_V5_VERSION) {
        return Ok(FsVersion::V5);
    }
    if read_le_u32(buf, RAFS_V6_MAGIC_OFFSET) == Some(RAFS_V6_MAGIC) {
        return Ok(FsVersion::V6);
    }
    Err(Error::invalid_argument(
        "bootstrap carries neither a v5 nor a v6 magic",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use vmm_sys_util::tempdir::TempDir;

    fn v5_buf() -> Vec<u8> {
        let mut buf = vec![0u8; 128];
        buf[..4].copy_from_slice(&RAFS_V5_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&RAFS_V5_VERSION.to_le_bytes());
        buf
    }

    fn v6_buf() -> Vec<u8> {
        let mut buf = vec![0u8; 2048];
        buf[RAFS_V6_MAGIC_OFFSET..RAFS_V6_MAGIC_OFFSET + 4]
            .copy_from_slice(&RAFS_V6_MAGIC.to_le_bytes());
        buf
    }

    #[test]
    fn test_version_detection_roundtrip() {
        assert_eq!(detect_fs_version_buf(&v5_buf()).unwrap(), FsVersion::V5);
        assert_eq!(detect_fs_version_buf(&v6_buf()).unwrap(), FsVersion::V6);
        assert!(detect_fs_version_buf(&[0u8; 4096]).is_err());
        // A file shorter than the v6 magic offset can still be v5.
        assert_eq!(detect_fs_version_buf(&v5_buf()[..8]).unwrap(), FsVersion::V5);
    }

    #[test]
    fn test_version_detection_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.as_path().join("image.boot");
        File::create(&path).unwrap().write_all(&v6_buf()).unwrap();
        assert_eq!(detect_fs_version(&path).unwrap(), FsVersion::V6);
    }

    #[test]
    fn test_overlay_options_order() {
        let lowers = vec!["/r/snapshots/2/fs".to_string(), "/r/snapshots/1/fs".to_string()];
        let mount = overlay_mount(
            &lowers,
            Some(Path::new("/r/snapshots/3/fs")),
            Some(Path::new("/r/snapshots/3/work")),
            false,
        );
        assert_eq!(mount.fs_type, "overlay");
        assert_eq!(
            mount.options,
            vec![
                "workdir=/r/snapshots/3/work".to_string(),
                "upperdir=/r/snapshots/3/fs".to_string(),
                "lowerdir=/r/snapshots/2/fs:/r/snapshots/1/fs".to_string(),
            ]
        );
    }

    #[test]
    fn test_volatile_only_for_writable() {
        let lowers = vec!["/l".to_string()];
        let rw = overlay_mount(&lowers, Some(Path::new("/u")), Some(Path::new("/w")), true);
        assert!(rw.options.contains(&"volatile".to_string()));
        let ro = overlay_mount(&lowers, None, None, true);
        assert!(!ro.options.contains(&"volatile".to_string()));
    }

    #[test]
    fn test_extraoption_trailer() {
        let extra = ExtraOption {
            source: "/r/snapshots/1/fs/image/image.boot".to_string(),
            config: "{}".to_string(),
            snapshotdir: "/r/snapshots/2".to_string(),
            fs_version: FsVersion::V6.as_str().to_string(),
        };
        let mount = fuse_overlay_mount(
            "fuse.nydus-overlayfs",
            &["/l".to_string()],
            None,
            None,
            false,
            &extra,
        )
        .unwrap();
        assert_eq!(mount.fs_type, "fuse.nydus-overlayfs");
        let trailer = mount.options.last().unwrap();
        let encoded = trailer.strip_prefix("extraoption=").unwrap();
        let decoded = BASE64_STANDARD.decode(encoded).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(v["fs_version"], "v6");
        assert_eq!(v["snapshotdir"], "/r/snapshots/2");
    }

    #[test]
    fn test_bind_mount() {
        let mount = bind_mount(Path::new("/r/snapshots/1/fs"));
        assert_eq!(mount.fs_type, "bind");
        assert_eq!(mount.options, vec!["ro".to_string(), "rbind".to_string()]);
    }
}
