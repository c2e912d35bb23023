// Copyright 2022 Alibaba Cloud. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Well-known snapshot labels and layer classification.
//!
//! The runtime annotates snapshots with labels; everything the snapshotter
//! knows about a layer is derived, read-only, from them.

use std::collections::HashMap;

/// The runtime wants Prepare to commit this snapshot under the given name
/// and answer "already exists" instead of returning mounts.
pub const TARGET_SNAPSHOT_REF: &str = "containerd.io/snapshot.ref";
/// The layer carries the RAFS bootstrap.
pub const NYDUS_META_LAYER: &str = "containerd.io/snapshot/nydus-bootstrap";
/// The layer carries RAFS blob data and is never unpacked.
pub const NYDUS_DATA_LAYER: &str = "containerd.io/snapshot/nydus-blob";
/// The layer belongs to an image with an associated referrer image.
pub const NYDUS_REF_LAYER: &str = "containerd.io/snapshot/nydus-ref";
/// Manifest digest of the referrer image, set next to [`NYDUS_REF_LAYER`].
pub const NYDUS_REF_DIGEST: &str = "containerd.io/snapshot/nydus-ref/digest";
/// The layer is an eStargz layer, served remotely without conversion.
pub const STARGZ_LAYER: &str = "containerd.io/snapshot/remote/stargz.reference";
/// The layer has been converted to an EROFS image backed by a loop device.
pub const TARFS_LAYER: &str = "containerd.io/snapshot/nydus-tarfs";
/// Ask for the `volatile` overlayfs option on the writable mount.
pub const OVERLAY_VOLATILE: &str = "containerd.io/snapshot/overlay.volatile";
/// Digest of the compressed layer blob.
pub const CRI_LAYER_DIGEST: &str = "containerd.io/snapshot/cri.layer-digest";
/// Image reference the layer belongs to.
pub const CRI_IMAGE_REF: &str = "containerd.io/snapshot/cri.image-ref";
/// Digest of the image manifest the layer belongs to.
pub const CRI_MANIFEST_DIGEST: &str = "containerd.io/snapshot/cri.manifest-digest";

pub type Labels = HashMap<String, String>;

pub fn is_nydus_meta_layer(labels: &Labels) -> bool {
    labels.contains_key(NYDUS_META_LAYER)
}

pub fn is_nydus_data_layer(labels: &Labels) -> bool {
    labels.contains_key(NYDUS_DATA_LAYER)
}

pub fn is_stargz_layer(labels: &Labels) -> bool {
    labels.contains_key(STARGZ_LAYER)
}

pub fn is_tarfs_layer(labels: &Labels) -> bool {
    labels.contains_key(TARFS_LAYER)
}

pub fn is_volatile(labels: &Labels) -> bool {
    labels.contains_key(OVERLAY_VOLATILE)
}

/// The target name Prepare is asked to commit the snapshot under, if any.
pub fn target_ref(labels: &Labels) -> Option<&str> {
    labels.get(TARGET_SNAPSHOT_REF).map(|s| s.as_str())
}

pub fn layer_digest(labels: &Labels) -> Option<&str> {
    labels.get(CRI_LAYER_DIGEST).map(|s| s.as_str())
}

pub fn image_ref(labels: &Labels) -> Option<&str> {
    labels.get(CRI_IMAGE_REF).map(|s| s.as_str())
}

pub fn manifest_digest(labels: &Labels) -> Option<&str> {
    labels.get(CRI_MANIFEST_DIGEST).map(|s| s.as_str())
}

/// Whether the labels mark any kind of remote layer the runtime must not
/// unpack itself.
pub fn is_remote_data_layer(labels: &Labels) -> bool {
    is_nydus_data_layer(labels) || is_tarfs_layer(labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_classification() {
        let l = labels(&[(NYDUS_META_LAYER, "true")]);
        assert!(is_nydus_meta_layer(&l));
        assert!(!is_nydus_data_layer(&l));
        assert!(!is_remote_data_layer(&l));

        let l = labels(&[(NYDUS_DATA_LAYER, "true"), (TARGET_SNAPSHOT_REF, "t1")]);
        assert!(is_nydus_data_layer(&l));
        assert!(is_remote_data_layer(&l));
        assert_eq!(target_ref(&l), Some("t1"));

        let l = labels(&[(TARFS_LAYER, "true")]);
        assert!(is_tarfs_layer(&l));
        assert!(is_remote_data_layer(&l));
    }

    #[test]
    fn test_digest_accessors() {
        let l = labels(&[
            (CRI_LAYER_DIGEST, "sha256:aa"),
            (CRI_IMAGE_REF, "registry.test/repo:tag"),
        ]);
        assert_eq!(layer_digest(&l), Some("sha256:aa"));
        assert_eq!(image_ref(&l), Some("registry.test/repo:tag"));
        assert_eq!(manifest_digest(&l), None);
    }
}
