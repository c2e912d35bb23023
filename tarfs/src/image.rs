// Copyright 2023 Alibaba Cloud. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Just enough of a registry client to pull one layer and learn its
//! uncompressed digest.

use std::time::Duration;

use serde::Deserialize;

use snapshotter_api::config::split_image_ref;
use snapshotter_api::error::{Error, Result};

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json";

#[derive(Debug, Clone, Deserialize)]
pub struct Descriptor {
    pub digest: String,
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    #[serde(default)]
    pub size: i64,
}

#[derive(Debug, Deserialize)]
pub struct Manifest {
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct RootFs {
    diff_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ImageConfig {
    rootfs: RootFs,
}

pub struct RegistryClient {
    client: reqwest::blocking::Client,
}

impl RegistryClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::internal(format!("registry http client: {}", e)))?;
        Ok(RegistryClient { client })
    }

    fn url(&self, image_ref: &str, kind: &str, digest: &str) -> Result<String> {
        let (host, repo) = split_image_ref(image_ref)?;
        Ok(format!("https://{}/v2/{}/{}/{}", host, repo, kind, digest))
    }

    pub fn fetch_manifest(&self, image_ref: &str, manifest_digest: &str) -> Result<Manifest> {
        let url = self.url(image_ref, "manifests", manifest_digest)?;
        let resp = self
            .client
            .get(&url)
            .header("Accept", MANIFEST_ACCEPT)
            .send()
            .map_err(|e| Error::internal(format!("fetch manifest {}: {}", url, e)))?;
        if !resp.status().is_success() {
            return Err(Error::internal(format!(
                "fetch manifest {}: status {}",
                url,
                resp.status()
            )));
        }
        resp.json()
            .map_err(|e| Error::internal(format!("parse manifest {}: {}", manifest_digest, e)))
    }

    /// The uncompressed digest and media type of one layer, resolved via
    /// the manifest and image config.
    pub fn layer_diff_id(
        &self,
        image_ref: &str,
        manifest_digest: &str,
        layer_digest: &str,
    ) -> Result<(String, String)> {
        let manifest = self.fetch_manifest(image_ref, manifest_digest)?;
        let index = manifest
            .layers
            .iter()
            .position(|l| l.digest == layer_digest)
            .ok_or_else(|| {
                Error::invalid_argument(format!(
                    "layer {} not in manifest {}",
                    layer_digest, manifest_digest
                ))
            })?;
        let media_type = manifest.layers[index].media_type.clone();

        let url = self.url(image_ref, "blobs", &manifest.config.digest)?;
        let resp = self
            .client
            .get(&url)
            .send()
            .map_err(|e| Error::internal(format!("fetch image config {}: {}", url, e)))?;
        if !resp.status().is_success() {
            return Err(Error::internal(format!(
                "fetch image config {}: status {}",
                url,
                resp.status()
            )));
        }
        let config: ImageConfig = resp
            .json()
            .map_err(|e| Error::internal(format!("parse image config: {}", e)))?;
        let diff_id = config
            .rootfs
            .diff_ids
            .get(index)
            .cloned()
            .ok_or_else(|| {
                Error::invalid_argument(format!(
                    "image config has {} diff ids but layer index is {}",
                    config.rootfs.diff_ids.len(),
                    index
                ))
            })?;
        Ok((diff_id, media_type))
    }

    pub fn open_blob(&self, image_ref: &str, digest: &str) -> Result<reqwest::blocking::Response> {
        let url = self.url(image_ref, "blobs", digest)?;
        let resp = self
            .client
            .get(&url)
            .send()
            .map_err(|e| Error::internal(format!("fetch blob {}: {}", url, e)))?;
        if !resp.status().is_success() {
            return Err(Error::internal(format!(
                "fetch blob {}: status {}",
                url,
                resp.status()
            )));
        }
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_parsing() {
        let raw = r#"{
            "schemaVersion": 2,
            "config": {"mediaType": "application/vnd.oci.image.config.v1+json",
                       "digest": "sha256:cfg", "size": 100},
            "layers": [
                {"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                 "digest": "sha256:l0", "size": 10},
                {"mediaType": "application/vnd.oci.image.layer.v1.tar",
                 "digest": "sha256:l1", "size": 20}
            ]
        }"#;
        let m: Manifest = serde_json::from_str(raw).unwrap();
        assert_eq!(m.config.digest, "sha256:cfg");
        assert_eq!(m.layers.len(), 2);
        assert!(m.layers[0].media_type.ends_with("gzip"));
    }

    #[test]
    fn test_config_parsing() {
        let raw = r#"{"rootfs": {"type": "layers",
                      "diff_ids": ["sha256:d0", "sha256:d1"]}}"#;
        let c: ImageConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(c.rootfs.diff_ids[1], "sha256:d1");
    }
}
