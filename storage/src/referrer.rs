// Copyright 2023 Alibaba Cloud. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Referrer detection.
//!
//! For images without nydus labels the registry may still carry an
//! associated nydus image, published through the OCI referrers API. The
//! detector asks the registry once per manifest digest and remembers the
//! answer, negative answers included; repeated misses are the common case
//! for ordinary OCI images and must not hammer the registry.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;

use snapshotter_api::config::split_image_ref;
use snapshotter_api::error::{Error, Result};

/// Cached answers are dropped wholesale beyond this many entries.
const CACHE_LIMIT: usize = 1024;

#[derive(Debug, Deserialize)]
struct ReferrerIndex {
    #[serde(default)]
    manifests: Vec<ReferrerDescriptor>,
}

#[derive(Debug, Deserialize)]
struct ReferrerDescriptor {
    digest: String,
    #[serde(rename = "artifactType", default)]
    artifact_type: String,
}

pub struct ReferrerDetector {
    client: reqwest::blocking::Client,
    /// manifest digest -> referrer manifest digest, `None` for a confirmed
    /// miss.
    answers: Mutex<HashMap<String, Option<String>>>,
}

impl ReferrerDetector {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::internal(format!("referrer http client: {}", e)))?;
        Ok(ReferrerDetector {
            client,
            answers: Mutex::new(HashMap::new()),
        })
    }

    /// The digest of the nydus referrer image for `manifest_digest`, if the
    /// registry knows one.
    pub fn check(&self, image_ref: &str, manifest_digest: &str) -> Result<Option<String>> {
        if let Some(answer) = self.answers.lock().unwrap().get(manifest_digest) {
            return Ok(answer.clone());
        }

        let answer = self.query(image_ref, manifest_digest)?;
        let mut answers = self.answers.lock().unwrap();
        if answers.len() >= CACHE_LIMIT {
            answers.clear();
        }
        answers.insert(manifest_digest.to_string(), answer.clone());
        Ok(answer)
    }

    fn query(&self, image_ref: &str, manifest_digest: &str) -> Result<Option<String>> {
        let (host, repo) = split_image_ref(image_ref)?;
        let url = format!("https://{}/v2/{}/referrers/{}", host, repo, manifest_digest);
        let resp = self
            .client
            .get(&url)
            .send()
            .map_err(|e| Error::internal(format!("referrers query {}: {}", url, e)))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            // Registry without referrers support; treat as a miss.
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Error::internal(format!(
                "referrers query {}: status {}",
                url,
                resp.status()
            )));
        }
        let index: ReferrerIndex = resp
            .json()
            .map_err(|e| Error::internal(format!("referrers index: {}", e)))?;
        Ok(index
            .manifests
            .into_iter()
            .find(|m| m.artifact_type.contains("nydus"))
            .map(|m| m.digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cached_answer_skips_query() {
        let detector = ReferrerDetector::new().unwrap();
        detector
            .answers
            .lock()
            .unwrap()
            .insert("sha256:m1".to_string(), Some("sha256:r1".to_string()));
        detector
            .answers
            .lock()
            .unwrap()
            .insert("sha256:m2".to_string(), None);

        // No network involved for either answer.
        let hit = detector.check("registry.test/app:v1", "sha256:m1").unwrap();
        assert_eq!(hit.as_deref(), Some("sha256:r1"));
        let miss = detector.check("registry.test/app:v1", "sha256:m2").unwrap();
        assert!(miss.is_none());
    }

    #[test]
    fn test_index_parsing() {
        let raw = r#"{
            "schemaVersion": 2,
            "manifests": [
                {"digest": "sha256:aaa", "artifactType": "application/vnd.example"},
                {"digest": "sha256:bbb", "artifactType": "application/vnd.nydus.rafs.v1"}
            ]
        }"#;
        let index: ReferrerIndex = serde_json::from_str(raw).unwrap();
        let hit = index
            .manifests
            .into_iter()
            .find(|m| m.artifact_type.contains("nydus"))
            .map(|m| m.digest);
        assert_eq!(hit.as_deref(), Some("sha256:bbb"));
    }
}
