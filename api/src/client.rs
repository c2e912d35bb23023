// Copyright 2022 Alibaba Cloud. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Blocking client for the FS daemon administration socket.
//!
//! The daemon speaks HTTP/1 over a unix domain socket. The client owns a
//! small current-thread runtime so callers stay synchronous; every request
//! carries the configured timeout and a timeout surfaces as `Unavailable`,
//! which is what the state waits upstream expect.

use std::path::{Path, PathBuf};
use std::time::Duration;

use hyper::{Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use tokio::runtime::Runtime;

use crate::error::{Error, Result};
use crate::types::{DaemonInfo, MountRequest};

const ENDPOINT_DAEMON: &str = "/api/v1/daemon";
const ENDPOINT_MOUNT: &str = "/api/v1/mount";
const ENDPOINT_START: &str = "/api/v1/daemon/start";
const ENDPOINT_EXIT: &str = "/api/v1/daemon/exit";
const ENDPOINT_TAKEOVER: &str = "/api/v1/daemon/fuse/takeover";

pub struct DaemonClient {
    sock: PathBuf,
    client: Client<UnixConnector>,
    rt: Runtime,
    timeout: Duration,
}

impl DaemonClient {
    pub fn new<P: AsRef<Path>>(sock: P, timeout: Duration) -> Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::internal(format!("daemon client runtime: {}", e)))?;
        Ok(DaemonClient {
            sock: sock.as_ref().to_path_buf(),
            client: Client::unix(),
            rt,
            timeout,
        })
    }

    pub fn socket(&self) -> &Path {
        &self.sock
    }

    fn call(&self, method: Method, path: &str, body: Option<String>) -> Result<(StatusCode, Vec<u8>)> {
        debug!("daemon api {} {} via {}", method, path, self.sock.display());
        let uri: hyper::Uri = Uri::new(&self.sock, path).into();
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(body.map(Body::from).unwrap_or_else(Body::empty))
            .map_err(|e| Error::internal(format!("build daemon request: {}", e)))?;

        self.rt.block_on(async {
            let resp = tokio::time::timeout(self.timeout, self.client.request(req))
                .await
                .map_err(|_| {
                    Error::unavailable(format!(
                        "daemon api {} timed out after {:?}",
                        path, self.timeout
                    ))
                })?
                .map_err(|e| Error::unavailable(format!("daemon api {}: {}", path, e)))?;
            let status = resp.status();
            let bytes = hyper::body::to_bytes(resp.into_body())
                .await
                .map_err(|e| Error::unavailable(format!("daemon api {}: {}", path, e)))?;
            Ok((status, bytes.to_vec()))
        })
    }

    fn expect_ok(&self, path: &str, status: StatusCode, body: &[u8]) -> Result<()> {
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::unavailable(format!(
                "daemon api {} failed with {}: {}",
                path,
                status,
                String::from_utf8_lossy(body)
            )))
        }
    }

    /// INFO: daemon identity and state.
    pub fn info(&self) -> Result<DaemonInfo> {
        let (status, body) = self.call(Method::GET, ENDPOINT_DAEMON, None)?;
        self.expect_ok(ENDPOINT_DAEMON, status, &body)?;
        serde_json::from_slice(&body)
            .map_err(|e| Error::unavailable(format!("daemon info response: {}", e)))
    }

    /// MOUNT a RAFS filesystem at `mountpoint` within the daemon.
    pub fn mount(&self, mountpoint: &str, bootstrap: &Path, config: &str) -> Result<()> {
        let req = MountRequest::rafs(&bootstrap.to_string_lossy(), config);
        let body = serde_json::to_string(&req)?;
        let path = format!("{}?mountpoint={}", ENDPOINT_MOUNT, mountpoint);
        let (status, resp) = self.call(Method::POST, &path, Some(body))?;
        self.expect_ok(&path, status, &resp)
    }

    /// UMOUNT the sub-filesystem at `mountpoint` within the daemon.
    pub fn umount(&self, mountpoint: &str) -> Result<()> {
        let path = format!("{}?mountpoint={}", ENDPOINT_MOUNT, mountpoint);
        let (status, resp) = self.call(Method::DELETE, &path, None)?;
        self.expect_ok(&path, status, &resp)
    }

    /// TAKEOVER the FUSE session of a predecessor daemon.
    pub fn takeover(&self) -> Result<()> {
        let (status, resp) = self.call(Method::PUT, ENDPOINT_TAKEOVER, None)?;
        self.expect_ok(ENDPOINT_TAKEOVER, status, &resp)
    }

    /// START serving after a takeover.
    pub fn start(&self) -> Result<()> {
        let (status, resp) = self.call(Method::PUT, ENDPOINT_START, None)?;
        self.expect_ok(ENDPOINT_START, status, &resp)
    }

    /// EXIT without unmounting, leaving the FUSE session to a successor.
    pub fn exit(&self) -> Result<()> {
        let (status, resp) = self.call(Method::PUT, ENDPOINT_EXIT, None)?;
        self.expect_ok(ENDPOINT_EXIT, status, &resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_socket_is_unavailable() {
        let client =
            DaemonClient::new("/no/such/dir/api.sock", Duration::from_millis(200)).unwrap();
        let err = client.info().unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)), "got {:?}", err);
    }

    #[test]
    fn test_mount_request_shape() {
        let req = MountRequest::rafs("/b/image.boot", "{}");
        let v: serde_json::Value = serde_json::from_str(&serde_json::to_string(&req).unwrap()).unwrap();
        assert_eq!(v["fs_type"], "rafs");
        assert_eq!(v["source"], "/b/image.boot");
    }
}
