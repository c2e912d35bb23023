// Copyright 2022 Alibaba Cloud. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! System controller: the operator-facing admin socket.
//!
//! A small HTTP server on a unix domain socket exposing daemon inventory,
//! the rolling upgrade trigger, and the Prometheus export. Runs on its own
//! thread; `stop` wakes the accept loop with a throwaway connection.

use std::fs;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use dbs_uhttp::{Body, HttpServer, Method, Request, Response, StatusCode, Version};

use snapshotter_api::error::{Error, Result};
use snapshotter_service::{rolling_upgrade, UpgradeRequest};

use crate::metrics;
use crate::snapshotter::Snapshotter;

const ROUTE_DAEMONS: &str = "/api/v1/daemons";
const ROUTE_DAEMON_RECORDS: &str = "/api/v1/daemons/records";
const ROUTE_UPGRADE: &str = "/api/v1/daemons/upgrade";
const ROUTE_METRICS: &str = "/metrics";

pub struct SystemController {
    snapshotter: Arc<Snapshotter>,
    socket: PathBuf,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SystemController {
    pub fn new(snapshotter: Arc<Snapshotter>, socket: PathBuf) -> Self {
        SystemController {
            snapshotter,
            socket,
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    pub fn start(&self) -> Result<()> {
        if self.socket.exists() {
            fs::remove_file(&self.socket)?;
        }
        let mut server = HttpServer::new(&self.socket)
            .map_err(|e| Error::internal(format!("bind {}: {:?}", self.socket.display(), e)))?;
        server
            .start_server()
            .map_err(|e| Error::internal(format!("start system controller: {:?}", e)))?;
        info!("system controller listening on {}", self.socket.display());

        self.running.store(true, Ordering::Release);
        let running = self.running.clone();
        let snapshotter = self.snapshotter.clone();
        let handle = thread::Builder::new()
            .name("system-controller".to_string())
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    let requests = match server.requests() {
                        Ok(r) => r,
                        Err(e) => {
                            if running.load(Ordering::Acquire) {
                                error!("system controller poll: {:?}", e);
                                thread::sleep(std::time::Duration::from_millis(100));
                            }
                            continue;
                        }
                    };
                    for server_request in requests {
                        let response =
                            server_request.process(|request| handle_request(&snapshotter, request));
                        if let Err(e) = server.respond(response) {
                            error!("system controller respond: {:?}", e);
                        }
                    }
                }
            })
            .map_err(|e| Error::internal(format!("spawn system controller: {}", e)))?;
        *self.thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        // Wake the accept loop so it observes the flag.
        let _ = UnixStream::connect(&self.socket);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        let _ = fs::remove_file(&self.socket);
    }
}

fn text_response(status: StatusCode, body: String) -> Response {
    let mut response = Response::new(Version::Http11, status);
    response.set_body(Body::new(body));
    response
}

fn error_response(e: &Error, status: StatusCode) -> Response {
    text_response(status, e.to_string())
}

fn handle_request(snapshotter: &Arc<Snapshotter>, request: &Request) -> Response {
    let path = request.uri().get_abs_path().to_string();
    match (request.method(), path.as_str()) {
        (Method::Get, ROUTE_DAEMONS) => {
            let exports = snapshotter.supervisor().exports();
            match serde_json::to_string(&exports) {
                Ok(body) => text_response(StatusCode::OK, body),
                Err(e) => error_response(&e.into(), StatusCode::InternalServerError),
            }
        }
        (Method::Get, ROUTE_DAEMON_RECORDS) => {
            Response::new(Version::Http11, StatusCode::NotImplemented)
        }
        (Method::Put, ROUTE_UPGRADE) => {
            let body = match request.body.as_ref() {
                Some(b) => b,
                None => return Response::new(Version::Http11, StatusCode::BadRequest),
            };
            let upgrade: UpgradeRequest = match serde_json::from_slice(body.raw()) {
                Ok(r) => r,
                Err(e) => {
                    return error_response(
                        &Error::invalid_argument(format!("upgrade request: {}", e)),
                        StatusCode::BadRequest,
                    )
                }
            };
            match rolling_upgrade(snapshotter.supervisor(), &upgrade) {
                Ok(()) => Response::new(Version::Http11, StatusCode::NoContent),
                Err(e) => {
                    error!("rolling upgrade failed: {}", e);
                    error_response(&e, StatusCode::InternalServerError)
                }
            }
        }
        (Method::Get, ROUTE_METRICS) => match metrics::export_text() {
            Ok(body) => text_response(StatusCode::OK, body),
            Err(e) => error_response(&e, StatusCode::InternalServerError),
        },
        _ => Response::new(Version::Http11, StatusCode::NotFound),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use std::io::{Read, Write};
    use vmm_sys_util::tempdir::TempDir;

    const DAEMON_TEMPLATE: &str = r#"{
        "device": {
            "backend": {"type": "registry", "config": {}},
            "cache": {"type": "blobcache", "config": {}}
        },
        "mode": "direct"
    }"#;

    fn http_get(socket: &std::path::Path, path: &str) -> String {
        let mut stream = UnixStream::connect(socket).unwrap();
        write!(stream, "GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path).unwrap();
        stream
            .set_read_timeout(Some(std::time::Duration::from_secs(5)))
            .unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    // One response is enough; the server keeps the
                    // connection open.
                    if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    #[test]
    fn test_routes() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.as_path());
        std::fs::write(&config.daemon_config_path, DAEMON_TEMPLATE).unwrap();
        let snapshotter = Arc::new(Snapshotter::new(config).unwrap());

        let socket = dir.as_path().join("system.sock");
        let controller = SystemController::new(snapshotter.clone(), socket.clone());
        controller.start().unwrap();

        let resp = http_get(&socket, "/api/v1/daemons");
        assert!(resp.starts_with("HTTP/1.1 200"), "{}", resp);

        let resp = http_get(&socket, "/api/v1/daemons/records");
        assert!(resp.starts_with("HTTP/1.1 501"), "{}", resp);

        let resp = http_get(&socket, "/metrics");
        assert!(resp.starts_with("HTTP/1.1 200"), "{}", resp);

        let resp = http_get(&socket, "/nope");
        assert!(resp.starts_with("HTTP/1.1 404"), "{}", resp);

        controller.stop();
        snapshotter.close().unwrap();
    }
}
