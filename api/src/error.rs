// Copyright 2022 Alibaba Cloud. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Error kinds surfaced to the container runtime.
//!
//! The runtime shim distinguishes failures by kind only, so every error in
//! this workspace eventually collapses into one of the variants below. The
//! message carries the annotation stack accumulated on the way up.

use std::fmt::Display;
use std::io;

/// Errors returned by snapshot operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("internal: {0}")]
    Internal(String),
}

/// Specialized `Result` for snapshot operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_found(msg: impl Display) -> Self {
        Error::NotFound(msg.to_string())
    }

    pub fn already_exists(msg: impl Display) -> Self {
        Error::AlreadyExists(msg.to_string())
    }

    pub fn failed_precondition(msg: impl Display) -> Self {
        Error::FailedPrecondition(msg.to_string())
    }

    pub fn invalid_argument(msg: impl Display) -> Self {
        Error::InvalidArgument(msg.to_string())
    }

    pub fn unavailable(msg: impl Display) -> Self {
        Error::Unavailable(msg.to_string())
    }

    pub fn internal(msg: impl Display) -> Self {
        Error::Internal(msg.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }

    /// Prefix the error message with `ctx`, keeping the kind.
    pub fn context(self, ctx: impl Display) -> Self {
        match self {
            Error::NotFound(m) => Error::NotFound(format!("{}: {}", ctx, m)),
            Error::AlreadyExists(m) => Error::AlreadyExists(format!("{}: {}", ctx, m)),
            Error::FailedPrecondition(m) => Error::FailedPrecondition(format!("{}: {}", ctx, m)),
            Error::InvalidArgument(m) => Error::InvalidArgument(format!("{}: {}", ctx, m)),
            Error::Unavailable(m) => Error::Unavailable(format!("{}: {}", ctx, m)),
            Error::Internal(m) => Error::Internal(format!("{}: {}", ctx, m)),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => Error::NotFound(e.to_string()),
            io::ErrorKind::AlreadyExists => Error::AlreadyExists(e.to_string()),
            _ => Error::Internal(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("json: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_kind_mapping() {
        let e: Error = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(e.is_not_found());
        let e: Error = io::Error::new(io::ErrorKind::AlreadyExists, "dup").into();
        assert!(e.is_already_exists());
        let e: Error = io::Error::new(io::ErrorKind::PermissionDenied, "no").into();
        assert!(matches!(e, Error::Internal(_)));
    }

    #[test]
    fn test_context_keeps_kind() {
        let e = Error::not_found("snapshot k1").context("stat");
        assert!(e.is_not_found());
        assert_eq!(e.to_string(), "not found: stat: snapshot k1");
    }
}
