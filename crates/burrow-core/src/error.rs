//! Error types for the Burrow bridge protocol

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Framing-level errors. Any of these is fatal to the connection it
/// occurred on, never to the listener.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid message type: {0}")]
    InvalidMessageType(u32),

    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("unexpected binary segment on {0} message")]
    UnexpectedBinary(&'static str),

    #[error("path traversal attempt blocked: {0}")]
    PathTraversal(String),

    #[error("invalid uri: {0}")]
    InvalidUri(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("deserialization failed: {0}")]
    Deserialization(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Deserialization(e.to_string())
    }
}

/// Wire error codes (sent in response-error bodies)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // General
    Unknown,
    ProtocolError,
    NotImplemented,

    // Mount / authorization
    MountNotFound,
    PathTraversal,

    // File errors
    FileNotFound,
    NotADirectory,
    IsADirectory,
    PermissionDenied,
    AlreadyExists,
    NotEmpty,
    NameTooLong,

    // I/O
    IoError,
}

impl From<&ProtocolError> for ErrorCode {
    fn from(e: &ProtocolError) -> Self {
        match e {
            ProtocolError::PathTraversal(_) => ErrorCode::PathTraversal,
            _ => ErrorCode::ProtocolError,
        }
    }
}

/// A recoverable file-system error, surfaced to the client as a
/// response-error frame while the connection stays open.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct FsError {
    pub code: ErrorCode,
    pub message: String,
}

impl FsError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::FileNotFound, message)
    }

    pub fn mount_not_found(token: &str) -> Self {
        Self::new(ErrorCode::MountNotFound, format!("mount {} not found", token))
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotImplemented, message)
    }
}

impl From<ProtocolError> for FsError {
    fn from(e: ProtocolError) -> Self {
        FsError::new(ErrorCode::from(&e), e.to_string())
    }
}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let code = match e.kind() {
            ErrorKind::NotFound => ErrorCode::FileNotFound,
            ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
            ErrorKind::AlreadyExists => ErrorCode::AlreadyExists,
            ErrorKind::NotADirectory => ErrorCode::NotADirectory,
            ErrorKind::IsADirectory => ErrorCode::IsADirectory,
            ErrorKind::DirectoryNotEmpty => ErrorCode::NotEmpty,
            _ => ErrorCode::IoError,
        };
        FsError::new(code, e.to_string())
    }
}
