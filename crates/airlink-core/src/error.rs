//! Error types for AirLink.
//!
//! This module provides a unified error type for all relay operations,
//! with specific error variants for the ways a request can be refused.

use std::fmt;
use std::io;

use thiserror::Error;

/// A specialized `Result` type for AirLink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Which side of an upload was missing from the device registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// The uploading device
    Sender,
    /// The device the upload is addressed to
    Target,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sender => f.write_str("Sender"),
            Self::Target => f.write_str("Target"),
        }
    }
}

/// The main error type for AirLink.
#[derive(Error, Debug)]
pub enum Error {
    /// Sender or target device is not currently registered
    #[error("{0} not connected")]
    NotConnected(PeerRole),

    /// Unknown transfer id
    #[error("transfer '{0}' not found")]
    NotFound(String),

    /// Unrecognized control verb
    #[error("invalid transfer action '{0}'")]
    InvalidAction(String),

    /// Download token mismatch, unknown transfer, or payload already claimed
    #[error("download forbidden")]
    Forbidden,

    /// Malformed upload request
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Pending transfer limit reached
    #[error("relay is holding {0} pending transfers, try again later")]
    Capacity(usize),

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidConfig {
        /// Configuration key
        key: String,
        /// Reason for invalidity
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the short wire code reported to HTTP clients.
    ///
    /// The codes match what browser clients already key on, so the
    /// human-readable `Display` text is free to change.
    #[must_use]
    pub fn code(&self) -> String {
        match self {
            Self::NotConnected(role) => format!("{role} not connected"),
            Self::NotFound(_) => "not_found".to_string(),
            Self::InvalidAction(_) => "bad_action".to_string(),
            Self::Forbidden => "forbidden".to_string(),
            Self::BadRequest(msg) => msg.clone(),
            Self::Capacity(_) => "capacity".to_string(),
            Self::ConfigError(_) | Self::InvalidConfig { .. } => "config".to_string(),
            Self::Io(_) => "io".to_string(),
            Self::Internal(_) => "internal".to_string(),
        }
    }

    /// Returns whether the caller may retry the same request later.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Capacity(_) | Self::Io(_))
    }
}
