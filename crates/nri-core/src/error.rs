//! Crate-wide error type.
//!
//! Mirrors the error taxonomy in the design: fatal-to-plugin conditions
//! (transport closed, protocol error, request timeout) are collected under
//! [`Error::Fatal`] so `closeIfFatalError`-style call sites can match on
//! [`FatalReason`] instead of string-sniffing; everything else is a
//! dedicated variant.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Reasons a plugin gets closed rather than just failing one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalReason {
    /// The underlying transport (socket, mux channel, wasm instance) closed.
    TransportClosed,
    /// A ttrpc/protobuf framing or protocol error occurred.
    ProtocolError,
    /// An outbound call exceeded its per-request timeout.
    RequestTimeout,
}

impl FatalReason {
    /// The `Shutdown` reason string sent to the plugin before teardown, per
    /// the documented reason strings (`request handling timeout`,
    /// `ttrpc protocol error`).
    pub fn shutdown_reason(&self) -> &'static str {
        match self {
            FatalReason::TransportClosed => "transport closed",
            FatalReason::ProtocolError => "ttrpc protocol error",
            FatalReason::RequestTimeout => "request handling timeout",
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("ttrpc error: {0}")]
    Ttrpc(#[from] ttrpc::Error),

    #[error("plugin registration failed: {0}")]
    Registration(String),

    #[error(
        "ownership conflict on field {field}{}: claimed by {owner}, rejected for {rejected}",
        key.as_deref().map(|k| format!(" (key {k:?})")).unwrap_or_default()
    )]
    OwnershipConflict {
        field: String,
        key: Option<String>,
        owner: String,
        rejected: String,
    },

    #[error("validation rejected by {plugin}: {reason}")]
    ValidationRejected { plugin: String, reason: String },

    #[error("required plugin(s) missing: {0:?}")]
    RequiredPluginMissing(Vec<String>),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("container {0} not found")]
    ContainerNotFound(String),

    #[error("plugin fatal error: {reason:?}: {detail}")]
    Fatal {
        reason: FatalReason,
        detail: String,
    },

    #[error("operation canceled")]
    Canceled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn fatal(reason: FatalReason, detail: impl Into<String>) -> Self {
        Error::Fatal {
            reason,
            detail: detail.into(),
        }
    }

    /// True for the error classes that mean "close this plugin" rather than
    /// "fail this one event".
    pub fn is_fatal_to_plugin(&self) -> bool {
        matches!(self, Error::Fatal { .. } | Error::Ttrpc(_))
    }
}
