//! Error types for the packet codec and the tunnel.

use std::io;

use thiserror::Error;

/// Result type alias for tunnel operations.
pub type TunnelResult<T> = Result<T, TunnelError>;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("packet truncated: need {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("unsupported IP version {0}")]
    UnsupportedVersion(u8),

    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("address family does not match the packet")]
    AddressFamilyMismatch,
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("tunnel is already listening")]
    AlreadyListening,

    #[error("tunnel is not listening")]
    NotListening,

    #[error("forwarding to {target} failed after {attempts} attempts")]
    ForwardFailed { target: String, attempts: u32 },
}
