use std::io;

use thiserror::Error;

use super::tunnel::HandshakeState;

/// A frame that does not follow `<len>.<value>(,<len>.<value>)*;`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed instruction: {0}")]
    Malformed(String),
    #[error("element length overflows")]
    LengthOverflow,
    #[error("instruction exceeds {max} bytes")]
    FrameTooLarge { max: usize },
    #[error("instruction is not valid UTF-8")]
    InvalidUtf8,
}

/// Failures while opening or using a tunnel to guacd.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to connect to guacd at {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("timed out connecting to guacd at {0}")]
    ConnectTimeout(String),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("handshake failed while {state}: expected \"{expected}\", got \"{got}\"")]
    UnexpectedInstruction {
        state: HandshakeState,
        expected: &'static str,
        got: String,
    },
    #[error("guacd sent \"ready\" without a connection id")]
    MissingConnectionId,
    #[error("guacd rejected the connection: {message} (status {status})")]
    Backend { message: String, status: String },
    #[error("guacd closed the connection")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
