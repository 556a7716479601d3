//! Disconnect codes reported to clients, and relay-level errors.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::guac::{Instruction, TunnelError};

/// Why a relay ended. The numeric value is sent to the client in the
/// `error` instruction and stored on the session record.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisconnectCode {
    Normal,
    TunnelClosed,
    SessionNotFound,
    NewTunnelError,
    ForcedDisconnect,
    AssetNotActive,
    ParametersError,
    AssetNotFound,
    SessionUpdateError,
}

impl DisconnectCode {
    pub fn code(self) -> i32 {
        match self {
            Self::Normal => 0,
            Self::TunnelClosed => -1,
            Self::SessionNotFound => 800,
            Self::NewTunnelError => 801,
            Self::ForcedDisconnect => 802,
            Self::AssetNotActive => 803,
            Self::ParametersError => 804,
            Self::AssetNotFound => 805,
            Self::SessionUpdateError => 806,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::TunnelClosed => "TUNNEL_CLOSED",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::NewTunnelError => "NEW_TUNNEL_ERROR",
            Self::ForcedDisconnect => "FORCED_DISCONNECT",
            Self::AssetNotActive => "ASSET_NOT_ACTIVE",
            Self::ParametersError => "PARAMETERS_ERROR",
            Self::AssetNotFound => "ASSET_NOT_FOUND",
            Self::SessionUpdateError => "SESSION_UPDATE_ERROR",
        }
    }
}

impl fmt::Display for DisconnectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}

/// A disconnect code plus the human-readable reason shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    pub code: DisconnectCode,
    pub reason: String,
}

impl Disconnect {
    pub fn new(code: DisconnectCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn normal(reason: impl Into<String>) -> Self {
        Self::new(DisconnectCode::Normal, reason)
    }

    pub fn forced(reason: impl Into<String>) -> Self {
        Self::new(DisconnectCode::ForcedDisconnect, reason)
    }

    pub fn is_normal(&self) -> bool {
        self.code == DisconnectCode::Normal
    }

    /// Instructions that tell the client why it is being disconnected:
    /// `error(reason, code)` then `disconnect()`. A normal close only sends
    /// `disconnect()`.
    pub fn instructions(&self) -> Vec<Instruction> {
        let disconnect = Instruction::new("disconnect", Vec::<String>::new());
        if self.is_normal() {
            return vec![disconnect];
        }
        vec![
            Instruction::new(
                "error",
                [self.reason.clone(), self.code.code().to_string()],
            ),
            disconnect,
        ]
    }
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.reason)
    }
}

impl From<&TunnelError> for Disconnect {
    fn from(e: &TunnelError) -> Self {
        Self::new(DisconnectCode::NewTunnelError, e.to_string())
    }
}

/// Errors reported by a client transport while reading.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("client transport error: {0}")]
    Client(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct() {
        let all = [
            DisconnectCode::Normal,
            DisconnectCode::TunnelClosed,
            DisconnectCode::SessionNotFound,
            DisconnectCode::NewTunnelError,
            DisconnectCode::ForcedDisconnect,
            DisconnectCode::AssetNotActive,
            DisconnectCode::ParametersError,
            DisconnectCode::AssetNotFound,
            DisconnectCode::SessionUpdateError,
        ];
        let codes: std::collections::HashSet<i32> = all.iter().map(|c| c.code()).collect();
        assert_eq!(codes.len(), all.len());
    }

    #[test]
    fn test_error_then_disconnect() {
        let d = Disconnect::new(DisconnectCode::SessionNotFound, "session gone");
        let encoded: Vec<String> = d
            .instructions()
            .iter()
            .map(|i| i.encode().to_string())
            .collect();
        assert_eq!(encoded, ["5.error,12.session gone,3.800;", "10.disconnect;"]);
    }

    #[test]
    fn test_normal_only_disconnects() {
        let d = Disconnect::normal("bye");
        let ins = d.instructions();
        assert_eq!(ins.len(), 1);
        assert_eq!(ins[0].opcode(), "disconnect");
    }
}
