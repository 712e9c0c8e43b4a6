// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

use serde::{Deserialize, Serialize};

/// Protocol-level error kinds surfaced to peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolError {
    /// Malformed envelope: bad shape, missing fields, or unknown method.
    InvalidEnvelope,
    /// Method sent by an agent that has not completed the handshake.
    NotAuthenticated,
}

impl ProtocolError {
    /// JSON-RPC error code carried in the `error.code` field.
    pub fn code(&self) -> i64 {
        match self {
            Self::InvalidEnvelope => -32600,
            Self::NotAuthenticated => -32001,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidEnvelope => "INVALID_ENVELOPE",
            Self::NotAuthenticated => "NOT_AUTHENTICATED",
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// WebSocket close codes for handshake policy violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyClose {
    /// Shared auth token missing or wrong at registration.
    AuthFailed,
    /// Challenge response did not echo the issued nonce.
    ChallengeFailed,
}

impl PolicyClose {
    pub fn code(&self) -> u16 {
        match self {
            Self::AuthFailed => 4001,
            Self::ChallengeFailed => 4003,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::AuthFailed => "auth token rejected",
            Self::ChallengeFailed => "challenge failed",
        }
    }
}
