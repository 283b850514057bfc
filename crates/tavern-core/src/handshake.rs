//! Handshake messages.
//!
//! The first frame a client sends is a `HandshakeRequest`; the host answers
//! with exactly one `HandshakeResponse`. No command flows in either direction
//! until the response has been accepted.

use serde::{Deserialize, Serialize};

use crate::policy::ServerPolicy;
use crate::wire::PROTOCOL_VERSION;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Gm,
    Player,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Gm => f.write_str("gm"),
            Role::Player => f.write_str("player"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = HandshakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gm" => Ok(Role::Gm),
            "player" => Ok(Role::Player),
            other => Err(HandshakeError::Malformed(format!("unknown role {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub name: String,
    #[serde(default)]
    pub password: Option<String>,
    pub role: Role,
    pub version: String,
}

impl HandshakeRequest {
    pub fn new(name: impl Into<String>, role: Role, password: Option<String>) -> Self {
        Self {
            name: name.into(),
            password,
            role,
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandshakeCode {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub code: HandshakeCode,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub policy: ServerPolicy,
}

impl HandshakeResponse {
    pub fn accept(policy: ServerPolicy) -> Self {
        Self {
            code: HandshakeCode::Ok,
            message: String::new(),
            policy,
        }
    }

    pub fn reject(err: &HandshakeError) -> Self {
        Self {
            code: HandshakeCode::Error,
            message: err.to_string(),
            policy: ServerPolicy::default(),
        }
    }

    /// Turn the response into the client-side outcome.
    pub fn into_result(self) -> Result<ServerPolicy, HandshakeError> {
        match self.code {
            HandshakeCode::Ok => Ok(self.policy),
            HandshakeCode::Error => Err(HandshakeError::Rejected(self.message)),
        }
    }
}

/// Why a handshake did not complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("wrong password for role {0}")]
    BadPassword(Role),

    #[error("name {0:?} is already in use")]
    NameInUse(String),

    #[error("version mismatch: host runs {host}, client runs {client}")]
    VersionMismatch { host: String, client: String },

    #[error("host rejected connection: {0}")]
    Rejected(String),

    #[error("malformed handshake: {0}")]
    Malformed(String),
}
