//! Server half of the handshake.
//!
//! A request is admitted when its version matches ours, its password matches
//! the one configured for the requested role, and its name is not already
//! connected (case-insensitive). The name check lives in `Host`, since it
//! needs the roster.

use tavern_core::config::ServerConfig;
use tavern_core::crypto::secrets_match;
use tavern_core::wire::PROTOCOL_VERSION;
use tavern_core::{HandshakeError, HandshakeRequest, Role};

/// Version and credential checks. Does not touch the roster.
pub fn check_request(server: &ServerConfig, request: &HandshakeRequest) -> Result<(), HandshakeError> {
    if request.version != PROTOCOL_VERSION {
        return Err(HandshakeError::VersionMismatch {
            host: PROTOCOL_VERSION.to_string(),
            client: request.version.clone(),
        });
    }

    if request.name.trim().is_empty() {
        return Err(HandshakeError::Malformed("empty player name".into()));
    }

    let expected = match request.role {
        Role::Gm => server.gm_password.as_deref(),
        Role::Player => server.player_password.as_deref(),
    };
    if !secrets_match(expected, request.password.as_deref()) {
        return Err(HandshakeError::BadPassword(request.role));
    }
    Ok(())
}

/// Roster key for a player name.
pub fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}
