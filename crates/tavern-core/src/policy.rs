use serde::{Deserialize, Serialize};

/// Table rules the host enforces and every client honours.
///
/// Sent in the handshake response and again in `setServerPolicy` whenever
/// the GM changes it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerPolicy {
    /// Players may only move tokens they own.
    pub strict_token_management: bool,
    /// Token movement is frozen for players.
    pub movement_locked: bool,
    pub players_can_reveal_vision: bool,
    pub use_individual_views: bool,
    /// Players may only speak as tokens they own.
    pub restricted_impersonation: bool,
    pub players_receive_campaign_macros: bool,
}
