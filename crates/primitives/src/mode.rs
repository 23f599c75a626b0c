use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// The mode a synchronisation run operates in.
///
/// Selected once per run, it determines which fetch queues are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Download headers and bodies, execute every block.
    Full,
    /// Download headers, bodies and receipts up to the pivot, the pivot state, then execute.
    #[default]
    Fast,
    /// Download headers and the state at the pivot block.
    Light,
    /// Download headers only.
    LightOnly,
}

impl SyncMode {
    /// Whether block bodies are downloaded in this mode.
    pub const fn fetches_bodies(&self) -> bool {
        matches!(self, Self::Full | Self::Fast)
    }

    /// Whether receipts are downloaded in this mode.
    pub const fn fetches_receipts(&self) -> bool {
        matches!(self, Self::Fast)
    }

    /// Whether the state trie is downloaded in this mode.
    pub const fn fetches_state(&self) -> bool {
        matches!(self, Self::Fast | Self::Light)
    }

    /// Whether this mode only tracks headers locally.
    pub const fn is_header_only(&self) -> bool {
        matches!(self, Self::Light | Self::LightOnly)
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Full => "full",
            Self::Fast => "fast",
            Self::Light => "light",
            Self::LightOnly => "lightonly",
        };
        f.write_str(s)
    }
}

/// Error returned when parsing an unknown [`SyncMode`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown sync mode {0:?}, expected one of full, fast, light, lightonly")]
pub struct ParseSyncModeError(String);

impl FromStr for SyncMode {
    type Err = ParseSyncModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "fast" => Ok(Self::Fast),
            "light" => Ok(Self::Light),
            "lightonly" | "light-only" => Ok(Self::LightOnly),
            _ => Err(ParseSyncModeError(s.to_string())),
        }
    }
}

/// The consensus engine family a node runs with, selected once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Difficulty based proof-of-work.
    #[default]
    ProofOfWork,
    /// Signer based proof-of-authority.
    ProofOfAuthority,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn parse_sync_mode() {
        for mode in [SyncMode::Full, SyncMode::Fast, SyncMode::Light, SyncMode::LightOnly] {
            assert_eq!(mode.to_string().parse::<SyncMode>().unwrap(), mode);
        }
        assert_matches!("turbo".parse::<SyncMode>(), Err(ParseSyncModeError(_)));
    }

    #[test]
    fn state_queue_only_for_fast_and_light() {
        assert!(SyncMode::Fast.fetches_state());
        assert!(SyncMode::Light.fetches_state());
        assert!(!SyncMode::Full.fetches_state());
        assert!(!SyncMode::LightOnly.fetches_state());
    }
}
