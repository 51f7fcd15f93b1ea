use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Nip46Error, Nip46Result};

/// Engine-wide tunables. All durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    pub default_relays: Vec<String>,
    /// Upgrade `ws://` relays to `wss://`.
    pub enforce_tls: bool,
    pub publish_timeout_ms: u64,
    pub response_timeout_ms: u64,
    pub sign_event_timeout_ms: u64,
    pub ping_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Extra attempts after a timed-out or unpublished request.
    pub max_retries: u32,
    pub auth_challenge_max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub storage_key: String,
    pub kdf: KdfConfig,
}

/// Argon2id cost parameters for passphrase-sealed sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    pub m_cost: u32, // KiB
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            m_cost: 19 * 1024,
            t_cost: 2,
            p_cost: 1,
        }
    }
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            default_relays: vec![
                "wss://relay.damus.io".to_string(),
                "wss://nos.lol".to_string(),
                "wss://relay.snort.social".to_string(),
                "wss://relay.primal.net".to_string(),
                "wss://relay.nostr.band".to_string(),
            ],
            enforce_tls: true,
            publish_timeout_ms: 8_000,
            response_timeout_ms: 15_000,
            sign_event_timeout_ms: 20_000,
            ping_timeout_ms: 5_000,
            handshake_timeout_ms: 60_000,
            max_retries: 1,
            auth_challenge_max_attempts: 5,
            backoff_base_ms: 2_000,
            backoff_max_ms: 30_000,
            storage_key: "nostr-connect:session:v1".to_string(),
            kdf: KdfConfig::default(),
        }
    }
}

impl ConnectConfig {
    pub fn from_json_str(json: &str) -> Nip46Result<Self> {
        serde_json::from_str(json).map_err(|e| Nip46Error::InvalidArgument(format!("config: {}", e)))
    }

    pub fn load(path: impl AsRef<Path>) -> Nip46Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Nip46Error::Storage(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_json_str(&raw)
    }

    /// `connect` waits at least 12s regardless of the general response timeout.
    pub fn connect_timeout_ms(&self) -> u64 {
        self.response_timeout_ms.max(12_000)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    /// Rate-limit backoff before retry `attempt` (0-based).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor).min(self.backoff_max_ms))
    }
}
