//! Flease protocol configuration.

use serde::{Deserialize, Serialize};

/// Timing and identity options shared by the proposer, acceptor and stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleaseConfig {
    /// Identity proposed as lease holder by this node.
    pub identity: String,
    /// Ballot sender id. Derived from the identity when zero.
    pub sender_id: i32,
    /// Time a PREPARE or ACCEPT phase may take before it is retried (default: 1000).
    pub round_timeout_ms: i64,
    /// Responses older than this are dropped (default: 500).
    pub message_timeout_ms: i64,
    /// Lease length requested by a proposer (default: 14000).
    pub max_lease_timeout_ms: i64,
    /// Maximum clock drift between any two nodes (default: 1000).
    pub d_max_ms: i64,
    /// Failed rounds tolerated before `lease_failed` fires (default: 3).
    pub max_retries: u32,
    /// Idle acceptor cells are collected after this long (default: 60000).
    pub cell_timeout_ms: i64,
    /// Acceptor silence after an unclean restart (default: lease timeout + d_max).
    pub restart_wait_ms: i64,
    /// Extra lead time for lease timeout notifications (default: 0).
    pub to_notification_ms: i64,
    /// Emit an empty lease when a tracked lease runs out (default: true).
    pub enable_timeout_events: bool,
    /// Broadcast LEARN to remote acceptors (default: true).
    pub send_learn_messages: bool,
    /// Trace every protocol message (default: false).
    pub debug_print_messages: bool,
}

impl Default for FleaseConfig {
    fn default() -> Self {
        Self {
            identity: String::from("localhost"),
            sender_id: 0,
            round_timeout_ms: 1000,
            message_timeout_ms: 500,
            max_lease_timeout_ms: 14_000,
            d_max_ms: 1000,
            max_retries: 3,
            cell_timeout_ms: 60_000,
            restart_wait_ms: 15_000,
            to_notification_ms: 0,
            enable_timeout_events: true,
            send_learn_messages: true,
            debug_print_messages: false,
        }
    }
}

impl FleaseConfig {
    /// Creates a config for `identity` with default timings.
    pub fn new(identity: impl Into<String>) -> Self {
        let mut config = FleaseConfig {
            identity: identity.into(),
            ..Default::default()
        };
        config.sender_id = sender_id_for(&config.identity);
        config
    }

    /// Sender id used in ballots, derived from the identity if not set.
    pub fn effective_sender_id(&self) -> i32 {
        if self.sender_id != 0 {
            self.sender_id
        } else {
            sender_id_for(&self.identity)
        }
    }
}

/// Stable non-zero sender id for an identity.
pub fn sender_id_for(identity: &str) -> i32 {
    let hash = blake3::hash(identity.as_bytes());
    let bytes = hash.as_bytes();
    let id = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) & 0x7fff_ffff;
    if id == 0 {
        1
    } else {
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = FleaseConfig::default();
        assert_eq!(config.round_timeout_ms, 1000);
        assert_eq!(config.message_timeout_ms, 500);
        assert_eq!(config.max_lease_timeout_ms, 14_000);
        assert_eq!(config.d_max_ms, 1000);
        assert_eq!(config.max_retries, 3);
        assert_eq!(
            config.restart_wait_ms,
            config.max_lease_timeout_ms + config.d_max_ms
        );
        assert!(config.send_learn_messages);
    }

    #[test]
    fn test_sender_id_is_stable_and_positive() {
        let a = sender_id_for("osd-a");
        assert_eq!(a, sender_id_for("osd-a"));
        assert!(a > 0);
        assert_ne!(a, sender_id_for("osd-b"));
    }

    #[test]
    fn test_new_sets_sender_id() {
        let config = FleaseConfig::new("node-1");
        assert_eq!(config.sender_id, sender_id_for("node-1"));
        assert_eq!(config.effective_sender_id(), config.sender_id);
    }

    #[test]
    fn test_serde_defaults_fill_missing_fields() {
        let config: FleaseConfig =
            serde_json::from_str(r#"{"identity":"x","d_max_ms":200}"#).unwrap();
        assert_eq!(config.identity, "x");
        assert_eq!(config.d_max_ms, 200);
        assert_eq!(config.round_timeout_ms, 1000);
    }
}
