//! Store key generation.
//!
//! Every per-client key embeds the same Redis Cluster hash tag
//! (`{client:<id>}`), so a client's rate window, exceed counter and block
//! marker always land on one shard. Origin counters use their own tag
//! (`{origin:<addr>}`) because they are an independent namespace.

use std::fmt;

/// Default prefix for all rate limit keys.
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit";

/// Builds store keys under a common prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    /// Create a key space under the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The prefix every key starts with.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Per-second request counter for a client.
    pub fn rate_window(&self, client_id: &str, epoch_second: u64) -> String {
        format!("{}:{}:rps:{}", self.prefix, ClientTag(client_id), epoch_second)
    }

    /// Count of exceeded windows for a client.
    pub fn exceed_counter(&self, client_id: &str) -> String {
        format!("{}:{}:exceed", self.prefix, ClientTag(client_id))
    }

    /// Block marker for a client.
    pub fn block_marker(&self, client_id: &str) -> String {
        format!("{}:{}:blocked", self.prefix, ClientTag(client_id))
    }

    /// Per-minute request counter for an origin address.
    pub fn origin_counter(&self, origin: &str, epoch_minute: u64) -> String {
        format!("{}:{{origin:{}}}:ipm:{}", self.prefix, origin, epoch_minute)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

struct ClientTag<'a>(&'a str);

impl fmt::Display for ClientTag<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{client:{}}}", self.0)
    }
}

/// The hash tag Redis Cluster would use to place `key`: the content of the
/// first `{...}` section, if non-empty, otherwise the whole key.
pub fn hash_tag(key: &str) -> &str {
    if let Some(open) = key.find('{') {
        if let Some(len) = key[open + 1..].find('}') {
            if len > 0 {
                return &key[open + 1..open + 1 + len];
            }
        }
    }
    key
}
