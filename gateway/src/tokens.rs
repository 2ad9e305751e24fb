//! Token correlation store
//!
//! Maps a session token observed while *recording* to the value the
//! target hands out while *replaying*, so later requests can be rewritten
//! to carry the live value.
//!
//! ```text
//! JSESSIONID ──► { Some("abc") ──► "zzz" }    exact: recorded "abc" became "zzz"
//!            └─► { None        ──► "w"   }    wildcard: fallback for anything else
//! ```
//!
//! Entries are upserted and never evicted; the store lives for one replay
//! session. Concurrent `observe` calls are last-write-wins.

use parking_lot::RwLock;
use std::collections::HashMap;

type Values = HashMap<Option<String>, String>;

/// Thread-safe token correlation store
///
/// Shared between workers behind an `Arc`; all synchronization is internal.
///
/// # Example
///
/// ```
/// use kaiku_gateway::TokenStore;
///
/// let tokens = TokenStore::new();
/// tokens.observe("JSESSIONID", Some("zzz"), Some("abc"));
///
/// assert_eq!(tokens.lookup("JSESSIONID", Some("abc")).as_deref(), Some("zzz"));
/// assert_eq!(tokens.lookup("JSESSIONID", Some("other")), None);
/// ```
#[derive(Debug, Default)]
pub struct TokenStore {
    tokens: RwLock<HashMap<String, Values>>,
}

impl TokenStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Record that `name` was `observed` where the recording had `original`
    ///
    /// `original = None` records the wildcard entry. An absent `observed`
    /// value is stored as the empty token. Nothing is recorded when both
    /// are absent.
    pub fn observe(&self, name: &str, observed: Option<&str>, original: Option<&str>) {
        if observed.is_none() && original.is_none() {
            return;
        }
        let mut tokens = self.tokens.write();
        tokens
            .entry(name.to_string())
            .or_default()
            .insert(original.map(str::to_string), observed.unwrap_or_default().to_string());
    }

    /// Latest observed value for `name` recorded as `original`
    ///
    /// Falls back to the wildcard entry when `original` was never observed.
    /// `None` means not found; the caller should leave the token alone.
    pub fn lookup(&self, name: &str, original: Option<&str>) -> Option<String> {
        let tokens = self.tokens.read();
        let values = tokens.get(name)?;
        values
            .get(&original.map(str::to_string))
            .or_else(|| values.get(&None))
            .cloned()
    }

    /// Number of token names with at least one entry
    pub fn len(&self) -> usize {
        self.tokens.read().len()
    }

    /// Check if nothing has been observed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
