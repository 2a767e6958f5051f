//! Write tokens: telling our own writes apart from external edits.
//!
//! Before writing a file the manager issues a token for its path. When the change
//! notification for that write comes back, the token is consumed and the change is treated
//! as self-inflicted. Tokens are single-use and expire; an expired token is the same as no
//! token.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::ignore_poison::IgnorePoison;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteToken {
    pub path: String,
    pub issued_at: Instant,
    pub expires_at: Instant,
    /// Modification time the write reported, once known.
    pub written_mtime: Option<i64>,
}

impl WriteToken {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

pub struct WriteTokenManager {
    tokens: Mutex<HashMap<String, WriteToken>>,
    expiry: Duration,
    require_exact_mtime: bool,
}

impl WriteTokenManager {
    /// # Arguments
    /// * `expiry` - How long a token stays valid after it's issued
    /// * `require_exact_mtime` - Only match when the observed mtime equals the written one.
    ///   Without it, any fresh token matches, so an external edit landing inside the token
    ///   window is taken for ours.
    pub fn new(expiry: Duration, require_exact_mtime: bool) -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            expiry,
            require_exact_mtime,
        }
    }

    pub fn generate_token(&self, path: &str) -> WriteToken {
        self.generate_token_at(path, Instant::now())
    }

    pub(crate) fn generate_token_at(&self, path: &str, now: Instant) -> WriteToken {
        let token = WriteToken {
            path: path.to_string(),
            issued_at: now,
            expires_at: now + self.expiry,
            written_mtime: None,
        };
        let mut tokens = self.tokens.lock_ignore_poison();
        tokens.retain(|_, t| t.is_fresh(now));
        tokens.insert(path.to_string(), token.clone());
        token
    }

    /// Records the mtime a write reported, for strict matching.
    pub fn record_write_mtime(&self, path: &str, mtime: i64) {
        if let Some(token) = self.tokens.lock_ignore_poison().get_mut(path) {
            token.written_mtime = Some(mtime);
        }
    }

    /// Consumes the token for `path` if there's a fresh one (and, in strict mode, its written
    /// mtime equals `observed_mtime`).
    pub fn match_token(&self, path: &str, observed_mtime: i64) -> Option<WriteToken> {
        self.match_token_at(path, observed_mtime, Instant::now())
    }

    pub(crate) fn match_token_at(&self, path: &str, observed_mtime: i64, now: Instant) -> Option<WriteToken> {
        let mut tokens = self.tokens.lock_ignore_poison();
        let token = tokens.get(path)?;
        if !token.is_fresh(now) {
            tokens.remove(path);
            return None;
        }
        if self.require_exact_mtime && token.written_mtime != Some(observed_mtime) {
            log::debug!(
                "Write token for '{path}' doesn't match: wrote {:?}, observed {observed_mtime}",
                token.written_mtime
            );
            return None;
        }
        tokens.remove(path)
    }

    pub fn clear(&self, path: &str) {
        self.tokens.lock_ignore_poison().remove(path);
    }

    /// Number of tokens that haven't expired yet.
    pub fn outstanding(&self) -> usize {
        let now = Instant::now();
        self.tokens.lock_ignore_poison().values().filter(|t| t.is_fresh(now)).count()
    }
}
