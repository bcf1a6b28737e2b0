//! Key-scoped launch arbitration.
//!
//! A [`ResourceLock`] decides who may (re)launch a given executable. It
//! enforces two rules:
//!
//! 1. a global minimum spacing between any two successful acquisitions,
//!    across all keys, so launches are staggered;
//! 2. at most one valid owner per key. The current owner may re-acquire; a
//!    different owner is refused with a reason naming the holder.
//!
//! Keys are case-insensitive (stored upper-cased, matching file paths on the
//! target platform). The registry is constructed explicitly and shared by
//! cloning.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::suspend::Suspension;
use crate::{AppError, Result};

/// Why an acquisition was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refusal {
    /// Another acquisition happened too recently.
    Throttled {
        /// Time left until the throttle window closes.
        remaining: Duration,
    },
    /// A different owner holds the key.
    Held {
        /// Upper-cased key.
        key: String,
        /// Current owner.
        owner: String,
    },
}

impl Display for Refusal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Throttled { remaining } => {
                write!(f, "waiting to launch ({}ms left)", remaining.as_millis())
            }
            Self::Held { owner, .. } => write!(f, "waiting on {owner} to release lock"),
        }
    }
}

#[derive(Debug)]
struct Entry {
    owner: Option<String>,
    generation: u64,
}

#[derive(Debug, Default)]
struct LockTable {
    entries: HashMap<String, Entry>,
    last_acquired: Option<Instant>,
    next_generation: u64,
}

impl LockTable {
    fn is_current(&self, key: &str, owner: &str, generation: u64) -> bool {
        self.entries.get(key).is_some_and(|entry| {
            entry.generation == generation && entry.owner.as_deref() == Some(owner)
        })
    }
}

/// Shared arbitrator. Cloning shares the same table.
#[derive(Debug, Clone)]
pub struct ResourceLock {
    table: Arc<Mutex<LockTable>>,
    min_interval: Duration,
}

impl ResourceLock {
    /// Create an empty registry with the given acquisition spacing.
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self {
            table: Arc::new(Mutex::new(LockTable::default())),
            min_interval,
        }
    }

    /// Try to take `key` for `owner`.
    ///
    /// # Errors
    ///
    /// [`Refusal::Throttled`] inside the spacing window,
    /// [`Refusal::Held`] when a different owner holds a valid token.
    pub fn acquire(&self, key: &str, owner: &str) -> std::result::Result<LockToken, Refusal> {
        let key = normalize(key);
        let mut table = self.lock();
        let now = Instant::now();

        if let Some(last) = table.last_acquired {
            let since = now.saturating_duration_since(last);
            if since < self.min_interval {
                return Err(Refusal::Throttled {
                    remaining: self.min_interval - since,
                });
            }
        }

        let existing = table
            .entries
            .get(&key)
            .and_then(|entry| entry.owner.clone().map(|holder| (holder, entry.generation)));
        match existing {
            Some((holder, _)) if holder != owner => {
                return Err(Refusal::Held { key, owner: holder });
            }
            Some((_, generation)) => {
                // The holder re-acquiring keeps its generation so earlier
                // tokens stay valid.
                table.last_acquired = Some(now);
                debug!(key, owner, "lock re-acquired by holder");
                return Ok(self.token(key, owner, generation));
            }
            None => {}
        }

        table.next_generation += 1;
        let generation = table.next_generation;
        table.entries.insert(
            key.clone(),
            Entry {
                owner: Some(owner.to_owned()),
                generation,
            },
        );
        table.last_acquired = Some(now);
        info!(key, owner, "lock acquired");
        Ok(self.token(key, owner, generation))
    }

    /// Poll [`acquire`](Self::acquire) until it succeeds, sleeping between
    /// attempts (the throttle remainder, or `retry_every` while held).
    ///
    /// # Errors
    ///
    /// [`AppError::Cancelled`] if the suspension fires while waiting.
    pub async fn acquire_with_backoff(
        &self,
        key: &str,
        owner: &str,
        retry_every: Duration,
        suspension: &Suspension,
    ) -> Result<LockToken> {
        let mut last_reason = String::new();
        loop {
            suspension.checkpoint().await?;
            match self.acquire(key, owner) {
                Ok(token) => return Ok(token),
                Err(refusal) => {
                    let reason = refusal.to_string();
                    if reason != last_reason {
                        info!(key, owner, %reason, "lock refused");
                        last_reason = reason;
                    }
                    let wait = match refusal {
                        Refusal::Throttled { remaining } => remaining.max(retry_every),
                        Refusal::Held { .. } => retry_every,
                    };
                    suspension.sleep(wait).await?;
                }
            }
        }
    }

    /// Whether `token` still grants its privilege.
    #[must_use]
    pub fn is_valid(&self, token: &LockToken) -> bool {
        token.is_valid()
    }

    /// Current owner of `key`, if any.
    #[must_use]
    pub fn holder(&self, key: &str) -> Option<String> {
        let table = self.lock();
        table
            .entries
            .get(&normalize(key))
            .and_then(|entry| entry.owner.clone())
    }

    /// Drop whatever owner holds `key`, invalidating its tokens.
    pub fn force_release(&self, key: &str) {
        let key = normalize(key);
        let mut table = self.lock();
        if let Some(entry) = table.entries.get_mut(&key) {
            if let Some(owner) = entry.owner.take() {
                info!(key, owner, "lock force-released");
            }
        }
    }

    fn token(&self, key: String, owner: &str, generation: u64) -> LockToken {
        LockToken {
            table: Arc::clone(&self.table),
            key,
            owner: owner.to_owned(),
            generation,
            released: false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LockTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Proof of ownership of one key. Released on drop.
#[derive(Debug)]
pub struct LockToken {
    table: Arc<Mutex<LockTable>>,
    key: String,
    owner: String,
    generation: u64,
    released: bool,
}

impl LockToken {
    /// Upper-cased key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Owner recorded at acquisition.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// `false` once released, force-released, or superseded.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if self.released {
            return false;
        }
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.is_current(&self.key, &self.owner, self.generation)
    }

    /// Give the key back. Equivalent to dropping the token.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if table.is_current(&self.key, &self.owner, self.generation) {
            if let Some(entry) = table.entries.get_mut(&self.key) {
                entry.owner = None;
            }
            debug!(key = %self.key, owner = %self.owner, "lock released");
        }
    }
}

impl Drop for LockToken {
    fn drop(&mut self) {
        self.release_inner();
    }
}

fn normalize(key: &str) -> String {
    key.to_uppercase()
}

impl From<Refusal> for AppError {
    fn from(refusal: Refusal) -> Self {
        Self::ProcessUnavailable(refusal.to_string())
    }
}
