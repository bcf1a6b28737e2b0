//! License key pool.
//!
//! Keys are opaque strings. [`KeyPool::allocate`] moves one out of the pool
//! into a [`LeaseToken`]; disposing (or dropping) the token moves it back,
//! exactly once.

use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use crate::{AppError, Result};

/// A license key whose `Debug` output is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct LicenseKey(String);

impl LicenseKey {
    /// Wrap a raw key.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The raw key, for the driver's command line.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Debug for LicenseKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("LicenseKey(<redacted>)")
    }
}

#[derive(Debug)]
struct PoolInner {
    free: Vec<LicenseKey>,
    capacity: usize,
}

/// Shared pool of license keys. Cloning shares the same pool.
#[derive(Debug, Clone)]
pub struct KeyPool {
    inner: Arc<Mutex<PoolInner>>,
}

impl KeyPool {
    /// Pool holding `keys`. Blank and duplicate keys are dropped.
    #[must_use]
    pub fn new(keys: impl IntoIterator<Item = String>) -> Self {
        let mut free: Vec<LicenseKey> = Vec::new();
        for key in keys {
            let key = key.trim();
            if key.is_empty() || free.iter().any(|k| k.expose() == key) {
                continue;
            }
            free.push(LicenseKey::new(key));
        }
        let capacity = free.len();
        Self {
            inner: Arc::new(Mutex::new(PoolInner { free, capacity })),
        }
    }

    /// Lease a free key.
    ///
    /// # Errors
    ///
    /// [`AppError::NoFreeKeys`] when every key is leased (or there are none).
    pub fn allocate(&self) -> Result<LeaseToken> {
        let key = self.lock().free.pop().ok_or(AppError::NoFreeKeys)?;
        debug!(free = self.free_count(), "license key leased");
        Ok(LeaseToken {
            pool: Arc::clone(&self.inner),
            key: Some(key),
        })
    }

    /// Keys currently free.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.lock().free.len()
    }

    /// Total keys the pool was built with.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A leased key. Returned to its pool on [`dispose`](Self::dispose) or drop.
#[derive(Debug)]
pub struct LeaseToken {
    pool: Arc<Mutex<PoolInner>>,
    key: Option<LicenseKey>,
}

impl LeaseToken {
    /// The leased key.
    ///
    /// # Errors
    ///
    /// [`AppError::InvalidArgument`] after the lease was disposed.
    pub fn key(&self) -> Result<&LicenseKey> {
        self.key
            .as_ref()
            .ok_or_else(|| AppError::InvalidArgument("license lease already disposed".into()))
    }

    /// Whether the key has gone back to the pool.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.key.is_none()
    }

    /// Return the key. Later calls do nothing.
    pub fn dispose(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        if pool.free.len() >= pool.capacity || pool.free.contains(&key) {
            warn!("license key returned to a full pool; dropping it");
            return;
        }
        pool.free.push(key);
        debug!(free = pool.free.len(), "license key returned");
    }
}

impl Drop for LeaseToken {
    fn drop(&mut self) {
        self.dispose();
    }
}
