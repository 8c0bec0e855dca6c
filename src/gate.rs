//! Per-credential mutual exclusion.
//!
//! At most one request may hold a credential at a time. Each token maps to its own
//! async mutex; the registry itself sits behind a short-lived sync lock.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct ConcurrencyGate {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Exclusive hold on one credential. Released on drop.
#[derive(Debug)]
pub struct GateGuard {
    token: String,
    _held: OwnedMutexGuard<()>,
}

impl GateGuard {
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl ConcurrencyGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, token: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(token.to_owned())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Waits until the credential is free, then holds it.
    pub async fn acquire(&self, token: &str) -> GateGuard {
        let slot = self.slot(token);
        GateGuard {
            token: token.to_owned(),
            _held: slot.lock_owned().await,
        }
    }

    pub fn try_acquire(&self, token: &str) -> Option<GateGuard> {
        let slot = self.slot(token);
        slot.try_lock_owned().ok().map(|held| GateGuard {
            token: token.to_owned(),
            _held: held,
        })
    }

    pub fn is_held(&self, token: &str) -> bool {
        self.locks
            .lock()
            .get(token)
            .is_some_and(|slot| slot.try_lock().is_err())
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops the registry entry of a deleted credential unless someone holds or
    /// waits on it.
    pub fn forget(&self, token: &str) {
        let mut locks = self.locks.lock();
        if locks
            .get(token)
            .is_some_and(|slot| Arc::strong_count(slot) == 1 && slot.try_lock().is_ok())
        {
            locks.remove(token);
        }
    }
}
