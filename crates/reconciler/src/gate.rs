//! Per-resource execution gate.
//!
//! At most one workflow runs per resource identity. Acquisition never
//! waits: a held gate answers [`Error::Busy`] and the caller re-queues.
//! The table's own mutex only guards bookkeeping and is never held while a
//! workflow runs.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use playop_core::ResourceId;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{Error, Result};

struct LockEntry {
    lock: Arc<AsyncMutex<()>>,
    last_used: Instant,
}

/// Keyed registry of per-resource locks.
#[derive(Default)]
pub struct ExecutionGate {
    locks: Mutex<HashMap<ResourceId, LockEntry>>,
}

/// Proof of exclusive access to one resource. Dropping it releases the gate.
pub struct GateToken {
    resource: ResourceId,
    _guard: OwnedMutexGuard<()>,
}

impl GateToken {
    /// The resource this token guards.
    #[must_use]
    pub const fn resource(&self) -> &ResourceId {
        &self.resource
    }
}

impl fmt::Debug for GateToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateToken").field("resource", &self.resource).finish()
    }
}

impl ExecutionGate {
    /// Create an empty gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the resource's lock, creating it on first use.
    ///
    /// Not reentrant: a holder asking again gets `Busy` like anyone else.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Busy`] if a token for `resource` is outstanding.
    pub fn acquire(&self, resource: &ResourceId) -> Result<GateToken> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = locks.entry(resource.clone()).or_insert_with(|| LockEntry {
            lock: Arc::new(AsyncMutex::new(())),
            last_used: Instant::now(),
        });
        entry.last_used = Instant::now();

        let guard = Arc::clone(&entry.lock)
            .try_lock_owned()
            .map_err(|_| Error::busy(resource))?;
        Ok(GateToken {
            resource: resource.clone(),
            _guard: guard,
        })
    }

    /// Give a token back.
    pub fn release(&self, token: GateToken) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = locks.get_mut(&token.resource) {
            entry.last_used = Instant::now();
        }
        drop(locks);
        drop(token);
    }

    /// Whether a token for `resource` is outstanding.
    #[must_use]
    pub fn is_held(&self, resource: &ResourceId) -> bool {
        let locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .get(resource)
            .is_some_and(|entry| entry.lock.try_lock().is_err())
    }

    /// Drop the entry for a removed resource, unless it is held.
    pub fn forget(&self, resource: &ResourceId) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(resource)
            .is_some_and(|entry| Arc::strong_count(&entry.lock) == 1)
        {
            locks.remove(resource);
        }
    }

    /// Remove unheld entries idle for longer than `ttl`. Returns how many.
    pub fn prune_idle(&self, ttl: Duration) -> usize {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let before = locks.len();
        locks.retain(|_, entry| {
            Arc::strong_count(&entry.lock) > 1 || entry.last_used.elapsed() < ttl
        });
        let pruned = before.saturating_sub(locks.len());
        if pruned > 0 {
            debug!(pruned, remaining = locks.len(), "Pruned idle resource locks");
        }
        pruned
    }

    /// Number of tracked resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no resource has been seen yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
