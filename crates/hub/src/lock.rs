// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Priority-based preemption lock. While held, the command queue does not
//! advance; only the holder's hijack-mode actions reach the browser.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::state::HubState;

/// Current lock holder.
#[derive(Debug, Clone)]
pub struct LockHold {
    pub owner: String,
    pub layer: String,
    pub priority: i64,
    pub reason: String,
    pub acquired_at: Instant,
    pub deadline: Instant,
    /// Monotonic generation; a TTL expiry only releases its own generation.
    pub generation: u64,
}

/// Result of a hijack request.
#[derive(Debug, Clone)]
pub enum AcquireOutcome {
    Granted {
        generation: u64,
        deadline: Instant,
        /// Layer of the owner that was preempted, if any.
        preempted: Option<String>,
    },
    /// Requester's priority did not beat the current owner. The refusal is
    /// silent on the wire.
    Refused,
}

#[derive(Debug, Default)]
pub struct PreemptionLock {
    inner: Mutex<Option<LockHold>>,
    generations: AtomicU64,
}

impl PreemptionLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant the lock if free, or preempt an owner with a strictly larger
    /// priority number.
    pub async fn acquire(
        &self,
        owner: &str,
        layer: &str,
        priority: i64,
        reason: &str,
        ttl: Duration,
    ) -> AcquireOutcome {
        let mut slot = self.inner.lock().await;
        let preempted = match slot.as_ref() {
            None => None,
            Some(hold) if priority < hold.priority => Some(hold.layer.clone()),
            Some(_) => return AcquireOutcome::Refused,
        };
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let now = Instant::now();
        let deadline = now + ttl;
        *slot = Some(LockHold {
            owner: owner.to_owned(),
            layer: layer.to_owned(),
            priority,
            reason: reason.to_owned(),
            acquired_at: now,
            deadline,
            generation,
        });
        AcquireOutcome::Granted { generation, deadline, preempted }
    }

    /// Release if the given agent owns the lock. Returns the hold.
    pub async fn release_by(&self, owner: &str) -> Option<LockHold> {
        let mut slot = self.inner.lock().await;
        if slot.as_ref().is_some_and(|h| h.owner == owner) {
            return slot.take();
        }
        None
    }

    /// Release a specific generation (TTL expiry). A newer hold survives.
    pub async fn release_generation(&self, generation: u64) -> Option<LockHold> {
        let mut slot = self.inner.lock().await;
        if slot.as_ref().is_some_and(|h| h.generation == generation) {
            return slot.take();
        }
        None
    }

    pub async fn is_held(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    pub async fn holder(&self) -> Option<LockHold> {
        self.inner.lock().await.clone()
    }

    /// Whether the given agent currently owns the lock.
    pub async fn owned_by(&self, owner: &str) -> bool {
        self.inner.lock().await.as_ref().is_some_and(|h| h.owner == owner)
    }
}

/// Arm the TTL for a freshly granted hold. On expiry the queue resumes as if
/// the owner had resumed without `re_check`.
pub fn spawn_ttl(state: Arc<HubState>, generation: u64, deadline: Instant) {
    tokio::spawn(async move {
        tokio::select! {
            _ = state.shutdown.cancelled() => {}
            _ = tokio::time::sleep_until(deadline) => {
                if let Some(hold) = state.lock.release_generation(generation).await {
                    tracing::warn!(
                        layer = %hold.layer,
                        reason = %hold.reason,
                        "preemption lock expired, resuming queue"
                    );
                    state.queue_notify.notify_one();
                }
            }
        }
    });
}

#[cfg(test)]
#[path = "lock_tests.rs"]
mod tests;
