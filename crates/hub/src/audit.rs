// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Mission trace and audit log. The trace is a bounded rolling ring of
//! inbound-envelope summaries; the audit log is the ordered record the
//! report renderer consumes.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// One rolling-trace entry: a redacted summary of an inbound envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Epoch milliseconds.
    pub ts: u64,
    pub method: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dom_snapshot: Option<String>,
}

/// Best-effort rolling trace. Oldest entries drop when the ring is full.
#[derive(Debug)]
pub struct MissionTrace {
    inner: Mutex<VecDeque<TraceEvent>>,
    capacity: usize,
    last_throttled: Mutex<Option<std::time::Instant>>,
}

impl MissionTrace {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            last_throttled: Mutex::new(None),
        }
    }

    pub async fn push(&self, event: TraceEvent) {
        let mut ring = self.inner.lock().await;
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(event);
    }

    /// Push subject to a minimum gap. Liveness beats go through here so a
    /// chatty agent cannot wash the ring out.
    pub async fn push_throttled(&self, event: TraceEvent, min_gap: std::time::Duration) {
        {
            let mut last = self.last_throttled.lock().await;
            if let Some(at) = *last {
                if at.elapsed() < min_gap {
                    return;
                }
            }
            *last = Some(std::time::Instant::now());
        }
        self.push(event).await;
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Ordered snapshot, oldest first.
    pub async fn snapshot(&self) -> Vec<TraceEvent> {
        self.inner.lock().await.iter().cloned().collect()
    }
}

/// Flags recorded with each executed command.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CommandFlags {
    #[serde(default)]
    pub self_healed: bool,
    #[serde(default)]
    pub predictive_wait: bool,
    #[serde(default)]
    pub forced_proceed: bool,
    #[serde(default)]
    pub learned: bool,
}

/// Typed audit entries, in mission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEntry {
    Hijack {
        ts: u64,
        agent_layer: String,
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        screenshot: Option<String>,
    },
    Command {
        ts: u64,
        id: String,
        cmd: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        selector: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        goal: Option<String>,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        duration_ms: u64,
        flags: CommandFlags,
        #[serde(skip_serializing_if = "Option::is_none")]
        screenshot_before: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        screenshot_after: Option<String>,
    },
    Failure {
        ts: u64,
        reason: String,
    },
    SentinelError {
        ts: u64,
        agent_layer: String,
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
    MissionFailure {
        ts: u64,
        reason: String,
    },
}

/// Ordered audit accumulator. Rendering is a collaborator's job; this store
/// only publishes the slice.
#[derive(Debug, Default)]
pub struct AuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, entry: AuditEntry) {
        self.entries.lock().await.push(entry);
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().await.clone()
    }

    /// Count of COMMAND entries, used by the drain logic and tests.
    pub async fn command_count(&self) -> usize {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|e| matches!(e, AuditEntry::Command { .. }))
            .count()
    }
}

/// Return current epoch millis.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
#[path = "audit_tests.rs"]
mod tests;
