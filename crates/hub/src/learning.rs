// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Self-healing memory: goal-to-selector mappings, observed settlement
//! latencies ("ghosts"), and historically unstable time buckets ("auras").
//! Loaded on startup, merged and written atomically on shutdown.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audit::{epoch_ms, TraceEvent};
use crate::queue::CommandKind;

/// In-memory learning state. Mappings are overwrite-only: nothing is ever
/// implicitly deleted.
#[derive(Debug, Default)]
pub struct LearningStore {
    memory: HashMap<String, String>,
    ghosts: HashMap<String, u64>,
}

fn goal_key(kind: CommandKind, goal: &str) -> String {
    format!("{}:{}", kind.as_str(), goal)
}

fn ghost_key(kind: CommandKind, selector: &str) -> String {
    format!("{}|{}", kind.as_str(), selector)
}

impl LearningStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful resolution under both the `(cmd, goal)` and the
    /// bare `goal` key.
    pub fn learn(&mut self, kind: CommandKind, goal: &str, selector: &str) {
        self.memory.insert(goal_key(kind, goal), selector.to_owned());
        self.memory.insert(goal.to_owned(), selector.to_owned());
    }

    /// Look up a historical selector: `(cmd, goal)` first, then bare `goal`.
    pub fn recall(&self, kind: CommandKind, goal: &str) -> Option<&str> {
        self.memory
            .get(&goal_key(kind, goal))
            .or_else(|| self.memory.get(goal))
            .map(String::as_str)
    }

    /// Look up under the bare goal only (general-resolver fallback).
    pub fn recall_bare(&self, goal: &str) -> Option<&str> {
        self.memory.get(goal).map(String::as_str)
    }

    /// Record an observed settlement latency for `(cmd, selector)`.
    pub fn observe_ghost(&mut self, kind: CommandKind, selector: &str, latency_ms: u64) {
        self.ghosts.insert(ghost_key(kind, selector), latency_ms);
    }

    pub fn ghost(&self, kind: CommandKind, selector: &str) -> Option<u64> {
        self.ghosts.get(&ghost_key(kind, selector)).copied()
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    /// Merge a persisted flat map into memory. Existing in-memory entries
    /// win: they are the fresher observations.
    pub fn merge_persisted(&mut self, persisted: HashMap<String, String>) {
        for (k, v) in persisted {
            self.memory.entry(k).or_insert(v);
        }
    }

    fn export(&self) -> HashMap<String, String> {
        self.memory.clone()
    }
}

/// Load `memory.json` if present, ignoring parse errors.
pub fn load_memory(path: &Path) -> HashMap<String, String> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };
    match serde_json::from_str(&contents) {
        Ok(map) => map,
        Err(e) => {
            tracing::warn!(path = %path.display(), err = %e, "ignoring unparseable memory file");
            HashMap::new()
        }
    }
}

/// Load `trace.json` if present, ignoring parse errors.
pub fn load_trace(path: &Path) -> Vec<TraceEvent> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    match serde_json::from_str(&contents) {
        Ok(events) => events,
        Err(e) => {
            tracing::warn!(path = %path.display(), err = %e, "ignoring unparseable trace file");
            Vec::new()
        }
    }
}

/// Save the learning store: take the TTL'd file lock, merge in-memory
/// overrides onto whatever is on disk, and write tmp + rename.
pub fn save_memory(path: &Path, store: &LearningStore, lock_ttl: Duration) -> anyhow::Result<()> {
    let _lock = MemoryFileLock::acquire(path, lock_ttl)?;

    let mut merged = load_memory(path);
    for (k, v) in store.export() {
        merged.insert(k, v);
    }

    let json = serde_json::to_string_pretty(&merged)?;
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Save the recent mission trace (bounded upstream by the ring capacity).
pub fn save_trace(path: &Path, events: &[TraceEvent]) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(events)?;
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Advisory lock file guarding memory writes across hub processes. A lock
/// older than the TTL is considered stale and is taken over.
struct MemoryFileLock {
    path: PathBuf,
}

impl MemoryFileLock {
    fn acquire(target: &Path, ttl: Duration) -> anyhow::Result<Self> {
        let path = target.with_extension("lock");
        if let Ok(contents) = std::fs::read_to_string(&path) {
            let held_since: u64 = contents.trim().parse().unwrap_or(0);
            let age = epoch_ms().saturating_sub(held_since);
            if age < ttl.as_millis() as u64 {
                anyhow::bail!("memory lock held (age {age}ms < ttl {}ms)", ttl.as_millis());
            }
            tracing::warn!(path = %path.display(), age_ms = age, "taking over stale memory lock");
        }
        std::fs::write(&path, epoch_ms().to_string())?;
        Ok(Self { path })
    }
}

impl Drop for MemoryFileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

// -- Auras --------------------------------------------------------------------

/// Methods that count as entropy evidence when bucketing a prior trace.
fn is_entropy_evidence(method: &str) -> bool {
    method.ends_with("hijack") || method.ends_with("wait") || method.ends_with("error")
}

/// Time buckets, relative to mission start, that were historically unstable.
/// Queries apply a one-bucket predictive buffer on each side.
#[derive(Debug, Default)]
pub struct AuraIndex {
    buckets: HashSet<u64>,
    bucket_ms: u64,
}

impl AuraIndex {
    /// Bucket a prior mission's trace. Offsets are taken relative to the
    /// first entry's timestamp.
    pub fn from_trace(events: &[TraceEvent], bucket_ms: u64) -> Self {
        let mut buckets = HashSet::new();
        let bucket_ms = bucket_ms.max(1);
        if let Some(first) = events.first() {
            for event in events {
                if is_entropy_evidence(&event.method) {
                    buckets.insert(event.ts.saturating_sub(first.ts) / bucket_ms);
                }
            }
        }
        Self { buckets, bucket_ms }
    }

    /// Whether the bucket for the given mission offset, its predecessor, or
    /// its successor saw instability.
    pub fn is_historically_unstable(&self, offset: Duration) -> bool {
        if self.buckets.is_empty() {
            return false;
        }
        let bucket = offset.as_millis() as u64 / self.bucket_ms.max(1);
        self.buckets.contains(&bucket)
            || self.buckets.contains(&(bucket + 1))
            || (bucket > 0 && self.buckets.contains(&(bucket - 1)))
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
#[path = "learning_tests.rs"]
mod tests;
