// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! FIFO command queue. Single producer per client, single consumer (the
//! execution pipeline); at most one command is ever in flight.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::protocol::IntentParams;

/// Command kinds accepted from clients, plus the internal `nop` sentinel
/// unshifted by `resume(re_check)` to force a fresh pre-check cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Goto,
    Click,
    Fill,
    Press,
    Type,
    Scroll,
    Select,
    Hover,
    Check,
    Uncheck,
    Upload,
    Checkpoint,
    Nop,
}

impl CommandKind {
    pub fn from_wire(cmd: &str) -> Option<Self> {
        match cmd {
            "goto" => Some(Self::Goto),
            "click" => Some(Self::Click),
            "fill" => Some(Self::Fill),
            "press" => Some(Self::Press),
            "type" => Some(Self::Type),
            "scroll" => Some(Self::Scroll),
            "select" => Some(Self::Select),
            "hover" => Some(Self::Hover),
            "check" => Some(Self::Check),
            "uncheck" => Some(Self::Uncheck),
            "upload" => Some(Self::Upload),
            "checkpoint" => Some(Self::Checkpoint),
            "nop" => Some(Self::Nop),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Goto => "goto",
            Self::Click => "click",
            Self::Fill => "fill",
            Self::Press => "press",
            Self::Type => "type",
            Self::Scroll => "scroll",
            Self::Select => "select",
            Self::Hover => "hover",
            Self::Check => "check",
            Self::Uncheck => "uncheck",
            Self::Upload => "upload",
            Self::Checkpoint => "checkpoint",
            Self::Nop => "nop",
        }
    }
}

/// One queued intent plus hub bookkeeping.
#[derive(Debug, Clone)]
pub struct CommandEnvelope {
    pub id: String,
    pub kind: CommandKind,
    pub selector: Option<String>,
    pub goal: Option<String>,
    pub url: Option<String>,
    pub text: Option<String>,
    pub key: Option<String>,
    pub value: Option<String>,
    pub files: Vec<String>,
    pub name: Option<String>,
    /// Advisory settle time in milliseconds, raised by ghost latencies.
    pub stability_hint: u64,
    /// Incremented each time a consensus round resolves WAIT for this command.
    pub pre_check_retries: u32,
    /// Set when the selector came from the learning store instead of a live
    /// resolution.
    pub self_healed: bool,
}

impl CommandEnvelope {
    /// Build from a client intent. `None` when the command kind is unknown.
    pub fn from_intent(params: IntentParams) -> Option<Self> {
        let kind = CommandKind::from_wire(&params.cmd)?;
        let id = params.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Some(Self {
            id,
            kind,
            selector: params.selector,
            goal: params.goal,
            url: params.url,
            text: params.text,
            key: params.key,
            value: params.value,
            files: params.files,
            name: params.name,
            stability_hint: params.stability_hint.unwrap_or(0),
            pre_check_retries: 0,
            self_healed: false,
        })
    }

    /// The harmless sentinel prepended on `resume(re_check)`.
    pub fn nop() -> Self {
        Self {
            id: format!("nop-{}", uuid::Uuid::new_v4()),
            kind: CommandKind::Nop,
            selector: None,
            goal: None,
            url: None,
            text: None,
            key: None,
            value: None,
            files: Vec::new(),
            name: None,
            stability_hint: 0,
            pre_check_retries: 0,
            self_healed: false,
        }
    }

    /// Summary of the command for pre-check broadcasts and trace entries.
    pub fn wire_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "cmd": self.kind.as_str(),
            "selector": self.selector,
            "goal": self.goal,
            "url": self.url,
        })
    }
}

/// Mutex-guarded FIFO of pending commands.
#[derive(Debug, Default)]
pub struct CommandQueue {
    inner: Mutex<VecDeque<CommandEnvelope>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self { inner: Mutex::new(VecDeque::new()) }
    }

    pub async fn push_back(&self, cmd: CommandEnvelope) {
        self.inner.lock().await.push_back(cmd);
    }

    /// Requeue at the head (WAIT retry, lock cancellation, `nop` sentinel).
    pub async fn push_front(&self, cmd: CommandEnvelope) {
        self.inner.lock().await.push_front(cmd);
    }

    pub async fn pop_front(&self) -> Option<CommandEnvelope> {
        self.inner.lock().await.pop_front()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Command ids in queue order, for tests and diagnostics.
    pub async fn ids(&self) -> Vec<String> {
        self.inner.lock().await.iter().map(|c| c.id.clone()).collect()
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
