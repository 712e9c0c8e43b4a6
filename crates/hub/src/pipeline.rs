// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Single-flight execution pipeline. One cooperative loop drains the queue:
//! ghost prior, aura wait, consensus, semantic resolution, driver call,
//! learning write, audit entry, completion broadcast.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::audit::{epoch_ms, AuditEntry, CommandFlags, TraceEvent};
use crate::consensus::{self, RoundOutcome};
use crate::driver::PageAction;
use crate::protocol::{self, CommandComplete};
use crate::queue::{CommandEnvelope, CommandKind};
use crate::resolve::{self, Resolution};
use crate::state::HubState;

const DRIVER_RETRY_DELAY: Duration = Duration::from_millis(200);
/// Fallback sleep when a WAIT resolution carries no `retryAfterMs`.
const WAIT_RETRY_SLEEP: Duration = Duration::from_secs(1);

/// Spawn the pipeline task. It wakes on `queue_notify` and drains until the
/// queue empties, the lock is taken, or shutdown begins.
pub fn spawn_pipeline(state: Arc<HubState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = state.queue_notify.notified() => {}
            }
            process_queue(&state).await;
        }
    })
}

enum Flow {
    Continue,
    Stop,
}

/// Drain the queue. Public for tests that drive the pipeline directly.
pub async fn process_queue(state: &Arc<HubState>) {
    loop {
        if state.shutdown.is_cancelled() || !state.mission_active.load(Ordering::Relaxed) {
            return;
        }
        if state.lock.is_held().await {
            return;
        }
        let Some(cmd) = state.queue.pop_front().await else {
            return;
        };
        state.in_flight.store(true, Ordering::SeqCst);
        let flow = run_command(state, cmd).await;
        state.in_flight.store(false, Ordering::SeqCst);
        if matches!(flow, Flow::Stop) {
            return;
        }
    }
}

fn requires_selector(kind: CommandKind) -> bool {
    matches!(
        kind,
        CommandKind::Click
            | CommandKind::Fill
            | CommandKind::Select
            | CommandKind::Hover
            | CommandKind::Check
            | CommandKind::Uncheck
            | CommandKind::Upload
    )
}

async fn run_command(state: &Arc<HubState>, mut cmd: CommandEnvelope) -> Flow {
    // Raise the stability hint to the observed settlement latency.
    if let Some(selector) = &cmd.selector {
        if let Some(ghost) = state.learning.lock().await.ghost(cmd.kind, selector) {
            cmd.stability_hint = cmd.stability_hint.max(ghost);
        }
    }

    let mut flags = CommandFlags { self_healed: cmd.self_healed, ..Default::default() };

    // Predictive wait inside a historically unstable aura.
    if state.auras.is_historically_unstable(state.started_at.elapsed()) {
        tokio::time::sleep(state.config.aura_predictive_wait()).await;
        flags.predictive_wait = true;
    }
    if cmd.stability_hint > 0 {
        tokio::time::sleep(Duration::from_millis(cmd.stability_hint)).await;
    }

    // Pre-check, unless WAIT retries are exhausted.
    if cmd.pre_check_retries >= state.config.max_pre_check_retries {
        flags.forced_proceed = true;
        tracing::warn!(command = %cmd.id, "pre-check retries exhausted, forcing through");
    } else {
        match consensus::run_round(state, &cmd).await {
            RoundOutcome::Clear => {}
            RoundOutcome::Wait { retry_after_ms } => {
                cmd.pre_check_retries += 1;
                tracing::info!(
                    command = %cmd.id,
                    retries = cmd.pre_check_retries,
                    "pre-check resolved wait, requeueing"
                );
                state.queue.push_front(cmd).await;
                let delay = retry_after_ms.map(Duration::from_millis).unwrap_or(WAIT_RETRY_SLEEP);
                tokio::time::sleep(delay).await;
                return Flow::Continue;
            }
            RoundOutcome::Cancelled => {
                // Lock taken mid-round; the command waits at the head.
                state.queue.push_front(cmd).await;
                return Flow::Stop;
            }
        }
    }

    let screenshot_before = state.screenshots.try_capture(state.driver.as_ref()).await;

    // Semantic resolution for goal-only commands.
    if cmd.selector.is_none() {
        if let Some(goal) = cmd.goal.clone() {
            let resolved = match cmd.kind {
                CommandKind::Click | CommandKind::Hover | CommandKind::Scroll => {
                    resolve::resolve_general(state, cmd.kind, &goal).await
                }
                CommandKind::Fill | CommandKind::Press | CommandKind::Upload => {
                    resolve::resolve_form_input(state, cmd.kind, &goal).await
                }
                CommandKind::Select => resolve::resolve_select(state, &goal).await,
                CommandKind::Check | CommandKind::Uncheck => {
                    resolve::resolve_checkable(state, cmd.kind, &goal).await
                }
                _ => None,
            };
            match resolved {
                Some(Resolution { selector, self_healed }) => {
                    if self_healed {
                        tracing::info!(command = %cmd.id, goal = %goal, selector = %selector, "selector self-healed from memory");
                    }
                    cmd.selector = Some(selector);
                    cmd.self_healed |= self_healed;
                    flags.self_healed |= self_healed;
                }
                None if requires_selector(cmd.kind) => {
                    let error = format!("no element matched goal {goal:?}");
                    report(state, &cmd, Outcome {
                        success: false,
                        error: Some(error),
                        duration_ms: 0,
                        flags,
                        screenshot_before,
                        screenshot_after: None,
                    })
                    .await;
                    return Flow::Continue;
                }
                None => {}
            }
        }
    }

    // Execute against the driver, retrying once on failure.
    let started = Instant::now();
    let (success, error) = execute(state, &cmd).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    if success {
        if let (Some(goal), Some(selector)) = (&cmd.goal, &cmd.selector) {
            let mut learning = state.learning.lock().await;
            learning.learn(cmd.kind, goal, selector);
            flags.learned = true;
        }
        if let Some(selector) = &cmd.selector {
            state.learning.lock().await.observe_ghost(cmd.kind, selector, duration_ms);
        }
    }

    if cmd.kind == CommandKind::Checkpoint {
        let name = cmd.name.clone().unwrap_or_default();
        state
            .trace
            .push(TraceEvent {
                ts: epoch_ms(),
                method: "checkpoint".to_owned(),
                summary: name,
                dom_snapshot: None,
            })
            .await;
    }

    let screenshot_after = state.screenshots.try_capture(state.driver.as_ref()).await;
    report(state, &cmd, Outcome {
        success,
        error,
        duration_ms,
        flags,
        screenshot_before,
        screenshot_after,
    })
    .await;
    Flow::Continue
}

/// Map a command to its page action. `Ok(None)` means no driver call
/// (checkpoint, nop).
fn build_action(cmd: &CommandEnvelope) -> Result<Option<PageAction>, String> {
    fn need(field: &Option<String>, what: &str) -> Result<String, String> {
        field.clone().ok_or_else(|| format!("missing {what}"))
    }
    let action = match cmd.kind {
        CommandKind::Goto => PageAction::Goto { url: need(&cmd.url, "url")? },
        CommandKind::Click => PageAction::Click { selector: need(&cmd.selector, "selector")? },
        CommandKind::Fill => PageAction::Fill {
            selector: need(&cmd.selector, "selector")?,
            text: need(&cmd.text, "text")?,
        },
        CommandKind::Press => PageAction::Press {
            selector: cmd.selector.clone(),
            key: need(&cmd.key, "key")?,
        },
        CommandKind::Type => PageAction::Type {
            selector: cmd.selector.clone(),
            text: need(&cmd.text, "text")?,
        },
        CommandKind::Scroll => PageAction::Scroll { selector: cmd.selector.clone() },
        CommandKind::Select => PageAction::Select {
            selector: need(&cmd.selector, "selector")?,
            value: need(&cmd.value, "value")?,
        },
        CommandKind::Hover => PageAction::Hover { selector: need(&cmd.selector, "selector")? },
        CommandKind::Check => PageAction::SetChecked {
            selector: need(&cmd.selector, "selector")?,
            checked: true,
        },
        CommandKind::Uncheck => PageAction::SetChecked {
            selector: need(&cmd.selector, "selector")?,
            checked: false,
        },
        CommandKind::Upload => {
            if cmd.files.is_empty() {
                return Err("missing files".to_owned());
            }
            PageAction::Upload {
                selector: need(&cmd.selector, "selector")?,
                files: cmd.files.clone(),
            }
        }
        CommandKind::Checkpoint | CommandKind::Nop => return Ok(None),
    };
    Ok(Some(action))
}

async fn execute(state: &HubState, cmd: &CommandEnvelope) -> (bool, Option<String>) {
    let action = match build_action(cmd) {
        Ok(Some(action)) => action,
        Ok(None) => return (true, None),
        Err(msg) => return (false, Some(msg)),
    };
    match state.driver.perform(action.clone()).await {
        Ok(()) => (true, None),
        Err(first) => {
            tracing::debug!(command = %cmd.id, err = %first, "driver call failed, retrying once");
            tokio::time::sleep(DRIVER_RETRY_DELAY).await;
            match state.driver.perform(action).await {
                Ok(()) => (true, None),
                Err(second) => (false, Some(second.to_string())),
            }
        }
    }
}

struct Outcome {
    success: bool,
    error: Option<String>,
    duration_ms: u64,
    flags: CommandFlags,
    screenshot_before: Option<String>,
    screenshot_after: Option<String>,
}

/// Record the terminal outcome: exactly one COMMAND audit entry per
/// dequeued command, plus the completion broadcast to clients.
async fn report(state: &HubState, cmd: &CommandEnvelope, outcome: Outcome) {
    state
        .audit
        .push(AuditEntry::Command {
            ts: epoch_ms(),
            id: cmd.id.clone(),
            cmd: cmd.kind.as_str().to_owned(),
            selector: cmd.selector.clone(),
            goal: cmd.goal.clone(),
            success: outcome.success,
            error: outcome.error.clone(),
            duration_ms: outcome.duration_ms,
            flags: outcome.flags,
            screenshot_before: outcome.screenshot_before,
            screenshot_after: outcome.screenshot_after,
        })
        .await;

    let context = match state.driver.page_context().await {
        Ok(ctx) => serde_json::to_value(ctx).unwrap_or_default(),
        Err(_) => serde_json::Value::Null,
    };
    let frame = protocol::notification(
        "command_complete",
        CommandComplete {
            id: &cmd.id,
            success: outcome.success,
            error: outcome.error.as_deref(),
            context,
            learned: outcome.flags.learned,
            self_healed: outcome.flags.self_healed,
        },
    );
    state.clients.broadcast(&frame).await;

    if !outcome.success {
        tracing::warn!(
            command = %cmd.id,
            cmd = cmd.kind.as_str(),
            error = outcome.error.as_deref().unwrap_or("unknown"),
            "command failed"
        );
    }
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
