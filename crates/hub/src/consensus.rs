// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Consensus engine: one pre-check round per command, quorum with veto,
//! a mandatory settlement window, and three timers (overall budget,
//! settlement, sub-unanimous consensus timeout).

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::driver::TargetRect;
use crate::protocol;
use crate::queue::CommandEnvelope;
use crate::registry::AgentEntry;
use crate::state::HubState;

const CONFIDENCE_EPS: f64 = 1e-9;

/// A single agent's reply to a pre-check.
#[derive(Debug, Clone, PartialEq)]
pub enum Vote {
    Clear { confidence: f64 },
    Wait { retry_after_ms: Option<u64> },
    /// Explicit error reply: counts as a response with zero confidence.
    Error,
}

#[derive(Debug)]
struct VoteMsg {
    agent_id: String,
    vote: Vote,
}

/// How a round resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum RoundOutcome {
    Clear,
    Wait { retry_after_ms: Option<u64> },
    /// The preemption lock was taken mid-round; the command goes back to
    /// the queue head.
    Cancelled,
}

struct ActiveRound {
    round_id: u64,
    participants: HashSet<String>,
    vote_tx: mpsc::UnboundedSender<VoteMsg>,
    cancel: CancellationToken,
}

/// Holder for the at-most-one open round. Votes for any other round are
/// discarded at submission.
#[derive(Default)]
pub struct RoundSlot {
    inner: Mutex<Option<ActiveRound>>,
    counter: AtomicU64,
}

impl RoundSlot {
    pub fn new() -> Self {
        Self::default()
    }

    async fn begin(
        &self,
        participants: HashSet<String>,
    ) -> (u64, mpsc::UnboundedReceiver<VoteMsg>, CancellationToken) {
        let round_id = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let (vote_tx, vote_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        *self.inner.lock().await = Some(ActiveRound {
            round_id,
            participants,
            vote_tx,
            cancel: cancel.clone(),
        });
        (round_id, vote_rx, cancel)
    }

    async fn finish(&self, round_id: u64) {
        let mut slot = self.inner.lock().await;
        if slot.as_ref().is_some_and(|r| r.round_id == round_id) {
            *slot = None;
        }
    }

    /// Route a vote into the open round. Returns false when the vote is
    /// stale (no round, or the sender is not a participant).
    pub async fn submit(&self, agent_id: &str, vote: Vote) -> bool {
        let slot = self.inner.lock().await;
        match slot.as_ref() {
            Some(round) if round.participants.contains(agent_id) => round
                .vote_tx
                .send(VoteMsg { agent_id: agent_id.to_owned(), vote })
                .is_ok(),
            _ => false,
        }
    }

    /// Reject all pending responses for the open round (lock acquisition).
    pub async fn cancel_active(&self) {
        if let Some(round) = self.inner.lock().await.as_ref() {
            round.cancel.cancel();
        }
    }

    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.is_some()
    }
}

/// Pre-check broadcast payload.
#[derive(Debug, Serialize)]
struct PreCheck {
    command: Value,
    blocking: Vec<String>,
    #[serde(rename = "targetRect", skip_serializing_if = "Option::is_none")]
    target_rect: Option<TargetRect>,
    #[serde(skip_serializing_if = "Option::is_none")]
    screenshot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    page_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    a11y_snapshot: Option<Value>,
}

async fn build_pre_check(
    state: &HubState,
    cmd: &CommandEnvelope,
    participants: &[Arc<AgentEntry>],
) -> PreCheck {
    let mut seen = HashSet::new();
    let mut blocking = Vec::new();
    for agent in participants {
        for selector in &agent.selectors {
            if seen.insert(selector.clone()) {
                blocking.push(selector.clone());
            }
        }
    }

    let target_rect = match &cmd.selector {
        Some(selector) => state.driver.target_rect(selector).await.unwrap_or(None),
        None => None,
    };

    let wants = |cap: &str| participants.iter().any(|a| a.capabilities.contains(cap));
    let screenshot = if wants("vision") {
        state.screenshots.try_capture(state.driver.as_ref()).await
    } else {
        None
    };
    let page_text = if wants("pii") {
        state.driver.visible_text().await.ok()
    } else {
        None
    };
    let a11y_snapshot = if wants("accessibility") {
        state.driver.a11y_snapshot().await.ok()
    } else {
        None
    };

    PreCheck {
        command: cmd.wire_summary(),
        blocking,
        target_rect,
        screenshot,
        page_text,
        a11y_snapshot,
    }
}

async fn sleep_opt(at: Option<Instant>) {
    match at {
        Some(t) => tokio::time::sleep_until(t).await,
        None => std::future::pending().await,
    }
}

/// Run one consensus round for the command at the head of the queue.
///
/// Ordering: the pre-check fans out in precedence order, so a
/// high-priority veto strictly happens-before lower-priority clears.
pub async fn run_round(state: &Arc<HubState>, cmd: &CommandEnvelope) -> RoundOutcome {
    let participants = state.registry.relevant_agents(state.config.relevance_threshold).await;
    if participants.is_empty() {
        // No relevant agents: clear immediately, no settlement delay.
        return RoundOutcome::Clear;
    }

    let started = Instant::now();
    let mut settlement = state.config.settlement_window();
    if state.config.stability_extends_settlement && cmd.stability_hint > 0 {
        settlement = settlement.max(Duration::from_millis(cmd.stability_hint));
    }
    let settle_at = started + settlement;
    let budget_at = started + state.config.sync_budget();

    let participant_ids: HashSet<String> =
        participants.iter().map(|a| a.id.clone()).collect();
    let (round_id, mut vote_rx, cancel) =
        state.round.begin(participant_ids.clone()).await;

    let payload = build_pre_check(state, cmd, &participants).await;
    let frame = protocol::notification("pre_check", &payload);
    for agent in &participants {
        agent.send(frame.clone());
    }

    let required = participants.len() as f64 * state.config.quorum_threshold;
    let sub_unanimous = state.config.quorum_threshold < 1.0;
    let mut responded: HashSet<String> = HashSet::new();
    let mut confidence = 0.0_f64;
    let mut consensus_at: Option<Instant> = None;

    let outcome = loop {
        let quorum_met = confidence + CONFIDENCE_EPS >= required;
        if quorum_met && Instant::now() >= settle_at {
            break RoundOutcome::Clear;
        }
        if !quorum_met && responded.len() == participant_ids.len() {
            // Everyone answered and the confidence still falls short.
            break RoundOutcome::Wait { retry_after_ms: None };
        }

        tokio::select! {
            _ = cancel.cancelled() => break RoundOutcome::Cancelled,

            _ = tokio::time::sleep_until(budget_at) => {
                let missing: Vec<&str> = participants
                    .iter()
                    .filter(|a| !responded.contains(&a.id))
                    .map(|a| a.layer.as_str())
                    .collect();
                tracing::warn!(command = %cmd.id, ?missing, "consensus budget exceeded");
                break RoundOutcome::Wait { retry_after_ms: None };
            }

            // Quorum reached: hold for the settlement window to absorb a
            // late veto, then clear.
            _ = tokio::time::sleep_until(settle_at), if quorum_met => {
                break RoundOutcome::Clear;
            }

            _ = sleep_opt(consensus_at), if consensus_at.is_some() => {
                if quorum_met {
                    // Enough confidence: the settlement branch finishes the round.
                    consensus_at = None;
                } else {
                    break RoundOutcome::Wait { retry_after_ms: None };
                }
            }

            msg = vote_rx.recv() => {
                let Some(VoteMsg { agent_id, vote }) = msg else {
                    break RoundOutcome::Wait { retry_after_ms: None };
                };
                match vote {
                    // Veto dominates irrespective of arrival order, even
                    // from an agent that already cleared.
                    Vote::Wait { retry_after_ms } => {
                        break RoundOutcome::Wait { retry_after_ms };
                    }
                    Vote::Clear { confidence: c } => {
                        if responded.insert(agent_id) {
                            confidence += c.clamp(0.0, 1.0);
                            if sub_unanimous && consensus_at.is_none() {
                                consensus_at =
                                    Some(Instant::now() + state.config.consensus_timeout());
                            }
                        }
                    }
                    Vote::Error => {
                        if responded.insert(agent_id) && sub_unanimous && consensus_at.is_none() {
                            consensus_at =
                                Some(Instant::now() + state.config.consensus_timeout());
                        }
                    }
                }
            }
        }
    };

    state.round.finish(round_id).await;
    outcome
}

#[cfg(test)]
#[path = "consensus_tests.rs"]
mod tests;
