// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent registry and handshake state machine. Agents are keyed by a
//! hub-assigned opaque id; no component holds a pointer into agent state
//! beyond that id.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rand::distr::Alphanumeric;
use rand::Rng;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::audit::epoch_ms;
use crate::protocol::RegistrationParams;

/// Handshake progression for one agent connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Unauthenticated,
    ChallengePending,
    Ready,
}

/// One connected sentinel.
pub struct AgentEntry {
    pub id: String,
    pub layer: String,
    /// Lower numeric value wins: critical agents sit at 5 and below.
    pub priority: i64,
    pub capabilities: HashSet<String>,
    pub selectors: Vec<String>,
    pub state: RwLock<HandshakeState>,
    /// 32 random characters, unique per handshake.
    pub nonce: String,
    /// Epoch millis of the last sign of life.
    pub last_seen: AtomicU64,
    pub tx: mpsc::Sender<String>,
    pub cancel: CancellationToken,
    pub connected_at: Instant,
}

impl AgentEntry {
    pub fn touch(&self) {
        self.last_seen.store(epoch_ms(), Ordering::Relaxed);
    }

    pub async fn is_ready(&self) -> bool {
        *self.state.read().await == HandshakeState::Ready
    }

    /// Queue an outbound frame without blocking the caller. A saturated or
    /// closed channel drops the frame; the heartbeat supervisor reaps dead
    /// peers.
    pub fn send(&self, text: String) {
        if let Err(e) = self.tx.try_send(text) {
            tracing::debug!(agent = %self.layer, err = %e, "dropping outbound frame");
        }
    }
}

/// Outcome of a `challenge_response`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeOutcome {
    /// First valid response: the agent just became READY.
    Accepted,
    /// Duplicate response on a READY agent: ignored.
    AlreadyReady,
    /// Response did not echo the issued nonce.
    Mismatch,
}

fn new_nonce() -> String {
    rand::rng().sample_iter(&Alphanumeric).take(32).map(char::from).collect()
}

/// Registry of connected agents keyed by assigned id.
#[derive(Default)]
pub struct Registry {
    agents: RwLock<HashMap<String, Arc<AgentEntry>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a registering agent: assign an id, issue a nonce, and move the
    /// connection to `ChallengePending`. Token validation happens at the
    /// gateway before this is called.
    pub async fn register(
        &self,
        params: RegistrationParams,
        tx: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Arc<AgentEntry> {
        let entry = Arc::new(AgentEntry {
            id: uuid::Uuid::new_v4().to_string(),
            layer: params.layer,
            priority: params.priority,
            capabilities: params.capabilities.into_iter().collect(),
            selectors: params.selectors,
            state: RwLock::new(HandshakeState::ChallengePending),
            nonce: new_nonce(),
            last_seen: AtomicU64::new(epoch_ms()),
            tx,
            cancel,
            connected_at: Instant::now(),
        });
        self.agents.write().await.insert(entry.id.clone(), Arc::clone(&entry));
        entry
    }

    /// Verify a challenge echo for the given agent.
    pub async fn verify_challenge(&self, id: &str, response: &str) -> ChallengeOutcome {
        let Some(entry) = self.get(id).await else {
            return ChallengeOutcome::Mismatch;
        };
        let mut state = entry.state.write().await;
        match *state {
            HandshakeState::Ready => ChallengeOutcome::AlreadyReady,
            _ if response == entry.nonce => {
                *state = HandshakeState::Ready;
                entry.touch();
                ChallengeOutcome::Accepted
            }
            _ => ChallengeOutcome::Mismatch,
        }
    }

    pub async fn get(&self, id: &str) -> Option<Arc<AgentEntry>> {
        self.agents.read().await.get(id).map(Arc::clone)
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<AgentEntry>> {
        self.agents.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    /// READY agents sorted so higher-precedence (lower numeric priority)
    /// agents come first. Broadcasts walk this order, which gives a
    /// high-priority veto a strict happens-before edge.
    pub async fn ready_agents(&self) -> Vec<Arc<AgentEntry>> {
        let mut out = Vec::new();
        for entry in self.agents.read().await.values() {
            if *entry.state.read().await == HandshakeState::Ready {
                out.push(Arc::clone(entry));
            }
        }
        out.sort_by_key(|a| a.priority);
        out
    }

    /// READY agents that participate in consensus: priority at or below the
    /// relevance threshold, precedence order.
    pub async fn relevant_agents(&self, threshold: i64) -> Vec<Arc<AgentEntry>> {
        let mut out = self.ready_agents().await;
        out.retain(|a| a.priority <= threshold);
        out
    }

    /// Fan a frame out to all READY agents in precedence order.
    pub async fn broadcast(&self, text: &str) {
        for agent in self.ready_agents().await {
            agent.send(text.to_owned());
        }
    }

    /// Fan a frame out to all READY agents except one (sidetalk relay).
    pub async fn broadcast_except(&self, skip_id: &str, text: &str) {
        for agent in self.ready_agents().await {
            if agent.id != skip_id {
                agent.send(text.to_owned());
            }
        }
    }

    /// Agents whose `last_seen` is older than the cutoff. Covers agents
    /// still mid-handshake: a stalled challenge times out like any other
    /// silence.
    pub async fn stale_agents(&self, older_than_ms: u64) -> Vec<Arc<AgentEntry>> {
        let now = epoch_ms();
        let mut out = Vec::new();
        for entry in self.agents.read().await.values() {
            let seen = entry.last_seen.load(Ordering::Relaxed);
            if now.saturating_sub(seen) > older_than_ms {
                out.push(Arc::clone(entry));
            }
        }
        out
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
