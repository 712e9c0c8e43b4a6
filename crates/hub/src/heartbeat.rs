// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Liveness supervisor: pings READY agents on a fixed tick and evicts any
//! whose last sign of life is older than the heartbeat timeout.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::protocol;
use crate::state::HubState;

/// Spawn the background heartbeat task.
pub fn spawn_heartbeat(state: Arc<HubState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(state.config.heartbeat_interval());
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }

            let ping = protocol::notification("ping", serde_json::json!({}));
            state.registry.broadcast(&ping).await;

            let stale = state.registry.stale_agents(state.config.heartbeat_timeout_ms).await;
            for agent in stale {
                tracing::warn!(
                    layer = %agent.layer,
                    agent = %agent.id,
                    "heartbeat timeout, evicting agent"
                );
                state.remove_agent(&agent.id, "heartbeat timeout").await;
            }
        }
    })
}

#[cfg(test)]
#[path = "heartbeat_tests.rs"]
mod tests;
