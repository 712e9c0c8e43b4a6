// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::audit::epoch_ms;
use crate::test_support::{ready_agent, test_config, test_state, MockDriver};

#[tokio::test(start_paused = true)]
async fn evicts_agents_past_the_heartbeat_timeout() -> anyhow::Result<()> {
    let state = test_state(test_config(), Arc::new(MockDriver::new()))?;
    let agent = ready_agent(&state, "sleepy", 5).await?;

    // Backdate the last sign of life past the timeout.
    let past = epoch_ms().saturating_sub(state.config.heartbeat_timeout_ms + 5_000);
    agent.entry.last_seen.store(past, std::sync::atomic::Ordering::Relaxed);

    spawn_heartbeat(Arc::clone(&state));
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(state.registry.len().await, 0);
    assert!(agent.entry.cancel.is_cancelled());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn eviction_releases_a_held_lock() -> anyhow::Result<()> {
    let state = test_state(test_config(), Arc::new(MockDriver::new()))?;
    let agent = ready_agent(&state, "sleepy", 5).await?;
    state
        .lock
        .acquire(&agent.entry.id, "sleepy", 5, "popup", Duration::from_secs(60))
        .await;

    let past = epoch_ms().saturating_sub(state.config.heartbeat_timeout_ms + 5_000);
    agent.entry.last_seen.store(past, std::sync::atomic::Ordering::Relaxed);

    spawn_heartbeat(Arc::clone(&state));
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(state.registry.len().await, 0);
    assert!(!state.lock.is_held().await);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn live_agents_receive_pings_and_survive() -> anyhow::Result<()> {
    let state = test_state(test_config(), Arc::new(MockDriver::new()))?;
    let mut agent = ready_agent(&state, "alive", 5).await?;

    spawn_heartbeat(Arc::clone(&state));
    tokio::time::sleep(Duration::from_millis(2_500)).await;

    assert_eq!(state.registry.len().await, 1);
    let mut saw_ping = false;
    while let Ok(frame) = agent.rx.try_recv() {
        if frame.contains("starlight.ping") {
            saw_ping = true;
        }
    }
    assert!(saw_ping);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn departed_agent_announces_agent_left() -> anyhow::Result<()> {
    let state = test_state(test_config(), Arc::new(MockDriver::new()))?;
    let agent = ready_agent(&state, "sleepy", 5).await?;
    let mut witness = ready_agent(&state, "witness", 3).await?;

    state.remove_agent(&agent.entry.id, "heartbeat timeout").await;

    let mut saw_left = false;
    while let Ok(frame) = witness.rx.try_recv() {
        if frame.contains("starlight.agent_left") && frame.contains("sleepy") {
            saw_left = true;
        }
    }
    assert!(saw_left);
    Ok(())
}
