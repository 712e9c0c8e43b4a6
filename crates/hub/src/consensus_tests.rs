// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::*;
use crate::protocol::IntentParams;
use crate::test_support::{ready_agent, ready_agent_full, test_config, test_state, MockDriver, TestAgent};

fn goto_cmd(id: &str) -> anyhow::Result<CommandEnvelope> {
    CommandEnvelope::from_intent(IntentParams {
        cmd: "goto".to_owned(),
        id: Some(id.to_owned()),
        url: Some("https://example.com".to_owned()),
        ..IntentParams::default()
    })
    .ok_or_else(|| anyhow::anyhow!("intent rejected"))
}

/// Reply to every pre-check this agent sees with the given vote.
fn vote_on_pre_check(state: &Arc<HubState>, mut agent: TestAgent, vote: Vote) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        while let Some(frame) = agent.rx.recv().await {
            if frame.contains("starlight.pre_check") {
                state.round.submit(&agent.entry.id, vote.clone()).await;
            }
        }
    });
}

#[tokio::test(start_paused = true)]
async fn zero_relevant_agents_clears_immediately() -> anyhow::Result<()> {
    let state = test_state(test_config(), Arc::new(MockDriver::new()))?;
    let cmd = goto_cmd("c0")?;

    let started = Instant::now();
    let outcome = run_round(&state, &cmd).await;
    assert_eq!(outcome, RoundOutcome::Clear);
    assert!(started.elapsed() < Duration::from_millis(100));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn clear_respects_settlement_floor() -> anyhow::Result<()> {
    let state = test_state(test_config(), Arc::new(MockDriver::new()))?;
    let agent = ready_agent(&state, "detection", 5).await?;
    vote_on_pre_check(&state, agent, Vote::Clear { confidence: 1.0 });

    let cmd = goto_cmd("c1")?;
    let started = Instant::now();
    let outcome = run_round(&state, &cmd).await;
    assert_eq!(outcome, RoundOutcome::Clear);
    assert!(started.elapsed() >= state.config.settlement_window());
    assert!(!state.round.is_open().await);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn veto_short_circuits_before_settlement() -> anyhow::Result<()> {
    let state = test_state(test_config(), Arc::new(MockDriver::new()))?;
    let agent = ready_agent(&state, "detection", 5).await?;
    vote_on_pre_check(&state, agent, Vote::Wait { retry_after_ms: Some(300) });

    let started = Instant::now();
    let outcome = run_round(&state, &goto_cmd("c2")?).await;
    assert_eq!(outcome, RoundOutcome::Wait { retry_after_ms: Some(300) });
    assert!(started.elapsed() < state.config.settlement_window());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn veto_supersedes_prior_clear() -> anyhow::Result<()> {
    let state = test_state(test_config(), Arc::new(MockDriver::new()))?;
    let calm = ready_agent(&state, "calm", 5).await?;
    vote_on_pre_check(&state, calm, Vote::Clear { confidence: 1.0 });

    let mut critical = ready_agent(&state, "critical", 1).await?;
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Some(frame) = critical.rx.recv().await {
                if frame.contains("starlight.pre_check") {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    state
                        .round
                        .submit(&critical.entry.id, Vote::Wait { retry_after_ms: Some(300) })
                        .await;
                }
            }
        });
    }

    let outcome = run_round(&state, &goto_cmd("c3")?).await;
    assert_eq!(outcome, RoundOutcome::Wait { retry_after_ms: Some(300) });
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn late_veto_during_settlement_wins() -> anyhow::Result<()> {
    let state = test_state(test_config(), Arc::new(MockDriver::new()))?;
    let mut agent = ready_agent(&state, "detection", 5).await?;
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Some(frame) = agent.rx.recv().await {
                if frame.contains("starlight.pre_check") {
                    // Clear first, then think better of it inside the window.
                    state.round.submit(&agent.entry.id, Vote::Clear { confidence: 1.0 }).await;
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    state
                        .round
                        .submit(&agent.entry.id, Vote::Wait { retry_after_ms: None })
                        .await;
                }
            }
        });
    }

    let outcome = run_round(&state, &goto_cmd("c4")?).await;
    assert_eq!(outcome, RoundOutcome::Wait { retry_after_ms: None });
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unresponsive_agent_waits_at_budget() -> anyhow::Result<()> {
    let state = test_state(test_config(), Arc::new(MockDriver::new()))?;
    let _agent = ready_agent(&state, "silent", 5).await?;

    let started = Instant::now();
    let outcome = run_round(&state, &goto_cmd("c5")?).await;
    assert_eq!(outcome, RoundOutcome::Wait { retry_after_ms: None });
    assert!(started.elapsed() >= state.config.sync_budget());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn sub_unanimous_consensus_timeout_resolves_short() -> anyhow::Result<()> {
    let mut config = test_config();
    config.quorum_threshold = 0.6;
    let state = test_state(config, Arc::new(MockDriver::new()))?;
    let voter = ready_agent(&state, "voter", 5).await?;
    let _silent = ready_agent(&state, "silent", 5).await?;
    vote_on_pre_check(&state, voter, Vote::Clear { confidence: 1.0 });

    // One vote in: 1.0 < 2 * 0.6, so the secondary timer decides.
    let started = Instant::now();
    let outcome = run_round(&state, &goto_cmd("c6")?).await;
    assert_eq!(outcome, RoundOutcome::Wait { retry_after_ms: None });
    let elapsed = started.elapsed();
    assert!(elapsed >= state.config.consensus_timeout());
    assert!(elapsed < state.config.sync_budget());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn sub_unanimous_quorum_clears_at_settlement() -> anyhow::Result<()> {
    let mut config = test_config();
    config.quorum_threshold = 0.5;
    let state = test_state(config, Arc::new(MockDriver::new()))?;
    let voter = ready_agent(&state, "voter", 5).await?;
    let _silent = ready_agent(&state, "silent", 5).await?;
    vote_on_pre_check(&state, voter, Vote::Clear { confidence: 1.0 });

    let started = Instant::now();
    let outcome = run_round(&state, &goto_cmd("c7")?).await;
    assert_eq!(outcome, RoundOutcome::Clear);
    assert!(started.elapsed() >= state.config.settlement_window());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn all_responded_below_quorum_waits() -> anyhow::Result<()> {
    let state = test_state(test_config(), Arc::new(MockDriver::new()))?;
    let a = ready_agent(&state, "a", 5).await?;
    let b = ready_agent(&state, "b", 5).await?;
    vote_on_pre_check(&state, a, Vote::Clear { confidence: 0.3 });
    vote_on_pre_check(&state, b, Vote::Clear { confidence: 0.3 });

    let started = Instant::now();
    let outcome = run_round(&state, &goto_cmd("c8")?).await;
    assert_eq!(outcome, RoundOutcome::Wait { retry_after_ms: None });
    assert!(started.elapsed() < state.config.sync_budget());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn error_reply_counts_as_response_without_confidence() -> anyhow::Result<()> {
    let state = test_state(test_config(), Arc::new(MockDriver::new()))?;
    let ok = ready_agent(&state, "ok", 5).await?;
    let broken = ready_agent(&state, "broken", 5).await?;
    vote_on_pre_check(&state, ok, Vote::Clear { confidence: 1.0 });
    vote_on_pre_check(&state, broken, Vote::Error);

    let outcome = run_round(&state, &goto_cmd("c9")?).await;
    assert_eq!(outcome, RoundOutcome::Wait { retry_after_ms: None });
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn budget_before_settlement_floor_waits() -> anyhow::Result<()> {
    let mut config = test_config();
    // A budget tighter than the settlement floor can never clear.
    config.sync_budget_ms = 200;
    let state = test_state(config, Arc::new(MockDriver::new()))?;
    let agent = ready_agent(&state, "eager", 5).await?;
    vote_on_pre_check(&state, agent, Vote::Clear { confidence: 1.0 });

    let outcome = run_round(&state, &goto_cmd("cb")?).await;
    assert_eq!(outcome, RoundOutcome::Wait { retry_after_ms: None });
    Ok(())
}

#[tokio::test]
async fn votes_without_an_open_round_are_discarded() -> anyhow::Result<()> {
    let state = test_state(test_config(), Arc::new(MockDriver::new()))?;
    let agent = ready_agent(&state, "detection", 5).await?;
    assert!(!state.round.submit(&agent.entry.id, Vote::Clear { confidence: 1.0 }).await);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn lock_acquisition_cancels_the_round() -> anyhow::Result<()> {
    let state = test_state(test_config(), Arc::new(MockDriver::new()))?;
    let mut agent = ready_agent(&state, "detection", 5).await?;
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Some(frame) = agent.rx.recv().await {
                if frame.contains("starlight.pre_check") {
                    state.round.cancel_active().await;
                }
            }
        });
    }

    let outcome = run_round(&state, &goto_cmd("c10")?).await;
    assert_eq!(outcome, RoundOutcome::Cancelled);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn pre_check_payload_is_capability_gated() -> anyhow::Result<()> {
    let driver = Arc::new(MockDriver::new());
    *driver.screenshot_payload.lock().unwrap_or_else(std::sync::PoisonError::into_inner) =
        Some("jpeg-bytes".to_owned());
    *driver.page_text.lock().unwrap_or_else(std::sync::PoisonError::into_inner) =
        "visible words".to_owned();
    let state = test_state(test_config(), driver)?;

    let mut seer =
        ready_agent_full(&state, "seer", 3, &["vision", "pii"], &[".modal"]).await?;
    let plain = ready_agent_full(&state, "plain", 5, &[], &[".toast"]).await?;
    vote_on_pre_check(&state, plain, Vote::Clear { confidence: 1.0 });

    let (frame_tx, frame_rx) = tokio::sync::oneshot::channel();
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut frame_tx = Some(frame_tx);
            while let Some(frame) = seer.rx.recv().await {
                if frame.contains("starlight.pre_check") {
                    if let Some(tx) = frame_tx.take() {
                        let _ = tx.send(frame.clone());
                    }
                    state.round.submit(&seer.entry.id, Vote::Clear { confidence: 1.0 }).await;
                }
            }
        });
    }

    let outcome = run_round(&state, &goto_cmd("c11")?).await;
    assert_eq!(outcome, RoundOutcome::Clear);

    let frame = frame_rx.await?;
    let value: serde_json::Value = serde_json::from_str(&frame)?;
    let params = &value["params"];
    assert_eq!(params["command"]["id"], "c11");
    assert_eq!(params["screenshot"], "jpeg-bytes");
    assert_eq!(params["page_text"], "visible words");
    let blocking: Vec<String> = serde_json::from_value(params["blocking"].clone())?;
    assert!(blocking.contains(&".modal".to_owned()));
    assert!(blocking.contains(&".toast".to_owned()));
    // No selector on a goto: no target rectangle.
    assert!(params.get("targetRect").is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn pre_check_without_capabilities_omits_extras() -> anyhow::Result<()> {
    let driver = Arc::new(MockDriver::new());
    *driver.screenshot_payload.lock().unwrap_or_else(std::sync::PoisonError::into_inner) =
        Some("jpeg-bytes".to_owned());
    let state = test_state(test_config(), driver)?;

    let mut agent = ready_agent_full(&state, "plain", 5, &[], &[]).await?;
    let (frame_tx, frame_rx) = tokio::sync::oneshot::channel();
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut frame_tx = Some(frame_tx);
            while let Some(frame) = agent.rx.recv().await {
                if frame.contains("starlight.pre_check") {
                    if let Some(tx) = frame_tx.take() {
                        let _ = tx.send(frame.clone());
                    }
                    state.round.submit(&agent.entry.id, Vote::Clear { confidence: 1.0 }).await;
                }
            }
        });
    }

    let outcome = run_round(&state, &goto_cmd("c12")?).await;
    assert_eq!(outcome, RoundOutcome::Clear);

    let frame = frame_rx.await?;
    assert!(!frame.contains("screenshot"));
    assert!(!frame.contains("page_text"));
    assert!(!frame.contains("a11y_snapshot"));
    Ok(())
}
