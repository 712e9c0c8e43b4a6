// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Integration tests for the hub HTTP surface.
//!
//! Uses `axum_test::TestServer` — no real TCP needed.

use std::sync::Arc;

use axum_test::TestServer;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use starlight_hub::config::HubConfig;
use starlight_hub::driver::NullDriver;
use starlight_hub::learning::{AuraIndex, LearningStore};
use starlight_hub::protocol::RegistrationParams;
use starlight_hub::state::HubState;
use starlight_hub::transport::build_router;

fn test_state(mut config: HubConfig) -> anyhow::Result<Arc<HubState>> {
    config.test_mode = true;
    let state = HubState::new(
        config,
        CancellationToken::new(),
        Arc::new(NullDriver),
        LearningStore::new(),
        AuraIndex::default(),
    )?;
    Ok(Arc::new(state))
}

fn test_server(state: Arc<HubState>) -> anyhow::Result<TestServer> {
    TestServer::new(build_router(state)).map_err(|e| anyhow::anyhow!("{e}"))
}

async fn insert_ready_agent(
    state: &Arc<HubState>,
    layer: &str,
    priority: i64,
    capabilities: &[&str],
) -> anyhow::Result<()> {
    let (tx, _rx) = mpsc::channel(8);
    let params = RegistrationParams {
        layer: layer.to_owned(),
        priority,
        capabilities: capabilities.iter().map(|c| (*c).to_owned()).collect(),
        selectors: Vec::new(),
        auth_token: None,
        version: None,
    };
    let entry = state.registry.register(params, tx, CancellationToken::new()).await;
    let nonce = entry.nonce.clone();
    state.registry.verify_challenge(&entry.id, &nonce).await;
    // The receiver is dropped; broadcast frames to this agent are discarded.
    Ok(())
}

#[tokio::test]
async fn health_reports_idle_hub() -> anyhow::Result<()> {
    let state = test_state(HubConfig::parse_from(["starlight-hub"]))?;
    let server = test_server(state)?;

    let resp = server.get("/health").await;
    resp.assert_status_ok();

    let body: serde_json::Value = resp.json();
    assert_eq!(body["status"], "running");
    assert_eq!(body["protocol"], "2.0");
    assert_eq!(body["mission"]["active"], true);
    assert_eq!(body["mission"]["queueLength"], 0);
    assert_eq!(body["mission"]["isLocked"], false);
    assert_eq!(body["security"]["authEnabled"], false);
    assert_eq!(body["security"]["tlsEnabled"], false);
    assert_eq!(body["agents"].as_array().map(Vec::len), Some(0));
    Ok(())
}

#[tokio::test]
async fn health_lists_ready_agents_and_lock_state() -> anyhow::Result<()> {
    let mut config = HubConfig::parse_from(["starlight-hub"]);
    config.auth_token = Some("sekrit".to_owned());
    let state = test_state(config)?;
    insert_ready_agent(&state, "detection", 5, &["vision"]).await?;
    insert_ready_agent(&state, "pii", 8, &["pii"]).await?;
    state
        .lock
        .acquire("agent-x", "detection", 5, "popup", std::time::Duration::from_secs(5))
        .await;

    let server = test_server(Arc::clone(&state))?;
    let resp = server.get("/health").await;
    resp.assert_status_ok();

    let body: serde_json::Value = resp.json();
    assert_eq!(body["security"]["authEnabled"], true);
    assert_eq!(body["mission"]["isLocked"], true);
    let agents = body["agents"].as_array().cloned().unwrap_or_default();
    assert_eq!(agents.len(), 2);
    assert_eq!(agents[0]["layer"], "detection");
    assert_eq!(agents[0]["priority"], 5);
    assert_eq!(agents[0]["capabilities"][0], "vision");
    Ok(())
}
