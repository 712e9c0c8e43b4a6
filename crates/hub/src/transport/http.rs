// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Read-only HTTP surface.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::protocol::PROTOCOL_VERSION;
use crate::state::HubState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub protocol: String,
    pub uptime: u64,
    pub agents: Vec<AgentSummary>,
    pub mission: MissionSummary,
    pub security: SecuritySummary,
}

#[derive(Debug, Serialize)]
pub struct AgentSummary {
    pub layer: String,
    pub priority: i64,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct MissionSummary {
    pub active: bool,
    #[serde(rename = "queueLength")]
    pub queue_length: usize,
    #[serde(rename = "isLocked")]
    pub is_locked: bool,
}

#[derive(Debug, Serialize)]
pub struct SecuritySummary {
    #[serde(rename = "authEnabled")]
    pub auth_enabled: bool,
    #[serde(rename = "tlsEnabled")]
    pub tls_enabled: bool,
}

/// `GET /health` — synchronous snapshot of the hub.
pub async fn health(State(state): State<Arc<HubState>>) -> Json<HealthResponse> {
    let mut agents = Vec::new();
    for agent in state.registry.ready_agents().await {
        let mut capabilities: Vec<String> = agent.capabilities.iter().cloned().collect();
        capabilities.sort();
        agents.push(AgentSummary {
            layer: agent.layer.clone(),
            priority: agent.priority,
            capabilities,
        });
    }

    Json(HealthResponse {
        status: "running".to_owned(),
        version: env!("CARGO_PKG_VERSION").to_owned(),
        protocol: PROTOCOL_VERSION.to_owned(),
        uptime: state.started_at.elapsed().as_secs(),
        agents,
        mission: MissionSummary {
            active: state.mission_active.load(Ordering::Relaxed),
            queue_length: state.queue.len().await,
            is_locked: state.lock.is_held().await,
        },
        security: SecuritySummary {
            auth_enabled: state.config.auth_token.is_some(),
            tls_enabled: false,
        },
    })
}
