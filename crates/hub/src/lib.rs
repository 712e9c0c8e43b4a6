// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Starlight hub: coordination engine for browser-automation sentinels.
//!
//! A mission client issues high-level intents; any number of sentinel
//! agents vote on each one, may veto it, or may preempt the pipeline to
//! remediate an obstacle. The hub owns the browser handle, executes
//! approved intents, and keeps the learning and audit stores.

pub mod audit;
pub mod config;
pub mod consensus;
pub mod driver;
pub mod error;
pub mod heartbeat;
pub mod learning;
pub mod lock;
pub mod pipeline;
pub mod protocol;
pub mod queue;
pub mod redact;
pub mod registry;
pub mod resolve;
pub mod state;
pub mod transport;

#[cfg(test)]
pub mod test_support;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::audit::{epoch_ms, AuditEntry};
use crate::config::HubConfig;
use crate::driver::{Driver, NullDriver};
use crate::learning::{AuraIndex, LearningStore};
use crate::state::HubState;

/// TTL on the memory lock file taken for the shutdown merge.
const MEMORY_LOCK_TTL: Duration = Duration::from_secs(10);

/// Shutdown drains in-progress work in steps of this, up to [`DRAIN_STEPS`].
const DRAIN_STEP: Duration = Duration::from_millis(100);
const DRAIN_STEPS: u32 = 50;

/// Run the hub with the stand-alone null driver until shutdown.
pub async fn run(config: HubConfig) -> anyhow::Result<()> {
    run_with_driver(config, CancellationToken::new(), Arc::new(NullDriver)).await
}

/// Run the hub with an injected browser driver.
pub async fn run_with_driver(
    config: HubConfig,
    shutdown: CancellationToken,
    driver: Arc<dyn Driver>,
) -> anyhow::Result<()> {
    // Merge persisted state; parse errors are ignored.
    let mut store = LearningStore::new();
    store.merge_persisted(learning::load_memory(&config.memory_path));
    let prior_trace = learning::load_trace(&config.trace_path);
    let auras = AuraIndex::from_trace(&prior_trace, config.aura_bucket_ms);
    if auras.bucket_count() > 0 {
        tracing::info!(buckets = auras.bucket_count(), "loaded unstable auras from prior trace");
    }

    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(HubState::new(config, shutdown.clone(), driver, store, auras)?);

    heartbeat::spawn_heartbeat(Arc::clone(&state));
    pipeline::spawn_pipeline(Arc::clone(&state));
    spawn_mission_timer(Arc::clone(&state));

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, shutting down");
                shutdown.cancel();
            }
        });
    }

    tracing::info!("starlight hub listening on {addr}");
    let router = transport::build_router(Arc::clone(&state));
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, router).with_graceful_shutdown(shutdown.cancelled_owned()).await?;

    drain(&state).await;
    persist(&state).await?;
    Ok(())
}

/// Orderly shutdown when the mission outlives its budget.
fn spawn_mission_timer(state: Arc<HubState>) {
    tokio::spawn(async move {
        tokio::select! {
            _ = state.shutdown.cancelled() => {}
            _ = tokio::time::sleep(state.config.mission_timeout()) => {
                tracing::warn!("mission timeout reached, shutting down");
                state
                    .audit
                    .push(AuditEntry::MissionFailure {
                        ts: epoch_ms(),
                        reason: "mission timeout".to_owned(),
                    })
                    .await;
                state.mission_active.store(false, Ordering::Relaxed);
                state.shutdown.cancel();
            }
        }
    });
}

/// Wait for the in-flight command to reach its terminal outcome.
async fn drain(state: &HubState) {
    for _ in 0..DRAIN_STEPS {
        if !state.in_flight.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(DRAIN_STEP).await;
    }
    tracing::warn!("shutdown drain expired with work still in flight");
}

/// Persist the learning store and the recent trace.
async fn persist(state: &HubState) -> anyhow::Result<()> {
    {
        let store = state.learning.lock().await;
        learning::save_memory(&state.config.memory_path, &store, MEMORY_LOCK_TTL)?;
    }
    let events = state.trace.snapshot().await;
    learning::save_trace(&state.config.trace_path, &events)?;
    tracing::info!(
        trace_events = events.len(),
        "persisted learning memory and mission trace"
    );
    Ok(())
}
