// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditLog, MissionTrace};
use crate::config::HubConfig;
use crate::consensus::RoundSlot;
use crate::driver::Driver;
use crate::learning::{AuraIndex, LearningStore};
use crate::lock::PreemptionLock;
use crate::queue::CommandQueue;
use crate::redact::{BasicRedactor, Redactor};
use crate::registry::Registry;

/// Shared hub state.
///
/// Organized by concern: the registry owns agents, the queue/lock/round
/// trio drives coordination, and the learning/audit stores feed the report.
pub struct HubState {
    pub config: HubConfig,
    pub shutdown: CancellationToken,
    pub registry: Registry,
    pub clients: ClientRegistry,
    pub queue: CommandQueue,
    /// Woken whenever the queue or the lock changes state.
    pub queue_notify: Notify,
    pub lock: PreemptionLock,
    pub round: RoundSlot,
    pub learning: Mutex<LearningStore>,
    pub auras: AuraIndex,
    pub trace: MissionTrace,
    pub audit: AuditLog,
    /// Process-scoped blob merged from `context_update` messages.
    pub shared_context: RwLock<Value>,
    pub driver: Arc<dyn Driver>,
    pub screenshots: ScreenshotGate,
    pub redactor: Arc<dyn Redactor>,
    pub started_at: Instant,
    pub mission_active: AtomicBool,
    /// True while the pipeline is between dequeue and terminal outcome.
    pub in_flight: AtomicBool,
}

impl HubState {
    pub fn new(
        config: HubConfig,
        shutdown: CancellationToken,
        driver: Arc<dyn Driver>,
        learning: LearningStore,
        auras: AuraIndex,
    ) -> anyhow::Result<Self> {
        let screenshots = ScreenshotGate::new(config.screenshot_throttle(), !config.test_mode);
        let trace = MissionTrace::new(config.trace_max_events);
        let redactor: Arc<dyn Redactor> = Arc::new(BasicRedactor::new()?);
        Ok(Self {
            config,
            shutdown,
            registry: Registry::new(),
            clients: ClientRegistry::new(),
            queue: CommandQueue::new(),
            queue_notify: Notify::new(),
            lock: PreemptionLock::new(),
            round: RoundSlot::new(),
            learning: Mutex::new(learning),
            auras,
            trace,
            audit: AuditLog::new(),
            shared_context: RwLock::new(Value::Null),
            driver,
            screenshots,
            redactor,
            started_at: Instant::now(),
            mission_active: AtomicBool::new(true),
            in_flight: AtomicBool::new(false),
        })
    }

    /// Fan a frame out to every peer: agents in precedence order first,
    /// then clients.
    pub async fn broadcast_all(&self, text: &str) {
        self.registry.broadcast(text).await;
        self.clients.broadcast(text).await;
    }

    /// Remove an agent (disconnect or eviction), releasing any lock it
    /// holds and announcing the exit to every peer.
    pub async fn remove_agent(&self, agent_id: &str, reason: &str) {
        let Some(agent) = self.registry.remove(agent_id).await else {
            return;
        };
        agent.cancel.cancel();
        if let Some(hold) = self.lock.release_by(agent_id).await {
            tracing::warn!(
                layer = %hold.layer,
                reason = %hold.reason,
                "released preemption lock held by departed agent"
            );
            self.queue_notify.notify_one();
        }
        let frame = crate::protocol::notification(
            "agent_left",
            crate::protocol::AgentLeft { layer: &agent.layer, reason },
        );
        self.broadcast_all(&frame).await;
        tracing::info!(layer = %agent.layer, reason, "agent removed");
    }
}

impl std::fmt::Debug for HubState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubState")
            .field("port", &self.config.port)
            .field("auth", &self.config.auth_token.is_some())
            .finish()
    }
}

/// Outbound handles for connected mission clients.
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, mpsc::Sender<String>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, conn_id: &str, tx: mpsc::Sender<String>) {
        self.clients.write().await.insert(conn_id.to_owned(), tx);
    }

    pub async fn remove(&self, conn_id: &str) {
        self.clients.write().await.remove(conn_id);
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn broadcast(&self, text: &str) {
        for tx in self.clients.read().await.values() {
            if let Err(e) = tx.try_send(text.to_owned()) {
                tracing::debug!(err = %e, "dropping client frame");
            }
        }
    }
}

/// Scoped throttle for screenshot capture. Captures are skipped, never
/// queued, when the throttle window has not elapsed; a capture failure
/// never blocks the executor.
pub struct ScreenshotGate {
    last: Mutex<Option<Instant>>,
    throttle: Duration,
    throttle_enabled: bool,
}

impl ScreenshotGate {
    pub fn new(throttle: Duration, throttle_enabled: bool) -> Self {
        Self { last: Mutex::new(None), throttle, throttle_enabled }
    }

    /// Take the throttle token and capture, or skip.
    pub async fn try_capture(&self, driver: &dyn Driver) -> Option<String> {
        {
            let mut last = self.last.lock().await;
            if self.throttle_enabled {
                if let Some(at) = *last {
                    if at.elapsed() < self.throttle {
                        return None;
                    }
                }
            }
            *last = Some(Instant::now());
        }
        match driver.screenshot().await {
            Ok(shot) => shot,
            Err(e) => {
                tracing::warn!(err = %e, "screenshot capture failed");
                None
            }
        }
    }
}
