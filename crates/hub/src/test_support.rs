// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: builders, a scripted mock driver, and
//! handshake helpers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use clap::Parser;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::HubConfig;
use crate::driver::{
    Driver, DriverFut, PageAction, PageContext, PageElement, SweepScope, TargetRect,
};
use crate::learning::{AuraIndex, LearningStore};
use crate::protocol::RegistrationParams;
use crate::registry::{AgentEntry, ChallengeOutcome};
use crate::state::HubState;

fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Config with clap defaults and screenshot throttling disabled.
pub fn test_config() -> HubConfig {
    let mut config = HubConfig::parse_from(["starlight-hub"]);
    config.test_mode = true;
    config
}

/// Hub state over the given driver, no persisted memory.
pub fn test_state(config: HubConfig, driver: Arc<dyn Driver>) -> anyhow::Result<Arc<HubState>> {
    let state = HubState::new(
        config,
        CancellationToken::new(),
        driver,
        LearningStore::new(),
        AuraIndex::default(),
    )?;
    Ok(Arc::new(state))
}

/// A READY agent registered straight through the state machine, with the
/// receiver end of its outbound channel.
pub struct TestAgent {
    pub entry: Arc<AgentEntry>,
    pub rx: mpsc::Receiver<String>,
}

pub async fn ready_agent(
    state: &Arc<HubState>,
    layer: &str,
    priority: i64,
) -> anyhow::Result<TestAgent> {
    ready_agent_full(state, layer, priority, &[], &[]).await
}

pub async fn ready_agent_full(
    state: &Arc<HubState>,
    layer: &str,
    priority: i64,
    capabilities: &[&str],
    selectors: &[&str],
) -> anyhow::Result<TestAgent> {
    let (tx, rx) = mpsc::channel(64);
    let params = RegistrationParams {
        layer: layer.to_owned(),
        priority,
        capabilities: capabilities.iter().map(|c| (*c).to_owned()).collect(),
        selectors: selectors.iter().map(|s| (*s).to_owned()).collect(),
        auth_token: None,
        version: None,
    };
    let entry = state.registry.register(params, tx, CancellationToken::new()).await;
    let nonce = entry.nonce.clone();
    let outcome = state.registry.verify_challenge(&entry.id, &nonce).await;
    if outcome != ChallengeOutcome::Accepted {
        anyhow::bail!("handshake did not complete: {outcome:?}");
    }
    Ok(TestAgent { entry, rx })
}

/// Register a client outbound channel and return its receiver.
pub async fn attach_client(state: &Arc<HubState>) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(64);
    let conn_id = uuid::Uuid::new_v4().to_string();
    state.clients.insert(&conn_id, tx).await;
    rx
}

/// Candidate element shorthand for resolver tests.
pub fn element(tag: &str, id: Option<&str>, text: &str) -> PageElement {
    PageElement {
        tag: tag.to_owned(),
        id: id.map(str::to_owned),
        text: text.to_owned(),
        ..PageElement::default()
    }
}

/// Scripted driver: records actions, serves canned sweeps and rects, and
/// can fail a configured number of upcoming actions.
#[derive(Default)]
pub struct MockDriver {
    pub actions: Mutex<Vec<PageAction>>,
    pub interactive: Mutex<Vec<PageElement>>,
    pub form_like: Mutex<Vec<PageElement>>,
    pub rects: Mutex<HashMap<String, TargetRect>>,
    pub fail_actions: AtomicU32,
    pub screenshot_payload: Mutex<Option<String>>,
    pub page_text: Mutex<String>,
    pub context: Mutex<PageContext>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<PageAction> {
        lock(&self.actions).clone()
    }

    pub fn set_interactive(&self, elements: Vec<PageElement>) {
        *lock(&self.interactive) = elements;
    }

    pub fn set_form_like(&self, elements: Vec<PageElement>) {
        *lock(&self.form_like) = elements;
    }

    pub fn set_rect(&self, selector: &str, rect: TargetRect) {
        lock(&self.rects).insert(selector.to_owned(), rect);
    }

    /// Fail the next `n` perform calls.
    pub fn fail_next(&self, n: u32) {
        self.fail_actions.store(n, Ordering::Relaxed);
    }
}

impl Driver for MockDriver {
    fn perform(&self, action: PageAction) -> DriverFut<'_, ()> {
        Box::pin(async move {
            let remaining = self.fail_actions.load(Ordering::Relaxed);
            if remaining > 0 {
                self.fail_actions.store(remaining - 1, Ordering::Relaxed);
                anyhow::bail!("scripted driver failure");
            }
            lock(&self.actions).push(action);
            Ok(())
        })
    }

    fn screenshot(&self) -> DriverFut<'_, Option<String>> {
        Box::pin(async { Ok(lock(&self.screenshot_payload).clone()) })
    }

    fn visible_text(&self) -> DriverFut<'_, String> {
        Box::pin(async { Ok(lock(&self.page_text).clone()) })
    }

    fn a11y_snapshot(&self) -> DriverFut<'_, Value> {
        Box::pin(async { Ok(Value::Null) })
    }

    fn target_rect(&self, selector: &str) -> DriverFut<'_, Option<TargetRect>> {
        let rect = lock(&self.rects).get(selector).copied();
        Box::pin(async move { Ok(rect) })
    }

    fn sweep(&self, scope: SweepScope) -> DriverFut<'_, Vec<PageElement>> {
        let elements = match scope {
            SweepScope::Interactive => lock(&self.interactive).clone(),
            _ => lock(&self.form_like).clone(),
        };
        Box::pin(async move { Ok(elements) })
    }

    fn evaluate(&self, _script: &str) -> DriverFut<'_, Value> {
        Box::pin(async { Ok(Value::Null) })
    }

    fn page_context(&self) -> DriverFut<'_, PageContext> {
        Box::pin(async { Ok(lock(&self.context).clone()) })
    }
}
