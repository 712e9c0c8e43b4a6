// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket gateway. One bidirectional stream per peer; envelopes are
//! JSON-RPC-shaped with `starlight.` methods. Two admission lanes share
//! the transport: agents run the challenge handshake, mission clients do
//! not. The gateway demultiplexes; semantics live elsewhere.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audit::{epoch_ms, AuditEntry, TraceEvent};
use crate::consensus::Vote;
use crate::driver::PageAction;
use crate::error::{PolicyClose, ProtocolError};
use crate::lock::AcquireOutcome;
use crate::protocol::{
    self, ActionParams, AgentJoined, ChallengeResponseParams, ClearParams, ContextUpdateParams,
    ErrorReportParams, FinishParams, HijackParams, IntentParams, Method, RegistrationParams,
    Request, ResumeParams, SidetalkParams, WaitParams,
};
use crate::queue::CommandEnvelope;
use crate::registry::{AgentEntry, ChallengeOutcome};
use crate::state::HubState;

const OUTBOUND_BUFFER: usize = 64;
const TRACE_SUMMARY_LEN: usize = 256;

/// What kind of peer this connection turned out to be.
enum Lane {
    Unknown,
    Agent(Arc<AgentEntry>),
    Client,
}

enum FrameFlow {
    Continue,
    Close(PolicyClose),
}

/// `GET /ws` — WebSocket upgrade for agents and clients alike.
pub async fn ws_handler(
    State(state): State<Arc<HubState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

/// Per-connection event loop.
async fn handle_socket(state: Arc<HubState>, socket: WebSocket) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
    let cancel = CancellationToken::new();
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Tell the new peer about every READY agent up front.
    for agent in state.registry.ready_agents().await {
        let mut capabilities: Vec<String> = agent.capabilities.iter().cloned().collect();
        capabilities.sort();
        let frame = protocol::notification(
            "agent_joined",
            AgentJoined {
                layer: &agent.layer,
                priority: agent.priority,
                capabilities: &capabilities,
            },
        );
        if ws_tx.send(Message::Text(frame.into())).await.is_err() {
            return;
        }
    }

    let mut lane = Lane::Unknown;

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,

            // Eviction cancels the per-agent token.
            _ = cancel.cancelled() => break,

            out = rx.recv() => {
                match out {
                    Some(text) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(_)) | None => break,
                };
                match msg {
                    Message::Text(text) => {
                        match handle_frame(&state, &mut lane, &tx, &cancel, &conn_id, &text).await {
                            FrameFlow::Continue => {}
                            FrameFlow::Close(policy) => {
                                let close = CloseFrame {
                                    code: policy.code(),
                                    reason: policy.reason().into(),
                                };
                                let _ = ws_tx.send(Message::Close(Some(close))).await;
                                break;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    match &lane {
        Lane::Agent(agent) => state.remove_agent(&agent.id, "disconnect").await,
        Lane::Client => state.clients.remove(&conn_id).await,
        Lane::Unknown => {}
    }
}

fn send(tx: &mpsc::Sender<String>, text: String) {
    if let Err(e) = tx.try_send(text) {
        tracing::debug!(err = %e, "dropping reply frame");
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Validate, trace, and dispatch one inbound frame.
async fn handle_frame(
    state: &Arc<HubState>,
    lane: &mut Lane,
    tx: &mpsc::Sender<String>,
    cancel: &CancellationToken,
    conn_id: &str,
    text: &str,
) -> FrameFlow {
    let request = match protocol::parse_request(text) {
        Ok(request) => request,
        Err(e) => {
            let summary = state.redactor.redact(truncate(text, TRACE_SUMMARY_LEN));
            state
                .trace
                .push(TraceEvent {
                    ts: epoch_ms(),
                    method: "invalid".to_owned(),
                    summary,
                    dom_snapshot: None,
                })
                .await;
            send(tx, protocol::error_response(None, e, "malformed envelope"));
            return FrameFlow::Continue;
        }
    };

    let summary = state.redactor.redact(truncate(&request.params.to_string(), TRACE_SUMMARY_LEN));
    let event = TraceEvent {
        ts: epoch_ms(),
        method: request.raw_method.clone(),
        summary,
        dom_snapshot: None,
    };
    if matches!(request.method, Method::Pulse | Method::Pong) {
        let gap = std::time::Duration::from_millis(state.config.entropy_throttle_ms);
        state.trace.push_throttled(event, gap).await;
    } else {
        state.trace.push(event).await;
    }

    dispatch(state, lane, tx, cancel, conn_id, request).await
}

async fn dispatch(
    state: &Arc<HubState>,
    lane: &mut Lane,
    tx: &mpsc::Sender<String>,
    cancel: &CancellationToken,
    conn_id: &str,
    request: Request,
) -> FrameFlow {
    // Unaddressed liveness passes through any lane.
    if request.method.is_liveness() {
        if let Lane::Agent(agent) = lane {
            agent.touch();
        }
        if request.method == Method::ContextUpdate {
            handle_context_update(state, request).await;
        }
        return FrameFlow::Continue;
    }

    // Client-origin lane: no handshake, no challenge.
    if request.method.is_client_origin() {
        if matches!(lane, Lane::Unknown) {
            *lane = Lane::Client;
            state.clients.insert(conn_id, tx.clone()).await;
        }
        return handle_client_method(state, tx, request).await;
    }

    match request.method {
        Method::Registration => handle_registration(state, lane, tx, cancel, request).await,
        Method::ChallengeResponse => handle_challenge(state, lane, tx, request).await,
        _ => {
            // Every other method is an agent interaction and requires READY.
            let ready = match lane {
                Lane::Agent(agent) => {
                    if agent.is_ready().await {
                        Some(Arc::clone(agent))
                    } else {
                        None
                    }
                }
                _ => None,
            };
            let Some(agent) = ready else {
                send(
                    tx,
                    protocol::error_response(
                        request.id.as_ref(),
                        ProtocolError::NotAuthenticated,
                        "handshake incomplete",
                    ),
                );
                return FrameFlow::Continue;
            };
            agent.touch();
            handle_agent_method(state, &agent, tx, request).await;
            FrameFlow::Continue
        }
    }
}

async fn handle_registration(
    state: &Arc<HubState>,
    lane: &mut Lane,
    tx: &mpsc::Sender<String>,
    cancel: &CancellationToken,
    request: Request,
) -> FrameFlow {
    if !matches!(lane, Lane::Unknown) {
        send(
            tx,
            protocol::error_response(
                request.id.as_ref(),
                ProtocolError::InvalidEnvelope,
                "already registered",
            ),
        );
        return FrameFlow::Continue;
    }
    let params: RegistrationParams = match serde_json::from_value(request.params) {
        Ok(p) => p,
        Err(_) => {
            send(
                tx,
                protocol::error_response(
                    request.id.as_ref(),
                    ProtocolError::InvalidEnvelope,
                    "bad registration params",
                ),
            );
            return FrameFlow::Continue;
        }
    };

    if let Some(expected) = &state.config.auth_token {
        if params.auth_token.as_deref() != Some(expected.as_str()) {
            tracing::warn!(layer = %params.layer, "registration rejected: auth token mismatch");
            return FrameFlow::Close(PolicyClose::AuthFailed);
        }
    }

    let layer = params.layer.clone();
    let entry = state.registry.register(params, tx.clone(), cancel.clone()).await;
    if let Some(id) = request.id.as_ref() {
        send(
            tx,
            protocol::response(
                id,
                json!({
                    "assignedId": entry.id,
                    "protocolVersion": protocol::PROTOCOL_VERSION,
                    "challenge": entry.nonce,
                    "heartbeatInterval": state.config.heartbeat_interval_ms,
                }),
            ),
        );
    }
    tracing::info!(layer = %layer, agent = %entry.id, "agent registered, challenge issued");
    *lane = Lane::Agent(entry);
    FrameFlow::Continue
}

async fn handle_challenge(
    state: &Arc<HubState>,
    lane: &mut Lane,
    tx: &mpsc::Sender<String>,
    request: Request,
) -> FrameFlow {
    let Lane::Agent(agent) = lane else {
        send(
            tx,
            protocol::error_response(
                request.id.as_ref(),
                ProtocolError::NotAuthenticated,
                "no registration",
            ),
        );
        return FrameFlow::Continue;
    };
    let params: ChallengeResponseParams = match serde_json::from_value(request.params) {
        Ok(p) => p,
        Err(_) => {
            send(
                tx,
                protocol::error_response(
                    request.id.as_ref(),
                    ProtocolError::InvalidEnvelope,
                    "bad challenge params",
                ),
            );
            return FrameFlow::Continue;
        }
    };

    match state.registry.verify_challenge(&agent.id, &params.response).await {
        ChallengeOutcome::Accepted => {
            if let Some(id) = request.id.as_ref() {
                send(tx, protocol::response(id, json!({ "success": true })));
            }
            let mut capabilities: Vec<String> = agent.capabilities.iter().cloned().collect();
            capabilities.sort();
            let frame = protocol::notification(
                "agent_joined",
                AgentJoined {
                    layer: &agent.layer,
                    priority: agent.priority,
                    capabilities: &capabilities,
                },
            );
            state.broadcast_all(&frame).await;
            tracing::info!(layer = %agent.layer, "agent ready");
            FrameFlow::Continue
        }
        // Duplicate response on a READY agent: ignored.
        ChallengeOutcome::AlreadyReady => FrameFlow::Continue,
        ChallengeOutcome::Mismatch => {
            tracing::warn!(layer = %agent.layer, "challenge mismatch, closing");
            state.registry.remove(&agent.id).await;
            FrameFlow::Close(PolicyClose::ChallengeFailed)
        }
    }
}

async fn handle_client_method(
    state: &Arc<HubState>,
    tx: &mpsc::Sender<String>,
    request: Request,
) -> FrameFlow {
    match request.method {
        Method::Intent => {
            let params: IntentParams = match serde_json::from_value(request.params) {
                Ok(p) => p,
                Err(_) => {
                    send(
                        tx,
                        protocol::error_response(
                            request.id.as_ref(),
                            ProtocolError::InvalidEnvelope,
                            "bad intent params",
                        ),
                    );
                    return FrameFlow::Continue;
                }
            };
            match CommandEnvelope::from_intent(params) {
                Some(cmd) => {
                    let command_id = cmd.id.clone();
                    state.queue.push_back(cmd).await;
                    state.queue_notify.notify_one();
                    if let Some(id) = request.id.as_ref() {
                        send(
                            tx,
                            protocol::response(
                                id,
                                json!({ "queued": true, "commandId": command_id }),
                            ),
                        );
                    }
                }
                None => {
                    send(
                        tx,
                        protocol::error_response(
                            request.id.as_ref(),
                            ProtocolError::InvalidEnvelope,
                            "unknown command kind",
                        ),
                    );
                }
            }
        }

        Method::Finish => {
            let params: FinishParams = serde_json::from_value(request.params)
                .unwrap_or(FinishParams { reason: String::new() });
            tracing::info!(reason = %params.reason, "finish requested, shutting down");
            if let Some(id) = request.id.as_ref() {
                send(tx, protocol::response(id, json!({ "finishing": true })));
            }
            state.mission_active.store(false, Ordering::Relaxed);
            state.shutdown.cancel();
        }

        Method::GetPageContext => {
            let context = state.driver.page_context().await.unwrap_or_default();
            if let Some(id) = request.id.as_ref() {
                send(tx, protocol::response(id, context));
            }
        }

        Method::StartRecording | Method::StopRecording => {
            // The recorder is an external collaborator; acknowledge and
            // leave a trace milestone.
            let recording = request.method == Method::StartRecording;
            if let Some(id) = request.id.as_ref() {
                send(tx, protocol::response(id, json!({ "recording": recording })));
            }
        }

        _ => {}
    }
    FrameFlow::Continue
}

async fn handle_agent_method(
    state: &Arc<HubState>,
    agent: &Arc<AgentEntry>,
    tx: &mpsc::Sender<String>,
    request: Request,
) {
    match request.method {
        Method::Clear => {
            let params: ClearParams =
                serde_json::from_value(request.params).unwrap_or(ClearParams { confidence: None });
            let vote = Vote::Clear { confidence: params.confidence.unwrap_or(1.0) };
            if !state.round.submit(&agent.id, vote).await {
                tracing::debug!(layer = %agent.layer, "discarding stale clear vote");
            }
        }

        Method::Wait => {
            let params: WaitParams = serde_json::from_value(request.params)
                .unwrap_or(WaitParams { retry_after_ms: None, confidence: None });
            let vote = Vote::Wait { retry_after_ms: params.retry_after_ms };
            if !state.round.submit(&agent.id, vote).await {
                tracing::debug!(layer = %agent.layer, "discarding stale wait vote");
            }
        }

        Method::Hijack => handle_hijack(state, agent, tx, request).await,
        Method::Resume => handle_resume(state, agent, tx, request).await,
        Method::Action => handle_action(state, agent, tx, request).await,

        Method::Sidetalk => {
            let params: SidetalkParams = serde_json::from_value(request.params)
                .unwrap_or(SidetalkParams { message: Value::Null });
            let frame = protocol::notification(
                "sidetalk",
                json!({ "from": agent.layer, "message": params.message }),
            );
            state.registry.broadcast_except(&agent.id, &frame).await;
        }

        Method::Error => {
            let params: ErrorReportParams = serde_json::from_value(request.params)
                .unwrap_or(ErrorReportParams { error: String::new(), stack: None });
            tracing::warn!(layer = %agent.layer, error = %params.error, "sentinel error");
            state
                .audit
                .push(AuditEntry::SentinelError {
                    ts: epoch_ms(),
                    agent_layer: agent.layer.clone(),
                    error: params.error,
                    stack: params.stack,
                })
                .await;
        }

        _ => {}
    }
}

async fn handle_hijack(
    state: &Arc<HubState>,
    agent: &Arc<AgentEntry>,
    tx: &mpsc::Sender<String>,
    request: Request,
) {
    let params: HijackParams = serde_json::from_value(request.params)
        .unwrap_or(HijackParams { reason: String::new() });
    let outcome = state
        .lock
        .acquire(&agent.id, &agent.layer, agent.priority, &params.reason, state.config.lock_ttl())
        .await;
    match outcome {
        AcquireOutcome::Granted { generation, deadline, preempted } => {
            if let Some(prev) = preempted {
                tracing::warn!(from = %prev, to = %agent.layer, "preemption lock preempted");
            }
            // Pending round responses are rejected; the command returns to
            // the queue head.
            state.round.cancel_active().await;
            crate::lock::spawn_ttl(Arc::clone(state), generation, deadline);
            let screenshot = state.screenshots.try_capture(state.driver.as_ref()).await;
            state
                .audit
                .push(AuditEntry::Hijack {
                    ts: epoch_ms(),
                    agent_layer: agent.layer.clone(),
                    reason: params.reason.clone(),
                    screenshot,
                })
                .await;
            tracing::info!(layer = %agent.layer, reason = %params.reason, "pipeline hijacked");
            if let Some(id) = request.id.as_ref() {
                send(tx, protocol::response(id, json!({ "granted": true })));
            }
        }
        AcquireOutcome::Refused => {
            // Silent on the wire.
            tracing::debug!(layer = %agent.layer, "hijack refused");
        }
    }
}

async fn handle_resume(
    state: &Arc<HubState>,
    agent: &Arc<AgentEntry>,
    tx: &mpsc::Sender<String>,
    request: Request,
) {
    let params: ResumeParams =
        serde_json::from_value(request.params).unwrap_or(ResumeParams { re_check: false });
    let Some(hold) = state.lock.release_by(&agent.id).await else {
        tracing::debug!(layer = %agent.layer, "ignoring resume from non-owner");
        return;
    };
    if params.re_check {
        state.queue.push_front(CommandEnvelope::nop()).await;
    }
    state.queue_notify.notify_one();
    tracing::info!(
        layer = %agent.layer,
        held_ms = hold.acquired_at.elapsed().as_millis() as u64,
        re_check = params.re_check,
        "pipeline resumed"
    );
    if let Some(id) = request.id.as_ref() {
        send(tx, protocol::response(id, json!({ "released": true })));
    }
}

async fn handle_action(
    state: &Arc<HubState>,
    agent: &Arc<AgentEntry>,
    tx: &mpsc::Sender<String>,
    request: Request,
) {
    if !state.lock.owned_by(&agent.id).await {
        // Non-owner actions are ignored.
        tracing::debug!(layer = %agent.layer, "ignoring action from non-owner");
        return;
    }
    let params: ActionParams = match serde_json::from_value(request.params) {
        Ok(p) => p,
        Err(_) => {
            send(
                tx,
                protocol::error_response(
                    request.id.as_ref(),
                    ProtocolError::InvalidEnvelope,
                    "bad action params",
                ),
            );
            return;
        }
    };

    let action = match params.cmd.as_str() {
        "force_click" => match params.selector {
            Some(selector) => PageAction::ForceClick { selector },
            None => return,
        },
        "dispatch_event" => match params.selector {
            Some(selector) => PageAction::DispatchEvent {
                selector,
                event: params.text.unwrap_or_else(|| "click".to_owned()),
            },
            None => return,
        },
        "hide_overlays" => PageAction::HideOverlays,
        "a11y_snapshot" => {
            let snapshot = state.driver.a11y_snapshot().await.unwrap_or(Value::Null);
            if let Some(id) = request.id.as_ref() {
                send(tx, protocol::response(id, json!({ "snapshot": snapshot })));
            }
            return;
        }
        other => {
            tracing::debug!(layer = %agent.layer, action = other, "unknown hijack action");
            return;
        }
    };

    let started = Instant::now();
    if let Err(e) = state.driver.perform(action).await {
        tracing::warn!(layer = %agent.layer, err = %e, "hijack action failed");
    } else {
        tracing::debug!(
            layer = %agent.layer,
            took_ms = started.elapsed().as_millis() as u64,
            "hijack action executed"
        );
    }
}

async fn handle_context_update(state: &Arc<HubState>, request: Request) {
    let params: ContextUpdateParams = serde_json::from_value(request.params)
        .unwrap_or(ContextUpdateParams { context: Value::Null });
    if params.context.is_null() {
        return;
    }
    {
        let mut shared = state.shared_context.write().await;
        merge_context(&mut shared, params.context);
    }
    let snapshot = state.shared_context.read().await.clone();
    let frame = protocol::notification("context", json!({ "context": snapshot }));
    state.registry.broadcast(&frame).await;
}

/// Shallow object merge; non-objects replace the blob wholesale.
fn merge_context(target: &mut Value, incoming: Value) {
    match incoming {
        Value::Object(fields) if target.is_object() => {
            if let Some(existing) = target.as_object_mut() {
                for (key, value) in fields {
                    existing.insert(key, value);
                }
            }
        }
        other => *target = other,
    }
}

#[cfg(test)]
#[path = "ws_tests.rs"]
mod tests;
