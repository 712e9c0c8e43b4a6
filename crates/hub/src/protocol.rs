// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire protocol: JSON-RPC-shaped envelopes with `starlight.`-namespaced
//! methods. The gateway only demultiplexes; semantics live in the registry,
//! consensus, lock, and pipeline modules.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ProtocolError;

pub const JSONRPC: &str = "2.0";
pub const NAMESPACE: &str = "starlight.";
pub const PROTOCOL_VERSION: &str = "2.0";

/// Raw inbound envelope shape, prior to method resolution.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Option<Value>,
}

/// Closed set of recognized methods. Unknown names are validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Registration,
    ChallengeResponse,
    Pulse,
    Pong,
    ContextUpdate,
    Clear,
    Wait,
    Hijack,
    Resume,
    Intent,
    Action,
    Finish,
    Sidetalk,
    Error,
    GetPageContext,
    StartRecording,
    StopRecording,
}

impl Method {
    pub fn from_wire(name: &str) -> Option<Self> {
        let bare = name.strip_prefix(NAMESPACE)?;
        match bare {
            "registration" => Some(Self::Registration),
            "challenge_response" => Some(Self::ChallengeResponse),
            "pulse" => Some(Self::Pulse),
            "pong" => Some(Self::Pong),
            "context_update" => Some(Self::ContextUpdate),
            "clear" => Some(Self::Clear),
            "wait" => Some(Self::Wait),
            "hijack" => Some(Self::Hijack),
            "resume" => Some(Self::Resume),
            "intent" => Some(Self::Intent),
            "action" => Some(Self::Action),
            "finish" => Some(Self::Finish),
            "sidetalk" => Some(Self::Sidetalk),
            "error" => Some(Self::Error),
            "getPageContext" => Some(Self::GetPageContext),
            "startRecording" => Some(Self::StartRecording),
            "stopRecording" => Some(Self::StopRecording),
            _ => None,
        }
    }

    /// Liveness beats that bypass the handshake guard without addressing it.
    pub fn is_liveness(&self) -> bool {
        matches!(self, Self::Pulse | Self::Pong | Self::ContextUpdate)
    }

    /// Client-origin methods: mission clients never complete the challenge
    /// handshake, so these pass the guard on a separate admission lane.
    pub fn is_client_origin(&self) -> bool {
        matches!(
            self,
            Self::Intent
                | Self::Finish
                | Self::GetPageContext
                | Self::StartRecording
                | Self::StopRecording
        )
    }
}

/// A validated inbound request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub raw_method: String,
    pub params: Value,
    pub id: Option<Value>,
}

/// Parse and shape-validate one frame. A failure keeps the connection open;
/// the caller responds with `-32600`.
pub fn parse_request(text: &str) -> Result<Request, ProtocolError> {
    let envelope: Envelope =
        serde_json::from_str(text).map_err(|_| ProtocolError::InvalidEnvelope)?;
    if envelope.jsonrpc != JSONRPC {
        return Err(ProtocolError::InvalidEnvelope);
    }
    if !envelope.params.is_object() && !envelope.params.is_null() {
        return Err(ProtocolError::InvalidEnvelope);
    }
    let method =
        Method::from_wire(&envelope.method).ok_or(ProtocolError::InvalidEnvelope)?;
    Ok(Request {
        method,
        raw_method: envelope.method,
        params: envelope.params,
        id: envelope.id,
    })
}

// -- Inbound param shapes -----------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationParams {
    pub layer: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub selectors: Vec<String>,
    #[serde(default, rename = "authToken")]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChallengeResponseParams {
    pub response: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClearParams {
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WaitParams {
    #[serde(default, rename = "retryAfterMs")]
    pub retry_after_ms: Option<u64>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HijackParams {
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResumeParams {
    #[serde(default, rename = "re_check")]
    pub re_check: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionParams {
    pub cmd: String,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

/// Client intent: one high-level command for the browser.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IntentParams {
    pub cmd: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub goal: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "stabilityHint")]
    pub stability_hint: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FinishParams {
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorReportParams {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub stack: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContextUpdateParams {
    #[serde(default)]
    pub context: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SidetalkParams {
    #[serde(default)]
    pub message: Value,
}

// -- Outbound envelope builders -----------------------------------------------

/// Serialize a notification (no `id`).
pub fn notification(method: &str, params: impl Serialize) -> String {
    let value = json!({
        "jsonrpc": JSONRPC,
        "method": format!("{NAMESPACE}{method}"),
        "params": params,
    });
    value.to_string()
}

/// Serialize a success response echoing the request id.
pub fn response(id: &Value, result: impl Serialize) -> String {
    let value = json!({
        "jsonrpc": JSONRPC,
        "id": id,
        "result": result,
    });
    value.to_string()
}

/// Serialize an error response. `id` is null for requests without one.
pub fn error_response(id: Option<&Value>, error: ProtocolError, message: &str) -> String {
    let value = json!({
        "jsonrpc": JSONRPC,
        "id": id.cloned().unwrap_or(Value::Null),
        "error": { "code": error.code(), "message": message },
    });
    value.to_string()
}

// -- Hub-originated notification payloads --------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct AgentJoined<'a> {
    pub layer: &'a str,
    pub priority: i64,
    pub capabilities: &'a [String],
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentLeft<'a> {
    pub layer: &'a str,
    pub reason: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandComplete<'a> {
    pub id: &'a str,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'a str>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub context: Value,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub learned: bool,
    #[serde(rename = "selfHealed", skip_serializing_if = "std::ops::Not::not")]
    pub self_healed: bool,
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
