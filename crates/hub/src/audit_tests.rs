// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use super::*;

fn event(method: &str) -> TraceEvent {
    TraceEvent { ts: epoch_ms(), method: method.to_owned(), summary: String::new(), dom_snapshot: None }
}

#[tokio::test]
async fn ring_drops_oldest_when_full() {
    let trace = MissionTrace::new(3);
    for method in ["a", "b", "c", "d"] {
        trace.push(event(method)).await;
    }
    assert_eq!(trace.len().await, 3);
    let methods: Vec<String> = trace.snapshot().await.into_iter().map(|e| e.method).collect();
    assert_eq!(methods, vec!["b", "c", "d"]);
}

#[tokio::test]
async fn throttled_push_collapses_bursts() {
    let trace = MissionTrace::new(16);
    let gap = Duration::from_millis(50);
    trace.push_throttled(event("pulse"), gap).await;
    trace.push_throttled(event("pulse"), gap).await;
    assert_eq!(trace.len().await, 1);

    tokio::time::sleep(Duration::from_millis(60)).await;
    trace.push_throttled(event("pulse"), gap).await;
    assert_eq!(trace.len().await, 2);
}

#[tokio::test]
async fn command_count_filters_entry_types() {
    let audit = AuditLog::new();
    audit
        .push(AuditEntry::Hijack {
            ts: epoch_ms(),
            agent_layer: "detection".to_owned(),
            reason: "popup".to_owned(),
            screenshot: None,
        })
        .await;
    audit
        .push(AuditEntry::Command {
            ts: epoch_ms(),
            id: "c1".to_owned(),
            cmd: "goto".to_owned(),
            selector: None,
            goal: None,
            success: true,
            error: None,
            duration_ms: 12,
            flags: CommandFlags::default(),
            screenshot_before: None,
            screenshot_after: None,
        })
        .await;
    assert_eq!(audit.command_count().await, 1);
    assert_eq!(audit.entries().await.len(), 2);
}

#[test]
fn entry_serialization_is_tagged() -> anyhow::Result<()> {
    let entry = AuditEntry::MissionFailure { ts: 1, reason: "mission timeout".to_owned() };
    let json = serde_json::to_string(&entry)?;
    assert!(json.contains("\"type\":\"MISSION_FAILURE\""));

    let entry = AuditEntry::SentinelError {
        ts: 2,
        agent_layer: "vision".to_owned(),
        error: "boom".to_owned(),
        stack: None,
    };
    let json = serde_json::to_string(&entry)?;
    assert!(json.contains("\"type\":\"SENTINEL_ERROR\""));
    assert!(!json.contains("stack"));
    Ok(())
}
