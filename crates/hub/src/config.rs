// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

/// Configuration for the starlight coordination hub.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "starlight-hub", about = "Coordination hub for browser sentinels")]
pub struct HubConfig {
    /// Host to bind on.
    #[arg(long, default_value = "127.0.0.1", env = "STARLIGHT_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080, env = "STARLIGHT_PORT")]
    pub port: u16,

    /// Shared token agents must present at registration. If unset, auth is disabled.
    #[arg(long, env = "STARLIGHT_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Heartbeat supervisor tick interval in milliseconds.
    #[arg(long, default_value_t = 1000, env = "STARLIGHT_HEARTBEAT_INTERVAL_MS")]
    pub heartbeat_interval_ms: u64,

    /// Evict an agent whose last sign of life is older than this, in milliseconds.
    #[arg(long, default_value_t = 5000, env = "STARLIGHT_HEARTBEAT_TIMEOUT_MS")]
    pub heartbeat_timeout_ms: u64,

    /// Preemption lock time-to-live in milliseconds.
    #[arg(long, default_value_t = 5000, env = "STARLIGHT_LOCK_TTL_MS")]
    pub lock_ttl_ms: u64,

    /// Mission-level timeout in milliseconds; expiry triggers orderly shutdown.
    #[arg(long, default_value_t = 180_000, env = "STARLIGHT_MISSION_TIMEOUT_MS")]
    pub mission_timeout_ms: u64,

    /// Overall budget for a consensus round in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "STARLIGHT_SYNC_BUDGET_MS")]
    pub sync_budget_ms: u64,

    /// Secondary timeout under sub-unanimous quorum, armed at the first vote.
    #[arg(long, default_value_t = 5000, env = "STARLIGHT_CONSENSUS_TIMEOUT_MS")]
    pub consensus_timeout_ms: u64,

    /// Mandatory settlement window before a CLEAR outcome, in milliseconds.
    #[arg(long, default_value_t = 500, env = "STARLIGHT_SETTLEMENT_WINDOW_MS")]
    pub settlement_window_ms: u64,

    /// Fraction of relevant agents (by confidence sum) required to clear a command.
    #[arg(long, default_value_t = 1.0, env = "STARLIGHT_QUORUM_THRESHOLD")]
    pub quorum_threshold: f64,

    /// How many WAIT retries a command gets before it is forced through.
    #[arg(long, default_value_t = 3, env = "STARLIGHT_MAX_PRE_CHECK_RETRIES")]
    pub max_pre_check_retries: u32,

    /// Agents with a priority number at or below this participate in consensus.
    #[arg(long, default_value_t = 10, env = "STARLIGHT_RELEVANCE_THRESHOLD")]
    pub relevance_threshold: i64,

    /// Predictive wait applied when the current time falls in an unstable aura.
    #[arg(long, default_value_t = 1500, env = "STARLIGHT_AURA_PREDICTIVE_WAIT_MS")]
    pub aura_predictive_wait_ms: u64,

    /// Width of an aura bucket relative to mission start, in milliseconds.
    #[arg(long, default_value_t = 500, env = "STARLIGHT_AURA_BUCKET_MS")]
    pub aura_bucket_ms: u64,

    /// Minimum spacing between entropy-derived trace samples, in milliseconds.
    #[arg(long, default_value_t = 500, env = "STARLIGHT_ENTROPY_THROTTLE_MS")]
    pub entropy_throttle_ms: u64,

    /// Minimum spacing between screenshot captures, in milliseconds.
    #[arg(long, default_value_t = 1500, env = "STARLIGHT_SCREENSHOT_THROTTLE_MS")]
    pub screenshot_throttle_ms: u64,

    /// Screenshots older than this are eligible for cleanup, in milliseconds.
    #[arg(long, default_value_t = 86_400_000, env = "STARLIGHT_SCREENSHOT_MAX_AGE_MS")]
    pub screenshot_max_age_ms: u64,

    /// Capacity of the rolling mission trace.
    #[arg(long, default_value_t = 500, env = "STARLIGHT_TRACE_MAX_EVENTS")]
    pub trace_max_events: usize,

    /// Recurse into shadow roots when sweeping the page for candidates.
    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        env = "STARLIGHT_SHADOW_DOM_ENABLED"
    )]
    pub shadow_dom_enabled: bool,

    /// Maximum shadow-root recursion depth for candidate sweeps.
    #[arg(long, default_value_t = 5, env = "STARLIGHT_SHADOW_DOM_MAX_DEPTH")]
    pub shadow_dom_max_depth: u32,

    /// Also stretch the settlement window by a command's stability hint.
    /// Off by default: the hint only lengthens the pre-execution wait.
    #[arg(long, env = "STARLIGHT_STABILITY_EXTENDS_SETTLEMENT")]
    pub stability_extends_settlement: bool,

    /// Path to the persisted goal-to-selector memory.
    #[arg(long, default_value = "memory.json", env = "STARLIGHT_MEMORY_PATH")]
    pub memory_path: std::path::PathBuf,

    /// Path to the persisted mission trace.
    #[arg(long, default_value = "trace.json", env = "STARLIGHT_TRACE_PATH")]
    pub trace_path: std::path::PathBuf,

    /// Browser engine handed to the driver backend (chromium, firefox, webkit, stealth).
    #[arg(long, default_value = "chromium", env = "STARLIGHT_BROWSER_ENGINE")]
    pub browser_engine: String,

    /// Run the browser headless.
    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        env = "STARLIGHT_BROWSER_HEADLESS"
    )]
    pub browser_headless: bool,

    /// Test mode: disables screenshot throttling.
    #[arg(long, env = "STARLIGHT_TEST_MODE")]
    pub test_mode: bool,
}

impl HubConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn mission_timeout(&self) -> Duration {
        Duration::from_millis(self.mission_timeout_ms)
    }

    pub fn sync_budget(&self) -> Duration {
        Duration::from_millis(self.sync_budget_ms)
    }

    pub fn consensus_timeout(&self) -> Duration {
        Duration::from_millis(self.consensus_timeout_ms)
    }

    pub fn settlement_window(&self) -> Duration {
        Duration::from_millis(self.settlement_window_ms)
    }

    pub fn aura_predictive_wait(&self) -> Duration {
        Duration::from_millis(self.aura_predictive_wait_ms)
    }

    pub fn screenshot_throttle(&self) -> Duration {
        Duration::from_millis(self.screenshot_throttle_ms)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
