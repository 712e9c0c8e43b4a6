// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Semantic goal resolution: score candidate elements reported by the
//! driver's page sweeps against a free-text goal and assemble a CSS
//! selector for the winner. Falls back to learned mappings when the live
//! page yields nothing ("self-healing").

use std::time::Duration;

use crate::driver::{PageElement, SweepScope};
use crate::queue::CommandKind;
use crate::state::HubState;

/// Tags that get the interactive bonus and the exact-text terminal score.
const PRIMARY_TAGS: [&str; 4] = ["BUTTON", "INPUT", "A", "SELECT"];

/// Candidates below this score are not considered matches.
const MIN_SCORE: u32 = 50;

/// Exact visible-text match on a primary tag: stop scanning.
const TERMINAL_SCORE: u32 = 110;

/// Labels at most this long participate in reverse-containment scoring.
const SHORT_LABEL_LEN: usize = 24;

/// Form-input resolution races this wall clock; timeout is a miss.
const FORM_RESOLVE_BUDGET: Duration = Duration::from_secs(10);

/// Bounded breadth of the form-input scan.
const FORM_SCAN_LIMIT: usize = 2000;

/// Well-known search inputs checked before the full form scan.
const SEARCH_FAST_PATH: [&str; 5] = [
    "input[type=search]",
    "input[name=q]",
    "#search",
    "[role=searchbox]",
    "input[placeholder*=search i]",
];

/// Resolver output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub selector: String,
    /// The selector came from the learning store, not the live page.
    pub self_healed: bool,
}

impl Resolution {
    fn live(selector: String) -> Self {
        Self { selector, self_healed: false }
    }

    fn healed(selector: &str) -> Self {
        Self { selector: selector.to_owned(), self_healed: true }
    }
}

/// Lowercase and collapse whitespace.
pub fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Convert a semantic class token to spaced words:
/// `shopping_cart_link`, `shopping-cart-link`, and `shoppingCartLink` all
/// become "shopping cart link".
pub fn spaced_words(token: &str) -> String {
    let mut out = String::with_capacity(token.len() + 4);
    let mut prev_lower = false;
    for ch in token.chars() {
        if ch == '_' || ch == '-' {
            out.push(' ');
            prev_lower = false;
        } else if ch.is_uppercase() && prev_lower {
            out.push(' ');
            out.extend(ch.to_lowercase());
            prev_lower = false;
        } else {
            out.extend(ch.to_lowercase());
            prev_lower = ch.is_lowercase() || ch.is_numeric();
        }
    }
    normalize(&out)
}

/// Score one normalized candidate text against the normalized goal.
pub fn score_text(goal: &str, candidate: &str) -> u32 {
    if goal.is_empty() || candidate.is_empty() {
        return 0;
    }
    if candidate == goal {
        return 100;
    }
    if candidate.contains(goal) {
        return 95;
    }
    if goal.contains(candidate) && candidate.len() <= SHORT_LABEL_LEN {
        return 90;
    }
    let words: Vec<&str> = goal.split(' ').collect();
    let matched = words.iter().filter(|w| candidate.contains(*w)).count();
    if matched == words.len() {
        return 85;
    }
    if words.first().is_some_and(|w| candidate.contains(*w)) {
        return 70;
    }
    if matched > 0 {
        return 50 + (30 * matched as u32) / words.len() as u32;
    }
    0
}

/// All the texts a candidate can be matched on.
fn text_vector(el: &PageElement) -> Vec<String> {
    let mut texts = vec![
        normalize(&el.text),
        normalize(&el.value),
        normalize(&el.parent_label),
        normalize(&el.hidden_text),
        normalize(&el.label_text),
    ];
    for attr in &el.attrs {
        texts.push(normalize(attr));
    }
    for class in &el.classes {
        texts.push(spaced_words(class));
    }
    texts.retain(|t| !t.is_empty());
    texts
}

fn is_primary(el: &PageElement) -> bool {
    PRIMARY_TAGS.contains(&el.tag.as_str())
}

/// Score a candidate element against the normalized goal.
pub fn score_element(goal: &str, el: &PageElement) -> u32 {
    if goal.is_empty() {
        return 0;
    }
    let primary = is_primary(el);
    if primary && normalize(&el.text) == goal {
        return TERMINAL_SCORE;
    }
    let mut best = 0;
    for text in text_vector(el) {
        best = best.max(score_text(goal, &text));
    }
    if best > 0 && primary {
        best += 10;
    }
    best
}

/// Assemble a CSS selector for a winning candidate: unique `#id` first, a
/// text predicate for short-labelled anchors and buttons, the driver's CSS
/// path otherwise. Shadow candidates get a piercing prefix.
pub fn build_selector(el: &PageElement) -> String {
    let base = match &el.id {
        Some(id) if !id.is_empty() => format!("#{id}"),
        _ => {
            let text = el.text.trim();
            if matches!(el.tag.as_str(), "A" | "BUTTON")
                && !text.is_empty()
                && text.len() <= SHORT_LABEL_LEN * 2
            {
                format!("{}:has-text(\"{}\")", el.tag.to_lowercase(), text)
            } else if !el.css_path.is_empty() {
                el.css_path.clone()
            } else {
                el.tag.to_lowercase()
            }
        }
    };
    if el.shadow_hosts.is_empty() {
        base
    } else {
        format!("{} >>> {}", el.shadow_hosts.join(" >>> "), base)
    }
}

fn best_candidate<'a, F>(candidates: &'a [PageElement], score: F) -> Option<&'a PageElement>
where
    F: Fn(&PageElement) -> u32,
{
    let mut best: Option<(u32, &PageElement)> = None;
    for el in candidates {
        let s = score(el);
        if s >= TERMINAL_SCORE {
            return Some(el);
        }
        if s >= MIN_SCORE && best.is_none_or(|(prev, _)| s > prev) {
            best = Some((s, el));
        }
    }
    best.map(|(_, el)| el)
}

/// General resolver for `click`, `hover`, and `scroll` goals.
pub async fn resolve_general(
    state: &HubState,
    _kind: CommandKind,
    goal: &str,
) -> Option<Resolution> {
    let goal_norm = normalize(goal);
    let candidates = state.driver.sweep(SweepScope::Interactive).await.unwrap_or_default();
    if let Some(el) = best_candidate(&candidates, |el| score_element(&goal_norm, el)) {
        return Some(Resolution::live(build_selector(el)));
    }
    // Miss: consult history under the bare goal.
    state.learning.lock().await.recall_bare(goal).map(Resolution::healed)
}

fn score_form_element(goal: &str, el: &PageElement) -> u32 {
    let mut haystack = String::new();
    for attr in &el.attrs {
        haystack.push_str(attr);
        haystack.push(' ');
    }
    if let Some(id) = &el.id {
        haystack.push_str(id);
        haystack.push(' ');
    }
    for class in &el.classes {
        haystack.push_str(&spaced_words(class));
        haystack.push(' ');
    }
    let mut score = score_text(goal, &normalize(&haystack));
    if score == 0 {
        return 0;
    }
    if score_text(goal, &normalize(&el.label_text)) >= 85 {
        score += 15;
    }
    if normalize(&el.parent_text).contains(goal) {
        score += 5;
    }
    score
}

/// Two-stage form-input resolver for `fill`, `press`, and `upload` goals,
/// raced against a wall-clock budget.
pub async fn resolve_form_input(
    state: &HubState,
    kind: CommandKind,
    goal: &str,
) -> Option<Resolution> {
    let live = tokio::time::timeout(FORM_RESOLVE_BUDGET, async {
        let goal_norm = normalize(goal);
        // Fast path: well-known search inputs.
        if goal_norm.contains("search") {
            for selector in SEARCH_FAST_PATH {
                if let Ok(Some(_)) = state.driver.target_rect(selector).await {
                    return Some(Resolution::live(selector.to_owned()));
                }
            }
        }
        let candidates = state.driver.sweep(SweepScope::FormInputs).await.unwrap_or_default();
        let bounded = &candidates[..candidates.len().min(FORM_SCAN_LIMIT)];
        best_candidate(bounded, |el| score_form_element(&goal_norm, el))
            .map(|el| Resolution::live(build_selector(el)))
    })
    .await;

    match live {
        Ok(Some(resolution)) => Some(resolution),
        Ok(None) => state.learning.lock().await.recall(kind, goal).map(Resolution::healed),
        Err(_) => {
            tracing::warn!(goal, "form-input resolution timed out");
            state.learning.lock().await.recall(kind, goal).map(Resolution::healed)
        }
    }
}

fn score_select_element(goal: &str, el: &PageElement) -> u32 {
    let mut best = score_text(goal, &normalize(&el.label_text));
    for attr in &el.attrs {
        best = best.max(score_text(goal, &normalize(attr)));
    }
    best
}

/// Specialized resolver for `select` commands.
pub async fn resolve_select(state: &HubState, goal: &str) -> Option<Resolution> {
    let goal_norm = normalize(goal);
    let candidates = state.driver.sweep(SweepScope::Selects).await.unwrap_or_default();
    if let Some(el) = best_candidate(&candidates, |el| score_select_element(&goal_norm, el)) {
        return Some(Resolution::live(build_selector(el)));
    }
    state.learning.lock().await.recall(CommandKind::Select, goal).map(Resolution::healed)
}

fn score_checkable_element(goal: &str, el: &PageElement) -> u32 {
    let mut best = score_text(goal, &normalize(&el.parent_text));
    best = best.max(score_text(goal, &normalize(&el.label_text)));
    for attr in &el.attrs {
        best = best.max(score_text(goal, &normalize(attr)));
    }
    best
}

/// Specialized resolver for `check` and `uncheck` commands.
pub async fn resolve_checkable(
    state: &HubState,
    kind: CommandKind,
    goal: &str,
) -> Option<Resolution> {
    let goal_norm = normalize(goal);
    let candidates = state.driver.sweep(SweepScope::Checkables).await.unwrap_or_default();
    if let Some(el) = best_candidate(&candidates, |el| score_checkable_element(&goal_norm, el)) {
        return Some(Resolution::live(build_selector(el)));
    }
    state.learning.lock().await.recall(kind, goal).map(Resolution::healed)
}

#[cfg(test)]
#[path = "resolve_tests.rs"]
mod tests;
