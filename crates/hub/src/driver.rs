// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Browser driver seam. The hub owns exactly one driver handle; concrete
//! backends (chromium/firefox/webkit/stealth) live outside this crate.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Boxed future used to keep [`Driver`] object-safe behind `Arc<dyn Driver>`.
pub type DriverFut<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// A single page operation, mapped one-to-one from command kinds and
/// hijack-mode actions.
#[derive(Debug, Clone, PartialEq)]
pub enum PageAction {
    Goto { url: String },
    Click { selector: String },
    Fill { selector: String, text: String },
    Press { selector: Option<String>, key: String },
    Type { selector: Option<String>, text: String },
    /// Scrolls the selector into view, or to the bottom of the page.
    Scroll { selector: Option<String> },
    Select { selector: String, value: String },
    Hover { selector: String },
    SetChecked { selector: String, checked: bool },
    Upload { selector: String, files: Vec<String> },
    /// Hijack-mode: click through overlays without actionability checks.
    ForceClick { selector: String },
    /// Hijack-mode: dispatch a synthetic DOM event.
    DispatchEvent { selector: String, event: String },
    /// Hijack-mode: hide modals and overlays via an in-page script.
    HideOverlays,
}

/// Bounding rectangle of a selector's element, for overlap analysis by
/// interested agents.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// What the resolver sweeps look for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepScope {
    /// Interactive elements: anchors, buttons, ARIA roles, click handlers.
    Interactive,
    /// Form-like elements: inputs, textareas, selects, searchboxes.
    FormInputs,
    /// `<select>` elements only.
    Selects,
    /// Checkboxes and radio inputs.
    Checkables,
}

/// One candidate element reported by the driver's page sweep. Text and
/// attribute extraction happens in the page; scoring happens in the hub.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageElement {
    /// Upper-cased tag name (`BUTTON`, `A`, `INPUT`, ...).
    pub tag: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub classes: Vec<String>,
    /// Visible text content, collapsed whitespace.
    #[serde(default)]
    pub text: String,
    /// Current input value, when the element has one.
    #[serde(default)]
    pub value: String,
    /// Accessibility-adjacent attributes: aria-label, title, alt,
    /// placeholder, data-tooltip, name, and friends.
    #[serde(default)]
    pub attrs: Vec<String>,
    /// Parent's aria-label or title, when present.
    #[serde(default)]
    pub parent_label: String,
    /// Visible text of the parent element.
    #[serde(default)]
    pub parent_text: String,
    /// Text of an associated `<label for=...>` element.
    #[serde(default)]
    pub label_text: String,
    /// Screen-reader-only text and SVG titles nested in the element.
    #[serde(default)]
    pub hidden_text: String,
    /// CSS path assembled by the driver walking up the tree.
    #[serde(default)]
    pub css_path: String,
    /// Shadow-host chain when the element lives inside shadow roots,
    /// outermost first.
    #[serde(default)]
    pub shadow_hosts: Vec<String>,
}

/// Page summary attached to command completions and `getPageContext` replies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageContext {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub ready_state: String,
}

/// Object-safe driver abstraction over a browser backend.
pub trait Driver: Send + Sync + 'static {
    /// Execute one page action.
    fn perform(&self, action: PageAction) -> DriverFut<'_, ()>;

    /// Capture a JPEG screenshot, base64-encoded. `None` when the backend
    /// has no screenshot surface.
    fn screenshot(&self) -> DriverFut<'_, Option<String>>;

    /// Visible text of the page, for PII-capable agents.
    fn visible_text(&self) -> DriverFut<'_, String>;

    /// Accessibility tree snapshot.
    fn a11y_snapshot(&self) -> DriverFut<'_, Value>;

    /// Bounding rect for a selector, if the element exists.
    fn target_rect(&self, selector: &str) -> DriverFut<'_, Option<TargetRect>>;

    /// Sweep the page for candidate elements in the given scope. Shadow-DOM
    /// recursion depth is a backend setting.
    fn sweep(&self, scope: SweepScope) -> DriverFut<'_, Vec<PageElement>>;

    /// Evaluate a script in the page and return its JSON result.
    fn evaluate(&self, script: &str) -> DriverFut<'_, Value>;

    /// Current page summary.
    fn page_context(&self) -> DriverFut<'_, PageContext>;
}

/// Driver used when no browser backend is wired in. Every action succeeds
/// without side effects so the coordination engine can run standalone.
#[derive(Debug, Default)]
pub struct NullDriver;

impl Driver for NullDriver {
    fn perform(&self, action: PageAction) -> DriverFut<'_, ()> {
        Box::pin(async move {
            tracing::debug!(?action, "null driver: action dropped");
            Ok(())
        })
    }

    fn screenshot(&self) -> DriverFut<'_, Option<String>> {
        Box::pin(async { Ok(None) })
    }

    fn visible_text(&self) -> DriverFut<'_, String> {
        Box::pin(async { Ok(String::new()) })
    }

    fn a11y_snapshot(&self) -> DriverFut<'_, Value> {
        Box::pin(async { Ok(Value::Null) })
    }

    fn target_rect(&self, _selector: &str) -> DriverFut<'_, Option<TargetRect>> {
        Box::pin(async { Ok(None) })
    }

    fn sweep(&self, _scope: SweepScope) -> DriverFut<'_, Vec<PageElement>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn evaluate(&self, _script: &str) -> DriverFut<'_, Value> {
        Box::pin(async { Ok(Value::Null) })
    }

    fn page_context(&self) -> DriverFut<'_, PageContext> {
        Box::pin(async { Ok(PageContext::default()) })
    }
}
