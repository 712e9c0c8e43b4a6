// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! PII redaction seam. The gateway runs every trace summary through the
//! configured redactor before it is stored or logged.

use regex::Regex;

/// Scrubs personally identifying content from trace summaries.
pub trait Redactor: Send + Sync + 'static {
    fn redact(&self, text: &str) -> String;
}

/// Pass-through redactor for deployments that scrub downstream.
#[derive(Debug, Default)]
pub struct NoopRedactor;

impl Redactor for NoopRedactor {
    fn redact(&self, text: &str) -> String {
        text.to_owned()
    }
}

/// Default scrubber: masks email addresses and long digit runs (card and
/// phone shaped values).
#[derive(Debug)]
pub struct BasicRedactor {
    email: Regex,
    digits: Regex,
}

impl BasicRedactor {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            email: Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}")?,
            digits: Regex::new(r"\d[\d\s-]{7,}\d")?,
        })
    }
}

impl Redactor for BasicRedactor {
    fn redact(&self, text: &str) -> String {
        let pass = self.email.replace_all(text, "[email]");
        self.digits.replace_all(&pass, "[number]").into_owned()
    }
}

#[cfg(test)]
#[path = "redact_tests.rs"]
mod tests;
