//! `{name}` placeholder substitution for handler command templates.
//!
//! Substitution is a pure function over an immutable context. Placeholders
//! with no value in the context are left in place, so a missing variable shows
//! up verbatim in the resolved command and the audit trail.

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

use super::state::{Step, WorkflowRun};

pub const WORK_ID: &str = "work_id";
pub const RUN_ID: &str = "run_id";
pub const ERROR: &str = "error";
pub const STEP_ID: &str = "step_id";
pub const PHASE: &str = "phase";

/// Variables every failure context provides
pub const RECOGNIZED_VARIABLES: [&str; 5] = [WORK_ID, RUN_ID, ERROR, STEP_ID, PHASE];

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
});

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubstitutionContext {
    variables: BTreeMap<String, String>,
}

impl SubstitutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for a failed step. Domain variables are applied first so the
    /// recognized variables always win over a same-named domain value.
    pub fn for_failure(run: &WorkflowRun, step: &Step, domain: &BTreeMap<String, String>) -> Self {
        let mut context = Self::new();
        for (key, value) in domain {
            context = context.with_var(key.clone(), value.clone());
        }

        context = context
            .with_var(RUN_ID, run.run_id.clone())
            .with_var(STEP_ID, step.step_id.clone())
            .with_var(PHASE, step.phase.clone())
            .with_error(step.last_error.as_deref().unwrap_or_default());
        if let Some(work_id) = &run.work_id {
            context = context.with_var(WORK_ID, work_id.clone());
        }
        context
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Set `error`, escaped for use inside a double-quoted argument
    pub fn with_error(self, message: &str) -> Self {
        self.with_var(ERROR, escape_error_message(message))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.variables.get(key).map(String::as_str)
    }

    pub fn variables(&self) -> &BTreeMap<String, String> {
        &self.variables
    }
}

/// Escape a free-form error message so it cannot break out of a quoted
/// argument or trigger shell expansion.
pub fn escape_error_message(message: &str) -> String {
    let mut escaped = String::with_capacity(message.len());
    for ch in message.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '`' => escaped.push_str("\\`"),
            '$' => escaped.push_str("\\$"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            c if c.is_control() => {}
            c => escaped.push(c),
        }
    }
    escaped
}

/// Replace every `{name}` that has a value in `context`; leave the rest
pub fn substitute(template: &str, context: &SubstitutionContext) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| match context.get(&caps[1]) {
            Some(value) => value.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Placeholder names still present in a resolved string
pub fn unresolved_placeholders(resolved: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(resolved)
        .map(|caps| caps[1].to_string())
        .collect()
}
