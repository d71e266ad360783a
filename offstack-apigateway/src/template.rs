//! Mapping template rendering
//!
//! Rendering goes through the [`TemplateRenderer`] trait so a full template
//! engine can be plugged in. The bundled [`SubstitutionRenderer`] covers the
//! references mapping templates use most: `$input.json('$.x')`,
//! `$input.body`, `$input.path('$.x')`, `$input.params('x')`, `$context.x`
//! and `$stageVariables.x`.

use offstack_core::json_path;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Error while rendering template: {0}")]
    Render(String),
}

/// Values a template can reference
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    /// `$input.body`, root of `$input.path` / `$input.json`
    pub payload: Value,
    /// `$context`
    pub context: Value,
    pub path_params: BTreeMap<String, String>,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    /// `$stageVariables`, null when none are configured
    pub stage_variables: Value,
}

impl TemplateContext {
    /// `$input.params('name')`: path, then query string, then header
    pub fn param(&self, name: &str) -> Option<&str> {
        self.path_params
            .get(name)
            .or_else(|| self.query.get(name))
            .map(String::as_str)
            .or_else(|| {
                self.headers
                    .iter()
                    .find(|(key, _)| key.eq_ignore_ascii_case(name))
                    .map(|(_, value)| value.as_str())
            })
    }
}

pub trait TemplateRenderer: Send + Sync {
    /// Render `template` and return the resulting JSON value
    fn render(&self, template: &str, context: &TemplateContext) -> Result<Value, TemplateError>;
}

static REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"\$input\.json\(\s*['"]([^'"]*)['"]\s*\)|\$input\.path\(\s*['"]([^'"]*)['"]\s*\)|\$input\.params\(\s*['"]([^'"]*)['"]\s*\)|\$input\.body|\$context\.([A-Za-z0-9_.]+)|\$stageVariables\.([A-Za-z0-9_]+)"#,
    )
    .expect("static regex")
});

/// Replaces references in place, then reads the result as JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct SubstitutionRenderer;

/// Strings render raw, everything else as JSON text, missing as nothing
fn text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn dotted<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |value, key| value.get(key))
}

impl SubstitutionRenderer {
    fn substitute(captures: &Captures<'_>, context: &TemplateContext) -> String {
        if let Some(path) = captures.get(1) {
            return json_path::resolve(&context.payload, path.as_str())
                .map_or_else(|| "null".to_string(), Value::to_string);
        }
        if let Some(path) = captures.get(2) {
            return text(json_path::resolve(&context.payload, path.as_str()));
        }
        if let Some(name) = captures.get(3) {
            return context.param(name.as_str()).unwrap_or_default().to_string();
        }
        if let Some(path) = captures.get(4) {
            return text(dotted(&context.context, path.as_str()));
        }
        if let Some(name) = captures.get(5) {
            return text(context.stage_variables.get(name.as_str()));
        }
        text(Some(&context.payload))
    }
}

impl TemplateRenderer for SubstitutionRenderer {
    fn render(&self, template: &str, context: &TemplateContext) -> Result<Value, TemplateError> {
        let rendered = REFERENCE.replace_all(template, |captures: &Captures<'_>| Self::substitute(captures, context));
        let trimmed = rendered.trim();
        Ok(serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string())))
    }
}
