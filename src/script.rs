//! Per-document scripts
//!
//! A script receives a mutable [`ScriptContext`] for one document and may
//! rewrite its source and identity, or set `op` to `"noop"` / `"delete"`.
//! Scripts are looked up by name in an immutable [`ScriptRegistry`].

use crate::config::ScriptSpec;
use crate::error::{ConfigError, ScriptError};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Operation names a script may set
pub mod ops {
    pub const INDEX: &str = "index";
    pub const NOOP: &str = "noop";
    pub const DELETE: &str = "delete";
}

/// View of one document handed to a script
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptContext {
    /// Parsed document source (`ctx._source`)
    pub source: Map<String, Value>,

    /// Source index; changes are ignored
    pub index: String,

    pub doc_type: String,
    pub id: String,

    /// Source version; changes are ignored
    pub version: Option<i64>,

    pub routing: Option<String>,
    pub parent: Option<String>,

    /// Operation override; `None` means index
    pub op: Option<String>,
}

/// A document rewrite
pub trait Script: Send + Sync {
    fn apply(&self, ctx: &mut ScriptContext, params: &Map<String, Value>) -> Result<(), ScriptError>;
}

impl<F> Script for F
where
    F: Fn(&mut ScriptContext, &Map<String, Value>) -> Result<(), ScriptError> + Send + Sync,
{
    fn apply(&self, ctx: &mut ScriptContext, params: &Map<String, Value>) -> Result<(), ScriptError> {
        self(ctx, params)
    }
}

/// Leaves the document untouched
pub struct Identity;

impl Script for Identity {
    fn apply(&self, _ctx: &mut ScriptContext, _params: &Map<String, Value>) -> Result<(), ScriptError> {
        Ok(())
    }
}

/// Skips every document
pub struct Noop;

impl Script for Noop {
    fn apply(&self, ctx: &mut ScriptContext, _params: &Map<String, Value>) -> Result<(), ScriptError> {
        ctx.op = Some(ops::NOOP.to_string());
        Ok(())
    }
}

/// Deletes every document from the destination
pub struct Delete;

impl Script for Delete {
    fn apply(&self, ctx: &mut ScriptContext, _params: &Map<String, Value>) -> Result<(), ScriptError> {
        ctx.op = Some(ops::DELETE.to_string());
        Ok(())
    }
}

/// Sets `params.field` to `params.value`
pub struct SetField;

impl Script for SetField {
    fn apply(&self, ctx: &mut ScriptContext, params: &Map<String, Value>) -> Result<(), ScriptError> {
        let field = string_param("set-field", params, "field")?;
        let value = params.get("value").ok_or_else(|| ScriptError::MissingParam {
            script: "set-field".into(),
            param: "value".into(),
        })?;
        ctx.source.insert(field.to_string(), value.clone());
        Ok(())
    }
}

/// Removes `params.field`
pub struct RemoveField;

impl Script for RemoveField {
    fn apply(&self, ctx: &mut ScriptContext, params: &Map<String, Value>) -> Result<(), ScriptError> {
        let field = string_param("remove-field", params, "field")?;
        ctx.source.remove(field);
        Ok(())
    }
}

fn string_param<'a>(
    script: &str,
    params: &'a Map<String, Value>,
    name: &str,
) -> Result<&'a str, ScriptError> {
    match params.get(name) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        Some(other) => Err(ScriptError::InvalidParam {
            script: script.into(),
            param: name.into(),
            reason: format!("expected a non-empty string, got {}", other),
        }),
        None => Err(ScriptError::MissingParam {
            script: script.into(),
            param: name.into(),
        }),
    }
}

/// A script bound to its parameters
#[derive(Clone)]
pub struct BoundScript {
    name: String,
    script: Arc<dyn Script>,
    params: Map<String, Value>,
}

impl BoundScript {
    pub fn new(name: impl Into<String>, script: Arc<dyn Script>, params: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            script,
            params,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run(&self, ctx: &mut ScriptContext) -> Result<(), ScriptError> {
        self.script.apply(ctx, &self.params)
    }
}

impl fmt::Debug for BoundScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundScript")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish()
    }
}

/// Named scripts, built once and shared read-only
#[derive(Clone, Default)]
pub struct ScriptRegistry {
    scripts: HashMap<String, Arc<dyn Script>>,
}

impl ScriptRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `identity`, `noop`, `delete`, `set-field` and `remove-field`
    pub fn builtin() -> Self {
        Self::new()
            .with("identity", Identity)
            .with("noop", Noop)
            .with("delete", Delete)
            .with("set-field", SetField)
            .with("remove-field", RemoveField)
    }

    /// Add a script under `name`, replacing any existing one
    pub fn with(mut self, name: impl Into<String>, script: impl Script + 'static) -> Self {
        self.scripts.insert(name.into(), Arc::new(script));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Script>> {
        self.scripts.get(name).cloned()
    }

    /// Sorted script names
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.scripts.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Look up a script and bind its parameters
    pub fn resolve(&self, spec: &ScriptSpec) -> Result<BoundScript, ConfigError> {
        let script = self.get(&spec.name).ok_or_else(|| ConfigError::UnknownScript {
            name: spec.name.clone(),
        })?;
        Ok(BoundScript::new(spec.name.clone(), script, spec.params.clone()))
    }
}

impl fmt::Debug for ScriptRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptRegistry")
            .field("scripts", &self.names())
            .finish()
    }
}
