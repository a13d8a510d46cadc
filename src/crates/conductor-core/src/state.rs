//! Shared execution state - typed bag with declared per-step permissions
//!
//! Every ensemble execution owns one [`StateStore`]. Steps never touch the
//! backing map directly: they declare `stateUse` (read keys) and `stateSet`
//! (write keys) and receive a short-lived [`StateHandle`] scoped to exactly
//! those keys, which makes the isolation rules mechanical:
//!
//! - reading a key outside `stateUse` fails with `PermissionDenied`,
//! - writing a key outside `stateSet` fails with `PermissionDenied`,
//! - writes stage inside the handle and become visible only on
//!   [`StateHandle::commit`] - all or nothing. A failing step aborts its
//!   handle and leaks no partial writes.
//!
//! A handle's reads are snapshotted when the handle is opened, so a step
//! observes the state as of the last committed writer and never sees
//! uncommitted writes from concurrent or later steps.
//!
//! # Typing
//!
//! An optional [`StateSchema`] maps keys to a small closed type grammar
//! ([`StateType`]); writes are checked on `write`, before staging, so a
//! type error surfaces at the offending step rather than at commit.
//!
//! # Reserved keys
//!
//! Keys starting with `$` are engine-owned (scoring mirrors, schedule
//! metadata). They bypass handle permissions via
//! [`StateStore::set_reserved`] and are invisible to schema validation.

use crate::error::{EngineError, Result};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Closed type grammar for state values
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    /// Accepts anything, including null
    Any,
}

impl StateType {
    /// Whether a value inhabits this type. `null` is accepted everywhere -
    /// keys are nullable by default.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (StateType::Any, _) => true,
            (StateType::String, Value::String(_)) => true,
            (StateType::Number, Value::Number(_)) => true,
            (StateType::Boolean, Value::Bool(_)) => true,
            (StateType::Object, Value::Object(_)) => true,
            (StateType::Array, Value::Array(_)) => true,
            _ => false,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            StateType::String => "string",
            StateType::Number => "number",
            StateType::Boolean => "boolean",
            StateType::Object => "object",
            StateType::Array => "array",
            StateType::Any => "any",
        }
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Key -> type declarations for an ensemble's state
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct StateSchema {
    #[serde(flatten)]
    fields: HashMap<String, StateType>,
}

impl StateSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, key: impl Into<String>, ty: StateType) -> Self {
        self.fields.insert(key.into(), ty);
        self
    }

    pub fn field(&self, key: &str) -> Option<StateType> {
        self.fields.get(key).copied()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    /// Check one write against the schema. Undeclared keys are untyped and
    /// always accepted.
    pub fn check(&self, key: &str, value: &Value) -> Result<()> {
        match self.fields.get(key) {
            Some(ty) if !ty.accepts(value) => Err(EngineError::StateType {
                key: key.to_string(),
                expected: ty.name().to_string(),
                actual: value_type_name(value).to_string(),
            }),
            _ => Ok(()),
        }
    }
}

/// The execution-scoped shared state bag
#[derive(Debug, Clone)]
pub struct StateStore {
    values: Arc<RwLock<Map<String, Value>>>,
    schema: Arc<StateSchema>,
}

impl StateStore {
    pub fn new(schema: StateSchema) -> Self {
        Self {
            values: Arc::new(RwLock::new(Map::new())),
            schema: Arc::new(schema),
        }
    }

    /// Apply the ensemble's `initialState`, type-checking each entry.
    pub async fn apply_initial(&self, initial: &Map<String, Value>) -> Result<()> {
        let mut values = self.values.write().await;
        for (key, value) in initial {
            self.schema.check(key, value)?;
            values.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    /// Full copy of the current state (suspension snapshots, final result).
    pub async fn snapshot(&self) -> Map<String, Value> {
        self.values.read().await.clone()
    }

    /// Restore from a snapshot (resumption).
    pub async fn restore(&self, snapshot: Map<String, Value>) {
        *self.values.write().await = snapshot;
    }

    /// The slice of state a step may see, keyed by its `stateUse` list.
    /// Used to build the interpolation scope.
    pub async fn visible(&self, use_keys: &[String]) -> Map<String, Value> {
        let values = self.values.read().await;
        let mut out = Map::new();
        for key in use_keys {
            if let Some(value) = values.get(key) {
                out.insert(key.clone(), value.clone());
            }
        }
        out
    }

    /// Open a permission-scoped handle for one step invocation.
    pub async fn begin_step(
        &self,
        step_id: impl Into<String>,
        use_keys: &[String],
        set_keys: &[String],
    ) -> StateHandle {
        let step_id = step_id.into();
        let reads = self.visible(use_keys).await;
        StateHandle {
            store: self.clone(),
            step_id,
            use_keys: use_keys.iter().cloned().collect(),
            set_keys: set_keys.iter().cloned().collect(),
            reads,
            staged: Map::new(),
        }
    }

    /// Engine-owned write to a reserved (`$`-prefixed) key, bypassing
    /// handle permissions. Panics in debug builds on non-reserved keys.
    pub async fn set_reserved(&self, key: &str, value: Value) {
        debug_assert!(key.starts_with('$'), "reserved keys start with '$'");
        self.values.write().await.insert(key.to_string(), value);
    }

    pub fn schema(&self) -> &StateSchema {
        &self.schema
    }

    async fn commit_writes(&self, staged: Map<String, Value>) {
        let mut values = self.values.write().await;
        for (key, value) in staged {
            values.insert(key, value);
        }
    }
}

/// Short-lived, permission-scoped view of the state for one step
#[derive(Debug)]
pub struct StateHandle {
    store: StateStore,
    step_id: String,
    use_keys: HashSet<String>,
    set_keys: HashSet<String>,
    /// Read snapshot taken when the handle was opened
    reads: Map<String, Value>,
    /// Staged writes, invisible until commit
    staged: Map<String, Value>,
}

impl StateHandle {
    /// Read a declared key. Reads-your-writes within the handle.
    pub fn read(&self, key: &str) -> Result<Option<Value>> {
        if !self.use_keys.contains(key) {
            return Err(EngineError::PermissionDenied {
                step: self.step_id.clone(),
                action: "read",
                key: key.to_string(),
            });
        }
        if let Some(value) = self.staged.get(key) {
            return Ok(Some(value.clone()));
        }
        Ok(self.reads.get(key).cloned())
    }

    /// Stage a write to a declared key, type-checking against the schema.
    pub fn write(&mut self, key: &str, value: Value) -> Result<()> {
        if !self.set_keys.contains(key) {
            return Err(EngineError::PermissionDenied {
                step: self.step_id.clone(),
                action: "write",
                key: key.to_string(),
            });
        }
        self.store.schema.check(key, &value)?;
        self.staged.insert(key.to_string(), value);
        Ok(())
    }

    /// Keys staged so far
    pub fn staged_keys(&self) -> Vec<String> {
        self.staged.keys().cloned().collect()
    }

    /// Atomically publish all staged writes.
    pub async fn commit(self) -> Result<()> {
        self.store.commit_writes(self.staged).await;
        Ok(())
    }

    /// Discard all staged writes.
    pub fn abort(self) {
        // Dropping the handle discards the staged map.
    }
}
