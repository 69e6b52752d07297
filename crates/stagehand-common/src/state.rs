//! Scope-tagged state and tombstone-aware deltas.
//!
//! Every state key belongs to exactly one scope, decided by its prefix:
//!
//! | Prefix   | Scope        | Persisted | Visible to                      |
//! |----------|--------------|-----------|---------------------------------|
//! | `temp:`  | `Invocation` | never     | the current orchestration run   |
//! | (none)   | `Session`    | yes       | future runs of the same session |
//! | `user:`  | `User`       | yes       | every session of the user       |
//! | `app:`   | `App`        | yes       | every session of the app        |
//!
//! Deltas carry an explicit [`DeltaOp::Delete`] marker. Deleting a key removes
//! it from the materialized map; a JSON `null` is an ordinary value.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const TEMP_PREFIX: &str = "temp:";
pub const USER_PREFIX: &str = "user:";
pub const APP_PREFIX: &str = "app:";

/// Materialized key/value state.
pub type StateMap = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateScope {
    Invocation,
    Session,
    User,
    App,
}

impl StateScope {
    /// Classify a key by its prefix.
    pub fn of(key: &str) -> Self {
        if key.starts_with(TEMP_PREFIX) {
            Self::Invocation
        } else if key.starts_with(USER_PREFIX) {
            Self::User
        } else if key.starts_with(APP_PREFIX) {
            Self::App
        } else {
            Self::Session
        }
    }

    pub fn is_durable(self) -> bool {
        !matches!(self, Self::Invocation)
    }

    pub fn prefix(self) -> &'static str {
        match self {
            Self::Invocation => TEMP_PREFIX,
            Self::Session => "",
            Self::User => USER_PREFIX,
            Self::App => APP_PREFIX,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invocation => "invocation",
            Self::Session => "session",
            Self::User => "user",
            Self::App => "app",
        }
    }
}

impl std::fmt::Display for StateScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single change to one key.
///
/// Serialized as `{"op":"set","value":..}` or `{"op":"delete"}`, so a
/// tombstone can never be read back as a stored `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum DeltaOp {
    Set(Value),
    Delete,
}

impl DeltaOp {
    pub fn is_delete(&self) -> bool {
        matches!(self, Self::Delete)
    }
}

/// Ordered set of key changes produced by one stage turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateDelta(BTreeMap<String, DeltaOp>);

impl StateDelta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`StateDelta::insert`] with a `Set` op.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), DeltaOp::Set(value.into()));
        self
    }

    /// Builder form of [`StateDelta::insert`] with a tombstone.
    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.0.insert(key.into(), DeltaOp::Delete);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, op: DeltaOp) {
        self.0.insert(key.into(), op);
    }

    pub fn get(&self, key: &str) -> Option<&DeltaOp> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &DeltaOp)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    /// Fold `other` into `self`; keys present in both take `other`'s op.
    pub fn merge(&mut self, other: StateDelta) {
        self.0.extend(other.0);
    }

    /// Whether any key is invocation-scoped.
    pub fn has_invocation_keys(&self) -> bool {
        self.0.keys().any(|k| StateScope::of(k) == StateScope::Invocation)
    }

    /// Copy of this delta with every `temp:` key removed.
    pub fn without_invocation(&self) -> StateDelta {
        StateDelta(
            self.0
                .iter()
                .filter(|(k, _)| StateScope::of(k).is_durable())
                .map(|(k, op)| (k.clone(), op.clone()))
                .collect(),
        )
    }

    /// Split by scope.
    ///
    /// Invocation and session entries keep their full key. User and app
    /// entries are stored under the key with the scope prefix removed, since
    /// they live in their own rows.
    pub fn partition(self) -> ScopedDelta {
        let mut scoped = ScopedDelta::default();
        for (key, op) in self.0 {
            match StateScope::of(&key) {
                StateScope::Invocation => scoped.invocation.insert(key, op),
                StateScope::Session => scoped.session.insert(key, op),
                StateScope::User => scoped.user.insert(&key[USER_PREFIX.len()..], op),
                StateScope::App => scoped.app.insert(&key[APP_PREFIX.len()..], op),
            }
        }
        scoped
    }

    /// Apply to a materialized map: `Set` writes the key, `Delete` removes it.
    pub fn apply_to(&self, state: &mut StateMap) {
        for (key, op) in &self.0 {
            match op {
                DeltaOp::Set(value) => {
                    state.insert(key.clone(), value.clone());
                }
                DeltaOp::Delete => {
                    state.remove(key);
                }
            }
        }
    }
}

impl From<StateMap> for StateDelta {
    fn from(map: StateMap) -> Self {
        StateDelta(
            map.into_iter()
                .map(|(k, v)| (k, DeltaOp::Set(v)))
                .collect(),
        )
    }
}

impl FromIterator<(String, DeltaOp)> for StateDelta {
    fn from_iter<I: IntoIterator<Item = (String, DeltaOp)>>(iter: I) -> Self {
        StateDelta(iter.into_iter().collect())
    }
}

/// A delta split into its four scopes. See [`StateDelta::partition`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopedDelta {
    pub invocation: StateDelta,
    pub session: StateDelta,
    pub user: StateDelta,
    pub app: StateDelta,
}

impl ScopedDelta {
    pub fn durable_is_empty(&self) -> bool {
        self.session.is_empty() && self.user.is_empty() && self.app.is_empty()
    }
}

/// Re-attach `prefix` to every key of a stored user/app row.
pub fn prefixed(state: &StateMap, prefix: &str) -> impl Iterator<Item = (String, Value)> {
    state
        .iter()
        .map(move |(k, v)| (format!("{prefix}{k}"), v.clone()))
}
