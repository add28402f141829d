use crate::types::{Event, EventTarget};
use futures::{future::BoxFuture, stream::BoxStream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use tokio::sync::mpsc;

/// Error raised by the evaluator during a transition or an executed action.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct TransitionError(pub String);

impl TransitionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// The full composed snapshot the evaluator produces for one chart: state
/// value, extended context, pending actions and activity markers. The engine
/// persists it as an opaque blob and only reads the fields it needs for
/// journaling, digests and action dispatch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MachineState {
    pub value: Value,
    #[serde(default)]
    pub context: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub activities: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_data: Option<Value>,
}

impl MachineState {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            context: Value::Null,
            actions: Vec::new(),
            activities: BTreeMap::new(),
            done: false,
            done_data: None,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_actions(mut self, actions: Vec<Action>) -> Self {
        self.actions = actions;
        self
    }

    /// Matches a dotted state-value descriptor, e.g. `"open"` against the
    /// value `"open"` or `"a.b"` against `{"a": "b"}`.
    pub fn matches(&self, descriptor: &str) -> bool {
        fn walk(value: &Value, mut parts: std::str::Split<'_, char>) -> bool {
            match (value, parts.next()) {
                (Value::String(leaf), Some(part)) => leaf == part && parts.next().is_none(),
                (Value::Object(map), Some(part)) => map
                    .get(part)
                    .map(|child| walk(child, parts))
                    .unwrap_or(false),
                _ => false,
            }
        }
        walk(&self.value, descriptor.split('.'))
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// An action the evaluator asks the engine to perform after a transition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    /// Enqueue an event through the deferred scheduler.
    Send {
        event: Event,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<EventTarget>,
        /// Milliseconds; zero means "as soon as possible".
        #[serde(default)]
        delay: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// Cancel a previously sent event by its send id.
    Cancel { send_id: String },
    /// Start the named activity from the machine definition.
    Start { activity_id: String },
    /// Stop a running activity.
    Stop { activity_id: String },
    /// Emit to the log.
    Log { message: String },
    /// Run a named synchronous action from the machine definition.
    Exec { name: String },
    /// Marker for initial entry side effects; skipped when rehydrating.
    Init,
    /// Anything the engine does not understand; ignored with a warning.
    Other { name: String },
}

/// Inbound/outbound plumbing handed to a callback activity: `send` pushes
/// events to the owning chart, `inbox` receives events sent to the activity.
pub struct ActivityHandle {
    pub send: mpsc::UnboundedSender<Event>,
    pub inbox: mpsc::UnboundedReceiver<Event>,
}

/// A spawnable side effect produced by the machine definition for an
/// `invoke` action.
pub enum ActivitySpawn {
    /// Resolves once: `done.invoke.<id>` with the value, or
    /// `error.activity.<id>` with the error.
    Future(BoxFuture<'static, Result<Value, Value>>),
    /// Long-running task with bidirectional event plumbing; aborted on stop.
    Callback(Box<dyn FnOnce(ActivityHandle) -> BoxFuture<'static, ()> + Send>),
    /// Every item is forwarded to the owner; completion yields
    /// `done.invoke.<id>`.
    Stream(BoxStream<'static, Value>),
    /// A nested chart running in-process under the owner.
    Chart {
        machine_id: String,
        chart_id: Option<String>,
        /// Forward the child's state updates to the owner as `update` events.
        sync: bool,
    },
}

impl std::fmt::Debug for ActivitySpawn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivitySpawn::Future(_) => f.write_str("ActivitySpawn::Future"),
            ActivitySpawn::Callback(_) => f.write_str("ActivitySpawn::Callback"),
            ActivitySpawn::Stream(_) => f.write_str("ActivitySpawn::Stream"),
            ActivitySpawn::Chart {
                machine_id,
                chart_id,
                sync,
            } => f
                .debug_struct("ActivitySpawn::Chart")
                .field("machine_id", machine_id)
                .field("chart_id", chart_id)
                .field("sync", sync)
                .finish(),
        }
    }
}

/// The statechart evaluator, consumed as a pure external library: given a
/// state and an event it produces the next state. Implementations must not
/// call back into the engine.
pub trait MachineDefinition: Send + Sync + 'static {
    fn id(&self) -> &str;

    fn initial_state(&self) -> Result<MachineState, TransitionError>;

    fn transition(
        &self,
        state: &MachineState,
        event: &Event,
    ) -> Result<MachineState, TransitionError>;

    /// Runs a named synchronous action; errors are logged as warnings and
    /// swallowed by the caller.
    fn exec_action(
        &self,
        _name: &str,
        _context: &Value,
        _event: &Event,
    ) -> Result<(), TransitionError> {
        Ok(())
    }

    /// Produces the spawnable for an `invoke` action, or `None` when the
    /// definition has no service under that id.
    fn spawn_activity(&self, _activity_id: &str, _state: &MachineState) -> Option<ActivitySpawn> {
        None
    }
}

/// A digest projection: `key` is the digest name, `pointer` a JSON pointer
/// into the chart context. A missing or null value clears the digest row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestSpec {
    pub key: String,
    pub pointer: String,
}

/// Per-machine behavior options supplied at registration.
#[derive(Clone, Debug, Default)]
pub struct MachineOptions {
    /// Delete the chart row once the machine reaches its final state.
    pub delete_on_done: bool,
    /// Activity ids whose running activities receive every event the owner
    /// chart processes.
    pub auto_forward: HashSet<String>,
    /// Digest projections maintained after every transition.
    pub digests: Vec<DigestSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn state_snapshot_round_trip() {
        let state = MachineState::new("open")
            .with_context(json!({"count": 3}))
            .with_actions(vec![
                Action::Init,
                Action::Send {
                    event: Event::new("tick"),
                    to: None,
                    delay: 85,
                    id: Some("tick-1".to_string()),
                },
            ]);
        let bytes = state.to_bytes().unwrap();
        assert_eq!(MachineState::from_bytes(&bytes).unwrap(), state);
    }

    #[test]
    fn state_value_matching() {
        let flat = MachineState::new("open");
        assert!(flat.matches("open"));
        assert!(!flat.matches("closed"));
        assert!(!flat.matches("open.wide"));

        let nested = MachineState::new(json!({"door": "open"}));
        assert!(nested.matches("door.open"));
        assert!(!nested.matches("door"));
        assert!(!nested.matches("door.closed"));
    }

    #[test]
    fn action_wire_form_is_tagged() {
        let action = Action::Cancel {
            send_id: "tick-1".to_string(),
        };
        let text = serde_json::to_string(&action).unwrap();
        assert_eq!(text, r#"{"kind":"cancel","send_id":"tick-1"}"#);
    }
}
