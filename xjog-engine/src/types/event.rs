use crate::types::ChartReference;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A named, JSON-serialisable value consumed by the evaluator. The engine
/// only ever inspects the type tag; the payload is opaque.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Event {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: Value::Null,
        }
    }

    pub fn with_data(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }

    /// The `done.invoke.<id>` event delivered when an invoked activity or a
    /// nested chart reaches its final state.
    pub fn done_invoke(id: &str, done_data: Option<Value>) -> Self {
        Self {
            event_type: format!("done.invoke.{id}"),
            data: done_data.unwrap_or(Value::Null),
        }
    }

    /// The `error.activity.<id>` event delivered when an activity fails.
    pub fn activity_error(id: &str, error: Value) -> Self {
        Self {
            event_type: format!("error.activity.{id}"),
            data: error,
        }
    }
}

impl From<&str> for Event {
    fn from(event_type: &str) -> Self {
        Self::new(event_type)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.event_type)
    }
}

/// Routing target of a deferred event. Absence means the chart itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventTarget {
    /// The chart's parent, resolved at delivery time.
    Parent,
    /// Another chart.
    Chart(ChartReference),
    /// A running activity of the chart.
    Activity(String),
}

const PARENT_TARGET: &str = "parent";

impl EventTarget {
    /// Text form stored in the `deferred_events.event_to` column.
    pub fn to_wire(&self) -> String {
        match self {
            EventTarget::Parent => PARENT_TARGET.to_string(),
            EventTarget::Chart(reference) => reference.uri(),
            EventTarget::Activity(id) => id.clone(),
        }
    }

    pub fn from_wire(wire: &str) -> Self {
        if wire == PARENT_TARGET {
            EventTarget::Parent
        } else if let Ok(reference) = wire.parse::<ChartReference>() {
            EventTarget::Chart(reference)
        } else {
            EventTarget::Activity(wire.to_string())
        }
    }
}

impl Serialize for EventTarget {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_wire())
    }
}

impl<'de> Deserialize<'de> for EventTarget {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = String::deserialize(deserializer)?;
        Ok(Self::from_wire(&wire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn event_serde_round_trip() {
        let event = Event::with_data("open", json!({"who": "operator"}));
        let text = serde_json::to_string(&event).unwrap();
        assert_eq!(text, r#"{"type":"open","data":{"who":"operator"}}"#);
        assert_eq!(serde_json::from_str::<Event>(&text).unwrap(), event);
    }

    #[test]
    fn payload_free_event_omits_data() {
        let text = serde_json::to_string(&Event::new("close")).unwrap();
        assert_eq!(text, r#"{"type":"close"}"#);
        let back: Event = serde_json::from_str(&text).unwrap();
        assert_eq!(back.data, Value::Null);
    }

    #[test]
    fn event_target_wire_round_trip() {
        let targets = [
            EventTarget::Parent,
            EventTarget::Chart(ChartReference::new("door", "main")),
            EventTarget::Activity("watchdog".to_string()),
        ];
        for target in targets {
            assert_eq!(EventTarget::from_wire(&target.to_wire()), target);
        }
    }
}
