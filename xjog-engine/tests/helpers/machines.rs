//! Hand-written machine definitions exercising the engine the way real
//! evaluator output would.

use futures::future;
use serde_json::{json, Value};
use xjog_engine::{
    Action, ActivitySpawn, Event, MachineDefinition, MachineState, TransitionError,
};

/// `closed → open` on `open`, `open → closed` on `close`.
pub struct DoorMachine;

impl MachineDefinition for DoorMachine {
    fn id(&self) -> &str {
        "door"
    }

    fn initial_state(&self) -> Result<MachineState, TransitionError> {
        Ok(MachineState::new("closed").with_context(json!({})))
    }

    fn transition(
        &self,
        state: &MachineState,
        event: &Event,
    ) -> Result<MachineState, TransitionError> {
        let next = match (state.value.as_str(), event.event_type.as_str()) {
            (Some("closed"), "open") => "open",
            (Some("open"), "close") => "closed",
            _ => {
                return Err(TransitionError::new(format!(
                    "no transition from {} on {}",
                    state.value, event.event_type
                )))
            }
        };
        Ok(MachineState::new(next).with_context(state.context.clone()))
    }
}

/// Wanders between places on `go to <place>` / `go home` events.
pub struct WalkingMachine;

impl MachineDefinition for WalkingMachine {
    fn id(&self) -> &str {
        "walking-around"
    }

    fn initial_state(&self) -> Result<MachineState, TransitionError> {
        Ok(MachineState::new("at home").with_context(json!({})))
    }

    fn transition(
        &self,
        state: &MachineState,
        event: &Event,
    ) -> Result<MachineState, TransitionError> {
        let next = match event.event_type.as_str() {
            "go to park" => "at the park",
            "go to diner" => "at the diner",
            "go home" => "at home",
            other => {
                return Err(TransitionError::new(format!(
                    "cannot {other} from {}",
                    state.value
                )))
            }
        };
        Ok(MachineState::new(next).with_context(state.context.clone()))
    }
}

/// `idle → working` on `getRestless`, arming a delayed transition back
/// `home` after 85 ms that also flips `goodWeather` off.
pub struct RestlessMachine;

const AFTER_EVENT: &str = "xjog.after.85.working";

impl MachineDefinition for RestlessMachine {
    fn id(&self) -> &str {
        "restless"
    }

    fn initial_state(&self) -> Result<MachineState, TransitionError> {
        Ok(MachineState::new("idle").with_context(json!({"goodWeather": true})))
    }

    fn transition(
        &self,
        state: &MachineState,
        event: &Event,
    ) -> Result<MachineState, TransitionError> {
        match (state.value.as_str(), event.event_type.as_str()) {
            (Some("idle"), "getRestless") => {
                Ok(MachineState::new("working")
                    .with_context(state.context.clone())
                    .with_actions(vec![Action::Send {
                        event: Event::new(AFTER_EVENT),
                        to: None,
                        delay: 85,
                        id: Some(AFTER_EVENT.to_string()),
                    }]))
            }
            (Some("working"), AFTER_EVENT) => {
                let mut context = state.context.clone();
                context["goodWeather"] = Value::Bool(false);
                Ok(MachineState::new("home").with_context(context))
            }
            _ => Err(TransitionError::new(format!(
                "no transition from {} on {}",
                state.value, event.event_type
            ))),
        }
    }
}

/// `idle → working` on `begin`; `working` invokes a promise-like activity
/// that never resolves, keeping the chart non-idle for adoption.
pub struct StubbornWorkerMachine;

impl MachineDefinition for StubbornWorkerMachine {
    fn id(&self) -> &str {
        "stubborn-worker"
    }

    fn initial_state(&self) -> Result<MachineState, TransitionError> {
        Ok(MachineState::new("idle").with_context(json!({})))
    }

    fn transition(
        &self,
        state: &MachineState,
        event: &Event,
    ) -> Result<MachineState, TransitionError> {
        match (state.value.as_str(), event.event_type.as_str()) {
            (Some("idle"), "begin") => {
                let mut next = MachineState::new("working")
                    .with_context(state.context.clone())
                    .with_actions(vec![Action::Start {
                        activity_id: "endless".to_string(),
                    }]);
                next.activities.insert("endless".to_string(), true);
                Ok(next)
            }
            _ => Err(TransitionError::new(format!(
                "no transition from {} on {}",
                state.value, event.event_type
            ))),
        }
    }

    fn spawn_activity(&self, activity_id: &str, _state: &MachineState) -> Option<ActivitySpawn> {
        match activity_id {
            "endless" => Some(ActivitySpawn::Future(Box::pin(future::pending()))),
            _ => None,
        }
    }
}
