//! One executor per live chart. Every mutating operation is serialized by
//! the chart's timed mutex; a mutex acquisition timeout is treated as a
//! liveness failure of the whole engine.

use crate::{
    engine::EngineInner,
    error::{EngineError, Result},
    metrics, repository,
    types::{
        Action, ChangeKind, ChartReference, Event, MachineState, StateChange,
    },
    deferred::DeferredEventInput,
};
use serde_json::Value;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};
use tokio::sync::{Mutex, MutexGuard};

use crate::registry::MachineHandle;

pub struct ChartExecutor {
    reference: ChartReference,
    parent: Option<ChartReference>,
    machine: Arc<MachineHandle>,
    engine: Weak<EngineInner>,
    stopping: AtomicBool,
    state: Mutex<MachineState>,
}

impl ChartExecutor {
    pub(crate) fn from_record(
        engine: Weak<EngineInner>,
        machine: Arc<MachineHandle>,
        record: repository::charts::ChartRecord,
    ) -> Self {
        Self {
            reference: record.reference,
            parent: record.parent,
            machine,
            engine,
            stopping: AtomicBool::new(false),
            state: Mutex::new(record.state),
        }
    }

    pub(crate) fn new(
        engine: Weak<EngineInner>,
        machine: Arc<MachineHandle>,
        reference: ChartReference,
        parent: Option<ChartReference>,
        state: MachineState,
    ) -> Self {
        Self {
            reference,
            parent,
            machine,
            engine,
            stopping: AtomicBool::new(false),
            state: Mutex::new(state),
        }
    }

    pub fn reference(&self) -> &ChartReference {
        &self.reference
    }

    pub fn parent(&self) -> Option<&ChartReference> {
        self.parent.as_ref()
    }

    /// A copy of the current state snapshot.
    pub async fn state(&self) -> MachineState {
        self.state.lock().await.clone()
    }

    /// Sends an event through the chart. See [`ChartExecutor::send_patched`].
    pub async fn send(&self, event: Event) -> Result<Option<MachineState>> {
        self.send_patched(event, None).await
    }

    /// Applies one transition under the chart mutex: evaluator, update hooks,
    /// snapshot persistence, change broadcast, action dispatch.
    ///
    /// Returns `None` without transitioning when the chart is stopping or the
    /// engine is draining (the event is deferred to the persistent queue
    /// instead), and when the evaluator rejects the event.
    ///
    /// Auto-forwarding to child activities happens after the chart mutex is
    /// released, so a child's reply may be observed before this chart's
    /// update broadcast reaches a subscriber.
    pub async fn send_patched(
        &self,
        event: Event,
        context_patch: Option<Value>,
    ) -> Result<Option<MachineState>> {
        let Some(engine) = self.engine.upgrade() else {
            return Ok(None);
        };

        if self.stopping.load(Ordering::SeqCst) || engine.is_dying() {
            engine
                .deferred
                .defer(DeferredEventInput::immediate(
                    self.reference.clone(),
                    event,
                ))
                .await?;
            return Ok(None);
        }

        let mut guard = self.lock_state(&engine).await?;

        // a paused chart, or one already adopted away, takes no transitions
        // here; the event goes to the persistent queue for whoever owns it
        match repository::charts::read(engine.db.as_ref(), &self.reference).await? {
            Some(record) if record.paused || record.owner_id != engine.instance_id => {
                drop(guard);
                engine
                    .deferred
                    .defer(DeferredEventInput::immediate(self.reference.clone(), event))
                    .await?;
                return Ok(None);
            }
            Some(_) => {}
            None => {
                return Err(EngineError::ChartNotFound(self.reference.clone()));
            }
        }

        let old = guard.clone();
        let mut working = old.clone();
        if let Some(patch) = context_patch {
            apply_context_patch(&mut working.context, patch);
        }

        let new_state = match self.machine.def.transition(&working, &event) {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(
                    chart = %self.reference,
                    event = %event,
                    error = %err,
                    "transition failed, event dropped"
                );
                return Ok(None);
            }
        };

        engine
            .touch_chart(&self.machine, &self.reference.chart_id)
            .await;

        let change = Arc::new(StateChange {
            kind: ChangeKind::Update,
            reference: self.reference.clone(),
            parent: self.parent.clone(),
            event: Some(event.clone()),
            old: Some(old),
            new: Some(new_state.clone()),
        });

        // a failed hook leaves the in-memory state untouched and nothing
        // persisted; the sender sees the error
        engine
            .run_update_hooks(&change)
            .await
            .map_err(EngineError::HookFailure)?;

        repository::charts::update_state(
            engine.db.as_ref(),
            &engine.instance_id,
            &self.reference,
            &new_state,
        )
        .await?;
        *guard = new_state.clone();
        metrics::TRANSITIONS_TOTAL.inc();

        engine.publish(&change);

        self.dispatch_actions(&engine, &new_state, &event, false)
            .await;

        if new_state.done {
            if let Some(parent) = &self.parent {
                let done_event =
                    Event::done_invoke(&self.reference.chart_id, new_state.done_data.clone());
                // deferred through the scheduler so the parent's mutex path
                // is never re-entered from here
                if let Err(err) = engine
                    .deferred
                    .defer(DeferredEventInput::immediate(parent.clone(), done_event))
                    .await
                {
                    tracing::warn!(
                        chart = %self.reference,
                        error = %err,
                        "failed to defer done event to parent"
                    );
                }
            }
        }

        drop(guard);

        engine
            .activities
            .send_auto_forward(&self.reference, &event)
            .await;

        if new_state.done && self.machine.options.delete_on_done {
            self.destroy().await?;
        }

        Ok(Some(new_state))
    }

    /// Re-dispatches the current state's actions. Used after creation and
    /// after adoption; rehydration skips `Init` so initial side effects do
    /// not run twice.
    pub(crate) async fn run_step(&self, rehydrated: bool) -> Result<()> {
        let Some(engine) = self.engine.upgrade() else {
            return Ok(());
        };
        let guard = self.lock_state(&engine).await?;
        let state = guard.clone();
        self.dispatch_actions(&engine, &state, &Event::new("xjog.init"), rehydrated)
            .await;
        drop(guard);
        Ok(())
    }

    /// Stops the chart and removes it and everything attached to it: the
    /// chart row, deferred events, external ids and digests in one
    /// transaction, plus the running activities and the cache entry.
    pub async fn destroy(&self) -> Result<()> {
        let Some(engine) = self.engine.upgrade() else {
            return Ok(());
        };
        if self.stopping.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let guard = self.lock_state(&engine).await?;

        let change = Arc::new(StateChange {
            kind: ChangeKind::Delete,
            reference: self.reference.clone(),
            parent: self.parent.clone(),
            event: None,
            old: Some(guard.clone()),
            new: None,
        });
        engine
            .run_update_hooks(&change)
            .await
            .map_err(EngineError::HookFailure)?;

        engine.activities.stop_all_for_chart(&self.reference).await;
        engine.deferred.cancel_all_for_chart(&self.reference).await;
        repository::charts::delete(engine.db.as_ref(), &self.reference).await?;
        engine.remove_cached_chart(&self.reference).await;

        engine.publish(&change);
        drop(guard);
        Ok(())
    }

    /// Used by cache eviction: returns once no transition is in flight.
    pub(crate) async fn wait_idle(&self) {
        let _ = self.state.lock().await;
    }

    async fn lock_state(
        &self,
        engine: &Arc<EngineInner>,
    ) -> Result<MutexGuard<'_, MachineState>> {
        match tokio::time::timeout(engine.settings.chart_mutex_timeout, self.state.lock()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                // a stuck chart mutex is a fatal local condition
                tracing::error!(chart = %self.reference, "chart mutex timed out, shutting down");
                engine.spawn_shutdown();
                Err(EngineError::MutexTimeout(self.reference.clone()))
            }
        }
    }

    async fn dispatch_actions(
        &self,
        engine: &Arc<EngineInner>,
        state: &MachineState,
        event: &Event,
        rehydrated: bool,
    ) {
        for action in &state.actions {
            match action {
                Action::Exec { name } => {
                    if let Err(err) = self.machine.def.exec_action(name, &state.context, event) {
                        tracing::warn!(
                            chart = %self.reference,
                            action = %name,
                            error = %err,
                            "exec action failed"
                        );
                    }
                }
                Action::Send {
                    event: sent,
                    to,
                    delay,
                    id,
                } => {
                    let input = DeferredEventInput {
                        reference: self.reference.clone(),
                        event: sent.clone(),
                        event_to: to.clone(),
                        delay: std::time::Duration::from_millis(*delay),
                        event_id: id.clone(),
                    };
                    if let Err(err) = engine.deferred.defer(input).await {
                        tracing::warn!(
                            chart = %self.reference,
                            error = %err,
                            "failed to defer send action"
                        );
                    }
                }
                Action::Cancel { send_id } => {
                    if let Err(err) = engine.deferred.cancel(&self.reference, send_id).await {
                        tracing::warn!(
                            chart = %self.reference,
                            send_id,
                            error = %err,
                            "failed to cancel deferred event"
                        );
                    }
                }
                Action::Start { activity_id } => {
                    if state.activities.get(activity_id).copied() != Some(true) {
                        continue;
                    }
                    match self.machine.def.spawn_activity(activity_id, state) {
                        Some(spawn) => {
                            let auto_forward =
                                self.machine.options.auto_forward.contains(activity_id);
                            if let Err(err) = engine
                                .activities
                                .register(&self.reference, activity_id, spawn, auto_forward)
                                .await
                            {
                                tracing::warn!(
                                    chart = %self.reference,
                                    activity = %activity_id,
                                    error = %err,
                                    "failed to register activity"
                                );
                            }
                        }
                        None => {
                            tracing::warn!(
                                chart = %self.reference,
                                activity = %activity_id,
                                "machine definition has no service for activity"
                            );
                        }
                    }
                }
                Action::Stop { activity_id } => {
                    engine.activities.stop(&self.reference, activity_id).await;
                }
                Action::Log { message } => {
                    tracing::info!(chart = %self.reference, "{message}");
                }
                Action::Init => {
                    // initial side effects must not re-run after adoption
                    if rehydrated {
                        continue;
                    }
                }
                Action::Other { name } => {
                    tracing::warn!(chart = %self.reference, action = %name, "unhandled action");
                }
            }
        }
    }
}

/// Shallow object merge; a non-object patch replaces the context wholesale.
fn apply_context_patch(context: &mut Value, patch: Value) {
    match (context, patch) {
        (Value::Object(context), Value::Object(patch)) => {
            for (key, value) in patch {
                context.insert(key, value);
            }
        }
        (context, patch) => *context = patch,
    }
}

#[cfg(test)]
mod tests {
    use super::apply_context_patch;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn context_patch_is_shallow() {
        let mut context = json!({"a": 1, "nested": {"x": 1}});
        apply_context_patch(&mut context, json!({"nested": {"y": 2}, "b": 2}));
        assert_eq!(context, json!({"a": 1, "nested": {"y": 2}, "b": 2}));
    }

    #[test]
    fn non_object_patch_replaces() {
        let mut context = json!({"a": 1});
        apply_context_patch(&mut context, json!(42));
        assert_eq!(context, json!(42));
    }
}
