//! In-memory registry of running activities. Activities are not persisted
//! beyond their marker row; after adoption the machine definition recreates
//! them through the entry actions. They outlive chart executors (a chart may
//! fall out of cache while its activity runs) but never the owning instance.

use crate::{
    deferred::DeferredEventInput,
    engine::EngineInner,
    error::Result,
    repository,
    types::{ActivityHandle, ActivitySpawn, ChartReference, Event},
};
use futures::StreamExt;
use sea_orm::DatabaseConnection;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};
use tokio::sync::{mpsc, Mutex};

struct RunningActivity {
    task: tokio::task::JoinHandle<()>,
    /// Inbound channel for `send_to` and auto-forwarded events; `None` for
    /// activity kinds that cannot receive.
    sender: Option<mpsc::UnboundedSender<Event>>,
    /// A nested chart run by this activity, destroyed when the activity
    /// stops.
    child: Option<ChartReference>,
    auto_forward: bool,
}

type ActivityMap = HashMap<String, HashMap<String, HashMap<String, RunningActivity>>>;

pub(crate) struct ActivityManager {
    db: Arc<DatabaseConnection>,
    engine: Weak<EngineInner>,
    inner: Mutex<ActivityMap>,
}

impl ActivityManager {
    pub(crate) fn new(db: Arc<DatabaseConnection>, engine: Weak<EngineInner>) -> Self {
        Self {
            db,
            engine,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Registers and starts an activity: the marker row makes the chart
    /// non-idle for adoption, the spawned task forwards whatever the
    /// activity emits back to the owner through the deferred queue.
    pub(crate) async fn register(
        &self,
        owner: &ChartReference,
        activity_id: &str,
        spawn: ActivitySpawn,
        auto_forward: bool,
    ) -> Result<()> {
        repository::activities::register(self.db.as_ref(), owner, activity_id).await?;

        let running = match spawn {
            ActivitySpawn::Future(future) => self.spawn_future(owner, activity_id, future),
            ActivitySpawn::Callback(callback) => self.spawn_callback(owner, activity_id, callback),
            ActivitySpawn::Stream(stream) => self.spawn_stream(owner, activity_id, stream),
            ActivitySpawn::Chart {
                machine_id,
                chart_id,
                sync,
            } => {
                self.spawn_chart(owner, activity_id, machine_id, chart_id, sync)
                    .await?
            }
        };

        let mut inner = self.inner.lock().await;
        let slot = inner
            .entry(owner.machine_id.clone())
            .or_default()
            .entry(owner.chart_id.clone())
            .or_default();
        if let Some(previous) = slot.insert(
            activity_id.to_string(),
            RunningActivity {
                auto_forward,
                ..running
            },
        ) {
            previous.task.abort();
        }
        Ok(())
    }

    fn spawn_future(
        &self,
        owner: &ChartReference,
        activity_id: &str,
        future: futures::future::BoxFuture<'static, std::result::Result<Value, Value>>,
    ) -> RunningActivity {
        let engine = self.engine.clone();
        let owner = owner.clone();
        let id = activity_id.to_string();
        let task = tokio::spawn(async move {
            let event = match future.await {
                Ok(value) => Event::done_invoke(&id, Some(value)),
                Err(error) => Event::activity_error(&id, error),
            };
            if let Some(engine) = engine.upgrade() {
                engine.forward_activity_event(&owner, event).await;
                engine.activities.finish_from_task(&owner, &id).await;
            }
        });
        RunningActivity {
            task,
            sender: None,
            child: None,
            auto_forward: false,
        }
    }

    fn spawn_callback(
        &self,
        owner: &ChartReference,
        activity_id: &str,
        callback: Box<dyn FnOnce(ActivityHandle) -> futures::future::BoxFuture<'static, ()> + Send>,
    ) -> RunningActivity {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        let body = callback(ActivityHandle {
            send: out_tx,
            inbox: in_rx,
        });

        let engine = self.engine.clone();
        let owner = owner.clone();
        let id = activity_id.to_string();
        let task = tokio::spawn(async move {
            // outbound events flow to the owner until the callback's sender
            // is gone
            let forwarder = {
                let engine = engine.clone();
                let owner = owner.clone();
                tokio::spawn(async move {
                    while let Some(event) = out_rx.recv().await {
                        let Some(engine) = engine.upgrade() else { return };
                        engine.forward_activity_event(&owner, event).await;
                    }
                })
            };
            body.await;
            let _ = forwarder.await;
            if let Some(engine) = engine.upgrade() {
                engine
                    .forward_activity_event(&owner, Event::done_invoke(&id, None))
                    .await;
                engine.activities.finish_from_task(&owner, &id).await;
            }
        });
        RunningActivity {
            task,
            sender: Some(in_tx),
            child: None,
            auto_forward: false,
        }
    }

    fn spawn_stream(
        &self,
        owner: &ChartReference,
        activity_id: &str,
        mut stream: futures::stream::BoxStream<'static, Value>,
    ) -> RunningActivity {
        let engine = self.engine.clone();
        let owner = owner.clone();
        let id = activity_id.to_string();
        let task = tokio::spawn(async move {
            while let Some(value) = stream.next().await {
                let Some(engine) = engine.upgrade() else { return };
                // items that already look like events pass through; anything
                // else is wrapped
                let event = serde_json::from_value::<Event>(value.clone())
                    .unwrap_or_else(|_| Event::with_data(format!("xjog.activity.{id}"), value));
                engine.forward_activity_event(&owner, event).await;
            }
            if let Some(engine) = engine.upgrade() {
                engine
                    .forward_activity_event(&owner, Event::done_invoke(&id, None))
                    .await;
                engine.activities.finish_from_task(&owner, &id).await;
            }
        });
        RunningActivity {
            task,
            sender: None,
            child: None,
            auto_forward: false,
        }
    }

    /// Runs a machine as a nested chart under the owner. The child's own
    /// executor reports its done event to the owner (the parent reference is
    /// set), so this task only handles `sync` forwarding and inbound sends.
    fn spawn_chart<'a>(
        &'a self,
        owner: &'a ChartReference,
        _activity_id: &'a str,
        machine_id: String,
        chart_id: Option<String>,
        sync: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<RunningActivity>> + Send + 'a>>
    {
        Box::pin(async move {
        let Some(engine) = self.engine.upgrade() else {
            return Err(crate::error::EngineError::NotFound(
                "engine is shutting down".to_string(),
            ));
        };
        let child = engine
            .create_chart(&machine_id, chart_id, Some(owner.clone()))
            .await?;
        let child_ref = child.reference().clone();

        let (in_tx, mut in_rx) = mpsc::unbounded_channel::<Event>();
        let weak = self.engine.clone();
        let owner_clone = owner.clone();
        let forward_ref = child_ref.clone();
        let task = tokio::spawn(async move {
            let Some(engine) = weak.upgrade() else { return };
            let mut changes = engine.changes();
            drop(engine);
            loop {
                tokio::select! {
                    inbound = in_rx.recv() => match inbound {
                        Some(event) => {
                            let Some(engine) = weak.upgrade() else { return };
                            if let Err(err) = engine.send_event(&forward_ref, event).await {
                                tracing::warn!(chart = %forward_ref, error = %err, "failed to forward event to nested chart");
                            }
                        }
                        None => return,
                    },
                    change = changes.recv() => match change {
                        Ok(change) if change.reference == forward_ref => {
                            if sync && change.kind == crate::types::ChangeKind::Update {
                                if let Some(new) = &change.new {
                                    let Some(engine) = weak.upgrade() else { return };
                                    let update = Event::with_data(
                                        "xjog.update",
                                        serde_json::json!({
                                            "value": new.value,
                                            "context": new.context,
                                        }),
                                    );
                                    engine.forward_activity_event(&owner_clone, update).await;
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        });
        Ok(RunningActivity {
            task,
            sender: Some(in_tx),
            child: Some(child_ref),
            auto_forward: false,
        })
        })
    }

    /// Stops the activity and drops its marker row. Deterministic no-op when
    /// the activity is not present.
    pub(crate) async fn stop(&self, owner: &ChartReference, activity_id: &str) {
        let removed = {
            let mut inner = self.inner.lock().await;
            inner
                .get_mut(&owner.machine_id)
                .and_then(|charts| charts.get_mut(&owner.chart_id))
                .and_then(|activities| activities.remove(activity_id))
        };
        let Some(activity) = removed else { return };
        activity.task.abort();
        if let Some(child) = activity.child {
            self.destroy_child(&child).await;
        }
        if let Err(err) =
            repository::activities::unregister(self.db.as_ref(), owner, activity_id).await
        {
            tracing::warn!(
                chart = %owner,
                activity = activity_id,
                error = %err,
                "failed to unregister activity"
            );
        }
    }

    pub(crate) async fn stop_all_for_chart(&self, owner: &ChartReference) {
        let removed = {
            let mut inner = self.inner.lock().await;
            inner
                .get_mut(&owner.machine_id)
                .and_then(|charts| charts.remove(&owner.chart_id))
                .unwrap_or_default()
        };
        for (_, activity) in removed {
            activity.task.abort();
            if let Some(child) = activity.child {
                self.destroy_child(&child).await;
            }
        }
        if let Err(err) =
            repository::activities::unregister_all_for_chart(self.db.as_ref(), owner).await
        {
            tracing::warn!(chart = %owner, error = %err, "failed to unregister activities");
        }
    }

    /// Shutdown path: abort every running activity and drop the marker rows
    /// chart by chart.
    pub(crate) async fn stop_all(&self) {
        let drained: Vec<(ChartReference, HashMap<String, RunningActivity>)> = {
            let mut inner = self.inner.lock().await;
            inner
                .drain()
                .flat_map(|(machine_id, charts)| {
                    charts.into_iter().map(move |(chart_id, activities)| {
                        (
                            ChartReference::new(machine_id.clone(), chart_id),
                            activities,
                        )
                    })
                })
                .collect()
        };
        for (owner, activities) in drained {
            for (_, activity) in activities {
                activity.task.abort();
            }
            if let Err(err) =
                repository::activities::unregister_all_for_chart(self.db.as_ref(), &owner).await
            {
                tracing::warn!(chart = %owner, error = %err, "failed to unregister activities");
            }
        }
    }

    /// Pushes an event into the activity's inbound channel, when it has one.
    pub(crate) async fn send_to(&self, owner: &ChartReference, activity_id: &str, event: Event) {
        let inner = self.inner.lock().await;
        let sender = inner
            .get(&owner.machine_id)
            .and_then(|charts| charts.get(&owner.chart_id))
            .and_then(|activities| activities.get(activity_id))
            .and_then(|activity| activity.sender.clone());
        drop(inner);
        match sender {
            Some(sender) => {
                let _ = sender.send(event);
            }
            None => {
                tracing::warn!(
                    chart = %owner,
                    activity = activity_id,
                    "event for an activity that is not running or cannot receive"
                );
            }
        }
    }

    /// Relays an owner-chart event to every auto-forwarding activity. Called
    /// after the owner's transition completes, outside the chart mutex.
    pub(crate) async fn send_auto_forward(&self, owner: &ChartReference, event: &Event) {
        let inner = self.inner.lock().await;
        let senders: Vec<mpsc::UnboundedSender<Event>> = inner
            .get(&owner.machine_id)
            .and_then(|charts| charts.get(&owner.chart_id))
            .map(|activities| {
                activities
                    .values()
                    .filter(|activity| activity.auto_forward)
                    .filter_map(|activity| activity.sender.clone())
                    .collect()
            })
            .unwrap_or_default();
        drop(inner);
        for sender in senders {
            let _ = sender.send(event.clone());
        }
    }

    pub(crate) async fn count_for_chart(&self, owner: &ChartReference) -> usize {
        self.inner
            .lock()
            .await
            .get(&owner.machine_id)
            .and_then(|charts| charts.get(&owner.chart_id))
            .map(|activities| activities.len())
            .unwrap_or(0)
    }

    /// Cleanup executed by a finishing activity task itself: the map entry
    /// goes first so a concurrent `stop` cannot abort us mid-cleanup.
    async fn finish_from_task(&self, owner: &ChartReference, activity_id: &str) {
        {
            let mut inner = self.inner.lock().await;
            if let Some(activities) = inner
                .get_mut(&owner.machine_id)
                .and_then(|charts| charts.get_mut(&owner.chart_id))
            {
                activities.remove(activity_id);
            }
        }
        if let Err(err) =
            repository::activities::unregister(self.db.as_ref(), owner, activity_id).await
        {
            tracing::warn!(
                chart = %owner,
                activity = activity_id,
                error = %err,
                "failed to unregister finished activity"
            );
        }
    }

    fn destroy_child<'a>(
        &'a self,
        child: &'a ChartReference,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let Some(engine) = self.engine.upgrade() else { return };
            match engine.chart_executor(child).await {
                Ok(Some(executor)) => {
                    if let Err(err) = executor.destroy().await {
                        tracing::warn!(chart = %child, error = %err, "failed to destroy nested chart");
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(chart = %child, error = %err, "failed to load nested chart for destroy");
                }
            }
        })
    }
}

impl EngineInner {
    /// Activity-emitted events reach the owner through the deferred queue
    /// with zero delay, so delivery order and idempotence match every other
    /// event source.
    pub(crate) async fn forward_activity_event(&self, owner: &ChartReference, event: Event) {
        if let Err(err) = self
            .deferred
            .defer(DeferredEventInput::immediate(owner.clone(), event))
            .await
        {
            tracing::warn!(chart = %owner, error = %err, "failed to defer activity event");
        }
    }
}
