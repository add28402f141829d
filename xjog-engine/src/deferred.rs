//! Persistent timer queue. Rows are claimed in batches with an atomic
//! reserve, armed as in-memory timers, and deleted after delivery so a retry
//! finds nothing to deliver. An event held in memory always has its row
//! locked by this instance.

use crate::{
    engine::EngineInner,
    error::Result,
    metrics, repository,
    settings::DeferredEventSettings,
    types::{ChartReference, Event, EventTarget},
};
use chrono::{DateTime, Utc};
use sea_orm::DatabaseConnection;
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::sync::{Mutex, Notify};
use xjog_entity::deferred_events;

/// One event handed to [`DeferredEventManager::defer`].
#[derive(Clone, Debug)]
pub(crate) struct DeferredEventInput {
    pub reference: ChartReference,
    pub event: Event,
    pub event_to: Option<EventTarget>,
    pub delay: Duration,
    pub event_id: Option<String>,
}

impl DeferredEventInput {
    /// An event due as soon as possible, delivered to the chart itself.
    pub fn immediate(reference: ChartReference, event: Event) -> Self {
        Self {
            reference,
            event,
            event_to: None,
            delay: Duration::ZERO,
            event_id: None,
        }
    }
}

/// The idempotency key is stored JSON-stringified so string and numeric send
/// ids round-trip with structural equality.
fn encode_event_id(id: Option<&str>) -> String {
    let key = id
        .map(|id| id.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
    serde_json::Value::String(key).to_string()
}

struct ArmedTimer {
    task: tokio::task::JoinHandle<()>,
    reference: ChartReference,
}

#[derive(Default)]
struct DeferredInner {
    timers: HashMap<i64, ArmedTimer>,
    next_read_at: Option<DateTime<Utc>>,
}

pub(crate) struct DeferredEventManager {
    db: Arc<DatabaseConnection>,
    settings: DeferredEventSettings,
    instance_id: String,
    engine: Weak<EngineInner>,
    inner: Mutex<DeferredInner>,
    wake: Notify,
}

impl DeferredEventManager {
    pub(crate) fn new(
        db: Arc<DatabaseConnection>,
        settings: DeferredEventSettings,
        instance_id: String,
        engine: Weak<EngineInner>,
    ) -> Self {
        Self {
            db,
            settings,
            instance_id,
            engine,
            inner: Mutex::new(DeferredInner::default()),
            wake: Notify::new(),
        }
    }

    /// Persists the event and, when it is due before the next scheduled batch
    /// read, pulls the read forward so the event is not left waiting a full
    /// interval.
    pub(crate) async fn defer(&self, input: DeferredEventInput) -> Result<i64> {
        let event_id = encode_event_id(input.event_id.as_deref());
        let row = repository::deferred_events::insert(
            self.db.as_ref(),
            &input.reference,
            &event_id,
            input.event_to.as_ref(),
            &input.event,
            input.delay,
        )
        .await?;

        let mut inner = self.inner.lock().await;
        let pull_forward = match inner.next_read_at {
            Some(next_read_at) => row.due < next_read_at,
            None => true,
        };
        if pull_forward {
            inner.next_read_at = Some(row.due.max(Utc::now()));
            self.wake.notify_one();
        }
        Ok(row.id)
    }

    /// Atomically reserves the upcoming rows and arms a timer per row. A full
    /// batch means more rows are likely waiting, so the next read lands at
    /// the last reserved due time; otherwise the regular interval applies.
    async fn schedule_upcoming(&self) {
        let reserved = match repository::deferred_events::reserve_batch(
            self.db.as_ref(),
            &self.instance_id,
            self.settings.look_ahead,
            self.settings.batch_size,
        )
        .await
        {
            Ok(reserved) => reserved,
            Err(err) => {
                tracing::warn!(error = %err, "deferred event batch reservation failed");
                let mut inner = self.inner.lock().await;
                inner.next_read_at = Some(Utc::now() + chrono::Duration::from_std(self.settings.interval).unwrap_or_default());
                return;
            }
        };

        let full_batch = reserved.len() as u64 == self.settings.batch_size;
        let last_due = reserved.last().map(|row| row.due);

        let mut inner = self.inner.lock().await;
        for row in reserved {
            self.arm(&mut inner, row);
        }
        let interval_read =
            Utc::now() + chrono::Duration::from_std(self.settings.interval).unwrap_or_default();
        inner.next_read_at = Some(match (full_batch, last_due) {
            (true, Some(due)) => due.max(Utc::now()),
            _ => interval_read,
        });
    }

    fn arm(&self, inner: &mut DeferredInner, row: deferred_events::Model) {
        if inner.timers.contains_key(&row.id) {
            return;
        }
        let id = row.id;
        let due = row.due;
        let reference = repository::deferred_events::reference_of(&row);
        let engine = self.engine.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(repository::deferred_events::due_instant(due)).await;
            if let Some(engine) = engine.upgrade() {
                engine.fire_deferred(row).await;
            }
        });
        inner.timers.insert(id, ArmedTimer { task, reference });
    }

    /// Cancels every pending event of the chart carrying the given send id.
    /// Idempotent: cancelling an unknown or already-fired id is a no-op.
    pub(crate) async fn cancel(&self, reference: &ChartReference, send_id: &str) -> Result<()> {
        let event_id = encode_event_id(Some(send_id));
        let deleted =
            repository::deferred_events::delete_by_event_id(self.db.as_ref(), reference, &event_id)
                .await?;
        let mut inner = self.inner.lock().await;
        for id in deleted {
            if let Some(timer) = inner.timers.remove(&id) {
                timer.task.abort();
            }
        }
        Ok(())
    }

    pub(crate) async fn cancel_all_for_chart(&self, reference: &ChartReference) {
        {
            let mut inner = self.inner.lock().await;
            let ids: Vec<i64> = inner
                .timers
                .iter()
                .filter(|(_, timer)| timer.reference == *reference)
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                if let Some(timer) = inner.timers.remove(&id) {
                    timer.task.abort();
                }
            }
        }
        if let Err(err) =
            repository::deferred_events::delete_all_for_chart(self.db.as_ref(), reference).await
        {
            tracing::warn!(chart = %reference, error = %err, "failed to delete deferred events");
        }
    }

    /// Shutdown path: disarm everything and return the locks to the pool so
    /// another instance can claim the rows.
    pub(crate) async fn release_all(&self) {
        let mut inner = self.inner.lock().await;
        for (_, timer) in inner.timers.drain() {
            timer.task.abort();
        }
        inner.next_read_at = None;
        drop(inner);

        if let Err(err) =
            repository::deferred_events::release_all(self.db.as_ref(), &self.instance_id).await
        {
            tracing::warn!(error = %err, "failed to release deferred event locks");
        }
    }

    async fn remove_timer(&self, id: i64) {
        self.inner.lock().await.timers.remove(&id);
    }
}

impl EngineInner {
    /// The batch cycle, run as a background task until the engine drains.
    pub(crate) async fn run_deferred_loop(self: Arc<Self>) {
        loop {
            let next_read_at = self.deferred.inner.lock().await.next_read_at;
            if let Some(at) = next_read_at {
                let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.deferred.wake.notified() => continue,
                }
            }
            if self.is_dying() {
                return;
            }
            self.deferred.schedule_upcoming().await;
        }
    }

    /// Fires one due event: deliver, then delete the row. Deletion after
    /// delivery makes the operation idempotent on retry, and a failed
    /// delivery still removes the row to prevent redelivery loops.
    pub(crate) async fn fire_deferred(&self, row: deferred_events::Model) {
        let id = row.id;
        if let Err(err) = self.deliver_deferred(&row).await {
            tracing::warn!(
                deferred_event = id,
                error = %err,
                "deferred delivery failed, removing event anyway"
            );
        }
        if let Err(err) = repository::deferred_events::delete(self.db.as_ref(), id).await {
            tracing::warn!(deferred_event = id, error = %err, "failed to delete fired event");
        }
        metrics::DEFERRED_EVENTS_DELIVERED.inc();
        self.deferred.remove_timer(id).await;
    }

    async fn deliver_deferred(&self, row: &deferred_events::Model) -> Result<()> {
        let reference = repository::deferred_events::reference_of(row);
        let event = repository::deferred_events::decode_event(row)?;
        let target = row.event_to.as_deref().map(EventTarget::from_wire);

        match target {
            None => {
                self.send_event(&reference, event).await?;
            }
            Some(EventTarget::Chart(target)) => {
                self.send_event(&target, event).await?;
            }
            Some(EventTarget::Parent) => {
                let parent = match self.chart_executor(&reference).await? {
                    Some(executor) => executor.parent().cloned(),
                    None => None,
                };
                match parent {
                    Some(parent) => {
                        self.send_event(&parent, event).await?;
                    }
                    None => {
                        tracing::warn!(
                            chart = %reference,
                            "deferred event routed to parent, but chart has none"
                        );
                    }
                }
            }
            Some(EventTarget::Activity(activity_id)) => {
                self.activities
                    .send_to(&reference, &activity_id, event)
                    .await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::encode_event_id;

    #[test]
    fn event_id_round_trips_as_json() {
        let encoded = encode_event_id(Some("tick-1"));
        assert_eq!(encoded, "\"tick-1\"");
        let back: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(back, serde_json::Value::String("tick-1".to_string()));
        // the same id always encodes identically, so cancel finds its row
        assert_eq!(encoded, encode_event_id(Some("tick-1")));
    }

    #[test]
    fn generated_event_ids_are_unique()  {
        assert_ne!(encode_event_id(None), encode_event_id(None));
    }
}
