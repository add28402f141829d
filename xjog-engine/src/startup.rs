//! Instance lifecycle: overthrow on start, the adoption loop with its
//! quiescence grace period, the death-note watcher, and the drain on
//! shutdown.
//!
//! ```text
//!     Initial → Starting → Adopting → Ready → Dying → Halted
//! ```

use crate::{
    engine::{EngineInner, EngineStatus},
    error::{EngineError, Result},
    metrics, repository,
    types::ChartReference,
};
use std::sync::Arc;
use tokio::time::{sleep, Instant};

impl EngineInner {
    /// Overthrows every other instance and begins adopting their charts.
    /// Returns once the background loops are running; readiness is observed
    /// through the status watch.
    pub(crate) async fn start_internal(&self) -> Result<()> {
        let started = self.status_tx.send_if_modified(|status| {
            if *status == EngineStatus::Initial {
                *status = EngineStatus::Starting;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(EngineError::Conflict("engine already started".to_string()));
        }

        repository::instances::overthrow_other_instances(self.db.as_ref(), &self.instance_id)
            .await?;
        self.set_status(EngineStatus::Adopting);

        let Some(engine) = self.weak.upgrade() else {
            return Ok(());
        };
        self.spawn_task(Arc::clone(&engine).adoption_loop());
        self.spawn_task(Arc::clone(&engine).death_note_loop());
        self.spawn_task(engine.run_deferred_loop());
        Ok(())
    }

    /// Repeatedly adopts idle paused charts; once none remain the engine is
    /// ready. The grace timer restarts after every non-empty pass, bounding
    /// quiescence rather than total adoption time. When it expires with
    /// paused charts still held back by their activity markers, those
    /// markers are wiped and the charts taken by force.
    async fn adoption_loop(self: Arc<Self>) {
        let settings = &self.settings.startup;
        let mut grace_deadline = Instant::now() + settings.grace_period;

        loop {
            if self.is_dying() {
                return;
            }

            match repository::charts::gently_adopt(self.db.as_ref(), &self.instance_id).await {
                Ok(adopted) if !adopted.is_empty() => {
                    metrics::CHARTS_ADOPTED
                        .with_label_values(&["gentle"])
                        .inc_by(adopted.len() as u64);
                    grace_deadline = Instant::now() + settings.grace_period;
                    for reference in &adopted {
                        self.resume_chart(reference).await;
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "gentle adoption pass failed");
                }
            }

            match repository::charts::count_paused(self.db.as_ref()).await {
                Ok(0) => break,
                Ok(paused) => {
                    if Instant::now() >= grace_deadline {
                        tracing::info!(paused, "grace period expired, adopting forcibly");
                        match repository::charts::forcibly_adopt(self.db.as_ref(), &self.instance_id)
                            .await
                        {
                            Ok(adopted) => {
                                metrics::CHARTS_ADOPTED
                                    .with_label_values(&["forcible"])
                                    .inc_by(adopted.len() as u64);
                                for reference in &adopted {
                                    self.resume_chart(reference).await;
                                }
                                break;
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "forcible adoption failed");
                                sleep(settings.adoption_frequency).await;
                            }
                        }
                    } else {
                        sleep(settings.adoption_frequency).await;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to count paused charts");
                    sleep(settings.adoption_frequency).await;
                }
            }
        }

        if !self.is_dying() {
            self.set_status(EngineStatus::Ready);
            tracing::info!(instance = %self.instance_id, "engine ready");
        }
    }

    /// Loads an adopted chart and re-runs its current step so entry actions
    /// execute and activities restart. Failures are logged, never fatal: a
    /// chart of an unregistered machine simply stays inert under our
    /// ownership.
    async fn resume_chart(&self, reference: &ChartReference) {
        match self.chart_executor(reference).await {
            Ok(Some(executor)) => {
                if let Err(err) = executor.run_step(true).await {
                    tracing::warn!(chart = %reference, error = %err, "failed to resume chart");
                }
            }
            Ok(None) => {
                tracing::warn!(chart = %reference, "adopted chart vanished before resume");
            }
            Err(err) => {
                tracing::warn!(chart = %reference, error = %err, "failed to load adopted chart");
            }
        }
    }

    /// Polls the own instance row; a newer instance flags us dying through
    /// the overthrow transaction. Best effort within the polling interval.
    async fn death_note_loop(self: Arc<Self>) {
        loop {
            sleep(self.settings.startup.death_note_polling_frequency).await;
            if self.is_dying() {
                return;
            }
            match repository::instances::is_dying(self.db.as_ref(), &self.instance_id).await {
                Ok(true) => {
                    tracing::info!(instance = %self.instance_id, "death note received, draining");
                    // shut down from a detached task: shutdown aborts the
                    // tracked background tasks, this loop included
                    let engine = Arc::clone(&self);
                    tokio::spawn(async move { engine.shutdown_internal().await });
                    return;
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::debug!(error = %err, "death note poll failed");
                }
            }
        }
    }

    /// Drains the instance: background loops stop, the instance row goes
    /// away, deferred-event locks return to the pool, activities stop, and —
    /// when another live instance exists to take over — our charts are
    /// handed off before `Halted` is reached.
    pub(crate) async fn shutdown_internal(&self) {
        let became_dying = self.status_tx.send_if_modified(|status| {
            if matches!(status, EngineStatus::Dying | EngineStatus::Halted) {
                false
            } else {
                *status = EngineStatus::Dying;
                true
            }
        });
        if !became_dying {
            // another caller is already draining; wait for it
            let mut status = self.status_tx.subscribe();
            let _ = status
                .wait_for(|status| *status == EngineStatus::Halted)
                .await;
            return;
        }

        tracing::info!(instance = %self.instance_id, "shutting down");

        for task in self.drain_tasks() {
            task.abort();
        }

        if let Err(err) =
            repository::instances::delete(self.db.as_ref(), &self.instance_id).await
        {
            tracing::warn!(error = %err, "failed to delete instance row");
        }
        self.deferred.release_all().await;
        self.activities.stop_all().await;

        match repository::instances::count_alive(self.db.as_ref()).await {
            Ok(alive) if alive > 0 => {
                // another instance will adopt our charts; drain until then
                loop {
                    match repository::charts::count_owned(self.db.as_ref(), &self.instance_id)
                        .await
                    {
                        Ok(0) => break,
                        Ok(owned) => {
                            tracing::debug!(owned, "waiting for charts to be adopted");
                            sleep(self.settings.shutdown.own_chart_polling_frequency).await;
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "failed to count own charts");
                            sleep(self.settings.shutdown.own_chart_polling_frequency).await;
                        }
                    }
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "failed to count alive instances");
            }
        }

        self.set_status(EngineStatus::Halted);
        tracing::info!(instance = %self.instance_id, "halted");
    }
}
