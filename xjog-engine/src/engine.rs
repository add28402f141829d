//! Composition root: owns the store handles, the managers, the machine
//! registry, the update-hook chain and the state-change broadcast.

use crate::{
    activity::ActivityManager,
    deferred::DeferredEventManager,
    error::{EngineError, Result},
    executor::ChartExecutor,
    journal::{FullStateRecord, JournalStore},
    registry::MachineHandle,
    repository,
    settings::EngineSettings,
    types::{
        ChangeKind, ChartFilter, ChartReference, DigestFilter, Event, MachineDefinition,
        MachineOptions, MachineState, StateChange,
    },
};
use futures::future::BoxFuture;
use sea_orm::DatabaseConnection;
use serde_json::Value;
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as StdMutex, RwLock, Weak,
    },
};
use tokio::sync::{broadcast, watch, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineStatus {
    Initial,
    Starting,
    Adopting,
    Ready,
    Dying,
    Halted,
}

/// An installed observer of every state change, awaited in installation
/// order before the change is persisted and broadcast. A hook error fails
/// the whole send.
pub type UpdateHook =
    Arc<dyn Fn(Arc<StateChange>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Handle returned by [`Engine::install_update_hook`]; uninstalls the hook.
pub struct HookGuard {
    id: u64,
    engine: Weak<EngineInner>,
}

impl HookGuard {
    pub async fn uninstall(self) {
        if let Some(engine) = self.engine.upgrade() {
            engine.hooks.lock().await.retain(|(id, _)| *id != self.id);
        }
    }
}

pub(crate) struct EngineInner {
    /// Back-reference handed to executors, timers and activity tasks.
    pub(crate) weak: Weak<EngineInner>,
    pub(crate) db: Arc<DatabaseConnection>,
    pub(crate) settings: EngineSettings,
    pub(crate) instance_id: String,
    pub(crate) status_tx: watch::Sender<EngineStatus>,
    pub(crate) machines: RwLock<HashMap<String, Arc<MachineHandle>>>,
    registration_closed: AtomicBool,
    pub(crate) journal: JournalStore,
    pub(crate) deferred: DeferredEventManager,
    pub(crate) activities: ActivityManager,
    pub(crate) hooks: Mutex<Vec<(u64, UpdateHook)>>,
    next_hook_id: AtomicU64,
    changes_tx: broadcast::Sender<StateChange>,
    tasks: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl EngineInner {
    pub(crate) fn status(&self) -> EngineStatus {
        *self.status_tx.borrow()
    }

    pub(crate) fn is_dying(&self) -> bool {
        matches!(self.status(), EngineStatus::Dying | EngineStatus::Halted)
    }

    pub(crate) fn set_status(&self, status: EngineStatus) {
        self.status_tx.send_replace(status);
    }

    pub(crate) fn spawn_task(&self, task: impl Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(task);
        self.tasks
            .lock()
            .expect("background task list poisoned")
            .push(handle);
    }

    pub(crate) fn drain_tasks(&self) -> Vec<tokio::task::JoinHandle<()>> {
        std::mem::take(
            &mut *self
                .tasks
                .lock()
                .expect("background task list poisoned"),
        )
    }

    /// Detached shutdown entry point for fatal conditions observed inside
    /// background tasks and mutex timeouts.
    pub(crate) fn spawn_shutdown(&self) {
        let Some(engine) = self.weak.upgrade() else {
            return;
        };
        tokio::spawn(async move { engine.shutdown_internal().await });
    }

    pub(crate) fn changes(&self) -> broadcast::Receiver<StateChange> {
        self.changes_tx.subscribe()
    }

    pub(crate) fn publish(&self, change: &Arc<StateChange>) {
        let _ = self.changes_tx.send((**change).clone());
    }

    /// Creates a chart: initial state through the hooks, the chart row, the
    /// cache entry, then the initial actions.
    pub(crate) async fn create_chart(
        &self,
        machine_id: &str,
        chart_id: Option<String>,
        parent: Option<ChartReference>,
    ) -> Result<Arc<ChartExecutor>> {
        let machine = self.machine(machine_id)?;
        let chart_id =
            chart_id.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let reference = ChartReference::new(machine_id, chart_id);

        let initial = machine.def.initial_state()?;
        let executor = Arc::new(ChartExecutor::new(
            self.weak.clone(),
            machine.clone(),
            reference.clone(),
            parent.clone(),
            initial.clone(),
        ));

        let change = Arc::new(StateChange {
            kind: ChangeKind::Create,
            reference: reference.clone(),
            parent: parent.clone(),
            event: None,
            old: None,
            new: Some(initial.clone()),
        });
        self.run_update_hooks(&change)
            .await
            .map_err(EngineError::HookFailure)?;

        repository::charts::insert(
            self.db.as_ref(),
            &self.instance_id,
            &reference,
            parent.as_ref(),
            &initial,
        )
        .await?;
        self.cache_chart(&machine, executor.clone()).await;

        executor.run_step(false).await?;
        self.publish(&change);
        Ok(executor)
    }

    pub(crate) async fn send_event(
        &self,
        reference: &ChartReference,
        event: Event,
    ) -> Result<Option<MachineState>> {
        match self.chart_executor(reference).await? {
            Some(executor) => executor.send(event).await,
            None => Err(EngineError::ChartNotFound(reference.clone())),
        }
    }

    /// The update chain: journal writer, digest writer, then user hooks, in
    /// order, each awaited. The first error aborts the chain.
    pub(crate) async fn run_update_hooks(
        &self,
        change: &Arc<StateChange>,
    ) -> anyhow::Result<()> {
        self.write_journal(change).await?;
        self.write_digests(change).await?;
        let hooks: Vec<UpdateHook> = self
            .hooks
            .lock()
            .await
            .iter()
            .map(|(_, hook)| hook.clone())
            .collect();
        for hook in hooks {
            hook(change.clone()).await?;
        }
        Ok(())
    }

    async fn write_journal(&self, change: &Arc<StateChange>) -> Result<()> {
        let new = match (&change.kind, &change.new) {
            (ChangeKind::Create, Some(new)) | (ChangeKind::Update, Some(new)) => new,
            // deletions leave the journal intact; the last snapshot stands
            _ => return Ok(()),
        };
        let (old_value, old_context) = change
            .old
            .as_ref()
            .map(|old| (old.value.clone(), old.context.clone()))
            .unwrap_or((Value::Null, Value::Null));
        self.journal
            .record(
                &self.instance_id,
                &change.reference,
                change.parent.as_ref(),
                change.event.as_ref(),
                &old_value,
                &old_context,
                &new.value,
                &new.context,
                change.kind == ChangeKind::Create,
            )
            .await?;
        Ok(())
    }

    async fn write_digests(&self, change: &Arc<StateChange>) -> Result<()> {
        let new = match (&change.kind, &change.new) {
            (ChangeKind::Create, Some(new)) | (ChangeKind::Update, Some(new)) => new,
            _ => return Ok(()),
        };
        let machine = self.machine(&change.reference.machine_id)?;
        if machine.options.digests.is_empty() {
            return Ok(());
        }
        for spec in &machine.options.digests {
            match new.context.pointer(&spec.pointer) {
                Some(Value::Null) | None => {
                    repository::digests::delete_key(self.db.as_ref(), &change.reference, &spec.key)
                        .await?;
                }
                Some(value) => {
                    let rendered = match value.as_str() {
                        Some(text) => text.to_string(),
                        None => value.to_string(),
                    };
                    repository::digests::upsert(
                        self.db.as_ref(),
                        &change.reference,
                        &spec.key,
                        &rendered,
                    )
                    .await?;
                }
            }
        }
        self.journal.notify_digest(&change.reference);
        Ok(())
    }
}

/// A durable statechart execution engine bound to one database. Multiple
/// engines may share the database; the newest one overthrows the others and
/// adopts their charts.
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(db: DatabaseConnection, settings: EngineSettings) -> Self {
        let settings = settings.clamped();
        let db = Arc::new(db);
        let instance_id = uuid::Uuid::new_v4().simple().to_string();
        let (status_tx, _) = watch::channel(EngineStatus::Initial);
        let (changes_tx, _) = broadcast::channel(1024);

        let inner = Arc::new_cyclic(|weak: &Weak<EngineInner>| EngineInner {
            weak: weak.clone(),
            journal: JournalStore::new(db.clone(), settings.journal.clone()),
            deferred: DeferredEventManager::new(
                db.clone(),
                settings.deferred_events.clone(),
                instance_id.clone(),
                weak.clone(),
            ),
            activities: ActivityManager::new(db.clone(), weak.clone()),
            db,
            settings,
            instance_id,
            status_tx,
            machines: RwLock::new(HashMap::new()),
            registration_closed: AtomicBool::new(false),
            hooks: Mutex::new(Vec::new()),
            next_hook_id: AtomicU64::new(0),
            changes_tx,
            tasks: StdMutex::new(Vec::new()),
        });
        Self { inner }
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn status(&self) -> EngineStatus {
        self.inner.status()
    }

    /// Resolves once the engine has adopted everything and is serving.
    pub async fn ready(&self) {
        let mut status = self.inner.status_tx.subscribe();
        let _ = status
            .wait_for(|status| {
                matches!(status, EngineStatus::Ready | EngineStatus::Dying | EngineStatus::Halted)
            })
            .await;
    }

    /// Resolves once the engine has fully drained.
    pub async fn halted(&self) {
        let mut status = self.inner.status_tx.subscribe();
        let _ = status
            .wait_for(|status| *status == EngineStatus::Halted)
            .await;
    }

    /// Number of chart executors currently cached for the machine. Bounded
    /// by the configured cache size.
    pub async fn cached_chart_count(&self, machine_id: &str) -> Result<usize> {
        Ok(self.inner.machine(machine_id)?.cached_count().await)
    }

    /// Registers a machine definition. Legal only before [`Engine::start`].
    pub fn register_machine(
        &self,
        def: Arc<dyn MachineDefinition>,
        options: MachineOptions,
    ) -> Result<()> {
        if self.inner.registration_closed.load(Ordering::SeqCst) {
            return Err(EngineError::RegistrationClosed);
        }
        let machine_id = def.id().to_string();
        let handle = Arc::new(MachineHandle::new(
            def,
            options,
            self.inner.settings.machine.cache_size,
        ));
        let mut machines = self
            .inner
            .machines
            .write()
            .expect("machine registry lock poisoned");
        if machines.contains_key(&machine_id) {
            return Err(EngineError::Conflict(format!(
                "machine {machine_id} already registered"
            )));
        }
        machines.insert(machine_id, handle);
        Ok(())
    }

    /// Starts the engine: overthrow, adoption, deferred scheduling, death
    /// watch. Returns once the loops run; await [`Engine::ready`] for the
    /// adoption to settle.
    pub async fn start(&self) -> Result<()> {
        self.inner.registration_closed.store(true, Ordering::SeqCst);
        self.inner.start_internal().await
    }

    /// Drains and halts the engine. Safe to call more than once; every
    /// caller returns once the engine is halted.
    pub async fn shutdown(&self) {
        self.inner.shutdown_internal().await;
    }

    pub async fn create_chart(
        &self,
        machine_id: &str,
        chart_id: Option<String>,
    ) -> Result<Arc<ChartExecutor>> {
        self.inner.create_chart(machine_id, chart_id, None).await
    }

    pub async fn get_chart(
        &self,
        reference: &ChartReference,
    ) -> Result<Option<Arc<ChartExecutor>>> {
        self.inner.chart_executor(reference).await
    }

    pub async fn send_event(
        &self,
        reference: &ChartReference,
        event: Event,
    ) -> Result<Option<MachineState>> {
        self.inner.send_event(reference, event).await
    }

    /// Sends an event to a running activity of the chart.
    pub async fn send_to(
        &self,
        reference: &ChartReference,
        activity_id: &str,
        event: Event,
    ) -> Result<()> {
        self.inner
            .activities
            .send_to(reference, activity_id, event)
            .await;
        Ok(())
    }

    pub async fn register_external_id(
        &self,
        key: &str,
        value: &str,
        reference: &ChartReference,
    ) -> Result<()> {
        repository::external_ids::register(self.inner.db.as_ref(), key, value, reference).await
    }

    pub async fn drop_external_id(&self, key: &str, value: &str) -> Result<()> {
        repository::external_ids::drop_id(self.inner.db.as_ref(), key, value).await
    }

    pub async fn get_chart_by_external_id(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Option<Arc<ChartExecutor>>> {
        match repository::external_ids::find_chart(self.inner.db.as_ref(), key, value).await? {
            Some(reference) => self.inner.chart_executor(&reference).await,
            None => Ok(None),
        }
    }

    /// Every state change applied by this engine, as a broadcast stream.
    pub fn changes(&self) -> broadcast::Receiver<StateChange> {
        self.inner.changes()
    }

    pub fn journal(&self) -> &JournalStore {
        &self.inner.journal
    }

    pub async fn install_update_hook(&self, hook: UpdateHook) -> HookGuard {
        let id = self.inner.next_hook_id.fetch_add(1, Ordering::SeqCst);
        self.inner.hooks.lock().await.push((id, hook));
        HookGuard {
            id,
            engine: Arc::downgrade(&self.inner),
        }
    }

    pub async fn query_digests(&self, filter: &DigestFilter) -> Result<Vec<ChartReference>> {
        repository::digests::query(self.inner.db.as_ref(), filter).await
    }

    pub async fn query_charts(&self, filter: &ChartFilter) -> Result<Vec<FullStateRecord>> {
        self.inner.journal.query_charts(filter).await
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for task in self.inner.drain_tasks() {
            task.abort();
        }
    }
}
