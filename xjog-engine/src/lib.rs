//! A durable statechart execution engine.
//!
//! Charts — long-lived, hierarchical state machines — are persisted
//! transactionally in PostgreSQL so work survives crashes and migrates
//! between processes. Deferred transitions fire on schedule from a
//! persistent timer queue, side-effecting activities are tracked for restart
//! after handover, and every transition lands in an append-only delta
//! journal with a latest-snapshot table and subscription streams.
//!
//! Multiple engine instances may share one database: a starting instance
//! overthrows the others, which drain gracefully while the newcomer adopts
//! their charts — gently while they are idle, forcibly once the grace
//! period expires.
//!
//! The statechart evaluator itself is an external collaborator, consumed
//! through the [`types::MachineDefinition`] trait as a pure transition
//! function.

pub mod engine;
pub mod error;
pub mod journal;
pub mod metrics;
pub mod repository;
pub mod settings;
pub mod types;

mod activity;
mod deferred;
mod executor;
mod registry;
mod startup;

pub use engine::{Engine, EngineStatus, HookGuard, UpdateHook};
pub use error::{EngineError, Result};
pub use executor::ChartExecutor;
pub use journal::{
    FullStateRecord, JournalEntryRecord, JournalNotification, JournalQuery, JournalStore,
    MergedJournalRecord, QueryOrdering,
};
pub use settings::EngineSettings;
pub use types::{
    Action, ActivityHandle, ActivitySpawn, ChangeKind, ChartFilter, ChartReference, DigestFilter,
    DigestSpec, Event, EventTarget, MachineDefinition, MachineOptions, MachineState, StateChange,
    TransitionError,
};
