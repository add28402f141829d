//! Transactional storage operations, one module per table. Functions are
//! free async fns over sea-orm connections so they compose into caller
//! transactions where needed.

pub mod activities;
pub mod charts;
pub mod deferred_events;
pub mod digests;
pub mod external_ids;
pub mod instances;
