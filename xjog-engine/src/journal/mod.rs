//! Append-only delta log with a latest-snapshot table. Deltas go backwards:
//! applying an entry's patch to the entry's own (new) state reproduces the
//! previous state, so history is reconstructed from the current snapshot
//! without duplicating full state in every entry.

mod stream;

use crate::{
    error::{EngineError, Result},
    repository::external_ids,
    settings::JournalSettings,
    types::{ChartFilter, ChartReference, Event},
};
use chrono::{DateTime, Utc};
use json_patch::Patch;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Statement, TransactionTrait,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use xjog_entity::{full_journal_states, journal_entries};

/// Payload of the `new-journal-entry` notification channel.
#[derive(Clone, Debug)]
pub struct JournalNotification {
    pub id: i64,
    pub reference: ChartReference,
}

/// One immutable delta record.
#[derive(Clone, Debug)]
pub struct JournalEntryRecord {
    pub id: i64,
    pub reference: ChartReference,
    pub timestamp: DateTime<Utc>,
    pub event: Option<Event>,
    pub state: Option<Value>,
    pub context: Option<Value>,
    pub state_delta: Patch,
    pub context_delta: Patch,
}

impl TryFrom<journal_entries::Model> for JournalEntryRecord {
    type Error = EngineError;

    fn try_from(model: journal_entries::Model) -> Result<Self> {
        Ok(Self {
            id: model.id,
            reference: ChartReference::new(model.machine_id, model.chart_id),
            timestamp: model.timestamp,
            event: model
                .event
                .as_deref()
                .map(serde_json::from_slice)
                .transpose()?,
            state: model
                .state
                .as_deref()
                .map(serde_json::from_slice)
                .transpose()?,
            context: model
                .context
                .as_deref()
                .map(serde_json::from_slice)
                .transpose()?,
            state_delta: serde_json::from_slice(&model.state_delta)?,
            context_delta: serde_json::from_slice(&model.context_delta)?,
        })
    }
}

/// The latest snapshot of one chart.
#[derive(Clone, Debug)]
pub struct FullStateRecord {
    pub id: i64,
    pub reference: ChartReference,
    pub parent: Option<ChartReference>,
    pub owner_id: String,
    pub created: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
    pub event: Option<Event>,
    pub value: Value,
    pub context: Value,
}

impl TryFrom<full_journal_states::Model> for FullStateRecord {
    type Error = EngineError;

    fn try_from(model: full_journal_states::Model) -> Result<Self> {
        let parent = match (model.parent_machine_id, model.parent_chart_id) {
            (Some(machine_id), Some(chart_id)) => Some(ChartReference::new(machine_id, chart_id)),
            _ => None,
        };
        Ok(Self {
            id: model.id,
            reference: ChartReference::new(model.machine_id, model.chart_id),
            parent,
            owner_id: model.owner_id,
            created: model.created,
            timestamp: model.timestamp,
            event: model
                .event
                .as_deref()
                .map(serde_json::from_slice)
                .transpose()?,
            value: model
                .state
                .as_deref()
                .map(serde_json::from_slice)
                .transpose()?
                .unwrap_or(Value::Null),
            context: model
                .context
                .as_deref()
                .map(serde_json::from_slice)
                .transpose()?
                .unwrap_or(Value::Null),
        })
    }
}

/// A chart's state as it was at the moment of one journal entry.
#[derive(Clone, Debug)]
pub struct MergedJournalRecord {
    pub id: i64,
    pub reference: ChartReference,
    pub timestamp: DateTime<Utc>,
    pub value: Value,
    pub context: Value,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QueryOrdering {
    #[default]
    Ascending,
    Descending,
}

/// Composable bounds for journal queries. `parent` applies to full-state
/// queries only; journal entries do not carry parentage.
#[derive(Clone, Debug, Default)]
pub struct JournalQuery {
    pub reference: Option<ChartReference>,
    pub parent: Option<ChartReference>,
    pub machine_id: Option<String>,
    pub after: Option<i64>,
    pub after_and_including: Option<i64>,
    pub before: Option<i64>,
    pub before_and_including: Option<i64>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub order: QueryOrdering,
}

impl JournalQuery {
    pub fn for_chart(reference: ChartReference) -> Self {
        Self {
            reference: Some(reference),
            ..Default::default()
        }
    }
}

#[derive(Clone)]
pub struct JournalStore {
    db: Arc<DatabaseConnection>,
    settings: JournalSettings,
    journal_tx: broadcast::Sender<JournalNotification>,
    digest_tx: broadcast::Sender<ChartReference>,
}

impl JournalStore {
    pub fn new(db: Arc<DatabaseConnection>, settings: JournalSettings) -> Self {
        let (journal_tx, _) = broadcast::channel(1024);
        let (digest_tx, _) = broadcast::channel(1024);
        Self {
            db,
            settings,
            journal_tx,
            digest_tx,
        }
    }

    /// Records one transition. In one transaction the entry row is inserted
    /// and the full-state row upserted, guarded so a concurrent writer with a
    /// higher id can never be overwritten by this one. The notification is
    /// sent only after commit.
    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
        owner_id: &str,
        reference: &ChartReference,
        parent: Option<&ChartReference>,
        event: Option<&Event>,
        old_value: &Value,
        old_context: &Value,
        new_value: &Value,
        new_context: &Value,
        initial: bool,
    ) -> Result<i64> {
        let state_delta = json_patch::diff(new_value, old_value);
        let context_delta = json_patch::diff(new_context, old_context);

        let event_bytes = event.map(serde_json::to_vec).transpose()?;
        let new_value_bytes = serde_json::to_vec(new_value)?;
        let new_context_bytes = serde_json::to_vec(new_context)?;

        let txn = self.db.begin().await?;

        let entry = journal_entries::Entity::insert(journal_entries::ActiveModel {
            id: sea_orm::ActiveValue::NotSet,
            timestamp: sea_orm::ActiveValue::Set(Utc::now()),
            machine_id: sea_orm::ActiveValue::Set(reference.machine_id.clone()),
            chart_id: sea_orm::ActiveValue::Set(reference.chart_id.clone()),
            event: sea_orm::ActiveValue::Set(event_bytes.clone()),
            // full snapshot only on the initial entry; later entries are
            // reachable through the deltas
            state: sea_orm::ActiveValue::Set(initial.then(|| new_value_bytes.clone())),
            context: sea_orm::ActiveValue::Set(initial.then(|| new_context_bytes.clone())),
            state_delta: sea_orm::ActiveValue::Set(serde_json::to_vec(&state_delta)?),
            context_delta: sea_orm::ActiveValue::Set(serde_json::to_vec(&context_delta)?),
        })
        .exec_with_returning(&txn)
        .await?;

        txn.execute(Statement::from_sql_and_values(
            txn.get_database_backend(),
            r#"
                INSERT INTO full_journal_states
                    (id, created, timestamp, owner_id, machine_id, chart_id,
                     parent_machine_id, parent_chart_id, event, state, context)
                VALUES ($1, now(), $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (machine_id, chart_id) DO UPDATE SET
                    id = EXCLUDED.id,
                    timestamp = EXCLUDED.timestamp,
                    owner_id = EXCLUDED.owner_id,
                    parent_machine_id = EXCLUDED.parent_machine_id,
                    parent_chart_id = EXCLUDED.parent_chart_id,
                    event = EXCLUDED.event,
                    state = EXCLUDED.state,
                    context = EXCLUDED.context
                WHERE full_journal_states.id < EXCLUDED.id;
            "#,
            [
                entry.id.into(),
                entry.timestamp.into(),
                owner_id.into(),
                reference.machine_id.as_str().into(),
                reference.chart_id.as_str().into(),
                parent.map(|p| p.machine_id.clone()).into(),
                parent.map(|p| p.chart_id.clone()).into(),
                event_bytes.into(),
                new_value_bytes.into(),
                new_context_bytes.into(),
            ],
        ))
        .await?;

        txn.commit().await?;

        let _ = self.journal_tx.send(JournalNotification {
            id: entry.id,
            reference: reference.clone(),
        });

        Ok(entry.id)
    }

    pub async fn read_entry(&self, id: i64) -> Result<Option<JournalEntryRecord>> {
        journal_entries::Entity::find_by_id(id)
            .one(self.db.as_ref())
            .await?
            .map(JournalEntryRecord::try_from)
            .transpose()
    }

    pub async fn query_entries(&self, query: &JournalQuery) -> Result<Vec<JournalEntryRecord>> {
        let mut select = journal_entries::Entity::find();
        if let Some(reference) = &query.reference {
            select = select
                .filter(journal_entries::Column::MachineId.eq(&reference.machine_id))
                .filter(journal_entries::Column::ChartId.eq(&reference.chart_id));
        }
        if let Some(machine_id) = &query.machine_id {
            select = select.filter(journal_entries::Column::MachineId.eq(machine_id));
        }
        if let Some(after) = query.after {
            select = select.filter(journal_entries::Column::Id.gt(after));
        }
        if let Some(after) = query.after_and_including {
            select = select.filter(journal_entries::Column::Id.gte(after));
        }
        if let Some(before) = query.before {
            select = select.filter(journal_entries::Column::Id.lt(before));
        }
        if let Some(before) = query.before_and_including {
            select = select.filter(journal_entries::Column::Id.lte(before));
        }
        if let Some(instant) = query.created_after {
            select = select.filter(journal_entries::Column::Timestamp.gt(instant));
        }
        if let Some(instant) = query.created_before {
            select = select.filter(journal_entries::Column::Timestamp.lt(instant));
        }
        select = match query.order {
            QueryOrdering::Ascending => select.order_by_asc(journal_entries::Column::Id),
            QueryOrdering::Descending => select.order_by_desc(journal_entries::Column::Id),
        };
        if let Some(limit) = query.limit {
            select = select.limit(limit);
        }
        if let Some(offset) = query.offset {
            select = select.offset(offset);
        }
        select
            .all(self.db.as_ref())
            .await?
            .into_iter()
            .map(JournalEntryRecord::try_from)
            .collect()
    }

    pub async fn read_full_state(
        &self,
        reference: &ChartReference,
    ) -> Result<Option<FullStateRecord>> {
        full_journal_states::Entity::find_by_id((
            reference.machine_id.clone(),
            reference.chart_id.clone(),
        ))
        .one(self.db.as_ref())
        .await?
        .map(FullStateRecord::try_from)
        .transpose()
    }

    pub async fn query_full_states(&self, query: &JournalQuery) -> Result<Vec<FullStateRecord>> {
        let mut select = full_journal_states::Entity::find();
        if let Some(reference) = &query.reference {
            select = select
                .filter(full_journal_states::Column::MachineId.eq(&reference.machine_id))
                .filter(full_journal_states::Column::ChartId.eq(&reference.chart_id));
        }
        if let Some(parent) = &query.parent {
            select = select
                .filter(full_journal_states::Column::ParentMachineId.eq(&parent.machine_id))
                .filter(full_journal_states::Column::ParentChartId.eq(&parent.chart_id));
        }
        if let Some(machine_id) = &query.machine_id {
            select = select.filter(full_journal_states::Column::MachineId.eq(machine_id));
        }
        if let Some(after) = query.after {
            select = select.filter(full_journal_states::Column::Id.gt(after));
        }
        if let Some(after) = query.after_and_including {
            select = select.filter(full_journal_states::Column::Id.gte(after));
        }
        if let Some(before) = query.before {
            select = select.filter(full_journal_states::Column::Id.lt(before));
        }
        if let Some(before) = query.before_and_including {
            select = select.filter(full_journal_states::Column::Id.lte(before));
        }
        if let Some(instant) = query.created_after {
            select = select.filter(full_journal_states::Column::Timestamp.gt(instant));
        }
        if let Some(instant) = query.created_before {
            select = select.filter(full_journal_states::Column::Timestamp.lt(instant));
        }
        select = match query.order {
            QueryOrdering::Ascending => select.order_by_asc(full_journal_states::Column::Id),
            QueryOrdering::Descending => select.order_by_desc(full_journal_states::Column::Id),
        };
        if let Some(limit) = query.limit {
            select = select.limit(limit);
        }
        if let Some(offset) = query.offset {
            select = select.offset(offset);
        }
        select
            .all(self.db.as_ref())
            .await?
            .into_iter()
            .map(FullStateRecord::try_from)
            .collect()
    }

    /// Full-state records matching a chart filter tree, with external ids
    /// loaded for the filter's benefit.
    pub async fn query_charts(&self, filter: &ChartFilter) -> Result<Vec<FullStateRecord>> {
        let mut matching = Vec::new();
        for record in self.query_full_states(&JournalQuery::default()).await? {
            let view = crate::types::filters::ChartView {
                machine_id: record.reference.machine_id.clone(),
                chart_id: record.reference.chart_id.clone(),
                state_value: record.value.clone(),
                external_ids: external_ids::for_chart(self.db.as_ref(), &record.reference).await?,
            };
            if filter.matches(&view) {
                matching.push(record);
            }
        }
        Ok(matching)
    }

    /// Time travel: the chart's state as it was at the moment of entry `id`,
    /// reconstructed by walking the backward deltas down from the current
    /// snapshot.
    pub async fn read_merged_entry(&self, id: i64) -> Result<MergedJournalRecord> {
        let entry = self
            .read_entry(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("journal entry {id}")))?;
        let full = self
            .read_full_state(&entry.reference)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("full state for {}", entry.reference)))?;

        let mut value = full.value;
        let mut context = full.context;
        let later = self
            .query_entries(&JournalQuery {
                reference: Some(entry.reference.clone()),
                after: Some(id),
                order: QueryOrdering::Descending,
                ..Default::default()
            })
            .await?;
        for later_entry in later {
            json_patch::patch(&mut value, &later_entry.state_delta)?;
            json_patch::patch(&mut context, &later_entry.context_delta)?;
        }

        Ok(MergedJournalRecord {
            id: entry.id,
            reference: entry.reference,
            timestamp: entry.timestamp,
            value,
            context,
        })
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<JournalNotification> {
        self.journal_tx.subscribe()
    }

    pub fn subscribe_digest_notifications(&self) -> broadcast::Receiver<ChartReference> {
        self.digest_tx.subscribe()
    }

    pub(crate) fn notify_digest(&self, reference: &ChartReference) {
        let _ = self.digest_tx.send(reference.clone());
    }

    pub(crate) fn db(&self) -> &Arc<DatabaseConnection> {
        &self.db
    }

    pub(crate) fn polling_frequency(&self) -> std::time::Duration {
        self.settings.polling_frequency
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    // Applying the stored delta to the entry's own state must reproduce the
    // previous state; this is what makes reverse traversal possible.
    #[test]
    fn delta_direction_is_backward() {
        let old = json!({"at": "park", "visits": {"park": 1}});
        let new = json!({"at": "diner", "visits": {"park": 1, "diner": 1}});

        let delta = json_patch::diff(&new, &old);
        let mut reconstructed = new.clone();
        json_patch::patch(&mut reconstructed, &delta).unwrap();
        assert_eq!(reconstructed, old);
    }

    #[test]
    fn delta_chain_reaches_the_initial_state() {
        let states = [
            json!("at home"),
            json!("at the park"),
            json!("at the diner"),
            json!("at home"),
        ];
        let deltas: Vec<_> = states
            .windows(2)
            .map(|pair| json_patch::diff(&pair[1], &pair[0]))
            .collect();

        let mut current = states.last().unwrap().clone();
        for delta in deltas.iter().rev() {
            json_patch::patch(&mut current, delta).unwrap();
        }
        assert_eq!(current, states[0]);
    }
}
