use crate::{
    error::{map_insert_error, EngineError, Result},
    types::{ChartReference, MachineState},
};
use chrono::Utc;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryResult, Statement, TransactionTrait,
};
use xjog_entity::{charts, deferred_events, digests, external_ids};

/// One persisted chart with its decoded state snapshot.
#[derive(Clone, Debug)]
pub struct ChartRecord {
    pub reference: ChartReference,
    pub parent: Option<ChartReference>,
    pub owner_id: String,
    pub paused: bool,
    pub state: MachineState,
}

impl TryFrom<charts::Model> for ChartRecord {
    type Error = EngineError;

    fn try_from(model: charts::Model) -> Result<Self> {
        let parent = match (model.parent_machine_id, model.parent_chart_id) {
            (Some(machine_id), Some(chart_id)) => Some(ChartReference::new(machine_id, chart_id)),
            _ => None,
        };
        Ok(Self {
            reference: ChartReference::new(model.machine_id, model.chart_id),
            parent,
            owner_id: model.owner_id,
            paused: model.paused,
            state: MachineState::from_bytes(&model.state)?,
        })
    }
}

pub async fn insert<C: ConnectionTrait>(
    db: &C,
    owner_id: &str,
    reference: &ChartReference,
    parent: Option<&ChartReference>,
    state: &MachineState,
) -> Result<()> {
    charts::Entity::insert(charts::ActiveModel {
        timestamp: Set(Utc::now()),
        owner_id: Set(owner_id.to_string()),
        machine_id: Set(reference.machine_id.clone()),
        chart_id: Set(reference.chart_id.clone()),
        parent_machine_id: Set(parent.map(|p| p.machine_id.clone())),
        parent_chart_id: Set(parent.map(|p| p.chart_id.clone())),
        state: Set(state.to_bytes()?),
        paused: Set(false),
    })
    .exec(db)
    .await
    .map_err(|err| map_insert_error(err, format!("chart reference in use: {reference}")))?;
    Ok(())
}

pub async fn read<C: ConnectionTrait>(
    db: &C,
    reference: &ChartReference,
) -> Result<Option<ChartRecord>> {
    charts::Entity::find_by_id((reference.machine_id.clone(), reference.chart_id.clone()))
        .one(db)
        .await?
        .map(ChartRecord::try_from)
        .transpose()
}

/// Persists a new state snapshot. The owner filter enforces the single-writer
/// invariant: an instance that lost the chart updates zero rows.
pub async fn update_state<C: ConnectionTrait>(
    db: &C,
    owner_id: &str,
    reference: &ChartReference,
    state: &MachineState,
) -> Result<()> {
    let updated = charts::Entity::update_many()
        .col_expr(
            charts::Column::State,
            sea_orm::sea_query::Expr::value(state.to_bytes()?),
        )
        .filter(charts::Column::MachineId.eq(&reference.machine_id))
        .filter(charts::Column::ChartId.eq(&reference.chart_id))
        .filter(charts::Column::OwnerId.eq(owner_id))
        .exec(db)
        .await?;
    if updated.rows_affected == 0 {
        return Err(EngineError::ChartNotFound(reference.clone()));
    }
    Ok(())
}

/// Deletes the chart row together with its deferred events, external ids and
/// digests in one transaction.
pub async fn delete(db: &DatabaseConnection, reference: &ChartReference) -> Result<()> {
    let txn = db.begin().await?;

    deferred_events::Entity::delete_many()
        .filter(deferred_events::Column::MachineId.eq(&reference.machine_id))
        .filter(deferred_events::Column::ChartId.eq(&reference.chart_id))
        .exec(&txn)
        .await?;
    external_ids::Entity::delete_many()
        .filter(external_ids::Column::MachineId.eq(&reference.machine_id))
        .filter(external_ids::Column::ChartId.eq(&reference.chart_id))
        .exec(&txn)
        .await?;
    digests::Entity::delete_many()
        .filter(digests::Column::MachineId.eq(&reference.machine_id))
        .filter(digests::Column::ChartId.eq(&reference.chart_id))
        .exec(&txn)
        .await?;
    charts::Entity::delete_by_id((reference.machine_id.clone(), reference.chart_id.clone()))
        .exec(&txn)
        .await?;

    txn.commit().await?;
    Ok(())
}

fn reference_from_row(row: &QueryResult) -> Result<ChartReference> {
    Ok(ChartReference::new(
        row.try_get::<String>("", "machine_id")?,
        row.try_get::<String>("", "chart_id")?,
    ))
}

/// Adopts every paused chart that has no ongoing-activity marker. Idempotent:
/// the idleness criterion is re-checked on each call.
pub async fn gently_adopt<C: ConnectionTrait>(db: &C, self_id: &str) -> Result<Vec<ChartReference>> {
    let rows = db
        .query_all(Statement::from_sql_and_values(
            db.get_database_backend(),
            r#"
                UPDATE charts SET owner_id = $1, paused = false
                WHERE paused = true AND NOT EXISTS (
                    SELECT 1 FROM ongoing_activities oa
                    WHERE oa.machine_id = charts.machine_id
                      AND oa.chart_id = charts.chart_id
                )
                RETURNING machine_id, chart_id;
            "#,
            [self_id.into()],
        ))
        .await?;
    rows.iter().map(reference_from_row).collect()
}

/// Wipes the activity markers of still-paused charts and takes them all, in
/// one transaction. The grace-period expiry path.
pub async fn forcibly_adopt(
    db: &DatabaseConnection,
    self_id: &str,
) -> Result<Vec<ChartReference>> {
    let txn = db.begin().await?;

    txn.execute(Statement::from_string(
        txn.get_database_backend(),
        r#"
            DELETE FROM ongoing_activities oa USING charts c
            WHERE oa.machine_id = c.machine_id
              AND oa.chart_id = c.chart_id
              AND c.paused = true;
        "#
        .to_string(),
    ))
    .await?;

    let rows = txn
        .query_all(Statement::from_sql_and_values(
            txn.get_database_backend(),
            r#"
                UPDATE charts SET owner_id = $1, paused = false
                WHERE paused = true
                RETURNING machine_id, chart_id;
            "#,
            [self_id.into()],
        ))
        .await?;
    let adopted = rows
        .iter()
        .map(reference_from_row)
        .collect::<Result<Vec<_>>>()?;

    txn.commit().await?;
    Ok(adopted)
}

pub async fn count_paused<C: ConnectionTrait>(db: &C) -> Result<u64> {
    Ok(charts::Entity::find()
        .filter(charts::Column::Paused.eq(true))
        .count(db)
        .await?)
}

pub async fn count_owned<C: ConnectionTrait>(db: &C, self_id: &str) -> Result<u64> {
    Ok(charts::Entity::find()
        .filter(charts::Column::OwnerId.eq(self_id))
        .count(db)
        .await?)
}
