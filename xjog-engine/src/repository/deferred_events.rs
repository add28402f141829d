use crate::{
    error::Result,
    types::{ChartReference, Event, EventTarget},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sea_orm::{
    sea_query::Expr, ActiveValue::Set, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter,
    Statement,
};
use std::time::Duration;
use xjog_entity::deferred_events;

/// Persists one deferred event; `due` is computed here, once, and never
/// changes afterwards.
pub async fn insert<C: ConnectionTrait>(
    db: &C,
    reference: &ChartReference,
    event_id: &str,
    event_to: Option<&EventTarget>,
    event: &Event,
    delay: Duration,
) -> Result<deferred_events::Model> {
    let now = Utc::now();
    let delay_ms = delay.as_millis() as i64;
    let due = now + ChronoDuration::milliseconds(delay_ms);
    let model = deferred_events::Entity::insert(deferred_events::ActiveModel {
        id: sea_orm::ActiveValue::NotSet,
        machine_id: Set(reference.machine_id.clone()),
        chart_id: Set(reference.chart_id.clone()),
        event_id: Set(event_id.to_string()),
        event_to: Set(event_to.map(EventTarget::to_wire)),
        event: Set(serde_json::to_string(event)?),
        timestamp: Set(now),
        delay: Set(delay_ms),
        due: Set(due),
        lock: Set(None),
    })
    .exec_with_returning(db)
    .await?;
    Ok(model)
}

/// Atomically reserves up to `batch_size` unlocked rows due within the
/// lookahead window, marking them with this instance's lock in the same
/// statement. Returned rows are ordered by `(due, id)`.
pub async fn reserve_batch<C: ConnectionTrait>(
    db: &C,
    self_id: &str,
    look_ahead: Duration,
    batch_size: u64,
) -> Result<Vec<deferred_events::Model>> {
    let cutoff = Utc::now() + ChronoDuration::milliseconds(look_ahead.as_millis() as i64);
    let mut reserved = deferred_events::Entity::find()
        .from_raw_sql(Statement::from_sql_and_values(
            db.get_database_backend(),
            r#"
                UPDATE deferred_events SET lock = $1
                WHERE id IN (
                    SELECT id FROM deferred_events
                    WHERE due < $2 AND lock IS NULL
                    ORDER BY due ASC, id ASC
                    LIMIT $3
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING *;
            "#,
            [self_id.into(), cutoff.into(), (batch_size as i64).into()],
        ))
        .all(db)
        .await?;
    reserved.sort_by_key(|row| (row.due, row.id));
    Ok(reserved)
}

/// Returns the row to the pool so another instance may claim it. Idempotent.
pub async fn release<C: ConnectionTrait>(db: &C, id: i64) -> Result<()> {
    deferred_events::Entity::update_many()
        .col_expr(deferred_events::Column::Lock, Expr::value(None::<String>))
        .filter(deferred_events::Column::Id.eq(id))
        .exec(db)
        .await?;
    Ok(())
}

pub async fn release_all<C: ConnectionTrait>(db: &C, self_id: &str) -> Result<()> {
    deferred_events::Entity::update_many()
        .col_expr(deferred_events::Column::Lock, Expr::value(None::<String>))
        .filter(deferred_events::Column::Lock.eq(self_id))
        .exec(db)
        .await?;
    Ok(())
}

/// Idempotent: deleting a fired or already-deleted row affects nothing.
pub async fn delete<C: ConnectionTrait>(db: &C, id: i64) -> Result<bool> {
    let result = deferred_events::Entity::delete_by_id(id).exec(db).await?;
    Ok(result.rows_affected > 0)
}

/// Deletes every row of the chart carrying the given send id; returns the
/// deleted row ids so in-memory timers can be disarmed.
pub async fn delete_by_event_id<C: ConnectionTrait>(
    db: &C,
    reference: &ChartReference,
    event_id: &str,
) -> Result<Vec<i64>> {
    let rows = db
        .query_all(Statement::from_sql_and_values(
            db.get_database_backend(),
            r#"
                DELETE FROM deferred_events
                WHERE machine_id = $1 AND chart_id = $2 AND event_id = $3
                RETURNING id;
            "#,
            [
                reference.machine_id.as_str().into(),
                reference.chart_id.as_str().into(),
                event_id.into(),
            ],
        ))
        .await?;
    rows.iter()
        .map(|row| Ok(row.try_get::<i64>("", "id")?))
        .collect()
}

pub async fn delete_all_for_chart<C: ConnectionTrait>(
    db: &C,
    reference: &ChartReference,
) -> Result<u64> {
    let result = deferred_events::Entity::delete_many()
        .filter(deferred_events::Column::MachineId.eq(&reference.machine_id))
        .filter(deferred_events::Column::ChartId.eq(&reference.chart_id))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

pub async fn count_for_chart<C: ConnectionTrait>(
    db: &C,
    reference: &ChartReference,
) -> Result<u64> {
    use sea_orm::PaginatorTrait;
    Ok(deferred_events::Entity::find()
        .filter(deferred_events::Column::MachineId.eq(&reference.machine_id))
        .filter(deferred_events::Column::ChartId.eq(&reference.chart_id))
        .count(db)
        .await?)
}

/// Decodes the payload column back into an [`Event`].
pub fn decode_event(model: &deferred_events::Model) -> Result<Event> {
    Ok(serde_json::from_str(&model.event)?)
}

pub fn reference_of(model: &deferred_events::Model) -> ChartReference {
    ChartReference::new(model.machine_id.clone(), model.chart_id.clone())
}

pub fn due_instant(due: DateTime<Utc>) -> tokio::time::Instant {
    let now = Utc::now();
    let delay = (due - now).to_std().unwrap_or(Duration::ZERO);
    tokio::time::Instant::now() + delay
}
