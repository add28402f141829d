use crate::{
    error::Result,
    types::{filters::DigestView, ChartReference, DigestFilter},
};
use chrono::Utc;
use sea_orm::{
    sea_query::{Expr, OnConflict},
    ActiveValue::Set,
    ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter,
};
use std::collections::HashMap;
use xjog_entity::digests;

pub async fn upsert<C: ConnectionTrait>(
    db: &C,
    reference: &ChartReference,
    key: &str,
    value: &str,
) -> Result<()> {
    let now = Utc::now();
    digests::Entity::insert(digests::ActiveModel {
        created: Set(now),
        timestamp: Set(now),
        machine_id: Set(reference.machine_id.clone()),
        chart_id: Set(reference.chart_id.clone()),
        key: Set(key.to_string()),
        value: Set(value.to_string()),
    })
    .on_conflict(
        OnConflict::columns([
            digests::Column::MachineId,
            digests::Column::ChartId,
            digests::Column::Key,
        ])
        .update_columns([digests::Column::Value])
        .value(digests::Column::Timestamp, Expr::current_timestamp())
        .to_owned(),
    )
    .exec_without_returning(db)
    .await?;
    Ok(())
}

pub async fn delete_key<C: ConnectionTrait>(
    db: &C,
    reference: &ChartReference,
    key: &str,
) -> Result<()> {
    digests::Entity::delete_by_id((
        reference.machine_id.clone(),
        reference.chart_id.clone(),
        key.to_string(),
    ))
    .exec(db)
    .await?;
    Ok(())
}

pub async fn delete_all_for_chart<C: ConnectionTrait>(
    db: &C,
    reference: &ChartReference,
) -> Result<()> {
    digests::Entity::delete_many()
        .filter(digests::Column::MachineId.eq(&reference.machine_id))
        .filter(digests::Column::ChartId.eq(&reference.chart_id))
        .exec(db)
        .await?;
    Ok(())
}

pub async fn for_chart<C: ConnectionTrait>(
    db: &C,
    reference: &ChartReference,
) -> Result<HashMap<String, DigestView>> {
    Ok(digests::Entity::find()
        .filter(digests::Column::MachineId.eq(&reference.machine_id))
        .filter(digests::Column::ChartId.eq(&reference.chart_id))
        .all(db)
        .await?
        .into_iter()
        .map(|row| {
            (
                row.key,
                DigestView {
                    value: row.value,
                    created: row.created,
                    updated: row.timestamp,
                },
            )
        })
        .collect())
}

/// Returns the references of every chart whose digest set matches the filter.
/// Rows are grouped per chart and the boolean tree is evaluated in memory.
pub async fn query<C: ConnectionTrait>(
    db: &C,
    filter: &DigestFilter,
) -> Result<Vec<ChartReference>> {
    let mut by_chart: HashMap<ChartReference, HashMap<String, DigestView>> = HashMap::new();
    for row in digests::Entity::find().all(db).await? {
        by_chart
            .entry(ChartReference::new(row.machine_id.clone(), row.chart_id.clone()))
            .or_default()
            .insert(
                row.key,
                DigestView {
                    value: row.value,
                    created: row.created,
                    updated: row.timestamp,
                },
            );
    }
    let mut matching: Vec<ChartReference> = by_chart
        .into_iter()
        .filter(|(_, digests)| filter.matches(digests))
        .map(|(reference, _)| reference)
        .collect();
    matching.sort();
    Ok(matching)
}
