use crate::{
    error::{map_insert_error, Result},
    types::ChartReference,
};
use sea_orm::{ActiveValue::Set, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use std::collections::HashMap;
use xjog_entity::external_ids;

/// Registers a secondary lookup key. `(key, value)` is unique per database;
/// an existing pair for another chart yields a conflict.
pub async fn register<C: ConnectionTrait>(
    db: &C,
    key: &str,
    value: &str,
    reference: &ChartReference,
) -> Result<()> {
    external_ids::Entity::insert(external_ids::ActiveModel {
        key: Set(key.to_string()),
        value: Set(value.to_string()),
        machine_id: Set(reference.machine_id.clone()),
        chart_id: Set(reference.chart_id.clone()),
    })
    .exec(db)
    .await
    .map_err(|err| map_insert_error(err, format!("external id ({key}, {value}) already taken")))?;
    Ok(())
}

pub async fn drop_id<C: ConnectionTrait>(db: &C, key: &str, value: &str) -> Result<()> {
    external_ids::Entity::delete_by_id((key.to_string(), value.to_string()))
        .exec(db)
        .await?;
    Ok(())
}

pub async fn find_chart<C: ConnectionTrait>(
    db: &C,
    key: &str,
    value: &str,
) -> Result<Option<ChartReference>> {
    Ok(external_ids::Entity::find_by_id((key.to_string(), value.to_string()))
        .one(db)
        .await?
        .map(|row| ChartReference::new(row.machine_id, row.chart_id)))
}

pub async fn for_chart<C: ConnectionTrait>(
    db: &C,
    reference: &ChartReference,
) -> Result<HashMap<String, String>> {
    Ok(external_ids::Entity::find()
        .filter(external_ids::Column::MachineId.eq(&reference.machine_id))
        .filter(external_ids::Column::ChartId.eq(&reference.chart_id))
        .all(db)
        .await?
        .into_iter()
        .map(|row| (row.key, row.value))
        .collect())
}

pub async fn delete_all_for_chart<C: ConnectionTrait>(
    db: &C,
    reference: &ChartReference,
) -> Result<()> {
    external_ids::Entity::delete_many()
        .filter(external_ids::Column::MachineId.eq(&reference.machine_id))
        .filter(external_ids::Column::ChartId.eq(&reference.chart_id))
        .exec(db)
        .await?;
    Ok(())
}
