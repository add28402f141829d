use crate::{error::Result, types::ChartReference};
use sea_orm::{
    sea_query::OnConflict, ActiveValue::Set, ColumnTrait, ConnectionTrait, EntityTrait,
    PaginatorTrait, QueryFilter,
};
use xjog_entity::ongoing_activities;

/// Marks the activity as running so adoption knows the chart is not idle.
/// Re-registration of the same activity is a no-op.
pub async fn register<C: ConnectionTrait>(
    db: &C,
    reference: &ChartReference,
    activity_id: &str,
) -> Result<()> {
    ongoing_activities::Entity::insert(ongoing_activities::ActiveModel {
        machine_id: Set(reference.machine_id.clone()),
        chart_id: Set(reference.chart_id.clone()),
        activity_id: Set(activity_id.to_string()),
    })
    .on_conflict(
        OnConflict::columns([
            ongoing_activities::Column::MachineId,
            ongoing_activities::Column::ChartId,
            ongoing_activities::Column::ActivityId,
        ])
        .do_nothing()
        .to_owned(),
    )
    .exec_without_returning(db)
    .await?;
    Ok(())
}

pub async fn unregister<C: ConnectionTrait>(
    db: &C,
    reference: &ChartReference,
    activity_id: &str,
) -> Result<()> {
    ongoing_activities::Entity::delete_by_id((
        reference.machine_id.clone(),
        reference.chart_id.clone(),
        activity_id.to_string(),
    ))
    .exec(db)
    .await?;
    Ok(())
}

pub async fn unregister_all_for_chart<C: ConnectionTrait>(
    db: &C,
    reference: &ChartReference,
) -> Result<()> {
    ongoing_activities::Entity::delete_many()
        .filter(ongoing_activities::Column::MachineId.eq(&reference.machine_id))
        .filter(ongoing_activities::Column::ChartId.eq(&reference.chart_id))
        .exec(db)
        .await?;
    Ok(())
}

pub async fn is_registered<C: ConnectionTrait>(
    db: &C,
    reference: &ChartReference,
    activity_id: &str,
) -> Result<bool> {
    Ok(ongoing_activities::Entity::find_by_id((
        reference.machine_id.clone(),
        reference.chart_id.clone(),
        activity_id.to_string(),
    ))
    .one(db)
    .await?
    .is_some())
}

pub async fn count_for_chart<C: ConnectionTrait>(
    db: &C,
    reference: &ChartReference,
) -> Result<u64> {
    Ok(ongoing_activities::Entity::find()
        .filter(ongoing_activities::Column::MachineId.eq(&reference.machine_id))
        .filter(ongoing_activities::Column::ChartId.eq(&reference.chart_id))
        .count(db)
        .await?)
}
