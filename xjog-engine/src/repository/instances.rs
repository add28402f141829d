use crate::error::{map_insert_error, Result};
use chrono::Utc;
use sea_orm::{
    sea_query::Expr, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, PaginatorTrait, QueryFilter, TransactionTrait,
};
use xjog_entity::{charts, instances};

pub async fn insert<C: ConnectionTrait>(db: &C, instance_id: &str) -> Result<()> {
    instances::Entity::insert(instances::ActiveModel {
        timestamp: Set(Utc::now()),
        instance_id: Set(instance_id.to_string()),
        dying: Set(false),
    })
    .exec(db)
    .await
    .map_err(|err| map_insert_error(err, format!("instance {instance_id} already registered")))?;
    Ok(())
}

/// In one transaction: flag every existing instance as dying, pause every
/// chart, and register `self_id` as the one live instance. After commit any
/// other running engine sees itself flagged and must drain.
pub async fn overthrow_other_instances(db: &DatabaseConnection, self_id: &str) -> Result<()> {
    let txn = db.begin().await?;

    instances::Entity::update_many()
        .col_expr(instances::Column::Dying, Expr::value(true))
        .exec(&txn)
        .await?;
    charts::Entity::update_many()
        .col_expr(charts::Column::Paused, Expr::value(true))
        .exec(&txn)
        .await?;
    instances::Entity::insert(instances::ActiveModel {
        timestamp: Set(Utc::now()),
        instance_id: Set(self_id.to_string()),
        dying: Set(false),
    })
    .exec(&txn)
    .await?;

    txn.commit().await?;
    Ok(())
}

/// A missing row counts as dying: it means another instance has already
/// removed us.
pub async fn is_dying<C: ConnectionTrait>(db: &C, instance_id: &str) -> Result<bool> {
    let row = instances::Entity::find_by_id(instance_id).one(db).await?;
    Ok(row.map(|instance| instance.dying).unwrap_or(true))
}

pub async fn delete<C: ConnectionTrait>(db: &C, instance_id: &str) -> Result<()> {
    instances::Entity::delete_by_id(instance_id).exec(db).await?;
    Ok(())
}

pub async fn count_alive<C: ConnectionTrait>(db: &C) -> Result<u64> {
    Ok(instances::Entity::find()
        .filter(instances::Column::Dying.eq(false))
        .count(db)
        .await?)
}
