use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "deferred_events")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub machine_id: String,
    pub chart_id: String,
    pub event_id: String,
    pub event_to: Option<String>,
    pub event: String,
    pub timestamp: DateTimeUtc,
    pub delay: i64,
    pub due: DateTimeUtc,
    pub lock: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
