use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "ongoing_activities")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub machine_id: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub chart_id: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub activity_id: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
