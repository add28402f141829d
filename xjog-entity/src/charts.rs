use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "charts")]
pub struct Model {
    pub timestamp: DateTimeUtc,
    pub owner_id: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub machine_id: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub chart_id: String,
    pub parent_machine_id: Option<String>,
    pub parent_chart_id: Option<String>,
    #[sea_orm(column_type = "VarBinary(StringLen::None)")]
    pub state: Vec<u8>,
    pub paused: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
