use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "full_journal_states")]
pub struct Model {
    pub id: i64,
    pub created: DateTimeUtc,
    pub timestamp: DateTimeUtc,
    pub owner_id: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub machine_id: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub chart_id: String,
    pub parent_machine_id: Option<String>,
    pub parent_chart_id: Option<String>,
    #[sea_orm(column_type = "VarBinary(StringLen::None)", nullable)]
    pub event: Option<Vec<u8>>,
    #[sea_orm(column_type = "VarBinary(StringLen::None)", nullable)]
    pub state: Option<Vec<u8>>,
    #[sea_orm(column_type = "VarBinary(StringLen::None)", nullable)]
    pub context: Option<Vec<u8>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
