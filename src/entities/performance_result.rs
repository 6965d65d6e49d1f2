use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "performance_result")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub run_id: String,
    pub scenario_name: String,
    pub started_at: i64,
    pub elapsed_ms: i64,
    pub items_sent: i64,
    pub items_received: i64,
    pub max_cpu: f64,
    pub avg_cpu: f64,
    pub max_ram: f64,
    pub avg_ram: f64,
    pub passed: bool,
    pub failure_kind: Option<String>,
    pub failure_reason: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
