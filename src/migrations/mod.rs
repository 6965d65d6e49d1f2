pub mod m20261019_090000_create_checkpoint_table;
pub mod m20261019_090500_create_performance_result_table;

pub use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20261019_090000_create_checkpoint_table::Migration),
            Box::new(m20261019_090500_create_performance_result_table::Migration),
        ]
    }
}
