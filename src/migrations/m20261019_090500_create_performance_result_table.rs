use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(PerformanceResult::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PerformanceResult::Id)
                            .integer()
                            .auto_increment()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(PerformanceResult::RunId).string().not_null())
                    .col(
                        ColumnDef::new(PerformanceResult::ScenarioName)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PerformanceResult::StartedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PerformanceResult::ElapsedMs)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PerformanceResult::ItemsSent)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PerformanceResult::ItemsReceived)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(PerformanceResult::MaxCpu).double().not_null())
                    .col(ColumnDef::new(PerformanceResult::AvgCpu).double().not_null())
                    .col(ColumnDef::new(PerformanceResult::MaxRam).double().not_null())
                    .col(ColumnDef::new(PerformanceResult::AvgRam).double().not_null())
                    .col(ColumnDef::new(PerformanceResult::Passed).boolean().not_null())
                    .col(ColumnDef::new(PerformanceResult::FailureKind).string())
                    .col(ColumnDef::new(PerformanceResult::FailureReason).string())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-performance_result-scenario")
                    .table(PerformanceResult::Table)
                    .col(PerformanceResult::ScenarioName)
                    .col(PerformanceResult::StartedAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(PerformanceResult::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum PerformanceResult {
    Table,
    Id,
    RunId,
    ScenarioName,
    StartedAt,
    ElapsedMs,
    ItemsSent,
    ItemsReceived,
    MaxCpu,
    AvgCpu,
    MaxRam,
    AvgRam,
    Passed,
    FailureKind,
    FailureReason,
}
