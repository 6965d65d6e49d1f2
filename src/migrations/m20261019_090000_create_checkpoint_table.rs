use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Checkpoint::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Checkpoint::Scope).string().not_null())
                    .col(ColumnDef::new(Checkpoint::Key).string().not_null())
                    .col(ColumnDef::new(Checkpoint::Value).binary().not_null())
                    .primary_key(
                        Index::create()
                            .col(Checkpoint::Scope)
                            .col(Checkpoint::Key),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Checkpoint::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum Checkpoint {
    Table,
    Scope,
    Key,
    Value,
}
