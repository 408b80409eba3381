use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Named mutexes with TTL. The primary key gives us the atomic
        // set-if-absent the refresh path relies on.
        manager
            .create_table(
                Table::create()
                    .table(BrokerLocks::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(BrokerLocks::LockKey)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(BrokerLocks::Holder).uuid().not_null())
                    .col(
                        ColumnDef::new(BrokerLocks::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(BrokerLocks::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum BrokerLocks {
    #[sea_orm(iden = "broker_locks")]
    Table,
    LockKey,
    Holder,
    ExpiresAt,
}
