use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Credentials::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Credentials::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Credentials::UserId).uuid().not_null())
                    .col(
                        ColumnDef::new(Credentials::ProviderIdentifier)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Credentials::CredentialType)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Credentials::IsValid)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(Credentials::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Credentials::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Credentials::LastUsedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Credentials::DeletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_credentials_user_id")
                    .table(Credentials::Table)
                    .col(Credentials::UserId)
                    .to_owned(),
            )
            .await?;

        // Uniqueness among non-deleted rows is enforced by the service layer
        // (replace deletes the prior row in the same transaction); this index
        // keeps the (user, provider) lookup fast.
        manager
            .create_index(
                Index::create()
                    .name("idx_credentials_user_provider")
                    .table(Credentials::Table)
                    .col(Credentials::UserId)
                    .col(Credentials::ProviderIdentifier)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Credentials::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Credentials {
    #[sea_orm(iden = "credentials")]
    Table,
    Id,
    UserId,
    ProviderIdentifier,
    CredentialType,
    IsValid,
    CreatedAt,
    UpdatedAt,
    LastUsedAt,
    DeletedAt,
}
