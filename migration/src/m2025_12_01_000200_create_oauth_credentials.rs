use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(OAuthCredentials::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(OAuthCredentials::CredentialId)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(OAuthCredentials::Expiry)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(OAuthCredentials::Secret)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OAuthCredentials::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(OAuthCredentials::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Drives the refresh sweep's expiry-window scan.
        manager
            .create_index(
                Index::create()
                    .name("idx_oauth_credentials_expiry")
                    .table(OAuthCredentials::Table)
                    .col(OAuthCredentials::Expiry)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(OAuthCredentials::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum OAuthCredentials {
    #[sea_orm(iden = "oauth_credentials")]
    Table,
    CredentialId,
    Expiry,
    Secret,
    CreatedAt,
    UpdatedAt,
}
