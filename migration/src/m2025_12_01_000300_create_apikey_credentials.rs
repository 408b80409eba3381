use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ApiKeyCredentials::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ApiKeyCredentials::CredentialId)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ApiKeyCredentials::Secret)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ApiKeyCredentials::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ApiKeyCredentials::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ApiKeyCredentials::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ApiKeyCredentials {
    #[sea_orm(iden = "apikey_credentials")]
    Table,
    CredentialId,
    Secret,
    CreatedAt,
    UpdatedAt,
}
