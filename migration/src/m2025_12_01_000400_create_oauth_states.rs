use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(OAuthStates::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(OAuthStates::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(OAuthStates::State).string().not_null())
                    .col(
                        ColumnDef::new(OAuthStates::CodeVerifier)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OAuthStates::CodeChallenge)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OAuthStates::Status)
                            .string()
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(OAuthStates::UserId).uuid().not_null())
                    .col(
                        ColumnDef::new(OAuthStates::ProviderIdentifier)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(OAuthStates::RedirectUrl).text().not_null())
                    .col(ColumnDef::new(OAuthStates::Permissions).json_binary().null())
                    .col(ColumnDef::new(OAuthStates::UserData).json_binary().null())
                    .col(
                        ColumnDef::new(OAuthStates::CallbackParams)
                            .json_binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(OAuthStates::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OAuthStates::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(OAuthStates::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(OAuthStates::DeletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_oauth_states_state")
                    .table(OAuthStates::Table)
                    .col(OAuthStates::State)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_oauth_states_expires_at")
                    .table(OAuthStates::Table)
                    .col(OAuthStates::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(OAuthStates::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum OAuthStates {
    #[sea_orm(iden = "oauth_states")]
    Table,
    Id,
    State,
    CodeVerifier,
    CodeChallenge,
    Status,
    UserId,
    ProviderIdentifier,
    RedirectUrl,
    Permissions,
    UserData,
    CallbackParams,
    ExpiresAt,
    CreatedAt,
    UpdatedAt,
    DeletedAt,
}
