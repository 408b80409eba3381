//! Database migrations for the credential broker.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_12_01_000100_create_credentials;
mod m2025_12_01_000200_create_oauth_credentials;
mod m2025_12_01_000300_create_apikey_credentials;
mod m2025_12_01_000400_create_oauth_states;
mod m2025_12_01_000500_create_broker_locks;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_12_01_000100_create_credentials::Migration),
            Box::new(m2025_12_01_000200_create_oauth_credentials::Migration),
            Box::new(m2025_12_01_000300_create_apikey_credentials::Migration),
            Box::new(m2025_12_01_000400_create_oauth_states::Migration),
            Box::new(m2025_12_01_000500_create_broker_locks::Migration),
        ]
    }
}
