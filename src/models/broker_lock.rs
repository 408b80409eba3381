//! Broker lock entity
//!
//! Backing row for the distributed lock: a named mutex with TTL. The primary
//! key on `lock_key` is what makes acquisition an atomic set-if-absent.

use chrono::{DateTime, Utc};
use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "broker_locks")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub lock_key: String,

    /// Acquisition token; release only removes the caller's own row
    pub holder: Uuid,

    /// Past this point the lock is silently reclaimable by another actor
    pub expires_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
