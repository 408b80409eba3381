//! Re-encrypt every stored credential under the current vault key version.
//!
//! Run after a key rotation to move old ciphertexts forward. Rows already on
//! the newest version are left untouched.

use anyhow::{Context, Result};
use chrono::Utc;
use credbroker::{
    config::ConfigLoader,
    db,
    models::{apikey_credential, oauth_credential},
    vault::{TransitVault, Vault},
};
use sea_orm::{ActiveModelTrait, EntityTrait, Set};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ConfigLoader::new().load().context("loading configuration")?;

    let vault = TransitVault::new(&config.vault.transit_base, &config.vault.root_keys())
        .context("initializing vault")?;

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;

    let mut updated_count = 0usize;

    for row in oauth_credential::Entity::find()
        .all(&db)
        .await
        .context("querying oauth credentials")?
    {
        let credential_id = row.credential_id;
        let mut secret = row
            .secret()
            .with_context(|| format!("decoding secret for {}", credential_id))?;

        let rewrapped = vault
            .rewrap(&secret.encryption_metadata)
            .await
            .with_context(|| format!("rewrapping oauth credential {}", credential_id))?;
        if rewrapped.key_version == secret.encryption_metadata.key_version {
            continue;
        }
        secret.encryption_metadata = rewrapped;

        let mut active: oauth_credential::ActiveModel = row.into();
        active.secret = Set(serde_json::to_value(&secret)?);
        active.updated_at = Set(Utc::now().into());
        active
            .update(&db)
            .await
            .with_context(|| format!("updating oauth credential {}", credential_id))?;
        updated_count += 1;
    }

    for row in apikey_credential::Entity::find()
        .all(&db)
        .await
        .context("querying apikey credentials")?
    {
        let credential_id = row.credential_id;
        let mut secret = row
            .secret()
            .with_context(|| format!("decoding secret for {}", credential_id))?;

        let rewrapped = vault
            .rewrap(&secret.encryption_metadata)
            .await
            .with_context(|| format!("rewrapping apikey credential {}", credential_id))?;
        if rewrapped.key_version == secret.encryption_metadata.key_version {
            continue;
        }
        secret.encryption_metadata = rewrapped;

        let mut active: apikey_credential::ActiveModel = row.into();
        active.secret = Set(serde_json::to_value(&secret)?);
        active.updated_at = Set(Utc::now().into());
        active
            .update(&db)
            .await
            .with_context(|| format!("updating apikey credential {}", credential_id))?;
        updated_count += 1;
    }

    println!("rewrapped {} credential rows", updated_count);
    Ok(())
}
