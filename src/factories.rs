//! Live client factories: decrypt per-tenant secrets and hand out API
//! clients. FFN clients are cached per tenant so token state (and the
//! refresh lock) is shared process-wide instead of per call site.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::clients::commerce::{
    CommerceApi, CommerceFactory, StorefrontClient, WebshopClient,
};
use crate::clients::ffn::{
    FfnApi, FfnClient, FfnClientParams, FfnFactory, TokenSink, TokenState,
};
use crate::crypto::CredentialVault;
use crate::error::SyncError;
use crate::models::{Channel, ChannelType, FfnConfig};
use crate::store::Database;

/// Writes rotated OAuth material back to the tenant's config row, encrypted.
struct VaultTokenSink {
    db: Database,
    vault: CredentialVault,
    config_id: String,
}

impl TokenSink for VaultTokenSink {
    fn persist(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let access_enc = self.vault.encrypt(access_token)?;
        let refresh_enc = refresh_token
            .map(|t| self.vault.encrypt(t))
            .transpose()?;
        self.db
            .update_ffn_tokens(
                &self.config_id,
                &access_enc,
                refresh_enc.as_deref(),
                expires_at,
            )
            .map_err(|e| SyncError::Storage(e.to_string()))
    }
}

pub struct LiveFfnFactory {
    db: Database,
    vault: CredentialVault,
    cache: Mutex<HashMap<String, (String, Arc<FfnClient>)>>,
}

impl LiveFfnFactory {
    pub fn new(db: Database, vault: CredentialVault) -> Self {
        Self {
            db,
            vault,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Cache key ingredients: anything whose change must produce a fresh
    /// client (re-authorization rotates the stored refresh token).
    fn fingerprint(config: &FfnConfig) -> String {
        format!(
            "{}|{}|{}",
            config.oauth_client_id,
            config.environment.as_str(),
            config.refresh_token.as_deref().unwrap_or("")
        )
    }
}

impl FfnFactory for LiveFfnFactory {
    fn client_for(&self, config: &FfnConfig) -> Result<Arc<dyn FfnApi>, SyncError> {
        let fingerprint = Self::fingerprint(config);
        {
            let cache = self.cache.lock();
            if let Some((cached_fingerprint, client)) = cache.get(&config.client_id) {
                if *cached_fingerprint == fingerprint {
                    return Ok(client.clone());
                }
            }
        }

        let secret = self.vault.safe_decrypt(&config.oauth_client_secret)?;
        let access_token = config
            .access_token
            .as_deref()
            .map(|t| self.vault.safe_decrypt(t))
            .transpose()?;
        let refresh_token = config
            .refresh_token
            .as_deref()
            .map(|t| self.vault.safe_decrypt(t))
            .transpose()?;

        let (api_base, auth_url) = FfnClient::bases_for(config.environment);
        let client = Arc::new(FfnClient::new(FfnClientParams {
            api_base: api_base.to_string(),
            auth_url: auth_url.to_string(),
            oauth_client_id: config.oauth_client_id.clone(),
            oauth_client_secret: secret,
            initial_token: TokenState {
                access_token,
                refresh_token,
                expires_at: config.token_expires_at,
            },
            token_sink: Some(Arc::new(VaultTokenSink {
                db: self.db.clone(),
                vault: self.vault.clone(),
                config_id: config.id.clone(),
            })),
            tenant_ref: config.client_id.clone(),
        })?);

        self.cache
            .lock()
            .insert(config.client_id.clone(), (fingerprint, client.clone()));
        Ok(client)
    }
}

pub struct LiveCommerceFactory {
    vault: CredentialVault,
}

impl LiveCommerceFactory {
    pub fn new(vault: CredentialVault) -> Self {
        Self { vault }
    }
}

impl CommerceFactory for LiveCommerceFactory {
    fn client_for(&self, channel: &Channel) -> Result<Arc<dyn CommerceApi>, SyncError> {
        let credentials = self.vault.safe_decrypt(&channel.api_credentials)?;
        match channel.channel_type {
            ChannelType::Webshop => Ok(Arc::new(WebshopClient::new(
                &channel.base_url,
                &credentials,
            )?)),
            ChannelType::Storefront => Ok(Arc::new(StorefrontClient::new(
                &channel.base_url,
                &credentials,
            )?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FfnEnvironment;
    use uuid::Uuid;

    const TEST_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn config(client_id: &str, vault: &CredentialVault) -> FfnConfig {
        FfnConfig {
            id: Uuid::new_v4().to_string(),
            client_id: client_id.to_string(),
            oauth_client_id: "cid".into(),
            oauth_client_secret: vault.encrypt("secret").unwrap(),
            access_token: None,
            refresh_token: Some(vault.encrypt("refresh").unwrap()),
            token_expires_at: None,
            environment: FfnEnvironment::Sandbox,
            fulfiller_id: None,
            warehouse_id: Some("W1".into()),
            is_active: true,
        }
    }

    #[test]
    fn ffn_clients_are_cached_per_tenant_until_reauth() {
        let db = Database::open_in_memory().unwrap();
        let vault = CredentialVault::from_hex_key(TEST_KEY).unwrap();
        let factory = LiveFfnFactory::new(db, vault.clone());

        let cfg = config("tenant-1", &vault);
        let a = factory.client_for(&cfg).unwrap();
        let b = factory.client_for(&cfg).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        // A rotated refresh token (re-authorization) yields a fresh client.
        let mut rotated = cfg.clone();
        rotated.refresh_token = Some(vault.encrypt("new-refresh").unwrap());
        let c = factory.client_for(&rotated).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn commerce_factory_picks_platform_flavor() {
        let vault = CredentialVault::from_hex_key(TEST_KEY).unwrap();
        let factory = LiveCommerceFactory::new(vault.clone());

        let webshop = Channel {
            id: "ch-1".into(),
            client_id: "tenant-1".into(),
            channel_type: ChannelType::Webshop,
            base_url: "https://shop.example".into(),
            api_credentials: vault.encrypt("ck_live:cs_live").unwrap(),
            is_active: true,
            sync_enabled: true,
            last_order_poll_at: None,
            last_product_poll_at: None,
        };
        assert!(factory.client_for(&webshop).is_ok());

        // Webshop credentials must be a key:secret pair.
        let broken = Channel {
            api_credentials: vault.encrypt("no-colon-here").unwrap(),
            ..webshop.clone()
        };
        assert!(matches!(
            factory.client_for(&broken),
            Err(SyncError::MissingCredentials(_))
        ));

        // Legacy plaintext rows pass through safe_decrypt unchanged.
        let legacy = Channel {
            channel_type: ChannelType::Storefront,
            api_credentials: "plain-token".into(),
            ..webshop
        };
        assert!(factory.client_for(&legacy).is_ok());
    }
}
