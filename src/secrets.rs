use std::collections::HashMap;
use std::env;

use anyhow::{Context, Result};
use vaultrs::auth::approle;
use vaultrs::client::{Client, VaultClient, VaultClientSettingsBuilder};
use vaultrs::kv2;

use crate::config::{Config, SecretsBackend};

const GATEWAY_SECRET_PATH: &str = "payment-gateways";

pub struct SecretsManager {
    client: VaultClient,
    kv_mount: String,
}

impl SecretsManager {
    pub async fn new() -> Result<Self> {
        let vault_addr =
            env::var("VAULT_ADDR").unwrap_or_else(|_| "http://127.0.0.1:8200".to_string());
        let role_id = env::var("VAULT_ROLE_ID").context("VAULT_ROLE_ID is required")?;
        let secret_id = env::var("VAULT_SECRET_ID").context("VAULT_SECRET_ID is required")?;
        let auth_mount = env::var("VAULT_AUTH_MOUNT").unwrap_or_else(|_| "approle".to_string());
        let kv_mount = env::var("VAULT_KV_MOUNT").unwrap_or_else(|_| "secret".to_string());

        let mut client = VaultClient::new(
            VaultClientSettingsBuilder::default()
                .address(&vault_addr)
                .build()
                .context("failed to build Vault client settings")?,
        )
        .context("failed to create Vault client")?;

        let auth = approle::login(&client, &auth_mount, &role_id, &secret_id)
            .await
            .context("failed to authenticate to Vault with AppRole")?;
        client.set_token(&auth.client_token);

        Ok(Self { client, kv_mount })
    }

    async fn gateway_secrets(&self) -> Result<HashMap<String, String>> {
        kv2::read(&self.client, &self.kv_mount, GATEWAY_SECRET_PATH)
            .await
            .with_context(|| format!("failed to read {} from Vault", GATEWAY_SECRET_PATH))
    }

    /// Fills the gateway keys from `<mount>/payment-gateways`
    /// (`esewa_secret_key`, `khalti_secret_key`). Keys set in the
    /// environment take precedence.
    pub async fn apply_gateway_secrets(&self, config: &mut Config) -> Result<()> {
        let secrets = self.gateway_secrets().await?;
        fill_secrets(config, &secrets)?;
        tracing::info!("Gateway secrets loaded from Vault");
        Ok(())
    }
}

fn fill_secrets(config: &mut Config, secrets: &HashMap<String, String>) -> Result<()> {
    if config.esewa.secret_key.is_empty() {
        config.esewa.secret_key = secrets
            .get("esewa_secret_key")
            .cloned()
            .context("esewa_secret_key not found in Vault")?;
    }
    if config.khalti.secret_key.is_empty() {
        config.khalti.secret_key = secrets
            .get("khalti_secret_key")
            .cloned()
            .context("khalti_secret_key not found in Vault")?;
    }
    Ok(())
}

/// Completes `config` from the configured secrets backend and validates it.
pub async fn resolve_secrets(config: &mut Config) -> Result<()> {
    if config.secrets_backend == SecretsBackend::Vault {
        SecretsManager::new()
            .await?
            .apply_gateway_secrets(config)
            .await?;
    }
    config.validate()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    #[test]
    fn test_fill_secrets_only_replaces_missing_keys() {
        let mut config = test_config();
        config.esewa.secret_key = String::new();

        let secrets = HashMap::from([
            ("esewa_secret_key".to_string(), "from-vault".to_string()),
            ("khalti_secret_key".to_string(), "ignored".to_string()),
        ]);
        fill_secrets(&mut config, &secrets).unwrap();

        assert_eq!(config.esewa.secret_key, "from-vault");
        assert_eq!(config.khalti.secret_key, "test_secret_key");
    }

    #[test]
    fn test_fill_secrets_reports_missing_key() {
        let mut config = test_config();
        config.khalti.secret_key = String::new();
        assert!(fill_secrets(&mut config, &HashMap::new()).is_err());
    }
}
