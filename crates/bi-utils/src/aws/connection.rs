//! Warehouse credentials and connections.
//!
//! Credentials live in a Secrets Manager JSON secret and are cached per
//! secret id for the life of the [`CredentialCache`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_credential_types::provider::ProvideCredentials;
use serde::{Deserialize, Deserializer};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Connection, PgConnection, PgPool};
use tokio::sync::Mutex;
use tracing::info;

use super::redshift::CopyAuth;
use crate::config::AwsConfig;
use crate::error::{Error, Result};

/// Maximum number of pooled warehouse connections.
const MAX_POOL_CONNECTIONS: u32 = 4;

/// Connection parameters of the warehouse, as stored in the secret.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct WarehouseCredentials {
    /// Database user.
    pub username: String,
    /// Database password.
    pub password: String,
    /// Cluster endpoint.
    pub host: String,
    /// Cluster port. The secret may hold it as a number or a string.
    #[serde(deserialize_with = "deserialize_port")]
    pub port: u16,
    /// Default database.
    pub dbname: String,
}

impl fmt::Debug for WarehouseCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WarehouseCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .finish()
    }
}

fn deserialize_port<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Source of secret strings.
#[async_trait]
pub trait SecretsProvider: Send + Sync + fmt::Debug {
    /// Fetch the secret string stored under `secret_id`.
    async fn secret_string(&self, secret_id: &str) -> Result<String>;
}

/// [`SecretsProvider`] backed by AWS Secrets Manager.
#[derive(Debug, Clone)]
pub struct SecretsManagerProvider {
    client: aws_sdk_secretsmanager::Client,
}

impl SecretsManagerProvider {
    /// Create a provider from a resolved SDK config.
    #[must_use]
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_secretsmanager::Client::new(sdk_config),
        }
    }
}

#[async_trait]
impl SecretsProvider for SecretsManagerProvider {
    async fn secret_string(&self, secret_id: &str) -> Result<String> {
        let output = self
            .client
            .get_secret_value()
            .secret_id(secret_id)
            .send()
            .await
            .map_err(|e| {
                Error::secret(
                    secret_id,
                    aws_sdk_secretsmanager::error::DisplayErrorContext(e),
                )
            })?;
        output
            .secret_string()
            .map(str::to_string)
            .ok_or_else(|| Error::secret(secret_id, "There is no credentials for given secret"))
    }
}

/// In-memory [`SecretsProvider`], mostly for tests and local setups.
#[derive(Debug, Clone, Default)]
pub struct StaticSecrets {
    secrets: HashMap<String, String>,
}

impl StaticSecrets {
    /// Create an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a secret.
    #[must_use]
    pub fn with_secret(mut self, secret_id: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(secret_id.into(), value.into());
        self
    }
}

#[async_trait]
impl SecretsProvider for StaticSecrets {
    async fn secret_string(&self, secret_id: &str) -> Result<String> {
        self.secrets
            .get(secret_id)
            .cloned()
            .ok_or_else(|| Error::secret(secret_id, "secret not found"))
    }
}

/// Loads warehouse credentials once per secret id.
#[derive(Debug)]
pub struct CredentialCache {
    provider: Arc<dyn SecretsProvider>,
    cached: Mutex<HashMap<String, WarehouseCredentials>>,
}

impl CredentialCache {
    /// Create an empty cache over `provider`.
    #[must_use]
    pub fn new(provider: Arc<dyn SecretsProvider>) -> Self {
        Self {
            provider,
            cached: Mutex::new(HashMap::new()),
        }
    }

    /// Credentials stored under `secret_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the secret cannot be fetched or is not a valid
    /// credentials document.
    pub async fn get(&self, secret_id: &str) -> Result<WarehouseCredentials> {
        let mut cached = self.cached.lock().await;
        if let Some(creds) = cached.get(secret_id) {
            return Ok(creds.clone());
        }
        let secret = self.provider.secret_string(secret_id).await?;
        let creds: WarehouseCredentials =
            serde_json::from_str(&secret).map_err(|e| Error::secret(secret_id, e))?;
        cached.insert(secret_id.to_string(), creds.clone());
        info!("Loaded AWS credentials ({secret_id})");
        Ok(creds)
    }
}

/// Per-call overrides of the connection target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Secret to read credentials from instead of the configured one.
    pub secret_id: Option<String>,
    /// Schema put on the `search_path`.
    pub schema: Option<String>,
    /// Database instead of the secret's `dbname`.
    pub database: Option<String>,
    /// Host instead of the secret's `host`.
    pub host: Option<String>,
}

impl ConnectOptions {
    /// Use another secret.
    #[must_use]
    pub fn with_secret_id(mut self, secret_id: impl Into<String>) -> Self {
        self.secret_id = Some(secret_id.into());
        self
    }

    /// Put `schema` on the search path.
    #[must_use]
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Connect to another database.
    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Connect to another host.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }
}

/// Build driver options from credentials and overrides.
#[must_use]
pub fn connect_options(creds: &WarehouseCredentials, opts: &ConnectOptions) -> PgConnectOptions {
    let options = PgConnectOptions::new()
        .host(opts.host.as_deref().unwrap_or(&creds.host))
        .port(creds.port)
        .username(&creds.username)
        .password(&creds.password)
        .database(opts.database.as_deref().unwrap_or(&creds.dbname));
    match &opts.schema {
        Some(schema) => options.options([("search_path", schema.as_str())]),
        None => options,
    }
}

/// Open a single warehouse connection.
///
/// # Errors
///
/// Returns an error if the connection cannot be established.
pub async fn connect(creds: &WarehouseCredentials, opts: &ConnectOptions) -> Result<PgConnection> {
    let conn = PgConnection::connect_with(&connect_options(creds, opts)).await?;
    let dbname = opts.database.as_deref().unwrap_or(&creds.dbname);
    match &opts.schema {
        Some(schema) => info!("Connected to {dbname} DB {schema} schema"),
        None => info!("Connected to {dbname} DB"),
    }
    Ok(conn)
}

/// Open a small warehouse connection pool.
///
/// # Errors
///
/// Returns an error if the first connection cannot be established.
pub async fn create_pool(creds: &WarehouseCredentials, opts: &ConnectOptions) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(MAX_POOL_CONNECTIONS)
        .connect_with(connect_options(creds, opts))
        .await?;
    let dbname = opts.database.as_deref().unwrap_or(&creds.dbname);
    info!("Created {dbname} DB engine");
    Ok(pool)
}

/// Resolve the AWS SDK config from the environment.
///
/// Credentials and region come from the default provider chain
/// (`AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, `AWS_DEFAULT_REGION`,
/// profiles, instance metadata); `config` may override region and endpoint.
pub async fn load_aws_config(config: &AwsConfig) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = &config.region {
        loader = loader.region(Region::new(region.clone()));
    }
    if let Some(endpoint) = &config.endpoint_url {
        loader = loader.endpoint_url(endpoint);
    }
    loader.load().await
}

/// Authorization Redshift uses to reach S3 in `COPY`/`UNLOAD`.
///
/// A configured IAM role wins; otherwise the caller's own keys are resolved
/// from the SDK provider chain.
///
/// # Errors
///
/// Returns [`Error::AwsCredentials`] if no role is set and the provider
/// chain yields no keys.
pub async fn resolve_copy_auth(sdk_config: &SdkConfig, iam_role: Option<&str>) -> Result<CopyAuth> {
    if let Some(role) = iam_role {
        return Ok(CopyAuth::IamRole(role.to_string()));
    }
    let provider = sdk_config
        .credentials_provider()
        .ok_or_else(|| Error::AwsCredentials("no credentials provider configured".to_string()))?;
    let creds = provider
        .provide_credentials()
        .await
        .map_err(|e| Error::AwsCredentials(e.to_string()))?;
    Ok(CopyAuth::Keys {
        access_key_id: creds.access_key_id().to_string(),
        secret_access_key: creds.secret_access_key().to_string(),
        session_token: creds.session_token().map(str::to_string),
    })
}
