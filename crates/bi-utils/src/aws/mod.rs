//! Redshift, S3 and Secrets Manager access.
//!
//! A [`Warehouse`] bundles the loaded configuration, the resolved AWS SDK
//! config, an [`ObjectBackend`](s3::ObjectBackend) (S3 unless replaced) and a
//! [`CredentialCache`](connection::CredentialCache). The helpers in [`db`]
//! take one and read their defaults from its configuration.

pub mod connection;
pub mod db;
pub mod redshift;
pub mod s3;

use std::sync::Arc;

use aws_config::SdkConfig;
use sqlx::{PgConnection, PgPool};
use tracing::info;

use crate::config::Config;
use crate::error::Result;

pub use connection::{
    ConnectOptions, CredentialCache, SecretsManagerProvider, SecretsProvider, StaticSecrets,
    WarehouseCredentials,
};
pub use db::{DownloadOptions, FileSet, UnloadOptions, UploadOptions};
pub use redshift::{CopyAuth, FileFormat, Redshift};
pub use s3::{ObjectBackend, ObjectStore};

/// Shared context of the warehouse helpers.
#[derive(Debug)]
pub struct Warehouse {
    config: Config,
    sdk_config: SdkConfig,
    store: Arc<dyn ObjectBackend>,
    credentials: CredentialCache,
}

impl Warehouse {
    /// Resolve the AWS environment and read secrets from Secrets Manager.
    pub async fn from_config(config: Config) -> Self {
        let sdk_config = connection::load_aws_config(&config.aws).await;
        let secrets = Arc::new(SecretsManagerProvider::new(&sdk_config));
        Self::with_secrets(config, sdk_config, secrets)
    }

    /// Build a context with a custom secrets source.
    #[must_use]
    pub fn with_secrets(
        config: Config,
        sdk_config: SdkConfig,
        secrets: Arc<dyn SecretsProvider>,
    ) -> Self {
        let store = ObjectStore::from_sdk_config(&sdk_config, config.aws.endpoint_url.is_some());
        Self {
            config,
            sdk_config,
            store: Arc::new(store),
            credentials: CredentialCache::new(secrets),
        }
    }

    /// The loaded configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Replace the object storage backend.
    #[must_use]
    pub fn with_object_store(mut self, store: Arc<dyn ObjectBackend>) -> Self {
        self.store = store;
        self
    }

    /// The object storage backend.
    #[must_use]
    pub fn object_store(&self) -> &dyn ObjectBackend {
        self.store.as_ref()
    }

    /// Warehouse credentials for `opts.secret_id`, or the configured secret.
    ///
    /// # Errors
    ///
    /// Returns an error if the secret cannot be loaded.
    pub async fn credentials(&self, opts: &ConnectOptions) -> Result<WarehouseCredentials> {
        let secret_id = opts.secret_id.as_deref().unwrap_or(&self.config.aws.secret_id);
        self.credentials.get(secret_id).await
    }

    /// Open a single warehouse connection.
    ///
    /// # Errors
    ///
    /// Returns an error if credentials cannot be loaded or the connection
    /// fails.
    pub async fn connect(&self, opts: &ConnectOptions) -> Result<PgConnection> {
        let creds = self.credentials(opts).await?;
        connection::connect(&creds, opts).await
    }

    /// Open a warehouse connection pool.
    ///
    /// # Errors
    ///
    /// Returns an error if credentials cannot be loaded or the connection
    /// fails.
    pub async fn pool(&self, opts: &ConnectOptions) -> Result<PgPool> {
        let creds = self.credentials(opts).await?;
        connection::create_pool(&creds, opts).await
    }

    /// Open a [`Redshift`] handle for `COPY`/`UNLOAD` transfers.
    ///
    /// # Errors
    ///
    /// Returns an error if credentials, the pool or the S3 authorization
    /// cannot be set up.
    pub async fn redshift(&self, opts: &ConnectOptions) -> Result<Redshift> {
        let creds = self.credentials(opts).await?;
        let pool = connection::create_pool(&creds, opts).await?;
        let auth =
            connection::resolve_copy_auth(&self.sdk_config, self.config.aws.iam_role.as_deref())
                .await?;
        let dbname = opts.database.as_deref().unwrap_or(&creds.dbname);
        info!("Created {dbname} RedShift connection");
        Ok(Redshift::new(pool, self.store.clone(), auth))
    }

    /// Upload defaults from the configuration.
    #[must_use]
    pub fn upload_options(&self) -> UploadOptions {
        UploadOptions::from(&self.config.warehouse)
    }

    /// Download defaults from the configuration.
    #[must_use]
    pub fn download_options(&self) -> DownloadOptions {
        DownloadOptions::from(&self.config.warehouse)
    }

    /// Unload defaults from the configuration.
    #[must_use]
    pub fn unload_options(&self) -> UnloadOptions {
        UnloadOptions::from(&self.config.warehouse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn warehouse() -> Warehouse {
        let mut config = Config::default();
        config.warehouse.bucket = "analytics-staging".to_string();
        let secrets = StaticSecrets::new().with_secret(
            "prod/redshift/analytics",
            r#"{"username": "bi", "password": "pw", "host": "localhost", "port": "5439", "dbname": "dwh"}"#,
        );
        Warehouse::with_secrets(config, SdkConfig::builder().build(), Arc::new(secrets))
    }

    #[tokio::test]
    async fn test_credentials_use_configured_secret() {
        let wh = warehouse();
        let creds = wh.credentials(&ConnectOptions::default()).await.unwrap();
        assert_eq!(creds.dbname, "dwh");

        let other = ConnectOptions::default().with_secret_id("dev/redshift");
        assert!(wh.credentials(&other).await.is_err());
    }

    #[tokio::test]
    async fn test_with_object_store() {
        let store = Arc::new(s3::testing::MemoryBackend::new());
        let wh = warehouse().with_object_store(store.clone());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.csv");
        std::fs::write(&path, "a\n1\n").unwrap();

        let key = wh.object_store().upload_file(&path, "bucket", "reports/").await.unwrap();

        assert_eq!(key, "reports/report.csv");
        assert_eq!(store.keys("bucket"), ["reports/report.csv"]);
    }

    #[test]
    fn test_options_follow_config() {
        let wh = warehouse();
        assert_eq!(wh.upload_options().bucket, "analytics-staging");
        assert_eq!(wh.download_options().bucket, "analytics-staging");
        assert_eq!(wh.unload_options().bucket_dir, "dwh/temp");
    }
}
