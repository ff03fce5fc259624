//! Configuration management for bi-utils.
//!
//! Configuration is loaded with figment from defaults, an optional TOML file
//! and `BI_UTILS_`-prefixed environment variables. AWS credentials themselves
//! are never part of this configuration; the AWS SDK resolves them from the
//! standard `AWS_*` variables and profiles.

use std::path::PathBuf;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default configuration directory name.
const CONFIG_DIR_NAME: &str = "bi-utils";

/// Secrets Manager secret holding the warehouse credentials.
pub const DEFAULT_SECRET_ID: &str = "prod/redshift/analytics";

/// Default S3 bucket for warehouse transfers.
pub const DEFAULT_BUCKET: &str = "gismart-analytics";

/// Default key prefix inside the bucket.
pub const DEFAULT_BUCKET_DIR: &str = "dwh/temp";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `BI_UTILS_`, sections split by `__`)
/// 2. TOML config file at `~/.config/bi-utils/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// AWS access configuration.
    pub aws: AwsConfig,
    /// Warehouse transfer defaults.
    pub warehouse: WarehouseConfig,
    /// Export queue configuration.
    pub export: ExportConfig,
}

/// AWS access configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    /// Secrets Manager id of the warehouse credentials.
    pub secret_id: String,
    /// Region override. Falls back to `AWS_DEFAULT_REGION`/`AWS_REGION`.
    pub region: Option<String>,
    /// Custom endpoint, e.g. a local S3-compatible store.
    pub endpoint_url: Option<String>,
    /// IAM role Redshift assumes for `COPY`/`UNLOAD`. Without it the
    /// caller's own AWS keys are passed to the statement.
    pub iam_role: Option<String>,
}

/// Defaults for Redshift <-> S3 transfers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseConfig {
    /// S3 bucket used for staging.
    pub bucket: String,
    /// Key prefix used for staging.
    pub bucket_dir: String,
    /// Local directory for downloaded chunks.
    pub temp_dir: PathBuf,
    /// Extra attempts after a failed S3 transfer.
    pub retries: u32,
    /// Maximum size of one unloaded file.
    pub max_chunk_size_mb: u32,
    /// Remove staged S3 objects after a transfer.
    pub delete_s3_after: bool,
    /// Put local downloads into a fresh timestamped directory.
    pub add_timestamp_dir: bool,
    /// Put staged S3 objects under a fresh timestamped prefix.
    pub add_s3_timestamp_dir: bool,
}

/// Export queue configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Name of the worker, used in log lines and errors.
    pub worker_name: String,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            secret_id: DEFAULT_SECRET_ID.to_string(),
            region: None,
            endpoint_url: None,
            iam_role: None,
        }
    }
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            bucket: DEFAULT_BUCKET.to_string(),
            bucket_dir: DEFAULT_BUCKET_DIR.to_string(),
            temp_dir: PathBuf::from("/tmp"),
            retries: 0,
            max_chunk_size_mb: 6000,
            delete_s3_after: true,
            add_timestamp_dir: true,
            add_s3_timestamp_dir: true,
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            worker_name: "exporter".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading, parsing or validation fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed("BI_UTILS_").split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(CONFIG_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.aws.secret_id.trim().is_empty() {
            return Err(Error::ConfigValidation {
                message: "aws.secret_id cannot be empty".to_string(),
            });
        }

        if self.warehouse.bucket.trim().is_empty() {
            return Err(Error::ConfigValidation {
                message: "warehouse.bucket cannot be empty".to_string(),
            });
        }

        if self.warehouse.max_chunk_size_mb == 0 {
            return Err(Error::ConfigValidation {
                message: "warehouse.max_chunk_size_mb must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}
