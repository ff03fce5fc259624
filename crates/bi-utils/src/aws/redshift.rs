//! Redshift `COPY`/`UNLOAD` through S3.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use sqlx::PgPool;
use tracing::{debug, info};

use super::s3::{s3_uri, ObjectBackend};
use crate::error::{Error, Result};

/// Format of files exchanged with Redshift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileFormat {
    /// Gzipped CSV with a header.
    #[default]
    Csv,
    /// Apache Parquet.
    Parquet,
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Csv => write!(f, "csv"),
            Self::Parquet => write!(f, "parquet"),
        }
    }
}

impl FromStr for FileFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "parquet" => Ok(Self::Parquet),
            _ => Err(Error::invalid_argument(format!(
                "{s} file format is not supported"
            ))),
        }
    }
}

/// How Redshift authenticates against S3.
#[derive(Clone, PartialEq, Eq)]
pub enum CopyAuth {
    /// Role attached to the cluster.
    IamRole(String),
    /// Temporary or long-lived access keys.
    Keys {
        /// Access key id.
        access_key_id: String,
        /// Secret access key.
        secret_access_key: String,
        /// Session token of temporary credentials.
        session_token: Option<String>,
    },
}

impl CopyAuth {
    /// The authorization clause of a `COPY`/`UNLOAD` statement.
    #[must_use]
    pub fn clause(&self) -> String {
        match self {
            Self::IamRole(role) => format!("IAM_ROLE '{role}'"),
            Self::Keys {
                access_key_id,
                secret_access_key,
                session_token,
            } => {
                let mut creds =
                    format!("aws_access_key_id={access_key_id};aws_secret_access_key={secret_access_key}");
                if let Some(token) = session_token {
                    creds.push_str(";token=");
                    creds.push_str(token);
                }
                format!("CREDENTIALS '{creds}'")
            }
        }
    }
}

impl fmt::Debug for CopyAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IamRole(role) => f.debug_tuple("IamRole").field(role).finish(),
            Self::Keys { access_key_id, .. } => f
                .debug_struct("Keys")
                .field("access_key_id", access_key_id)
                .finish_non_exhaustive(),
        }
    }
}

/// `COPY` statement loading `s3_uri` into `table`.
///
/// `table` may carry a column list, e.g. `schema.table (a,b)`. Without a
/// delimiter (parquet) no `DELIMITER` clause is emitted.
#[must_use]
pub fn copy_statement(
    table: &str,
    s3_uri: &str,
    auth: &CopyAuth,
    delimiter: Option<char>,
    options: &[String],
) -> String {
    let mut statement = format!("COPY {table} FROM '{s3_uri}' {}", auth.clause());
    if let Some(delimiter) = delimiter {
        statement.push_str(&format!(" DELIMITER '{delimiter}'"));
    }
    for option in options {
        statement.push(' ');
        statement.push_str(option);
    }
    statement.push(';');
    statement
}

/// `UNLOAD` statement exporting `query` to files under `s3_prefix`.
#[must_use]
pub fn unload_statement(query: &str, s3_prefix: &str, auth: &CopyAuth, options: &[String]) -> String {
    let query = query
        .trim()
        .trim_end_matches(';')
        .replace('\\', "\\\\")
        .replace('\'', "\\'");
    let mut statement = format!("UNLOAD ('{query}') TO '{s3_prefix}' {}", auth.clause());
    for option in options {
        statement.push(' ');
        statement.push_str(option);
    }
    statement.push(';');
    statement
}

/// Options of an `UNLOAD` into files of at most `max_chunk_size_mb`.
///
/// ```
/// use bi_utils::aws::redshift::{unload_options, FileFormat};
///
/// let options = unload_options::<&str>(FileFormat::Parquet, false, 100, &[]);
/// assert_eq!(options, ["PARQUET", "PARALLEL ON", "MAXFILESIZE 100 MB", "ALLOWOVERWRITE"]);
/// ```
#[must_use]
pub fn unload_options<S: AsRef<str>>(
    format: FileFormat,
    delete_s3_before: bool,
    max_chunk_size_mb: u32,
    partition_by: &[S],
) -> Vec<String> {
    let max_chunk_size = format!("MAXFILESIZE {max_chunk_size_mb} MB");
    let mut options: Vec<String> = match format {
        FileFormat::Csv => vec!["CSV".into(), "HEADER".into(), "GZIP".into(), "PARALLEL ON".into()],
        FileFormat::Parquet => vec!["PARQUET".into(), "PARALLEL ON".into()],
    };
    options.push(max_chunk_size);
    options.push(if delete_s3_before { "CLEANPATH" } else { "ALLOWOVERWRITE" }.into());
    if !partition_by.is_empty() {
        let cols: Vec<&str> = partition_by.iter().map(AsRef::as_ref).collect();
        options.push(format!("PARTITION BY ({}) INCLUDE", cols.join(", ")));
    }
    options
}

/// Where staged files live in S3.
#[derive(Debug, Clone, Copy)]
pub struct Staging<'a> {
    /// Bucket name.
    pub bucket: &'a str,
    /// Key prefix.
    pub bucket_dir: &'a str,
    /// Remove the staged objects once the transfer is done.
    pub delete_s3_after: bool,
}

/// Files written by the last `UNLOAD` of the session.
const UNLOADED_PATHS: &str =
    "SELECT TRIM(path) AS path FROM stl_unload_log WHERE query = pg_last_query_id() ORDER BY path";

/// Object keys from `stl_unload_log` paths (`s3://bucket/key`, blank padded).
fn unloaded_keys(bucket: &str, paths: &[String]) -> Vec<String> {
    let root = s3_uri(bucket, "");
    let mut keys: Vec<String> = paths
        .iter()
        .map(String::as_str)
        .map(str::trim)
        .filter(|path| !path.is_empty())
        .map(|path| path.strip_prefix(root.as_str()).unwrap_or(path).to_string())
        .collect();
    keys.sort();
    keys.dedup();
    keys
}

/// Local name of `key`: its path below `prefix` with `/` replaced by `_`, so
/// partition directories do not collide.
fn local_name(prefix: &str, key: &str) -> String {
    key.strip_prefix(prefix)
        .unwrap_or(key)
        .trim_start_matches('/')
        .replace('/', "_")
}

/// Download `keys` into `dest_dir`, then delete exactly those objects when
/// the staging asks for it.
pub(crate) async fn copy_from_s3(
    store: &dyn ObjectBackend,
    staging: Staging<'_>,
    keys: &[String],
    dest_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::with_capacity(keys.len());
    for key in keys {
        let dest = dest_dir.join(local_name(staging.bucket_dir, key));
        paths.push(store.download_file(staging.bucket, key, &dest).await?);
    }
    if staging.delete_s3_after {
        store.delete_keys(staging.bucket, keys).await?;
    }
    Ok(paths)
}

/// A warehouse connection pool plus the S3 side of `COPY`/`UNLOAD`.
#[derive(Debug, Clone)]
pub struct Redshift {
    pool: PgPool,
    store: Arc<dyn ObjectBackend>,
    auth: CopyAuth,
}

impl Redshift {
    /// Combine a pool, an object store and the S3 authorization.
    #[must_use]
    pub fn new(pool: PgPool, store: Arc<dyn ObjectBackend>, auth: CopyAuth) -> Self {
        Self { pool, store, auth }
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run one or more statements and return the affected row count.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Warehouse`] if a statement fails.
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        let result = sqlx::raw_sql(sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Upload `local_file` to S3 and `COPY` it into `table`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ObjectStore`] if staging fails and
    /// [`Error::Warehouse`] if the `COPY` fails.
    pub async fn load_and_copy(
        &self,
        local_file: &Path,
        staging: Staging<'_>,
        table: &str,
        delimiter: Option<char>,
        copy_options: &[String],
    ) -> Result<()> {
        let key = self
            .store
            .upload_file(local_file, staging.bucket, staging.bucket_dir)
            .await?;
        let statement = copy_statement(
            table,
            &s3_uri(staging.bucket, &key),
            &self.auth,
            delimiter,
            copy_options,
        );
        debug!("Running COPY into {table}");
        self.execute(&statement).await?;
        info!("Copied {key} to {table}");
        if staging.delete_s3_after {
            self.store
                .delete_keys(staging.bucket, std::slice::from_ref(&key))
                .await?;
        }
        Ok(())
    }

    /// `UNLOAD` `query` to files under `s3_prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Warehouse`] if the statement fails.
    pub async fn unload(&self, query: &str, s3_prefix: &str, options: &[String]) -> Result<()> {
        let statement = unload_statement(query, s3_prefix, &self.auth, options);
        debug!("Running UNLOAD to {s3_prefix}");
        self.execute(&statement).await?;
        Ok(())
    }

    /// `UNLOAD` `query` under the staging prefix and download the files it
    /// wrote into `dest_dir`.
    ///
    /// The written keys come from `stl_unload_log` on the same connection,
    /// so other objects under the prefix are neither downloaded nor deleted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoFiles`] if the unload produced nothing, and any
    /// warehouse or S3 error.
    pub async fn unload_and_copy(
        &self,
        query: &str,
        staging: Staging<'_>,
        dest_dir: &Path,
        options: &[String],
    ) -> Result<Vec<PathBuf>> {
        let prefix = staging.bucket_dir;
        let statement = unload_statement(query, &s3_uri(staging.bucket, prefix), &self.auth, options);
        let mut conn = self.pool.acquire().await?;
        debug!("Running UNLOAD to {prefix}");
        sqlx::raw_sql(&statement).execute(&mut *conn).await?;
        let paths: Vec<String> = sqlx::query_scalar(UNLOADED_PATHS)
            .fetch_all(&mut *conn)
            .await?;
        drop(conn);

        let keys = unloaded_keys(staging.bucket, &paths);
        if keys.is_empty() {
            return Err(Error::NoFiles {
                bucket: staging.bucket.to_string(),
                prefix: prefix.to_string(),
            });
        }
        debug!("UNLOAD wrote {} files", keys.len());
        copy_from_s3(self.store.as_ref(), staging, &keys, dest_dir).await
    }
}
