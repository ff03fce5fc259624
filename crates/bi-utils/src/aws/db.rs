//! High-level warehouse helpers.
//!
//! Uploads stage a local file in S3 and `COPY` it into a table; downloads
//! `UNLOAD` a query into S3 and fetch the produced chunks. Every helper
//! takes a [`Warehouse`] plus an options struct whose defaults come from the
//! `warehouse` configuration section.

use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{Local, NaiveDateTime};
use sqlx::{Column, Connection, Executor, Statement};
use tracing::{debug, info, warn};

use super::connection::ConnectOptions;
use super::redshift::{unload_options, FileFormat, Staging};
use super::s3::s3_uri;
use super::Warehouse;
use crate::config::WarehouseConfig;
use crate::error::{Error, Result};
use crate::files::csv_columns;
use crate::frame::{read_csv, read_parquet, write_csv, write_parquet, CsvReadOptions, DType, Frame};
use crate::retry::{retry_async, RetryPolicy};
use crate::sql::{build_set, build_where, SqlValue};

/// Rows per `INSERT` statement.
const INSERT_BATCH_SIZE: usize = 1000;

/// Options of [`upload_file`] and [`upload_data`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOptions {
    /// CSV field delimiter.
    pub separator: u8,
    /// Staging bucket.
    pub bucket: String,
    /// Staging key prefix.
    pub bucket_dir: String,
    /// Target columns. CSV uploads default to the file header.
    pub columns: Option<Vec<String>>,
    /// Remove the staged object after `COPY`.
    pub delete_s3_after: bool,
    /// Extra attempts after a failed S3 transfer.
    pub retries: u32,
    /// Stage under a fresh timestamped prefix.
    pub add_s3_timestamp_dir: bool,
    /// Remove the local file written by [`upload_data`] afterwards.
    pub remove_file: bool,
    /// Partition columns; local files are written unpartitioned with a warning.
    pub partition_cols: Vec<String>,
    /// Connection overrides.
    pub connect: ConnectOptions,
}

impl From<&WarehouseConfig> for UploadOptions {
    fn from(config: &WarehouseConfig) -> Self {
        Self {
            separator: b',',
            bucket: config.bucket.clone(),
            bucket_dir: config.bucket_dir.clone(),
            columns: None,
            delete_s3_after: config.delete_s3_after,
            retries: config.retries,
            add_s3_timestamp_dir: config.add_s3_timestamp_dir,
            remove_file: false,
            partition_cols: Vec::new(),
            connect: ConnectOptions::default(),
        }
    }
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self::from(&WarehouseConfig::default())
    }
}

impl UploadOptions {
    /// Load into these columns only.
    #[must_use]
    pub fn with_columns<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Use another CSV delimiter.
    #[must_use]
    pub fn with_separator(mut self, separator: u8) -> Self {
        self.separator = separator;
        self
    }

    /// Retry failed S3 transfers.
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Remove the written file after upload.
    #[must_use]
    pub fn with_remove_file(mut self, remove_file: bool) -> Self {
        self.remove_file = remove_file;
        self
    }

    /// Override the connection target.
    #[must_use]
    pub fn with_connect(mut self, connect: ConnectOptions) -> Self {
        self.connect = connect;
        self
    }
}

/// Options of [`download_files`] and [`download_data`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOptions {
    /// Local directory for the chunks; `None` is the working directory.
    pub data_dir: Option<PathBuf>,
    /// Format of the unloaded files.
    pub format: FileFormat,
    /// Staging bucket.
    pub bucket: String,
    /// Staging key prefix.
    pub bucket_dir: String,
    /// Clean the prefix before unloading.
    pub delete_s3_before: bool,
    /// Remove the unloaded objects after download.
    pub delete_s3_after: bool,
    /// Extra attempts after a failed S3 transfer.
    pub retries: u32,
    /// Maximum size of one unloaded file.
    pub max_chunk_size_mb: u32,
    /// Download into a fresh timestamped directory.
    pub add_timestamp_dir: bool,
    /// Unload under a fresh timestamped prefix.
    pub add_s3_timestamp_dir: bool,
    /// Remove the downloaded files once [`download_data`] read them.
    pub remove_files: bool,
    /// Connection overrides.
    pub connect: ConnectOptions,
}

impl From<&WarehouseConfig> for DownloadOptions {
    fn from(config: &WarehouseConfig) -> Self {
        Self {
            data_dir: Some(config.temp_dir.clone()),
            format: FileFormat::Csv,
            bucket: config.bucket.clone(),
            bucket_dir: config.bucket_dir.clone(),
            delete_s3_before: false,
            delete_s3_after: config.delete_s3_after,
            retries: config.retries,
            max_chunk_size_mb: config.max_chunk_size_mb,
            add_timestamp_dir: config.add_timestamp_dir,
            add_s3_timestamp_dir: config.add_s3_timestamp_dir,
            remove_files: true,
            connect: ConnectOptions::default(),
        }
    }
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self::from(&WarehouseConfig::default())
    }
}

impl DownloadOptions {
    /// Download into `data_dir`.
    #[must_use]
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(data_dir.into());
        self
    }

    /// Unload in another format.
    #[must_use]
    pub fn with_format(mut self, format: FileFormat) -> Self {
        self.format = format;
        self
    }

    /// Retry failed S3 transfers.
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Override the connection target.
    #[must_use]
    pub fn with_connect(mut self, connect: ConnectOptions) -> Self {
        self.connect = connect;
        self
    }
}

/// Options of [`unload_data`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnloadOptions {
    /// Format of the unloaded files.
    pub format: FileFormat,
    /// Target bucket.
    pub bucket: String,
    /// Target key prefix.
    pub bucket_dir: String,
    /// Clean the prefix before unloading.
    pub delete_s3_before: bool,
    /// Maximum size of one unloaded file.
    pub max_chunk_size_mb: u32,
    /// Partition columns.
    pub partition_by: Vec<String>,
    /// Connection overrides.
    pub connect: ConnectOptions,
}

impl From<&WarehouseConfig> for UnloadOptions {
    fn from(config: &WarehouseConfig) -> Self {
        Self {
            format: FileFormat::Csv,
            bucket: config.bucket.clone(),
            bucket_dir: config.bucket_dir.clone(),
            delete_s3_before: false,
            max_chunk_size_mb: config.max_chunk_size_mb,
            partition_by: Vec::new(),
            connect: ConnectOptions::default(),
        }
    }
}

impl Default for UnloadOptions {
    fn default() -> Self {
        Self::from(&WarehouseConfig::default())
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |name| name.to_string_lossy().into_owned())
}

fn with_trailing_slash(dir: &str) -> String {
    if dir.ends_with('/') {
        dir.to_string()
    } else {
        format!("{dir}/")
    }
}

/// `schema.table`, followed by a column list when there is one.
fn copy_target(schema: &str, table: &str, columns: &[String]) -> String {
    if columns.is_empty() {
        format!("{schema}.{table}")
    } else {
        format!("{schema}.{table} ({})", columns.join(","))
    }
}

fn timestamp_name(now: NaiveDateTime) -> String {
    now.format("%Y-%m-%d_%H-%M-%S_%6f").to_string()
}

/// Append a directory named after the current local time (to the
/// microsecond) plus `postfix`. `posix` joins with `/` regardless of the
/// platform, as S3 keys need.
#[must_use]
pub fn add_timestamp_dir(dir: &str, postfix: &str, posix: bool) -> String {
    join_timestamp(dir, &timestamp_name(Local::now().naive_local()), postfix, posix)
}

fn join_timestamp(dir: &str, timestamp: &str, postfix: &str, posix: bool) -> String {
    let name = format!("{timestamp}{postfix}");
    if !posix {
        return Path::new(dir).join(name).to_string_lossy().into_owned();
    }
    if dir.is_empty() || dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|source| Error::DirectoryCreate {
        path: path.to_path_buf(),
        source,
    })
}

/// Upload a CSV or parquet file to S3 and `COPY` it into `schema.table`.
///
/// # Errors
///
/// Returns [`Error::UnsupportedFormat`] for other extensions, and any S3 or
/// warehouse error once the retries are spent.
pub async fn upload_file(
    wh: &Warehouse,
    path: &Path,
    schema: &str,
    table: &str,
    opts: &UploadOptions,
) -> Result<()> {
    let filename = display_name(path);
    let lower = filename.to_ascii_lowercase();
    let explicit = opts.columns.clone().filter(|cols| !cols.is_empty());
    let (copy_options, delimiter, columns) = if lower.ends_with(".csv") {
        let columns = match explicit {
            Some(columns) => columns,
            None => csv_columns(path, opts.separator)?,
        };
        let options = vec!["CSV".to_string(), "IGNOREHEADER 1".to_string()];
        (options, Some(char::from(opts.separator)), columns)
    } else if lower.ends_with(".parquet") {
        (vec!["PARQUET".to_string()], None, explicit.unwrap_or_default())
    } else {
        return Err(Error::UnsupportedFormat(filename));
    };
    let target = copy_target(schema, table, &columns);
    let bucket_dir = if opts.add_s3_timestamp_dir {
        add_timestamp_dir(&opts.bucket_dir, "", true)
    } else {
        with_trailing_slash(&opts.bucket_dir)
    };

    let redshift = wh.redshift(&opts.connect).await?;
    let staging = Staging {
        bucket: &opts.bucket,
        bucket_dir: &bucket_dir,
        delete_s3_after: opts.delete_s3_after,
    };
    let redshift = &redshift;
    let target = target.as_str();
    let copy_options = copy_options.as_slice();
    let attempts = AtomicU32::new(0);
    let attempts = &attempts;
    retry_async(RetryPolicy::new(opts.retries), Error::is_object_store, move || {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst);
        if attempt > 0 {
            warn!("Failed upload attempt #{attempt}");
        }
        redshift.load_and_copy(path, staging, target, delimiter, copy_options)
    })
    .await?;
    info!("{filename} is uploaded to {schema}.{table}");
    Ok(())
}

/// `UNLOAD` `query` through S3 and download the produced files.
///
/// Returns the local files this unload wrote, sorted, or nothing if the
/// query unloaded no files.
///
/// # Errors
///
/// Returns any S3 or warehouse error once the retries are spent.
pub async fn download_files(wh: &Warehouse, query: &str, opts: &DownloadOptions) -> Result<Vec<PathBuf>> {
    let options = unload_options::<&str>(opts.format, opts.delete_s3_before, opts.max_chunk_size_mb, &[]);
    let bucket_dir = if opts.add_s3_timestamp_dir {
        add_timestamp_dir(&opts.bucket_dir, "/", true)
    } else {
        with_trailing_slash(&opts.bucket_dir)
    };
    let base_dir = match &opts.data_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let data_dir = if opts.add_timestamp_dir {
        PathBuf::from(add_timestamp_dir(&base_dir.to_string_lossy(), "", false))
    } else {
        base_dir
    };
    if !data_dir.exists() {
        create_dir(&data_dir)?;
    }

    let redshift = wh.redshift(&opts.connect).await?;
    let staging = Staging {
        bucket: &opts.bucket,
        bucket_dir: &bucket_dir,
        delete_s3_after: opts.delete_s3_after,
    };
    let redshift = &redshift;
    let data_dir = data_dir.as_path();
    let options = options.as_slice();
    let files = download_retrying(opts.retries, move || {
        redshift.unload_and_copy(query, staging, data_dir, options)
    })
    .await?;
    if !files.is_empty() {
        info!("Data is downloaded to {} files", opts.format);
    }
    Ok(files)
}

/// Run `transfer`, retrying on S3 errors. An unload that wrote no files
/// yields an empty list.
async fn download_retrying<F, Fut>(retries: u32, mut transfer: F) -> Result<Vec<PathBuf>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<PathBuf>>>,
{
    let mut attempt = 0;
    let result = retry_async(RetryPolicy::new(retries), Error::is_object_store, || {
        if attempt > 0 {
            warn!("Failed download attempt #{attempt}");
        }
        attempt += 1;
        transfer()
    })
    .await;
    match result {
        Ok(mut files) => {
            files.sort();
            Ok(files)
        }
        Err(err) if err.is_no_files() => {
            debug!("{err}");
            Ok(Vec::new())
        }
        Err(err) => Err(err),
    }
}

/// Save `frame` as CSV or parquet to `path` and upload it into
/// `schema.table`.
///
/// # Errors
///
/// Returns [`Error::UnsupportedFormat`] unless `path` is a `.csv` or
/// `.parquet` file, and any error from writing or [`upload_file`].
pub async fn upload_data(
    wh: &Warehouse,
    frame: &Frame,
    path: &Path,
    schema: &str,
    table: &str,
    opts: &UploadOptions,
) -> Result<()> {
    let filename = display_name(path);
    let lower = filename.to_ascii_lowercase();
    let is_parquet = lower.ends_with(".parquet");
    if !is_parquet && !lower.ends_with(".csv") {
        return Err(Error::UnsupportedFormat(filename));
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            create_dir(parent)?;
        }
    }
    let selected;
    let frame = match &opts.columns {
        Some(columns) if !columns.is_empty() => {
            selected = frame.select(columns)?;
            &selected
        }
        _ => frame,
    };
    if !opts.partition_cols.is_empty() {
        warn!("Partitions are not supported for local files: {filename}");
    }
    if is_parquet {
        write_parquet(frame, path)?;
    } else {
        write_csv(frame, path, opts.separator)?;
    }
    info!("Data is saved to {filename} ({} rows)", frame.len());

    let upload_opts = UploadOptions {
        columns: Some(frame.columns().to_vec()),
        ..opts.clone()
    };
    upload_file(wh, path, schema, table, &upload_opts).await?;
    if opts.remove_file {
        fs::remove_file(path)?;
        info!("{filename} is removed");
    }
    Ok(())
}

/// Download the result of `query` into one frame.
///
/// An unload that produced no files yields an empty frame.
///
/// # Errors
///
/// Returns any error from [`download_files`] or [`read_files`].
pub async fn download_data(
    wh: &Warehouse,
    query: &str,
    opts: &DownloadOptions,
    read: &CsvReadOptions,
) -> Result<Frame> {
    let files = download_files(wh, query, opts).await?;
    if files.is_empty() {
        return Ok(Frame::default());
    }
    read_files(files, read, opts.remove_files)
}

/// Download the result of `query` as a lazy sequence of frames, one per
/// non-empty file.
///
/// An unload that produced no files yields a single empty frame.
///
/// # Errors
///
/// Returns any error from [`download_files`].
pub async fn download_data_chunked(
    wh: &Warehouse,
    query: &str,
    opts: &DownloadOptions,
    read: &CsvReadOptions,
) -> Result<Chunks> {
    let files = download_files(wh, query, opts).await?;
    if files.is_empty() {
        return Ok(Chunks::single(Frame::default()));
    }
    read_chunks(files, read, opts.remove_files)
}

/// `UNLOAD` `query` to S3 without downloading. Returns the `s3://` prefix.
///
/// # Errors
///
/// Returns any warehouse error.
pub async fn unload_data(wh: &Warehouse, query: &str, opts: &UnloadOptions) -> Result<String> {
    let options = unload_options(
        opts.format,
        opts.delete_s3_before,
        opts.max_chunk_size_mb,
        &opts.partition_by,
    );
    let prefix = s3_uri(&opts.bucket, &with_trailing_slash(&opts.bucket_dir));
    let redshift = wh.redshift(&opts.connect).await?;
    redshift.unload(query, &prefix, &options).await?;
    info!("Data is unloaded to {prefix}");
    Ok(prefix)
}

/// Files to read: one file, every file of a directory, or a list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSet {
    /// A single file or a directory.
    Path(PathBuf),
    /// Explicit files.
    List(Vec<PathBuf>),
}

impl From<PathBuf> for FileSet {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&Path> for FileSet {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

impl From<&str> for FileSet {
    fn from(path: &str) -> Self {
        Self::Path(PathBuf::from(path))
    }
}

impl From<Vec<PathBuf>> for FileSet {
    fn from(files: Vec<PathBuf>) -> Self {
        Self::List(files)
    }
}

impl FileSet {
    /// The files and the directory holding them.
    fn resolve(self) -> Result<(Vec<PathBuf>, Option<PathBuf>)> {
        match self {
            Self::Path(path) if path.is_file() => {
                let dir = path.parent().map(Path::to_path_buf);
                Ok((vec![path], dir))
            }
            Self::Path(dir) => {
                let mut files = Vec::new();
                for entry in fs::read_dir(&dir)? {
                    let path = entry?.path();
                    if path.is_file() {
                        files.push(path);
                    }
                }
                files.sort();
                Ok((files, Some(dir)))
            }
            Self::List(files) => {
                let dir = files.first().and_then(|f| f.parent()).map(Path::to_path_buf);
                Ok((files, dir))
            }
        }
    }
}

fn read_chunk(path: &Path, options: &CsvReadOptions) -> Result<Frame> {
    let lower = display_name(path).to_ascii_lowercase();
    if lower.ends_with(".csv") || lower.ends_with(".gz") {
        read_csv(path, options)
    } else if lower.ends_with(".parquet") {
        read_parquet(path)
    } else {
        Err(Error::UnsupportedFormat(display_name(path)))
    }
}

/// Lazy reader over downloaded chunks.
///
/// Empty chunks are skipped. With cleanup enabled each file is removed once
/// read, and the directory is removed when the reader is exhausted or
/// dropped.
#[derive(Debug)]
pub struct Chunks {
    files: std::vec::IntoIter<PathBuf>,
    options: CsvReadOptions,
    temp_dir: Option<PathBuf>,
    index: usize,
    pending: Option<Frame>,
}

impl Chunks {
    fn single(frame: Frame) -> Self {
        Self {
            files: Vec::new().into_iter(),
            options: CsvReadOptions::default(),
            temp_dir: None,
            index: 0,
            pending: Some(frame),
        }
    }

    fn cleanup(&mut self) {
        if let Some(dir) = self.temp_dir.take() {
            let _ = fs::remove_dir_all(dir);
        }
    }
}

impl Iterator for Chunks {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(frame) = self.pending.take() {
            return Some(Ok(frame));
        }
        loop {
            let Some(path) = self.files.next() else {
                self.cleanup();
                return None;
            };
            self.index += 1;
            let chunk = read_chunk(&path, &self.options);
            if self.temp_dir.is_some() {
                if let Err(err) = fs::remove_file(&path) {
                    warn!("Failed to remove {}: {err}", path.display());
                }
            }
            match chunk {
                Ok(frame) if frame.is_empty() => debug!("Chunk #{} is empty", self.index),
                Ok(frame) => {
                    debug!("Loaded chunk #{}", self.index);
                    return Some(Ok(frame));
                }
                Err(err) => {
                    self.files = Vec::new().into_iter();
                    self.cleanup();
                    return Some(Err(err));
                }
            }
        }
    }
}

impl Drop for Chunks {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Lazily read CSV (optionally gzipped) or parquet chunks.
///
/// With `remove_dir` the files and their directory are deleted as they are
/// consumed.
///
/// # Errors
///
/// Returns an error if a directory cannot be listed.
pub fn read_chunks(
    files: impl Into<FileSet>,
    options: &CsvReadOptions,
    remove_dir: bool,
) -> Result<Chunks> {
    let (files, dir) = files.into().resolve()?;
    Ok(Chunks {
        files: files.into_iter(),
        options: options.clone(),
        temp_dir: if remove_dir { dir } else { None },
        index: 0,
        pending: None,
    })
}

/// Read CSV or parquet chunks into one frame.
///
/// Chunks are concatenated and then cast to `options.dtype`, with the
/// `parse_bools` columns as booleans. No files (or only empty ones) yield an
/// empty frame.
///
/// # Errors
///
/// Returns an error if a file cannot be read or parsed, the chunks have
/// different columns, or a cast fails.
pub fn read_files(
    files: impl Into<FileSet>,
    options: &CsvReadOptions,
    remove_dir: bool,
) -> Result<Frame> {
    let chunks = read_chunks(files, options, remove_dir)?.collect::<Result<Vec<_>>>()?;
    if chunks.is_empty() {
        return Ok(Frame::default());
    }
    let mut dtypes = options.dtype.clone();
    for col in &options.parse_bools {
        dtypes.insert(col.clone(), DType::Bool);
    }
    let frame = Frame::concat(chunks)?.astype(&dtypes)?;
    info!("Data is loaded from files ({} rows)", frame.len());
    Ok(frame)
}

/// Run `UPDATE schema.table SET .. WHERE ..` and return the affected rows.
///
/// # Errors
///
/// Returns an error if `set` is empty or holds a list, or the statement fails.
pub async fn update(
    wh: &Warehouse,
    table: &str,
    schema: &str,
    set: &[(&str, SqlValue)],
    conditions: &[(&str, SqlValue)],
    opts: &ConnectOptions,
) -> Result<u64> {
    let query = format!(
        "UPDATE {schema}.{table} {} {}",
        build_set(set)?,
        build_where(conditions)
    );
    let mut conn = wh.connect(&opts.clone().with_schema(schema)).await?;
    let result = sqlx::raw_sql(&query).execute(&mut conn).await?;
    info!("Updated data in {schema}.{table}");
    Ok(result.rows_affected())
}

/// Run `DELETE FROM schema.table WHERE ..` and return the affected rows.
///
/// Scalars match by equality and lists by `IN`.
///
/// # Errors
///
/// Returns an error if no condition is given or the statement fails.
pub async fn delete(
    wh: &Warehouse,
    table: &str,
    schema: &str,
    conditions: &[(&str, SqlValue)],
    opts: &ConnectOptions,
) -> Result<u64> {
    if conditions.is_empty() {
        return Err(Error::invalid_argument(
            "Pass at least 1 equal condition as keyword argument",
        ));
    }
    let query = format!("DELETE FROM {schema}.{table} {}", build_where(conditions));
    let mut conn = wh.connect(&opts.clone().with_schema(schema)).await?;
    let result = sqlx::raw_sql(&query).execute(&mut conn).await?;
    info!("Deleted data from {schema}.{table}");
    Ok(result.rows_affected())
}

/// Column names of `schema.table` in ordinal order.
///
/// # Errors
///
/// Returns an error if the table does not exist or the connection fails.
pub async fn get_columns(
    wh: &Warehouse,
    table: &str,
    schema: &str,
    opts: &ConnectOptions,
) -> Result<Vec<String>> {
    let query = format!("SELECT * FROM {schema}.{table} LIMIT 0");
    let mut conn = wh.connect(&opts.clone().with_schema(schema)).await?;
    let statement = (&mut conn).prepare(&query).await?;
    Ok(statement
        .columns()
        .iter()
        .map(|col| col.name().to_string())
        .collect())
}

/// Multi-row `INSERT` statements appending `frame` to `schema.table`.
#[must_use]
pub fn insert_statements(schema: &str, table: &str, frame: &Frame) -> Vec<String> {
    let columns = frame.columns().join(", ");
    frame
        .rows()
        .chunks(INSERT_BATCH_SIZE)
        .map(|batch| {
            let values: Vec<String> = batch
                .iter()
                .map(|row| {
                    let literals: Vec<String> =
                        row.iter().map(|v| SqlValue::from(v).to_string()).collect();
                    format!("({})", literals.join(", "))
                })
                .collect();
            format!(
                "INSERT INTO {schema}.{table} ({columns}) VALUES {}",
                values.join(", ")
            )
        })
        .collect()
}

/// Append `frame` to `schema.table` in one transaction.
///
/// # Errors
///
/// Returns an error if the connection or a statement fails; nothing is
/// inserted then.
pub async fn insert_frame(
    wh: &Warehouse,
    frame: &Frame,
    schema: &str,
    table: &str,
    opts: &ConnectOptions,
) -> Result<u64> {
    if frame.is_empty() {
        return Ok(0);
    }
    let mut conn = wh.connect(opts).await?;
    let mut tx = conn.begin().await?;
    let mut inserted = 0;
    for statement in insert_statements(schema, table, frame) {
        inserted += (&mut *tx).execute(sqlx::raw_sql(&statement)).await?.rows_affected();
    }
    tx.commit().await?;
    info!("Inserted {inserted} rows into {schema}.{table}");
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::write::GzEncoder;
    use flate2::Compression;

    use super::*;
    use crate::aws::redshift::copy_from_s3;
    use crate::aws::s3::testing::MemoryBackend;
    use crate::frame::Value;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_copy_target() {
        assert_eq!(copy_target("dq", "events", &[]), "dq.events");
        let cols = vec!["a".to_string(), "b".to_string()];
        assert_eq!(copy_target("dq", "events", &cols), "dq.events (a,b)");
    }

    #[test]
    fn test_timestamp_dir() {
        let now = NaiveDateTime::parse_from_str("2021-03-04 05:06:07.000089", "%Y-%m-%d %H:%M:%S%.f")
            .unwrap();
        let name = timestamp_name(now);
        assert_eq!(name, "2021-03-04_05-06-07_000089");
        assert_eq!(join_timestamp("dwh/temp", &name, "/", true), format!("dwh/temp/{name}/"));
        assert_eq!(join_timestamp("dwh/temp/", &name, "", true), format!("dwh/temp/{name}"));
        assert_eq!(join_timestamp("", &name, "", true), name);
    }

    #[test]
    fn test_add_timestamp_dir_local() {
        let dir = add_timestamp_dir("/tmp", "", false);
        let name = Path::new(&dir).file_name().unwrap().to_string_lossy().into_owned();
        assert!(dir.starts_with("/tmp"));
        assert_eq!(name.len(), "2021-03-04_05-06-07_000089".len());
    }

    #[test]
    fn test_with_trailing_slash() {
        assert_eq!(with_trailing_slash("dwh/temp"), "dwh/temp/");
        assert_eq!(with_trailing_slash("dwh/temp/"), "dwh/temp/");
    }

    #[test]
    fn test_options_from_config() {
        let mut config = WarehouseConfig::default();
        config.retries = 3;
        config.add_timestamp_dir = false;
        let upload = UploadOptions::from(&config);
        assert_eq!(upload.retries, 3);
        assert_eq!(upload.separator, b',');
        let download = DownloadOptions::from(&config);
        assert_eq!(download.data_dir, Some(PathBuf::from("/tmp")));
        assert!(!download.add_timestamp_dir);
        assert!(download.remove_files);
        assert_eq!(UnloadOptions::default().max_chunk_size_mb, 6000);
    }

    #[test]
    fn test_read_files_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "0000_part_00", "media_source,installs\nfb,10\n");
        write(dir.path(), "0001_part_00", "media_source,installs\n");
        write(dir.path(), "0002_part_00.csv", "media_source,installs\ngoogle,3\n");

        let frame = read_files(dir.path(), &CsvReadOptions::default(), false);
        // extensionless chunks are not CSV
        assert!(matches!(frame, Err(Error::UnsupportedFormat(_))));

        fs::rename(dir.path().join("0000_part_00"), dir.path().join("0000_part_00.csv")).unwrap();
        fs::rename(dir.path().join("0001_part_00"), dir.path().join("0001_part_00.csv")).unwrap();
        let frame = read_files(dir.path(), &CsvReadOptions::default(), false).unwrap();
        assert_eq!(frame.len(), 2);
        assert_eq!(frame.rows()[0][0], Value::from("fb"));
        assert_eq!(frame.rows()[1][1], Value::Int(3));
    }

    #[test]
    fn test_read_files_parquet_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let chunk = |media_source: &str, installs: i64| {
            Frame::from_columns(vec![
                ("media_source", vec![media_source.into()]),
                ("installs", vec![installs.into()]),
            ])
            .unwrap()
        };
        write_parquet(&chunk("fb", 10), dir.path().join("0000_part_00.parquet")).unwrap();
        write_parquet(&chunk("google", 3), dir.path().join("0001_part_00.parquet")).unwrap();

        let options = CsvReadOptions::default().with_dtype("installs", DType::Float);
        let frame = read_files(dir.path(), &options, false).unwrap();
        assert_eq!(frame.len(), 2);
        assert_eq!(frame.rows()[1][0], Value::from("google"));
        assert_eq!(frame.rows()[0][1], Value::Float(10.0));
    }

    #[test]
    fn test_read_files_gzip_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let chunk_dir = dir.path().join("chunks");
        fs::create_dir(&chunk_dir).unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"is_paid,revenue\nt,1.5\nf,\n").unwrap();
        fs::write(chunk_dir.join("0000_part_00.gz"), encoder.finish().unwrap()).unwrap();

        let options = CsvReadOptions::default().with_parse_bools(["is_paid"]);
        let frame = read_files(chunk_dir.clone(), &options, true).unwrap();
        assert_eq!(frame.len(), 2);
        assert_eq!(frame.rows()[0][0], Value::Bool(true));
        assert_eq!(frame.rows()[1][1], Value::Null);
        assert!(!chunk_dir.exists());
    }

    #[test]
    fn test_read_files_empty() {
        let dir = tempfile::tempdir().unwrap();
        let frame = read_files(Vec::<PathBuf>::new(), &CsvReadOptions::default(), false).unwrap();
        assert!(frame.is_empty());

        write(dir.path(), "empty.csv", "a,b\n");
        let frame = read_files(dir.path(), &CsvReadOptions::default(), false).unwrap();
        assert!(frame.is_empty());
    }

    #[test]
    fn test_read_files_casts_dtype() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), "data.csv", "version,ltv\n1,2\n2,3\n");
        let options = CsvReadOptions::default().with_dtype("ltv", DType::Float);
        let frame = read_files(file, &options, false).unwrap();
        assert_eq!(frame.rows()[0][1], Value::Float(2.0));
        assert_eq!(frame.rows()[0][0], Value::Int(1));
    }

    #[test]
    fn test_read_chunks_skips_empty_and_drops_dir() {
        let dir = tempfile::tempdir().unwrap();
        let chunk_dir = dir.path().join("chunks");
        fs::create_dir(&chunk_dir).unwrap();
        let files = vec![
            write(&chunk_dir, "0000_part_00.csv", "a\n1\n"),
            write(&chunk_dir, "0001_part_00.csv", "a\n"),
            write(&chunk_dir, "0002_part_00.csv", "a\n2\n"),
        ];

        let mut chunks = read_chunks(files, &CsvReadOptions::default(), true).unwrap();
        let first = chunks.next().unwrap().unwrap();
        assert_eq!(first.len(), 1);
        assert!(!chunk_dir.join("0000_part_00.csv").exists());
        drop(chunks);
        assert!(!chunk_dir.exists());
    }

    #[test]
    fn test_single_chunk() {
        let chunks: Vec<Frame> = Chunks::single(Frame::default())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_empty());
    }

    fn seeded_store(failing_downloads: u32) -> (MemoryBackend, Vec<String>) {
        let store = MemoryBackend::new().fail_downloads(failing_downloads);
        store.put("bucket", "dwh/temp/job/0001_part_00.gz", b"b");
        store.put("bucket", "dwh/temp/job/0000_part_00.gz", b"a");
        let keys = vec![
            "dwh/temp/job/0001_part_00.gz".to_string(),
            "dwh/temp/job/0000_part_00.gz".to_string(),
        ];
        (store, keys)
    }

    const STAGING: Staging<'static> = Staging {
        bucket: "bucket",
        bucket_dir: "dwh/temp/job/",
        delete_s3_after: true,
    };

    #[tokio::test]
    async fn test_download_retrying_recovers_from_failed_download() {
        let (store, keys) = seeded_store(1);
        let dir = tempfile::tempdir().unwrap();
        let (store_ref, keys_ref, dest) = (&store, keys.as_slice(), dir.path());

        let files = download_retrying(2, move || copy_from_s3(store_ref, STAGING, keys_ref, dest))
            .await
            .unwrap();

        assert_eq!(
            files,
            [dest.join("0000_part_00.gz"), dest.join("0001_part_00.gz")]
        );
        assert_eq!(store.downloads.load(Ordering::SeqCst), 3);
        assert!(store.keys("bucket").is_empty());
    }

    #[tokio::test]
    async fn test_download_retrying_gives_up() {
        let (store, keys) = seeded_store(5);
        let dir = tempfile::tempdir().unwrap();
        let (store_ref, keys_ref, dest) = (&store, keys.as_slice(), dir.path());

        let err = download_retrying(1, move || copy_from_s3(store_ref, STAGING, keys_ref, dest))
            .await
            .unwrap_err();

        assert!(err.is_object_store());
        assert_eq!(store.downloads.load(Ordering::SeqCst), 2);
        assert_eq!(store.keys("bucket").len(), 2);
    }

    #[tokio::test]
    async fn test_download_retrying_no_files_is_empty() {
        let files = download_retrying(2, || async {
            Err(Error::NoFiles {
                bucket: "bucket".to_string(),
                prefix: "dwh/temp/job/".to_string(),
            })
        })
        .await
        .unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn test_insert_statements() {
        let frame = Frame::from_columns(vec![
            ("name", vec!["O'Brien".into(), Value::Null]),
            ("score", vec![1_i64.into(), 2.5.into()]),
        ])
        .unwrap();
        let statements = insert_statements("dq", "scores", &frame);
        assert_eq!(
            statements,
            ["INSERT INTO dq.scores (name, score) VALUES ('O''Brien', 1), (NULL, 2.5)"]
        );
    }

    #[test]
    fn test_insert_statements_batches() {
        let rows: Vec<Value> = (0..2500_i64).map(Value::from).collect();
        let frame = Frame::from_columns(vec![("id", rows)]).unwrap();
        assert_eq!(insert_statements("dq", "ids", &frame).len(), 3);
    }
}
