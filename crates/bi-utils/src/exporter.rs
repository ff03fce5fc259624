//! Background export queue.
//!
//! [`QueueExporter`] hands frames and files to a tokio task that saves them
//! and ships them to S3, to the warehouse, or both, so the producer never
//! waits on the network. Arguments are validated on enqueue; failures inside
//! the worker are logged and the worker moves on to the next item.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::aws::db::{self, UploadOptions};
use crate::aws::{ConnectOptions, Warehouse};
use crate::error::{Error, Result};
use crate::frame::{write_csv, write_json, write_parquet, Frame};

/// Where an exported item goes.
///
/// With S3 only the file is uploaded; with a table only the frame is
/// inserted; with both the file is staged in S3 and copied into the table.
/// With neither a frame is just saved to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportTarget {
    /// S3 bucket.
    pub s3_bucket: Option<String>,
    /// Key prefix inside the bucket.
    pub s3_bucket_dir: Option<String>,
    /// Warehouse schema.
    pub schema: Option<String>,
    /// Warehouse table.
    pub table: Option<String>,
    /// CSV field delimiter.
    pub separator: u8,
    /// Export only these frame columns.
    pub columns: Option<Vec<String>>,
    /// Partition columns; not supported for CSV and only warned about.
    pub partition_cols: Vec<String>,
    /// Remove the local file once exported.
    pub delete_file_after: bool,
    /// Remove the staged S3 object after `COPY`.
    pub delete_s3_after: bool,
    /// Secret holding the warehouse credentials.
    pub secret_id: Option<String>,
}

impl Default for ExportTarget {
    fn default() -> Self {
        Self {
            s3_bucket: None,
            s3_bucket_dir: None,
            schema: None,
            table: None,
            separator: b',',
            columns: None,
            partition_cols: Vec::new(),
            delete_file_after: false,
            delete_s3_after: false,
            secret_id: None,
        }
    }
}

impl ExportTarget {
    /// A target that only saves frames locally.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Upload to `bucket`/`bucket_dir`.
    #[must_use]
    pub fn s3(mut self, bucket: impl Into<String>, bucket_dir: impl Into<String>) -> Self {
        self.s3_bucket = Some(bucket.into());
        self.s3_bucket_dir = Some(bucket_dir.into());
        self
    }

    /// Load into `schema.table`.
    #[must_use]
    pub fn db(mut self, schema: impl Into<String>, table: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self.table = Some(table.into());
        self
    }

    /// Export only these columns of a frame.
    #[must_use]
    pub fn columns<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Remove the local file once exported.
    #[must_use]
    pub fn delete_file_after(mut self, delete: bool) -> Self {
        self.delete_file_after = delete;
        self
    }

    /// Remove the staged S3 object after `COPY`.
    #[must_use]
    pub fn delete_s3_after(mut self, delete: bool) -> Self {
        self.delete_s3_after = delete;
        self
    }

    /// Read warehouse credentials from another secret.
    #[must_use]
    pub fn secret_id(mut self, secret_id: impl Into<String>) -> Self {
        self.secret_id = Some(secret_id.into());
        self
    }

    fn s3_location(&self) -> Option<(&str, &str)> {
        Some((self.s3_bucket.as_deref()?, self.s3_bucket_dir.as_deref()?))
    }

    fn table_name(&self) -> Option<(&str, &str)> {
        Some((self.schema.as_deref()?, self.table.as_deref()?))
    }

    /// Check that the combination of arguments makes sense for `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] describing the first problem found.
    pub fn check(&self, path: &Path) -> Result<()> {
        if self.s3_bucket.is_some() != self.s3_bucket_dir.is_some() {
            return Err(Error::invalid_argument(
                "Pass both s3_bucket and s3_bucket_dir arguments for S3 export",
            ));
        }
        if self.schema.is_some() != self.table.is_some() {
            return Err(Error::invalid_argument(
                "Pass both schema and table arguments for DB export",
            ));
        }
        let to_db = self.table_name().is_some();
        let to_s3 = self.s3_location().is_some();
        if !to_db && self.delete_s3_after {
            return Err(Error::invalid_argument(
                "Only files exported to DB via S3 can be deleted from S3",
            ));
        }
        if !to_db && !to_s3 && self.delete_file_after {
            return Err(Error::invalid_argument(
                "Only files exported to DB or S3 can be deleted",
            ));
        }
        if to_db && to_s3 && !is_copyable(path) {
            return Err(Error::invalid_argument(
                "Only csv or parquet files can be exported to DB via S3",
            ));
        }
        Ok(())
    }

    fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            secret_id: self.secret_id.clone(),
            ..ConnectOptions::default()
        }
    }
}

fn lower_path(path: &Path) -> String {
    path.to_string_lossy().to_ascii_lowercase()
}

fn is_copyable(path: &Path) -> bool {
    let lower = lower_path(path);
    lower.contains(".csv") || lower.contains(".parquet")
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| "unknown".to_string(), |name| name.to_string_lossy().into_owned())
}

#[derive(Debug)]
enum Export {
    Frame {
        frame: Frame,
        path: PathBuf,
        target: ExportTarget,
    },
    File {
        path: PathBuf,
        target: ExportTarget,
    },
}

impl Export {
    fn kind(&self) -> &'static str {
        match self {
            Self::Frame { .. } => "df",
            Self::File { .. } => "file",
        }
    }

    fn path(&self) -> &Path {
        match self {
            Self::Frame { path, .. } | Self::File { path, .. } => path,
        }
    }
}

#[derive(Debug)]
enum QueueItem {
    Export(Box<Export>),
    Close,
}

/// Export queue served by its own tokio task.
///
/// Dropping an open exporter closes it; call [`join`](Self::join) to wait
/// for the queued items to finish.
#[derive(Debug)]
pub struct QueueExporter {
    name: String,
    sender: UnboundedSender<QueueItem>,
    worker: Option<JoinHandle<()>>,
    alive: bool,
}

impl QueueExporter {
    /// Spawn the worker task. Must be called inside a tokio runtime.
    pub fn start(warehouse: Arc<Warehouse>, name: impl Into<String>) -> Self {
        let name = name.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run(warehouse, name.clone(), receiver));
        Self {
            name,
            sender,
            worker: Some(worker),
            alive: true,
        }
    }

    /// Whether the queue still accepts items.
    #[must_use]
    pub fn alive(&self) -> bool {
        self.alive
    }

    /// Worker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `frame` to be saved to `path` and exported to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an inconsistent target and
    /// [`Error::ExporterClosed`] once the queue is closed.
    pub fn export_frame(&self, frame: Frame, path: impl Into<PathBuf>, target: ExportTarget) -> Result<()> {
        let path = path.into();
        target.check(&path)?;
        self.check_open()?;
        self.enqueue(Export::Frame {
            frame,
            path,
            target,
        })
    }

    /// Queue the file at `path` to be exported to `target`, which needs an
    /// S3 location.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an inconsistent target and
    /// [`Error::ExporterClosed`] once the queue is closed.
    pub fn export_file(&self, path: impl Into<PathBuf>, target: ExportTarget) -> Result<()> {
        let path = path.into();
        target.check(&path)?;
        if target.s3_location().is_none() {
            return Err(Error::invalid_argument(
                "Pass both s3_bucket and s3_bucket_dir arguments for S3 export",
            ));
        }
        self.check_open()?;
        self.enqueue(Export::File { path, target })
    }

    fn check_open(&self) -> Result<()> {
        if self.worker.as_ref().map_or(true, JoinHandle::is_finished) {
            return Err(Error::ExporterClosed(format!("Process {}", self.name)));
        }
        if !self.alive {
            return Err(Error::ExporterClosed("Queue".to_string()));
        }
        Ok(())
    }

    fn enqueue(&self, export: Export) -> Result<()> {
        self.sender
            .send(QueueItem::Export(Box::new(export)))
            .map_err(|_| Error::ExporterClosed(format!("Process {}", self.name)))
    }

    /// Stop accepting items. Items already queued are still exported.
    pub fn close(&mut self) {
        let _ = self.sender.send(QueueItem::Close);
        self.alive = false;
    }

    /// Wait for the worker to finish.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the worker task panicked.
    pub async fn join(&mut self) -> Result<()> {
        if let Some(worker) = self.worker.take() {
            worker
                .await
                .map_err(|e| Error::internal(format!("{} worker failed: {e}", self.name)))?;
        }
        Ok(())
    }
}

impl Drop for QueueExporter {
    fn drop(&mut self) {
        if self.alive {
            self.close();
        }
    }
}

async fn run(warehouse: Arc<Warehouse>, name: String, mut receiver: UnboundedReceiver<QueueItem>) {
    while let Some(item) = receiver.recv().await {
        let export = match item {
            QueueItem::Export(export) => export,
            QueueItem::Close => {
                info!("Closing {name}");
                break;
            }
        };
        let filename = display_name(export.path());
        let kind = export.kind();
        info!("Started {filename} {kind} export");
        let result = match *export {
            Export::Frame {
                frame,
                path,
                target,
            } => export_frame(&warehouse, frame, &path, &target).await,
            Export::File { path, target } => export_file(&warehouse, &path, &target).await,
        };
        match result {
            Ok(()) => info!("Finished {filename} {kind} export"),
            Err(err) => error!("Exception occurred: {err}"),
        }
    }
}

fn save_frame(frame: &Frame, path: &Path, target: &ExportTarget) -> Result<()> {
    let lower = lower_path(path);
    if lower.contains(".csv") {
        if !target.partition_cols.is_empty() {
            warn!("Partitions are not supported for csv files: {}", display_name(path));
        }
        write_csv(frame, path, target.separator)
    } else if lower.contains(".parquet") {
        if !target.partition_cols.is_empty() {
            warn!("Partitions are not supported for local parquet files: {}", display_name(path));
        }
        write_parquet(frame, path)
    } else {
        write_json(frame, path)
    }
}

async fn export_frame(wh: &Warehouse, frame: Frame, path: &Path, target: &ExportTarget) -> Result<()> {
    let frame = match &target.columns {
        Some(columns) if !columns.is_empty() => frame.select(columns.as_slice())?,
        _ => frame,
    };
    if target.s3_bucket.is_some() || target.s3_bucket_dir.is_some() || !target.delete_file_after {
        save_frame(&frame, path, target)?;
        info!("Saved df to {} ({} rows)", display_name(path), frame.len());
    }
    if target.s3_location().is_some() {
        export_file(wh, path, target).await
    } else if let Some((schema, table)) = target.table_name() {
        db::insert_frame(wh, &frame, schema, table, &target.connect_options()).await?;
        Ok(())
    } else {
        Ok(())
    }
}

async fn export_file(wh: &Warehouse, path: &Path, target: &ExportTarget) -> Result<()> {
    let (bucket, bucket_dir) = target.s3_location().ok_or_else(|| {
        Error::invalid_argument("Pass both s3_bucket and s3_bucket_dir arguments for S3 export")
    })?;
    match target.table_name() {
        Some((schema, table)) if is_copyable(path) => {
            let opts = UploadOptions {
                separator: target.separator,
                bucket: bucket.to_string(),
                bucket_dir: bucket_dir.to_string(),
                delete_s3_after: target.delete_s3_after,
                connect: target.connect_options(),
                ..wh.upload_options()
            };
            db::upload_file(wh, path, schema, table, &opts).await?;
        }
        _ => {
            wh.object_store().upload_file(path, bucket, bucket_dir).await?;
        }
    }
    if target.delete_file_after {
        tokio::fs::remove_file(path).await?;
        info!("Removed {}", display_name(path));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use aws_config::SdkConfig;

    use super::*;
    use crate::aws::StaticSecrets;
    use crate::config::Config;
    use crate::frame::read_csv;
    use crate::frame::CsvReadOptions;

    fn warehouse() -> Arc<Warehouse> {
        Arc::new(Warehouse::with_secrets(
            Config::default(),
            SdkConfig::builder().build(),
            Arc::new(StaticSecrets::new()),
        ))
    }

    fn frame() -> Frame {
        Frame::from_columns(vec![
            ("media_source", vec!["fb".into(), "google".into()]),
            ("installs", vec![10_i64.into(), 3_i64.into()]),
        ])
        .unwrap()
    }

    fn check_err(target: &ExportTarget, path: &str) -> String {
        target.check(Path::new(path)).unwrap_err().to_string()
    }

    #[test]
    fn test_check_requires_both_s3_args() {
        let target = ExportTarget {
            s3_bucket: Some("bucket".into()),
            ..ExportTarget::default()
        };
        assert_eq!(
            check_err(&target, "data.csv"),
            "Pass both s3_bucket and s3_bucket_dir arguments for S3 export"
        );
    }

    #[test]
    fn test_check_requires_both_db_args() {
        let target = ExportTarget {
            table: Some("events".into()),
            ..ExportTarget::default()
        };
        assert_eq!(
            check_err(&target, "data.csv"),
            "Pass both schema and table arguments for DB export"
        );
    }

    #[test]
    fn test_check_delete_flags() {
        let target = ExportTarget::new().s3("bucket", "dir").delete_s3_after(true);
        assert_eq!(
            check_err(&target, "data.csv"),
            "Only files exported to DB via S3 can be deleted from S3"
        );
        let target = ExportTarget::new().delete_file_after(true);
        assert_eq!(
            check_err(&target, "data.csv"),
            "Only files exported to DB or S3 can be deleted"
        );
        let target = ExportTarget::new().db("dq", "events").delete_file_after(true);
        assert!(target.check(Path::new("data.pkl")).is_ok());
    }

    #[test]
    fn test_check_db_via_s3_needs_csv_or_parquet() {
        let target = ExportTarget::new().s3("bucket", "dir").db("dq", "events");
        assert_eq!(
            check_err(&target, "data.json"),
            "Only csv or parquet files can be exported to DB via S3"
        );
        assert!(target.check(Path::new("data.CSV")).is_ok());
        assert!(target.check(Path::new("data.parquet")).is_ok());
        assert!(target.check(Path::new("data.csv.gz")).is_ok());
    }

    #[tokio::test]
    async fn test_local_frame_export() {
        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("data.csv");
        let json_path = dir.path().join("data.json");

        let mut exporter = QueueExporter::start(warehouse(), "test-exporter");
        assert!(exporter.alive());
        exporter
            .export_frame(frame(), &csv_path, ExportTarget::new().columns(["installs"]))
            .unwrap();
        exporter
            .export_frame(frame(), &json_path, ExportTarget::new())
            .unwrap();
        exporter.close();
        exporter.join().await.unwrap();

        let saved = read_csv(&csv_path, &CsvReadOptions::default()).unwrap();
        assert_eq!(saved.columns(), &["installs"]);
        assert_eq!(saved.len(), 2);
        assert_eq!(crate::frame::read_json(&json_path).unwrap(), frame());
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_items() {
        let mut exporter = QueueExporter::start(warehouse(), "test-exporter");
        exporter.close();
        assert!(!exporter.alive());

        let err = exporter
            .export_frame(frame(), "data.csv", ExportTarget::new())
            .unwrap_err();
        assert!(matches!(err, Error::ExporterClosed(_)));
        assert!(err.to_string().ends_with("is closed"));

        exporter.join().await.unwrap();
        let err = exporter
            .export_frame(frame(), "data.csv", ExportTarget::new())
            .unwrap_err();
        assert_eq!(err.to_string(), "Process test-exporter is closed");
    }

    #[tokio::test]
    async fn test_export_file_needs_s3() {
        let exporter = QueueExporter::start(warehouse(), "test-exporter");
        let err = exporter
            .export_file("data.csv", ExportTarget::new())
            .unwrap_err();
        assert!(err.to_string().contains("s3_bucket"));
    }

    #[tokio::test]
    async fn test_worker_survives_failed_items() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.csv");

        let missing = dir.path().join("missing").join("data.csv");

        let mut exporter = QueueExporter::start(warehouse(), "test-exporter");
        exporter
            .export_frame(frame(), &missing, ExportTarget::new())
            .unwrap();
        exporter
            .export_frame(frame(), &good, ExportTarget::new())
            .unwrap();
        exporter.close();
        exporter.join().await.unwrap();

        assert!(good.exists());
        assert!(!missing.exists());
    }

    #[tokio::test]
    async fn test_export_frame_as_parquet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("installs.parquet");

        let mut exporter = QueueExporter::start(warehouse(), "test-exporter");
        exporter
            .export_frame(frame(), &path, ExportTarget::new())
            .unwrap();
        exporter.close();
        exporter.join().await.unwrap();

        assert_eq!(crate::frame::read_parquet(&path).unwrap(), frame());
    }
}
