//! S3 transfers.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Files above this size are uploaded in parts.
pub const DEFAULT_PART_SIZE: u64 = 8 * 1024 * 1024;

/// S3 rejects smaller parts (except the last one).
const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

const UPDATE_FREQ: u64 = 10;

/// Thread-safe transfer progress printed to stdout.
///
/// Only every 10th update and the final one are printed, and the final one
/// ends the line.
#[derive(Debug)]
pub struct Progress {
    total: u64,
    state: Mutex<ProgressState>,
}

#[derive(Debug, Default)]
struct ProgressState {
    seen: u64,
    updates: u64,
}

impl Progress {
    /// Track a transfer of `total` bytes.
    #[must_use]
    pub fn new(total: u64) -> Self {
        Self {
            total,
            state: Mutex::new(ProgressState::default()),
        }
    }

    /// Record `bytes` more transferred bytes and return the line to print,
    /// if this update prints one.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn update(&self, bytes: u64) -> Option<String> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.seen = state.seen.saturating_add(bytes);
        state.updates += 1;
        let done = state.seen >= self.total;
        if state.updates % UPDATE_FREQ != 0 && !done {
            return None;
        }
        let ratio = if done {
            1.0
        } else {
            state.seen as f64 / self.total as f64
        };
        let bar = "#".repeat((ratio * 10.0) as usize);
        let mut line = format!("\rTransferring [{bar}] {:.0}%", ratio * 100.0);
        if done {
            line.push('\n');
        }
        Some(line)
    }

    /// [`update`](Self::update) and print the line, if any.
    pub fn report(&self, bytes: u64) {
        if let Some(line) = self.update(bytes) {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(line.as_bytes());
            let _ = stdout.flush();
        }
    }
}

/// Key of `filename` inside `bucket_dir`.
#[must_use]
pub fn object_key(bucket_dir: &str, filename: &str) -> String {
    let dir = bucket_dir.trim_end_matches('/');
    if dir.is_empty() {
        filename.to_string()
    } else {
        format!("{dir}/{filename}")
    }
}

/// `s3://` URI of an object or prefix.
#[must_use]
pub fn s3_uri(bucket: &str, key: &str) -> String {
    format!("s3://{bucket}/{key}")
}

fn file_name(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| Error::invalid_argument(format!("{} has no file name", path.display())))
}

/// Object storage operations behind the warehouse transfers.
///
/// [`ObjectStore`] talks to S3. Tests swap in an in-memory backend.
#[async_trait]
pub trait ObjectBackend: Send + Sync + fmt::Debug {
    /// Upload a local file to `bucket_dir/<file name>` and return the key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ObjectStore`] if the transfer fails, or an I/O error
    /// if the file cannot be read.
    async fn upload_file(&self, path: &Path, bucket: &str, bucket_dir: &str) -> Result<String>;

    /// Download an object. If `dest` is a directory the object keeps its
    /// file name inside it. Returns the written path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ObjectStore`] if the transfer fails, or an I/O error
    /// if the file cannot be written.
    async fn download_file(&self, bucket: &str, key: &str, dest: &Path) -> Result<PathBuf>;

    /// Keys of every object under `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ObjectStore`] if the listing fails.
    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;

    /// Delete the given objects.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ObjectStore`] on the first failed deletion.
    async fn delete_keys(&self, bucket: &str, keys: &[String]) -> Result<()>;
}

/// Thin wrapper over the S3 client.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    client: Client,
    part_size: u64,
}

impl ObjectStore {
    /// Wrap an existing client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            part_size: DEFAULT_PART_SIZE,
        }
    }

    /// Build a client from a resolved SDK config. Path-style addressing is
    /// needed by most S3-compatible stores behind a custom endpoint.
    #[must_use]
    pub fn from_sdk_config(sdk_config: &SdkConfig, force_path_style: bool) -> Self {
        let conf = aws_sdk_s3::config::Builder::from(sdk_config)
            .force_path_style(force_path_style)
            .build();
        Self::new(Client::from_conf(conf))
    }

    /// Set the multipart threshold and part size (at least 5 MiB).
    #[must_use]
    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size.max(MIN_PART_SIZE);
        self
    }

    async fn upload_multipart(
        &self,
        path: &Path,
        bucket: &str,
        key: &str,
        progress: &Progress,
    ) -> Result<()> {
        let upload = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                Error::object_store("create_multipart_upload", key, DisplayErrorContext(e))
            })?;
        let upload_id = upload
            .upload_id()
            .ok_or_else(|| Error::object_store("create_multipart_upload", key, "no upload id"))?
            .to_string();

        let parts = match self
            .upload_parts(path, bucket, key, &upload_id, progress)
            .await
        {
            Ok(parts) => parts,
            Err(err) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        "Failed to abort upload of {key}: {}",
                        DisplayErrorContext(abort_err)
                    );
                }
                return Err(err);
            }
        };

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| {
                Error::object_store("complete_multipart_upload", key, DisplayErrorContext(e))
            })?;
        Ok(())
    }

    async fn upload_parts(
        &self,
        path: &Path,
        bucket: &str,
        key: &str,
        upload_id: &str,
        progress: &Progress,
    ) -> Result<Vec<CompletedPart>> {
        let part_size = usize::try_from(self.part_size)
            .map_err(|_| Error::internal("part size does not fit in memory"))?;
        let mut file = File::open(path).await?;
        let mut parts = Vec::new();
        let mut part_number: i32 = 1;
        loop {
            let mut buf = vec![0_u8; part_size];
            let filled = read_part(&mut file, &mut buf).await?;
            if filled == 0 {
                break;
            }
            buf.truncate(filled);
            let output = self
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(buf))
                .send()
                .await
                .map_err(|e| Error::object_store("upload_part", key, DisplayErrorContext(e)))?;
            debug!("Uploaded part #{part_number} of {key}");
            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(output.e_tag().map(str::to_string))
                    .build(),
            );
            progress.report(filled as u64);
            part_number += 1;
        }
        Ok(parts)
    }
}

#[async_trait]
impl ObjectBackend for ObjectStore {
    /// Upload a local file to `bucket_dir/<file name>` and return the key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ObjectStore`] if a request fails, or an I/O error if
    /// the file cannot be read.
    async fn upload_file(&self, path: &Path, bucket: &str, bucket_dir: &str) -> Result<String> {
        let filename = file_name(path)?;
        let key = object_key(bucket_dir, filename);
        let size = tokio::fs::metadata(path).await?.len();
        let progress = Progress::new(size);

        if size <= self.part_size {
            let body = ByteStream::from_path(path)
                .await
                .map_err(|e| Error::object_store("put_object", &key, e))?;
            self.client
                .put_object()
                .bucket(bucket)
                .key(&key)
                .body(body)
                .send()
                .await
                .map_err(|e| Error::object_store("put_object", &key, DisplayErrorContext(e)))?;
            progress.report(size);
        } else {
            self.upload_multipart(path, bucket, &key, &progress).await?;
        }
        info!("{filename} is exported to S3");
        Ok(key)
    }

    /// Download an object. If `dest` is a directory the object keeps its
    /// file name inside it. Returns the written path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ObjectStore`] if the request or the transfer fails,
    /// or an I/O error if the file cannot be written.
    async fn download_file(&self, bucket: &str, key: &str, dest: &Path) -> Result<PathBuf> {
        let filename = key.rsplit('/').next().unwrap_or(key);
        let dest = if dest.is_dir() {
            dest.join(filename)
        } else {
            dest.to_path_buf()
        };
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Error::object_store("get_object", key, DisplayErrorContext(e)))?;

        let mut body = output.body.into_async_read();
        let mut file = File::create(&dest).await?;
        tokio::io::copy(&mut body, &mut file)
            .await
            .map_err(|e| Error::object_store("get_object", key, e))?;
        file.flush().await?;
        info!("{filename} downloaded from S3");
        Ok(dest)
    }

    /// Keys of every object under `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ObjectStore`] if a listing request fails.
    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| Error::object_store("list_objects_v2", prefix, DisplayErrorContext(e)))?;
            keys.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );
            match output.next_continuation_token() {
                Some(next) => token = Some(next.to_string()),
                None => break,
            }
        }
        Ok(keys)
    }

    /// Delete the given objects.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ObjectStore`] on the first failed deletion.
    async fn delete_keys(&self, bucket: &str, keys: &[String]) -> Result<()> {
        for key in keys {
            self.client
                .delete_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| Error::object_store("delete_object", key, DisplayErrorContext(e)))?;
            debug!("Deleted s3://{bucket}/{key}");
        }
        Ok(())
    }
}

async fn read_part(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// In-memory backend for tests.
#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Debug, Default)]
    pub(crate) struct MemoryBackend {
        objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
        failing_downloads: AtomicU32,
        pub(crate) downloads: AtomicU32,
    }

    impl MemoryBackend {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// The next `n` downloads fail with a retryable error.
        pub(crate) fn fail_downloads(self, n: u32) -> Self {
            self.failing_downloads.store(n, Ordering::SeqCst);
            self
        }

        pub(crate) fn put(&self, bucket: &str, key: &str, data: &[u8]) {
            self.objects
                .lock()
                .unwrap()
                .insert((bucket.to_string(), key.to_string()), data.to_vec());
        }

        pub(crate) fn keys(&self, bucket: &str) -> Vec<String> {
            self.objects
                .lock()
                .unwrap()
                .keys()
                .filter(|(b, _)| b == bucket)
                .map(|(_, key)| key.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ObjectBackend for MemoryBackend {
        async fn upload_file(&self, path: &Path, bucket: &str, bucket_dir: &str) -> Result<String> {
            let key = object_key(bucket_dir, file_name(path)?);
            let data = tokio::fs::read(path).await?;
            self.put(bucket, &key, &data);
            Ok(key)
        }

        async fn download_file(&self, bucket: &str, key: &str, dest: &Path) -> Result<PathBuf> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            if self
                .failing_downloads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::object_store("get_object", key, "connection reset"));
            }
            let data = self
                .objects
                .lock()
                .unwrap()
                .get(&(bucket.to_string(), key.to_string()))
                .cloned()
                .ok_or_else(|| Error::object_store("get_object", key, "NoSuchKey"))?;
            let dest = if dest.is_dir() {
                dest.join(key.rsplit('/').next().unwrap_or(key))
            } else {
                dest.to_path_buf()
            };
            tokio::fs::write(&dest, data).await?;
            Ok(dest)
        }

        async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
            Ok(self
                .keys(bucket)
                .into_iter()
                .filter(|key| key.starts_with(prefix))
                .collect())
        }

        async fn delete_keys(&self, bucket: &str, keys: &[String]) -> Result<()> {
            let mut objects = self.objects.lock().unwrap();
            for key in keys {
                objects.remove(&(bucket.to_string(), key.clone()));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_prints_every_10th_update() {
        let progress = Progress::new(100);
        assert_eq!(progress.update(0), None);
        for _ in 0..8 {
            assert_eq!(progress.update(5), None);
        }
        assert_eq!(
            progress.update(5).as_deref(),
            Some("\rTransferring [####] 45%")
        );
    }

    #[test]
    fn test_progress_completion_ends_line() {
        let progress = Progress::new(100);
        assert_eq!(progress.update(30), None);
        assert_eq!(
            progress.update(70).as_deref(),
            Some("\rTransferring [##########] 100%\n")
        );
    }

    #[test]
    fn test_progress_empty_file() {
        let progress = Progress::new(0);
        assert_eq!(
            progress.update(0).as_deref(),
            Some("\rTransferring [##########] 100%\n")
        );
    }

    #[test]
    fn test_progress_is_shared_between_threads() {
        let progress = std::sync::Arc::new(Progress::new(1000));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let progress = progress.clone();
                std::thread::spawn(move || {
                    (0..5).filter(|_| progress.update(50).is_some()).count()
                })
            })
            .collect();
        let printed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        // 20 updates: the 10th and the 20th (which also completes)
        assert_eq!(printed, 2);
    }

    #[test]
    fn test_object_key() {
        assert_eq!(object_key("dwh/temp", "data.csv"), "dwh/temp/data.csv");
        assert_eq!(object_key("dwh/temp/", "data.csv"), "dwh/temp/data.csv");
        assert_eq!(object_key("", "data.csv"), "data.csv");
        assert_eq!(s3_uri("bucket", "dwh/temp/"), "s3://bucket/dwh/temp/");
    }

    #[test]
    fn test_part_size_has_floor() {
        let conf = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .build();
        let store = ObjectStore::new(Client::from_conf(conf)).with_part_size(1);
        assert_eq!(store.part_size, MIN_PART_SIZE);
    }
}
