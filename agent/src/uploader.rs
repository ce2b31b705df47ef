//! Artifact upload tracking for Replay sessions.
//!
//! The [`UploadTracker`] discovers finished files in the session data
//! directory and ships them to the collection endpoint. Each upload is a two
//! step exchange:
//!
//! 1. `GET {endpoint}/api/sign/{apiId}/{sessionId}/{fileName}/put?content_length=N`
//!    returns a signed URL as plain text.
//! 2. `PUT {signedUrl}` sends the raw file bytes as `application/octet-stream`.
//!
//! A non-2xx response at either step fails the upload. Failures are logged
//! and the file stays unmarked, so the next scan schedules it again. There is
//! no other retry.
//!
//! # Concurrency
//!
//! Every scheduled file runs in its own task inside a [`JoinSet`], which
//! [`UploadTracker::wait_for_uploads`] drains. The per-path records live
//! behind one mutex and a path is claimed while its upload is in flight, so
//! overlapping scans never schedule the same file twice.

use std::collections::HashMap;
use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode, Url};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::types::SessionInfo;

/// HTTP request timeout.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Header carrying the API key on endpoint requests.
const API_KEY_HEADER: &str = "api-key";

/// Default minimum age of a segment before it is considered finished.
pub const DEFAULT_STABLE_AGE: Duration = Duration::from_secs(2);

/// Errors that can occur while registering the session or uploading files.
#[derive(Error, Debug)]
pub enum UploadError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Reading the file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The endpoint rejected the API credentials (401/403).
    #[error("authentication failed: API credentials were rejected")]
    AuthFailed,

    /// Session registration returned an error status.
    #[error("session registration failed: {status} - {message}")]
    RegisterFailed { status: u16, message: String },

    /// Requesting the signed upload URL failed.
    #[error("signing request failed: {status} - {message}")]
    SignFailed { status: u16, message: String },

    /// The signed URL could not be parsed.
    #[error("invalid signed URL: {0}")]
    InvalidSignedUrl(String),

    /// Transmitting the file to the signed URL failed.
    #[error("upload failed: {status} - {message}")]
    PutFailed { status: u16, message: String },

    /// The endpoint cannot be extended with path segments.
    #[error("invalid endpoint URL: {0}")]
    InvalidEndpoint(String),

    /// The path has no usable file name.
    #[error("invalid file name: {0}")]
    InvalidFileName(PathBuf),

    /// API id or key is empty.
    #[error("missing API credentials")]
    MissingCredentials,
}

/// Settings for the upload tracker.
#[derive(Debug, Clone)]
pub struct UploadSettings {
    /// Collection endpoint base URL.
    pub endpoint: Url,
    /// API id (user id) used in endpoint paths.
    pub api_id: String,
    /// API key sent in the `api-key` header.
    pub api_key: String,
    /// Session identifier used in endpoint paths.
    pub session_id: String,
    /// Directory scanned for artifacts.
    pub data_dir: PathBuf,
    /// Extension of recorder segments, without the dot.
    pub segment_extension: String,
    /// Minimum time since last modification before a segment is uploaded.
    pub stable_age: Duration,
}

/// Upload state of one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadRecord {
    /// Set exactly once, after a confirmed transmission.
    pub uploaded: bool,
    /// Set while an upload task owns the path.
    pub in_flight: bool,
}

/// Discovers, schedules and uploads session artifacts.
pub struct UploadTracker {
    settings: UploadSettings,
    client: Client,
    records: Mutex<HashMap<PathBuf, UploadRecord>>,
    tasks: Mutex<JoinSet<()>>,
}

impl UploadTracker {
    /// Creates a tracker with its own pooled HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError::Http`] if the HTTP client cannot be built.
    pub fn new(settings: UploadSettings) -> Result<Self, UploadError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(Self {
            settings,
            client,
            records: Mutex::new(HashMap::new()),
            tasks: Mutex::new(JoinSet::new()),
        })
    }

    /// Returns the tracker settings.
    #[must_use]
    pub fn settings(&self) -> &UploadSettings {
        &self.settings
    }

    /// Posts session metadata to `{endpoint}/api/session/{apiId}/{sessionId}`.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError::AuthFailed`] on 401/403 and
    /// [`UploadError::RegisterFailed`] on any other non-2xx status.
    pub async fn register_session(&self, info: &SessionInfo) -> Result<(), UploadError> {
        self.check_credentials()?;
        let url = self.endpoint_url(&["api", "session", &self.settings.api_id, &self.settings.session_id])?;

        debug!(url = %url, "Registering session");
        let response = self
            .client
            .post(url)
            .header(API_KEY_HEADER, &self.settings.api_key)
            .json(info)
            .send()
            .await?;

        let status = response.status();
        match status {
            _ if status.is_success() => {
                info!(session_id = %self.settings.session_id, "Session registered");
                Ok(())
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                error!(status = status.as_u16(), "Session registration rejected credentials");
                Err(UploadError::AuthFailed)
            }
            _ => Err(UploadError::RegisterFailed {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// Schedules every finished, not yet uploaded segment under the data
    /// directory. Returns the number of uploads scheduled.
    pub fn scan_and_upload_segments(self: &Arc<Self>) -> usize {
        self.reap_finished();
        let now = SystemTime::now();
        let extension = self.settings.segment_extension.as_str();

        let candidates = collect_files(&self.settings.data_dir)
            .into_iter()
            .filter(|(path, _)| path.extension().is_some_and(|ext| ext == extension))
            .filter(|(_, meta)| is_stable(meta, self.settings.stable_age, now))
            .map(|(path, _)| path);

        let scheduled = candidates.filter(|path| self.schedule_upload(path)).count();
        if scheduled > 0 {
            debug!(scheduled, "Scheduled segment uploads");
        }
        scheduled
    }

    /// Schedules every not yet uploaded file under the data directory except
    /// `exclude`, regardless of extension or age. Returns the number of
    /// uploads scheduled.
    ///
    /// Uploads already in flight are awaited first. A claimed path would
    /// otherwise be skipped here and, if that attempt failed, never scheduled
    /// again.
    pub async fn upload_all_remaining(self: &Arc<Self>, exclude: &Path) -> usize {
        let settled = self.wait_for_uploads().await;
        if settled > 0 {
            debug!(settled, "In-flight uploads settled");
        }
        let exclude = canonical(exclude);

        let scheduled = collect_files(&self.settings.data_dir)
            .into_iter()
            .map(|(path, _)| path)
            .filter(|path| canonical(path) != exclude)
            .filter(|path| self.schedule_upload(path))
            .count();

        info!(scheduled, "Scheduled remaining uploads");
        scheduled
    }

    /// Claims `path` and spawns its upload task. Returns false if the file is
    /// already uploaded or in flight.
    pub fn schedule_upload(self: &Arc<Self>, path: &Path) -> bool {
        {
            let mut records = self.lock_records();
            let record = records.entry(path.to_path_buf()).or_default();
            if record.uploaded || record.in_flight {
                return false;
            }
            record.in_flight = true;
        }

        let tracker = Arc::clone(self);
        let path = path.to_path_buf();
        self.lock_tasks().spawn(async move {
            if let Err(e) = tracker.upload_file(&path).await {
                error!(path = %path.display(), error = %e, "Upload failed");
                tracker.release(&path);
            }
        });
        true
    }

    /// Uploads one file through a signed URL and marks it uploaded.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, the signing request or
    /// the transfer returns a non-2xx status, or the request fails.
    pub async fn upload_file(&self, path: &Path) -> Result<(), UploadError> {
        self.check_credentials()?;
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| UploadError::InvalidFileName(path.to_path_buf()))?;

        let body = tokio::fs::read(path).await?;
        let signed_url = self.request_signed_url(file_name, body.len()).await?;
        let size = body.len();

        debug!(path = %path.display(), size, "Uploading file");
        let response = self
            .client
            .put(signed_url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::PutFailed {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        info!(path = %path.display(), size, "File uploaded");
        self.mark_uploaded(path);
        Ok(())
    }

    async fn request_signed_url(&self, file_name: &str, content_length: usize) -> Result<Url, UploadError> {
        let mut url = self.endpoint_url(&[
            "api",
            "sign",
            &self.settings.api_id,
            &self.settings.session_id,
            file_name,
            "put",
        ])?;
        url.query_pairs_mut()
            .append_pair("content_length", &content_length.to_string());

        let response = self
            .client
            .get(url)
            .header(API_KEY_HEADER, &self.settings.api_key)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(UploadError::SignFailed {
                status: status.as_u16(),
                message: text,
            });
        }

        let signed = text.trim();
        Url::parse(signed).map_err(|e| UploadError::InvalidSignedUrl(format!("{signed:?}: {e}")))
    }

    /// Records a confirmed upload. Returns false if it was already recorded.
    pub fn mark_uploaded(&self, path: &Path) -> bool {
        let mut records = self.lock_records();
        let record = records.entry(path.to_path_buf()).or_default();
        record.in_flight = false;
        if record.uploaded {
            return false;
        }
        record.uploaded = true;
        true
    }

    /// Returns true if `path` has been uploaded.
    #[must_use]
    pub fn is_uploaded(&self, path: &Path) -> bool {
        self.lock_records().get(path).is_some_and(|r| r.uploaded)
    }

    /// Returns the record for `path`, if it has been observed.
    #[must_use]
    pub fn record(&self, path: &Path) -> Option<UploadRecord> {
        self.lock_records().get(path).copied()
    }

    /// Waits until every scheduled upload task has finished, including tasks
    /// scheduled while waiting. Returns the number of tasks joined.
    pub async fn wait_for_uploads(&self) -> usize {
        let mut joined = 0;
        loop {
            let mut set = std::mem::take(&mut *self.lock_tasks());
            if set.is_empty() {
                return joined;
            }
            while let Some(result) = set.join_next().await {
                joined += 1;
                if let Err(e) = result {
                    error!(error = %e, "Upload task panicked");
                }
            }
        }
    }

    /// Returns the number of upload tasks not yet joined.
    #[must_use]
    pub fn pending_uploads(&self) -> usize {
        self.lock_tasks().len()
    }

    /// Joins tasks that have already finished so the set does not grow for
    /// the whole session.
    fn reap_finished(&self) {
        let mut tasks = self.lock_tasks();
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                error!(error = %e, "Upload task panicked");
            }
        }
    }

    fn release(&self, path: &Path) {
        if let Some(record) = self.lock_records().get_mut(path) {
            record.in_flight = false;
        }
    }

    fn check_credentials(&self) -> Result<(), UploadError> {
        if self.settings.api_id.is_empty() || self.settings.api_key.is_empty() {
            error!("API id or key is empty, refusing to contact the endpoint");
            return Err(UploadError::MissingCredentials);
        }
        Ok(())
    }

    fn endpoint_url(&self, segments: &[&str]) -> Result<Url, UploadError> {
        build_url(&self.settings.endpoint, segments)
    }

    fn lock_records(&self) -> MutexGuard<'_, HashMap<PathBuf, UploadRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Appends percent-encoded path segments to `base`.
fn build_url(base: &Url, segments: &[&str]) -> Result<Url, UploadError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| UploadError::InvalidEndpoint(base.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Returns true if the file was last modified more than `stable_age` ago.
/// Files with a modification time in the future are never stable.
fn is_stable(meta: &Metadata, stable_age: Duration, now: SystemTime) -> bool {
    meta.modified()
        .ok()
        .and_then(|modified| now.duration_since(modified).ok())
        .is_some_and(|age| age > stable_age)
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Lists every regular file under `dir`, recursively.
fn collect_files(dir: &Path) -> Vec<(PathBuf, Metadata)> {
    let mut files = Vec::new();
    collect_files_recursive(dir, &mut files);
    files
}

fn collect_files_recursive(dir: &Path, files: &mut Vec<(PathBuf, Metadata)>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Cannot read directory, skipping");
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        match entry.metadata() {
            Ok(meta) if meta.is_dir() => collect_files_recursive(&path, files),
            Ok(meta) if meta.is_file() => files.push((path, meta)),
            Ok(_) => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to get file metadata");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings(dir: &Path) -> UploadSettings {
        UploadSettings {
            endpoint: Url::parse("https://collect.example.com").unwrap(),
            api_id: "user-1".to_string(),
            api_key: "secret".to_string(),
            session_id: "session-1".to_string(),
            data_dir: dir.to_path_buf(),
            segment_extension: "ts".to_string(),
            stable_age: DEFAULT_STABLE_AGE,
        }
    }

    #[test]
    fn test_build_url_appends_encoded_segments() {
        let base = Url::parse("https://collect.example.com/").unwrap();
        let url = build_url(&base, &["api", "sign", "u", "s", "clip 1.ts", "put"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://collect.example.com/api/sign/u/s/clip%201.ts/put"
        );
    }

    #[test]
    fn test_build_url_keeps_base_path() {
        let base = Url::parse("https://collect.example.com/v2").unwrap();
        let url = build_url(&base, &["api", "session"]).unwrap();
        assert_eq!(url.as_str(), "https://collect.example.com/v2/api/session");
    }

    #[test]
    fn test_is_stable_uses_strict_age() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.ts");
        fs::write(&path, b"x").unwrap();
        let meta = fs::metadata(&path).unwrap();
        let modified = meta.modified().unwrap();

        let age = Duration::from_secs(2);
        assert!(!is_stable(&meta, age, modified + age));
        assert!(is_stable(&meta, age, modified + age + Duration::from_millis(1)));
        assert!(!is_stable(&meta, age, modified - Duration::from_secs(1)));
    }

    #[test]
    fn test_collect_files_recurses() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("nested/deeper")).unwrap();
        fs::write(dir.path().join("a.ts"), b"a").unwrap();
        fs::write(dir.path().join("nested/deeper/b.ts"), b"b").unwrap();

        let mut names: Vec<String> = collect_files(dir.path())
            .into_iter()
            .map(|(p, _)| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.ts", "b.ts"]);
    }

    #[test]
    fn test_collect_files_missing_dir_is_empty() {
        assert!(collect_files(Path::new("/nonexistent/replay/data")).is_empty());
    }

    #[test]
    fn test_mark_uploaded_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let tracker = UploadTracker::new(settings(dir.path())).unwrap();
        let path = dir.path().join("a.ts");

        assert!(!tracker.is_uploaded(&path));
        assert!(tracker.mark_uploaded(&path));
        assert!(!tracker.mark_uploaded(&path));
        assert!(tracker.is_uploaded(&path));
    }

    #[tokio::test]
    async fn test_missing_credentials_are_refused() {
        let dir = TempDir::new().unwrap();
        let mut settings = settings(dir.path());
        settings.api_key.clear();
        let tracker = UploadTracker::new(settings).unwrap();

        let path = dir.path().join("a.ts");
        fs::write(&path, b"a").unwrap();

        assert!(matches!(
            tracker.upload_file(&path).await,
            Err(UploadError::MissingCredentials)
        ));
        assert!(!tracker.is_uploaded(&path));
    }

    #[tokio::test]
    async fn test_fresh_segment_is_not_scheduled() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.ts"), b"a").unwrap();

        let tracker = Arc::new(UploadTracker::new(settings(dir.path())).unwrap());
        assert_eq!(tracker.scan_and_upload_segments(), 0);
        assert_eq!(tracker.wait_for_uploads().await, 0);
    }

    #[test]
    fn test_upload_error_display() {
        let err = UploadError::SignFailed {
            status: 500,
            message: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "signing request failed: 500 - boom");
        assert_eq!(
            UploadError::AuthFailed.to_string(),
            "authentication failed: API credentials were rejected"
        );
    }
}
