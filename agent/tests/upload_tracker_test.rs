//! Integration tests for session registration and artifact uploads.
//!
//! The collection endpoint and the signed-URL storage are both played by one
//! wiremock server.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use reqwest::Url;
use replay_agent::types::SessionInfo;
use replay_agent::uploader::{UploadError, UploadSettings, UploadTracker};
use tempfile::TempDir;
use wiremock::matchers::{body_bytes, body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

// =============================================================================
// Test Helpers
// =============================================================================

fn create_tracker(server: &MockServer, dir: &Path) -> Arc<UploadTracker> {
    let settings = UploadSettings {
        endpoint: Url::parse(&server.uri()).unwrap(),
        api_id: "user-1".to_string(),
        api_key: "secret".to_string(),
        session_id: "session-1".to_string(),
        data_dir: dir.to_path_buf(),
        segment_extension: "ts".to_string(),
        stable_age: Duration::from_secs(2),
    };
    Arc::new(UploadTracker::new(settings).unwrap())
}

/// Writes `contents` to `dir/name` and backdates it past the stable age.
fn write_stable_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(SystemTime::now() - Duration::from_secs(10))
        .unwrap();
    path
}

/// Mounts a successful sign + put exchange for `file_name`.
async fn mount_upload(server: &MockServer, file_name: &str, contents: &[u8], times: u64) {
    Mock::given(method("GET"))
        .and(path(format!("/api/sign/user-1/session-1/{file_name}/put")))
        .and(query_param("content_length", contents.len().to_string()))
        .and(header("api-key", "secret"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(format!("{}/storage/{file_name}?sig=abc\n", server.uri())),
        )
        .expect(times)
        .mount(server)
        .await;

    Mock::given(method("PUT"))
        .and(path(format!("/storage/{file_name}")))
        .and(query_param("sig", "abc"))
        .and(header("content-type", "application/octet-stream"))
        .and(body_bytes(contents.to_vec()))
        .respond_with(ResponseTemplate::new(200))
        .expect(times)
        .mount(server)
        .await;
}

fn session_info() -> SessionInfo {
    SessionInfo::collect("Game".to_string(), "1.0.0".to_string(), vec!["test".to_string()])
}

// =============================================================================
// Registration
// =============================================================================

#[tokio::test]
async fn test_register_session_posts_metadata() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("POST"))
        .and(path("/api/session/user-1/session-1"))
        .and(header("api-key", "secret"))
        .and(header("content-type", "application/json"))
        .and(body_partial_json(serde_json::json!({
            "app_name": "Game",
            "app_version": "1.0.0",
            "tags": ["test"],
        })))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let tracker = create_tracker(&server, dir.path());
    tracker.register_session(&session_info()).await.unwrap();
}

#[tokio::test]
async fn test_register_session_rejected_credentials() {
    for status in [401, 403] {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();

        Mock::given(method("POST"))
            .and(path("/api/session/user-1/session-1"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;

        let tracker = create_tracker(&server, dir.path());
        let result = tracker.register_session(&session_info()).await;
        assert!(
            matches!(result, Err(UploadError::AuthFailed)),
            "status {status} should be a credential rejection, got {result:?}"
        );
    }
}

#[tokio::test]
async fn test_register_session_server_error() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("POST"))
        .and(path("/api/session/user-1/session-1"))
        .respond_with(ResponseTemplate::new(500).set_body_string("down"))
        .mount(&server)
        .await;

    let tracker = create_tracker(&server, dir.path());
    let result = tracker.register_session(&session_info()).await;
    assert!(matches!(
        result,
        Err(UploadError::RegisterFailed { status: 500, ref message }) if message == "down"
    ));
}

// =============================================================================
// Segment scan
// =============================================================================

#[tokio::test]
async fn test_stable_segment_is_uploaded_and_marked() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let segment = write_stable_file(dir.path(), "output_000.ts", b"video");
    mount_upload(&server, "output_000.ts", b"video", 1).await;

    let tracker = create_tracker(&server, dir.path());

    assert_eq!(tracker.scan_and_upload_segments(), 1);
    assert_eq!(tracker.wait_for_uploads().await, 1);
    assert!(tracker.is_uploaded(&segment));

    // Later scans leave it alone.
    assert_eq!(tracker.scan_and_upload_segments(), 0);
}

#[tokio::test]
async fn test_scan_skips_fresh_and_foreign_files() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    fs::write(dir.path().join("output_001.ts"), b"still recording").unwrap();
    write_stable_file(dir.path(), "playlist.m3u8", b"#EXTM3U");
    write_stable_file(dir.path(), "internal.log", b"log");

    let tracker = create_tracker(&server, dir.path());
    assert_eq!(tracker.scan_and_upload_segments(), 0);
    assert_eq!(tracker.wait_for_uploads().await, 0);
}

#[tokio::test]
async fn test_nested_segments_are_found() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("hls")).unwrap();
    let segment = write_stable_file(&dir.path().join("hls"), "output_002.ts", b"nested");
    mount_upload(&server, "output_002.ts", b"nested", 1).await;

    let tracker = create_tracker(&server, dir.path());
    assert_eq!(tracker.scan_and_upload_segments(), 1);
    tracker.wait_for_uploads().await;
    assert!(tracker.is_uploaded(&segment));
}

#[tokio::test]
async fn test_failed_sign_leaves_file_for_next_scan() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let segment = write_stable_file(dir.path(), "output_000.ts", b"video");

    Mock::given(method("GET"))
        .and(path("/api/sign/user-1/session-1/output_000.ts/put"))
        .respond_with(ResponseTemplate::new(500).set_body_string("signing down"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_upload(&server, "output_000.ts", b"video", 1).await;

    let tracker = create_tracker(&server, dir.path());

    assert_eq!(tracker.scan_and_upload_segments(), 1);
    tracker.wait_for_uploads().await;
    assert!(!tracker.is_uploaded(&segment));
    let record = tracker.record(&segment).unwrap();
    assert!(!record.in_flight);

    assert_eq!(tracker.scan_and_upload_segments(), 1);
    tracker.wait_for_uploads().await;
    assert!(tracker.is_uploaded(&segment));
}

#[tokio::test]
async fn test_failed_put_leaves_file_unmarked() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let segment = write_stable_file(dir.path(), "output_000.ts", b"video");

    Mock::given(method("GET"))
        .and(path("/api/sign/user-1/session-1/output_000.ts/put"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(format!("{}/storage/output_000.ts", server.uri())),
        )
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/storage/output_000.ts"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;

    let tracker = create_tracker(&server, dir.path());
    let result = tracker.upload_file(&segment).await;

    assert!(matches!(result, Err(UploadError::PutFailed { status: 403, .. })));
    assert!(!tracker.is_uploaded(&segment));
}

#[tokio::test]
async fn test_overlapping_scans_schedule_once() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    write_stable_file(dir.path(), "output_000.ts", b"video");
    mount_upload(&server, "output_000.ts", b"video", 1).await;

    let tracker = create_tracker(&server, dir.path());

    let first = tracker.scan_and_upload_segments();
    let second = tracker.scan_and_upload_segments();
    assert_eq!(first + second, 1);

    assert_eq!(tracker.wait_for_uploads().await, 1);
}

#[tokio::test]
async fn test_concurrent_scans_from_tasks_schedule_once() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    for i in 0..5 {
        let name = format!("output_{i:03}.ts");
        write_stable_file(dir.path(), &name, b"video");
        mount_upload(&server, &name, b"video", 1).await;
    }

    let tracker = create_tracker(&server, dir.path());
    let scans: Vec<_> = (0..4)
        .map(|_| {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.scan_and_upload_segments() })
        })
        .collect();

    let mut scheduled = 0;
    for scan in scans {
        scheduled += scan.await.unwrap();
    }
    assert_eq!(scheduled, 5);
    assert_eq!(tracker.wait_for_uploads().await, 5);
}

#[tokio::test]
async fn test_finished_uploads_are_reaped_by_next_scan() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let segment = write_stable_file(dir.path(), "output_000.ts", b"video");
    mount_upload(&server, "output_000.ts", b"video", 1).await;

    let tracker = create_tracker(&server, dir.path());
    assert_eq!(tracker.scan_and_upload_segments(), 1);

    for _ in 0..200 {
        if tracker.is_uploaded(&segment) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(tracker.is_uploaded(&segment));
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Finished but not yet joined.
    assert_eq!(tracker.pending_uploads(), 1);

    assert_eq!(tracker.scan_and_upload_segments(), 0);
    assert_eq!(tracker.pending_uploads(), 0);
}

// =============================================================================
// Remaining files
// =============================================================================

#[tokio::test]
async fn test_upload_all_remaining_excludes_diagnostic_log() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    // Fresh and non-segment files are included; only the exclusion is not.
    fs::write(dir.path().join("output_003.ts"), b"last").unwrap();
    write_stable_file(dir.path(), "events.ndjson", b"{}\n");
    let log = write_stable_file(dir.path(), "internal.log", b"log");

    mount_upload(&server, "output_003.ts", b"last", 1).await;
    mount_upload(&server, "events.ndjson", b"{}\n", 1).await;
    mount_upload(&server, "internal.log", b"log", 0).await;

    let tracker = create_tracker(&server, dir.path());
    assert_eq!(tracker.upload_all_remaining(&log).await, 2);
    assert_eq!(tracker.wait_for_uploads().await, 2);
    assert!(!tracker.is_uploaded(&log));
}

#[tokio::test]
async fn test_upload_all_remaining_skips_uploaded_files() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    write_stable_file(dir.path(), "output_000.ts", b"video");
    mount_upload(&server, "output_000.ts", b"video", 1).await;

    let tracker = create_tracker(&server, dir.path());
    tracker.scan_and_upload_segments();
    tracker.wait_for_uploads().await;

    assert_eq!(
        tracker.upload_all_remaining(&dir.path().join("internal.log")).await,
        0
    );
}

#[tokio::test]
async fn test_upload_all_remaining_retries_upload_that_fails_in_flight() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let segment = write_stable_file(dir.path(), "output_000.ts", b"video");
    let log = dir.path().join("internal.log");

    // The periodic attempt is still in flight when the final pass starts,
    // and then fails.
    Mock::given(method("GET"))
        .and(path("/api/sign/user-1/session-1/output_000.ts/put"))
        .respond_with(
            ResponseTemplate::new(500)
                .set_body_string("signing down")
                .set_delay(Duration::from_millis(300)),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    mount_upload(&server, "output_000.ts", b"video", 1).await;

    let tracker = create_tracker(&server, dir.path());
    assert_eq!(tracker.scan_and_upload_segments(), 1);
    assert!(tracker.record(&segment).unwrap().in_flight);

    assert_eq!(tracker.upload_all_remaining(&log).await, 1);
    assert_eq!(tracker.wait_for_uploads().await, 1);
    assert!(tracker.is_uploaded(&segment));
}
