use std::collections::HashMap;
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::ServiceConfig;
use crate::error::{CoreError, CoreResult};
use crate::manager::{CreateDownload, DownloadManager};
use crate::net::{FetchResponse, HttpClient, Probe};
use crate::task::{Software, TaskId, TaskStatus};

/// In-memory origin standing in for the vendor CDN.
struct StubOrigin {
    payload: Vec<u8>,
    accept_ranges: bool,
    advertised_total: Option<u64>,
    /// range-start -> remaining 500 responses before success
    failures: Mutex<HashMap<u64, u32>>,
    fail_everything: bool,
    read_delay: Duration,
}

impl StubOrigin {
    fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            accept_ranges: true,
            advertised_total: None,
            failures: Mutex::new(HashMap::new()),
            fail_everything: false,
            read_delay: Duration::ZERO,
        }
    }

    fn total(&self) -> u64 {
        self.advertised_total.unwrap_or(self.payload.len() as u64)
    }
}

impl HttpClient for StubOrigin {
    fn head(&self, _url: &str) -> CoreResult<Probe> {
        Ok(Probe {
            status: 200,
            total_bytes: Some(self.total()),
            accept_ranges: self.accept_ranges,
        })
    }

    fn fetch(&self, _url: &str, range: Option<(u64, u64)>) -> CoreResult<FetchResponse> {
        if self.fail_everything {
            return Ok(error_response(500));
        }
        if let Some((start, _)) = range {
            if let Ok(mut failures) = self.failures.lock() {
                if let Some(remaining) = failures.get_mut(&start) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Ok(error_response(500));
                    }
                }
            }
        }
        let (status, slice) = match range {
            Some((start, end)) => {
                let start = start as usize;
                let end = (end as usize + 1).min(self.payload.len());
                (206, self.payload[start..end].to_vec())
            }
            None => (200, self.payload.clone()),
        };
        let len = slice.len() as u64;
        Ok(FetchResponse {
            status,
            content_length: Some(len),
            content_range_total: Some(self.total()),
            body: Box::new(SlowReader {
                inner: Cursor::new(slice),
                delay: self.read_delay,
            }),
        })
    }
}

fn error_response(status: u16) -> FetchResponse {
    FetchResponse {
        status,
        content_length: None,
        content_range_total: None,
        body: Box::new(Cursor::new(Vec::new())),
    }
}

struct SlowReader {
    inner: Cursor<Vec<u8>>,
    delay: Duration,
}

impl Read for SlowReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.delay > Duration::ZERO {
            thread::sleep(self.delay);
        }
        let max = buf.len().min(64 * 1024);
        self.inner.read(&mut buf[..max])
    }
}

fn deterministic_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn test_manager(data_dir: &Path, client: Arc<dyn HttpClient>) -> Arc<DownloadManager> {
    let config = ServiceConfig {
        data_dir: data_dir.to_path_buf(),
        download_threads: 4,
        ..ServiceConfig::default()
    };
    let manager = DownloadManager::new(config)
        .expect("manager")
        .with_client(client)
        .with_url_validator(Arc::new(|_| Ok(())));
    Arc::new(manager)
}

fn request(name: &str) -> CreateDownload {
    CreateDownload {
        software: Software {
            name: name.to_string(),
            bundle_id: format!("com.example.{name}"),
            version: "1.0".to_string(),
            file_size_bytes: None,
        },
        account_hash: "acct1234".to_string(),
        download_url: "https://iosapps.itunes.apple.com/app.ipa".to_string(),
        sinfs: Vec::new(),
        itunes_metadata: None,
    }
}

fn wait_for_status(
    manager: &DownloadManager,
    id: &TaskId,
    wanted: TaskStatus,
    timeout: Duration,
) -> crate::task::Task {
    let deadline = Instant::now() + timeout;
    loop {
        let task = manager.get(id).expect("task exists");
        if task.status == wanted {
            return task;
        }
        if task.status == TaskStatus::Failed && wanted != TaskStatus::Failed {
            panic!("task failed unexpectedly: {:?}", task.error);
        }
        if Instant::now() > deadline {
            panic!(
                "timed out waiting for {wanted}, task is {} ({:?})",
                task.status, task.error
            );
        }
        thread::sleep(Duration::from_millis(20));
    }
}

fn part_files(dir: &Path) -> Vec<String> {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|entry| entry.file_name().to_string_lossy().to_string())
                .filter(|name| name.contains(".part"))
                .collect()
        })
        .unwrap_or_default()
}

#[test]
fn create_rejects_invalid_inputs() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(StubOrigin::new(Vec::new()));
    let config = ServiceConfig {
        data_dir: dir.path().to_path_buf(),
        ..ServiceConfig::default()
    };
    // Real validator here: these are the validation-path tests.
    let manager = Arc::new(
        DownloadManager::new(config)
            .unwrap()
            .with_client(client),
    );

    let mut bad_url = request("badurl");
    bad_url.download_url = "http://cdn.apple.com/app.ipa".to_string();
    let err = manager.create(bad_url).unwrap_err();
    assert_eq!(err.to_string(), "Must use HTTPS");

    let mut bad_host = request("badhost");
    bad_host.download_url = "https://example.com/app.ipa".to_string();
    let err = manager.create(bad_host).unwrap_err();
    assert_eq!(err.to_string(), "Must be from an allowed domain");

    let mut bad_account = request("badacct");
    bad_account.account_hash = "..".to_string();
    let err = manager.create(bad_account).unwrap_err();
    assert_eq!(err.to_string(), "Invalid accountHash");

    assert!(manager.list(&["acct1234".to_string()]).unwrap().is_empty());
}

#[test]
fn chunked_download_completes_and_scrubs_secrets() {
    let dir = tempfile::tempdir().unwrap();
    let payload = deterministic_payload(1024 * 1024);
    let client = Arc::new(StubOrigin::new(payload.clone()));
    let manager = test_manager(dir.path(), client);

    let task = manager.create(request("happy")).unwrap();
    let done = wait_for_status(&manager, &task.id, TaskStatus::Completed, Duration::from_secs(20));

    assert_eq!(done.progress, 100);
    assert_eq!(done.download_url, "");
    assert!(done.sinfs.is_empty());
    assert!(done.itunes_metadata.is_none());

    let written = fs::read(&done.file_path).unwrap();
    assert_eq!(written, payload);

    let file_dir = Path::new(&done.file_path).parent().unwrap();
    assert!(part_files(file_dir).is_empty());

    // The completed task survives a restart. The snapshot write trails the
    // status flip slightly, so poll for it.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let snapshot = fs::read_to_string(dir.path().join("tasks.json")).unwrap_or_default();
        if snapshot.contains(&task.id.to_string()) {
            break;
        }
        if Instant::now() > deadline {
            panic!("snapshot never recorded the completed task");
        }
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn range_unsupported_falls_back_to_single_stream() {
    let dir = tempfile::tempdir().unwrap();
    let payload = deterministic_payload(512 * 1024 + 17);
    let mut origin = StubOrigin::new(payload.clone());
    origin.accept_ranges = false;
    let manager = test_manager(dir.path(), Arc::new(origin));

    let task = manager.create(request("fallback")).unwrap();
    let done = wait_for_status(&manager, &task.id, TaskStatus::Completed, Duration::from_secs(20));
    assert_eq!(fs::read(&done.file_path).unwrap(), payload);
}

#[test]
fn failing_chunk_is_retried_until_it_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let payload = deterministic_payload(400 * 1024);
    let origin = StubOrigin::new(payload.clone());
    // threads=4 over 400 KiB: chunk size 100 KiB, chunk 2 starts at 200 KiB.
    let chunk2_start = 2 * 100 * 1024;
    origin
        .failures
        .lock()
        .unwrap()
        .insert(chunk2_start, 2);
    let manager = test_manager(dir.path(), Arc::new(origin));

    let started = Instant::now();
    let task = manager.create(request("retry")).unwrap();
    let done = wait_for_status(&manager, &task.id, TaskStatus::Completed, Duration::from_secs(30));
    // Two retry delays of 2 s each must have elapsed.
    assert!(started.elapsed() >= Duration::from_secs(4));
    assert_eq!(fs::read(&done.file_path).unwrap(), payload);
}

#[test]
fn exhausted_retries_fail_the_task() {
    let dir = tempfile::tempdir().unwrap();
    let mut origin = StubOrigin::new(deterministic_payload(64 * 1024));
    origin.fail_everything = true;
    let manager = test_manager(dir.path(), Arc::new(origin));

    let task = manager.create(request("doomed")).unwrap();
    let failed = wait_for_status(&manager, &task.id, TaskStatus::Failed, Duration::from_secs(30));
    assert_eq!(failed.error.as_deref(), Some("Download failed"));
    assert!(!Path::new(&failed.file_path).exists());
}

#[test]
fn pause_suppresses_failure_and_resume_completes() {
    let dir = tempfile::tempdir().unwrap();
    let payload = deterministic_payload(4 * 1024 * 1024);
    let mut origin = StubOrigin::new(payload.clone());
    origin.read_delay = Duration::from_millis(40);
    let manager = test_manager(dir.path(), Arc::new(origin));

    let task = manager.create(request("pausable")).unwrap();
    wait_for_status(&manager, &task.id, TaskStatus::Downloading, Duration::from_secs(10));
    thread::sleep(Duration::from_millis(200));

    manager.pause(&task.id).unwrap();
    let paused = wait_for_status(&manager, &task.id, TaskStatus::Paused, Duration::from_secs(1));
    assert!(paused.error.is_none());

    // Give the torn-down worker threads a moment, then verify no artifacts.
    thread::sleep(Duration::from_millis(500));
    let current = manager.get(&task.id).unwrap();
    assert_eq!(current.status, TaskStatus::Paused);
    assert!(!Path::new(&current.file_path).exists());
    let file_dir = Path::new(&current.file_path).parent().unwrap();
    assert!(part_files(file_dir).is_empty());

    // Pausing a paused task is an error.
    assert!(manager.pause(&task.id).is_err());

    manager.resume(&task.id).unwrap();
    let done = wait_for_status(&manager, &task.id, TaskStatus::Completed, Duration::from_secs(60));
    assert_eq!(fs::read(&done.file_path).unwrap(), payload);
}

#[test]
fn size_cap_rejects_oversized_requests_at_create() {
    let dir = tempfile::tempdir().unwrap();
    let mut origin = StubOrigin::new(Vec::new());
    origin.advertised_total = Some(20 * 1024 * 1024);
    let config = ServiceConfig {
        data_dir: dir.path().to_path_buf(),
        max_download_mb: 10,
        ..ServiceConfig::default()
    };
    let manager = Arc::new(
        DownloadManager::new(config)
            .unwrap()
            .with_client(Arc::new(origin))
            .with_url_validator(Arc::new(|_| Ok(()))),
    );

    let err = manager.create(request("big")).unwrap_err();
    assert!(matches!(err, CoreError::SizeLimit));
    assert!(manager.list(&["acct1234".to_string()]).unwrap().is_empty());
}

#[test]
fn unverifiable_size_is_a_preflight_error() {
    struct OpaqueOrigin;
    impl HttpClient for OpaqueOrigin {
        fn head(&self, _url: &str) -> CoreResult<Probe> {
            Ok(Probe {
                status: 200,
                total_bytes: None,
                accept_ranges: false,
            })
        }
        fn fetch(&self, _url: &str, _range: Option<(u64, u64)>) -> CoreResult<FetchResponse> {
            Err(CoreError::Network("connection refused".to_string()))
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let config = ServiceConfig {
        data_dir: dir.path().to_path_buf(),
        max_download_mb: 10,
        ..ServiceConfig::default()
    };
    let manager = Arc::new(
        DownloadManager::new(config)
            .unwrap()
            .with_client(Arc::new(OpaqueOrigin))
            .with_url_validator(Arc::new(|_| Ok(()))),
    );
    let err = manager.create(request("opaque")).unwrap_err();
    assert_eq!(err.to_string(), "Unable to verify file size");
}

#[test]
fn delete_removes_task_file_and_empty_parents() {
    let dir = tempfile::tempdir().unwrap();
    let payload = deterministic_payload(128 * 1024);
    let manager = test_manager(dir.path(), Arc::new(StubOrigin::new(payload)));

    let task = manager.create(request("deleted")).unwrap();
    let done = wait_for_status(&manager, &task.id, TaskStatus::Completed, Duration::from_secs(20));
    let file_path = done.file_path.clone();
    assert!(Path::new(&file_path).exists());

    manager.delete(&task.id).unwrap();

    assert!(manager.get(&task.id).is_err());
    assert!(!Path::new(&file_path).exists());
    // Empty version/bundle/account directories were pruned; the packages
    // base itself survives.
    let packages = dir.path().join("packages");
    assert!(packages.exists());
    assert!(!packages.join("acct1234").exists());

    let snapshot: Vec<serde_json::Value> =
        serde_json::from_str(&fs::read_to_string(dir.path().join("tasks.json")).unwrap()).unwrap();
    assert!(snapshot.is_empty());
}

#[test]
fn size_based_cleanup_trims_oldest_completed_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let payload = deterministic_payload(600 * 1024);
    let config = ServiceConfig {
        data_dir: dir.path().to_path_buf(),
        download_threads: 2,
        // 1 MB budget: two 600 KiB artifacts exceed it.
        auto_cleanup_max_mb: 1,
        ..ServiceConfig::default()
    };
    let manager = Arc::new(
        DownloadManager::new(config)
            .unwrap()
            .with_client(Arc::new(StubOrigin::new(payload)))
            .with_url_validator(Arc::new(|_| Ok(()))),
    );

    let first = manager.create(request("old")).unwrap();
    wait_for_status(&manager, &first.id, TaskStatus::Completed, Duration::from_secs(20));
    thread::sleep(Duration::from_millis(1100));

    let second = manager.create(request("new")).unwrap();
    wait_for_status(&manager, &second.id, TaskStatus::Completed, Duration::from_secs(20));

    // The sweep runs before each start; a third download evicts the oldest.
    let third = manager.create(request("newest")).unwrap();
    wait_for_status(&manager, &third.id, TaskStatus::Completed, Duration::from_secs(20));

    assert!(manager.get(&first.id).is_err());
    assert!(manager.get(&second.id).is_ok());
}
