use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread;

use serde::Deserialize;

use crate::cleanup;
use crate::config::{ServiceConfig, DOWNLOAD_TIMEOUT};
use crate::downloader::{CancelToken, ChunkedDownloader, ProgressFn, ProgressUpdate};
use crate::error::{CoreError, CoreResult};
use crate::fanout::ProgressHub;
use crate::injector;
use crate::net::{HttpClient, ReqwestClient};
use crate::store::TaskStore;
use crate::task::{PublicTask, Sinf, Software, Task, TaskId, TaskStatus};
use crate::validate::{path_within_base, sanitize_path_segment, validate_download_url};

const INVALID_PATH: &str = "Invalid path";

pub type UrlValidator = dyn Fn(&str) -> CoreResult<()> + Send + Sync;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDownload {
    pub software: Software,
    pub account_hash: String,
    #[serde(rename = "downloadURL")]
    pub download_url: String,
    #[serde(default)]
    pub sinfs: Vec<Sinf>,
    #[serde(rename = "iTunesMetadata", default)]
    pub itunes_metadata: Option<String>,
}

/// Top-level orchestrator. Owns every task record, its artifact subtree and
/// the per-task cancellation and downloader indices.
pub struct DownloadManager {
    config: ServiceConfig,
    store: TaskStore,
    hub: ProgressHub,
    client: Arc<dyn HttpClient>,
    validate_url: Arc<UrlValidator>,
    cancels: Mutex<HashMap<TaskId, Arc<CancelToken>>>,
    active: Mutex<HashMap<TaskId, Arc<ChunkedDownloader>>>,
}

impl DownloadManager {
    pub fn new(config: ServiceConfig) -> CoreResult<Self> {
        let store = TaskStore::open(&config.data_dir)?;
        let user_agent = concat!("appdepot/", env!("CARGO_PKG_VERSION"));
        let client = ReqwestClient::new(user_agent)?;
        Ok(Self {
            config,
            store,
            hub: ProgressHub::new(),
            client: Arc::new(client),
            validate_url: Arc::new(validate_download_url),
            cancels: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.client = client;
        self
    }

    pub fn with_url_validator(mut self, validator: Arc<UrlValidator>) -> Self {
        self.validate_url = validator;
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Initial age sweep plus the midnight reschedule loop.
    pub fn spawn_maintenance(self: &Arc<Self>) {
        cleanup::run_age_cleanup(self);
        cleanup::spawn_midnight_schedule(self);
    }

    pub fn create(self: &Arc<Self>, request: CreateDownload) -> CoreResult<Task> {
        (self.validate_url)(&request.download_url)?;
        sanitize_path_segment(&request.account_hash, "accountHash")?;
        sanitize_path_segment(&request.software.bundle_id, "bundleID")?;
        sanitize_path_segment(&request.software.version, "version")?;
        self.preflight_size(&request.download_url)?;

        let task = Task::new(
            request.software,
            request.account_hash,
            request.download_url,
            request.sinfs,
            request.itunes_metadata,
        );
        self.store.insert(task.clone())?;
        tracing::info!(
            "created task {} for {} {}",
            task.id,
            task.software.bundle_id,
            task.software.version
        );

        let manager = Arc::clone(self);
        let id = task.id;
        thread::spawn(move || manager.start_download(id));
        Ok(task)
    }

    pub fn get(&self, id: &TaskId) -> CoreResult<Task> {
        self.store.get(id)
    }

    pub fn list(&self, account_hashes: &[String]) -> CoreResult<Vec<Task>> {
        let tasks = self.store.list()?;
        Ok(tasks
            .into_iter()
            .filter(|task| account_hashes.contains(&task.account_hash))
            .collect())
    }

    pub fn pause(&self, id: &TaskId) -> CoreResult<()> {
        let task = self.store.get(id)?;
        if task.status != TaskStatus::Downloading {
            return Err(CoreError::InvalidState(format!(
                "cannot pause task in state {}",
                task.status
            )));
        }
        // Status flips first so the awaiting driver observes the pause and
        // suppresses its failure transition.
        let updated = self.store.update(id, |task| {
            task.status = TaskStatus::Paused;
            task.speed = "0 B/s".to_string();
        })?;
        self.hub.notify(&updated);

        let cancel = self.lock_cancels()?.get(id).cloned();
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        let downloader = self.lock_active()?.get(id).cloned();
        if let Some(downloader) = downloader {
            downloader.abort();
        }
        Ok(())
    }

    /// Restart a paused task from byte zero; there is no partial-chunk state.
    pub fn resume(self: &Arc<Self>, id: &TaskId) -> CoreResult<()> {
        let task = self.store.get(id)?;
        if task.status != TaskStatus::Paused {
            return Err(CoreError::InvalidState(format!(
                "cannot resume task in state {}",
                task.status
            )));
        }
        let manager = Arc::clone(self);
        let id = *id;
        thread::spawn(move || manager.start_download(id));
        Ok(())
    }

    pub fn delete(&self, id: &TaskId) -> CoreResult<()> {
        let downloader = self.lock_active()?.remove(id);
        if let Some(downloader) = downloader {
            downloader.abort();
        }
        let cancel = self.lock_cancels()?.remove(id);
        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        if let Some(task) = self.store.remove(id)? {
            self.remove_artifact(&task);
            self.hub.clear_task(*id);
            tracing::info!("deleted task {}", id);
        }
        self.store.persist()
    }

    pub fn subscribe(&self, id: &TaskId) -> (u64, Receiver<PublicTask>) {
        self.hub.subscribe(*id)
    }

    pub fn unsubscribe(&self, id: &TaskId, subscriber_id: u64) {
        self.hub.unsubscribe(*id, subscriber_id);
    }

    pub(crate) fn completed_tasks(&self) -> Vec<Task> {
        self.store
            .list()
            .unwrap_or_default()
            .into_iter()
            .filter(|task| task.status == TaskStatus::Completed)
            .collect()
    }

    /// Verify the advertised size against the configured cap before a task is
    /// created. Origins that hide the length from HEAD get a one-byte range
    /// probe; if the total still cannot be learned the request is refused.
    fn preflight_size(&self, url: &str) -> CoreResult<()> {
        let Some(cap) = self.config.max_download_bytes() else {
            return Ok(());
        };
        let mut total = match self.client.head(url) {
            Ok(probe) if (200..300).contains(&probe.status) => {
                probe.total_bytes.filter(|bytes| *bytes > 0)
            }
            _ => None,
        };
        if total.is_none() {
            total = self
                .client
                .fetch(url, Some((0, 0)))
                .ok()
                .and_then(|resp| resp.content_range_total);
        }
        let Some(total) = total else {
            return Err(CoreError::Preflight("Unable to verify file size".to_string()));
        };
        if total > cap {
            return Err(CoreError::SizeLimit);
        }
        Ok(())
    }

    fn start_download(self: &Arc<Self>, id: TaskId) {
        let cancel = Arc::new(CancelToken::with_deadline(DOWNLOAD_TIMEOUT));
        if let Ok(mut cancels) = self.cancels.lock() {
            cancels.insert(id, Arc::clone(&cancel));
        }

        let mut registered: Option<Arc<ChunkedDownloader>> = None;
        let result = self.run_download(id, &cancel, &mut registered);

        // Drop the indices, but only the entries this run registered; a
        // resumed run may already own the slots.
        if let Ok(mut cancels) = self.cancels.lock() {
            if cancels
                .get(&id)
                .map(|current| Arc::ptr_eq(current, &cancel))
                .unwrap_or(false)
            {
                cancels.remove(&id);
            }
        }
        if let Some(ours) = &registered {
            if let Ok(mut active) = self.active.lock() {
                if active
                    .get(&id)
                    .map(|current| Arc::ptr_eq(current, ours))
                    .unwrap_or(false)
                {
                    active.remove(&id);
                }
            }
        }

        if let Err(err) = result {
            self.handle_failure(id, err, &cancel, registered);
        }
    }

    fn run_download(
        self: &Arc<Self>,
        id: TaskId,
        cancel: &Arc<CancelToken>,
        registered: &mut Option<Arc<ChunkedDownloader>>,
    ) -> CoreResult<()> {
        cleanup::run_age_cleanup(self);
        cleanup::run_size_cleanup(self);

        let task = self.store.update(&id, |task| {
            task.status = TaskStatus::Downloading;
            task.progress = 0;
            task.speed = "0 B/s".to_string();
            task.error = None;
        })?;
        self.hub.notify(&task);

        let dest = self.destination_path(&task)?;
        let task = self.store.update(&id, |task| {
            task.file_path = dest.to_string_lossy().to_string();
        })?;

        (self.validate_url)(&task.download_url)?;

        let downloader = Arc::new(ChunkedDownloader::new(
            task.download_url.clone(),
            dest,
            self.config.download_threads,
            Arc::clone(&self.client),
            Arc::clone(cancel),
            self.progress_callback(id),
        ));
        *registered = Some(Arc::clone(&downloader));
        self.lock_active()?.insert(id, Arc::clone(&downloader));

        downloader.download()?;

        let task = self.store.get(&id)?;
        if !task.sinfs.is_empty() {
            let injecting = self.store.update(&id, |task| {
                task.status = TaskStatus::Injecting;
                task.progress = 100;
            })?;
            self.hub.notify(&injecting);
            injector::inject(
                Path::new(&injecting.file_path),
                &injecting.sinfs,
                injecting.itunes_metadata.as_deref(),
            )?;
        }

        let task = self.store.update(&id, |task| {
            task.status = TaskStatus::Completed;
            task.progress = 100;
            task.speed = "0 B/s".to_string();
            task.scrub_secrets();
        })?;
        self.store.persist()?;
        self.hub.notify(&task);
        tracing::info!("task {} completed", id);
        Ok(())
    }

    /// Compose `<packages>/<acct>/<bundle>/<version>/` from re-sanitized
    /// segments and assert it stays strictly inside the packages base.
    fn destination_path(&self, task: &Task) -> CoreResult<PathBuf> {
        let account = sanitize_path_segment(&task.account_hash, "accountHash")?;
        let bundle = sanitize_path_segment(&task.software.bundle_id, "bundleID")?;
        let version = sanitize_path_segment(&task.software.version, "version")?;
        let base = self.store.packages_dir();
        let dir = base.join(account).join(bundle).join(version);
        if !path_within_base(&dir, base) {
            return Err(CoreError::Validation(INVALID_PATH.to_string()));
        }
        fs::create_dir_all(&dir).map_err(|err| CoreError::Io(err.to_string()))?;
        Ok(dir.join(format!("{}.ipa", task.id)))
    }

    fn progress_callback(self: &Arc<Self>, id: TaskId) -> Arc<ProgressFn> {
        let weak = Arc::downgrade(self);
        Arc::new(move |update: ProgressUpdate| {
            let Some(manager) = weak.upgrade() else {
                return;
            };
            let updated = manager.store.update(&id, |task| {
                task.speed = update.speed.clone();
                if update.total > 0 {
                    let percent =
                        (update.downloaded as f64 / update.total as f64 * 100.0).round();
                    task.progress = percent.clamp(0.0, 100.0) as u8;
                }
            });
            if let Ok(task) = updated {
                manager.hub.notify(&task);
            }
        })
    }

    fn handle_failure(
        &self,
        id: TaskId,
        err: CoreError,
        cancel: &CancelToken,
        downloader: Option<Arc<ChunkedDownloader>>,
    ) {
        // An explicit cancel is an operator pause or delete, never a failure.
        // A deadline expiry without one is the global timeout and falls
        // through to the failure transition below.
        if matches!(err, CoreError::Aborted) && cancel.aborted_explicitly() {
            match self.store.get(&id) {
                // Pause: the status was already set and announced. The worker
                // threads have joined by now, so one more part sweep catches
                // anything written after the operator's abort ran.
                Ok(task) if task.status == TaskStatus::Paused => {
                    if let Some(downloader) = downloader {
                        downloader.abort();
                    }
                }
                // Deleted while in flight; same post-join sweep.
                Err(_) => {
                    if let Some(downloader) = downloader {
                        downloader.abort();
                    }
                }
                // Already resumed: the new run owns the artifacts now.
                Ok(_) => {}
            }
            return;
        }

        tracing::error!("task {} failed: {}", id, err);

        // Partial artifacts do not outlive a failed run.
        if let Some(downloader) = downloader {
            downloader.abort();
        }
        if let Ok(task) = self.store.get(&id) {
            if !task.file_path.is_empty() {
                let path = PathBuf::from(&task.file_path);
                if path_within_base(&path, self.store.packages_dir()) {
                    let _ = fs::remove_file(&path);
                }
            }
        }

        let message = match &err {
            CoreError::Aborted => "Download timed out",
            CoreError::Validation(msg) if msg == INVALID_PATH => INVALID_PATH,
            _ => "Download failed",
        };
        if let Ok(task) = self.store.update(&id, |task| {
            task.status = TaskStatus::Failed;
            task.error = Some(message.to_string());
            task.speed = "0 B/s".to_string();
        }) {
            self.hub.notify(&task);
        }
    }

    fn remove_artifact(&self, task: &Task) {
        if task.file_path.is_empty() {
            return;
        }
        let path = PathBuf::from(&task.file_path);
        let base = self.store.packages_dir();
        if !path_within_base(&path, base) {
            return;
        }
        let _ = fs::remove_file(&path);

        // Prune now-empty parents, stopping at the packages base. remove_dir
        // refuses non-empty directories, which terminates the walk.
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == base || fs::remove_dir(dir).is_err() {
                break;
            }
            current = dir.parent();
        }
    }

    fn lock_cancels(
        &self,
    ) -> CoreResult<std::sync::MutexGuard<'_, HashMap<TaskId, Arc<CancelToken>>>> {
        self.cancels
            .lock()
            .map_err(|_| CoreError::Storage("cancel index lock poisoned".to_string()))
    }

    fn lock_active(
        &self,
    ) -> CoreResult<std::sync::MutexGuard<'_, HashMap<TaskId, Arc<ChunkedDownloader>>>> {
        self.active
            .lock()
            .map_err(|_| CoreError::Storage("downloader index lock poisoned".to_string()))
    }
}
