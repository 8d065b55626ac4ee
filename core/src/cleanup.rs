use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use chrono::{Local, TimeZone};

use crate::manager::DownloadManager;
use crate::task::Task;

/// Delete completed artifacts older than the configured age. Runs once at
/// startup, before every download start, and at each local midnight.
pub fn run_age_cleanup(manager: &DownloadManager) {
    let days = manager.config().auto_cleanup_days;
    if days == 0 {
        return;
    }
    let max_age = Duration::from_secs(u64::from(days) * 24 * 60 * 60);
    let Some(threshold) = SystemTime::now().checked_sub(max_age) else {
        return;
    };
    for task in manager.completed_tasks() {
        let Some(modified) = file_mtime(&task) else {
            continue;
        };
        if modified < threshold {
            tracing::info!("age cleanup removing task {}", task.id);
            let _ = manager.delete(&task.id);
        }
    }
}

/// Trim the oldest completed artifacts until the total size fits the budget.
/// Runs before each new download starts.
pub fn run_size_cleanup(manager: &DownloadManager) {
    let budget_mb = manager.config().auto_cleanup_max_mb;
    if budget_mb == 0 {
        return;
    }
    let budget = budget_mb * 1024 * 1024;

    let mut entries: Vec<(Task, u64, SystemTime)> = manager
        .completed_tasks()
        .into_iter()
        .filter_map(|task| {
            let meta = fs::metadata(&task.file_path).ok()?;
            let modified = meta.modified().ok()?;
            Some((task, meta.len(), modified))
        })
        .collect();

    let mut total: u64 = entries.iter().map(|(_, size, _)| size).sum();
    if total <= budget {
        return;
    }

    entries.sort_by_key(|(_, _, modified)| *modified);
    for (task, size, _) in entries {
        if total <= budget {
            break;
        }
        tracing::info!("size cleanup removing task {}", task.id);
        if manager.delete(&task.id).is_ok() {
            total = total.saturating_sub(size);
        }
    }
}

/// Absolute wake-at-midnight computation, recomputed each iteration so the
/// schedule does not drift with sleep inaccuracy.
pub fn next_midnight_delay() -> Duration {
    let now = Local::now();
    let fallback = Duration::from_secs(24 * 60 * 60);
    let Some(tomorrow) = now.date_naive().succ_opt() else {
        return fallback;
    };
    let Some(midnight) = tomorrow.and_hms_opt(0, 0, 0) else {
        return fallback;
    };
    match Local.from_local_datetime(&midnight).earliest() {
        Some(target) => (target - now).to_std().unwrap_or(fallback),
        None => fallback,
    }
}

pub fn spawn_midnight_schedule(manager: &Arc<DownloadManager>) {
    let weak = Arc::downgrade(manager);
    thread::spawn(move || loop {
        thread::sleep(next_midnight_delay());
        let Some(manager) = weak.upgrade() else {
            break;
        };
        tracing::debug!("running scheduled age cleanup");
        run_age_cleanup(&manager);
    });
}

fn file_mtime(task: &Task) -> Option<SystemTime> {
    fs::metadata(&task.file_path).ok()?.modified().ok()
}
