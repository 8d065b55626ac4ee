use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{CoreError, CoreResult};
use crate::task::{Task, TaskId, TaskStatus};

const SNAPSHOT_FILE: &str = "tasks.json";
const LEGACY_SNAPSHOT_FILE: &str = "downloads.json";
const PACKAGES_DIR: &str = "packages";

/// Authoritative in-memory task map plus its on-disk JSON snapshot.
/// Only completed tasks whose artifact still exists are ever persisted.
pub struct TaskStore {
    packages_dir: PathBuf,
    snapshot_path: PathBuf,
    tasks: Mutex<HashMap<TaskId, Task>>,
    write_lock: Mutex<()>,
}

impl TaskStore {
    pub fn open(data_dir: &Path) -> CoreResult<Self> {
        fs::create_dir_all(data_dir).map_err(|err| CoreError::Io(err.to_string()))?;

        // Migration hygiene: the pre-snapshot format is simply discarded.
        let legacy = data_dir.join(LEGACY_SNAPSHOT_FILE);
        if legacy.exists() {
            tracing::info!("removing legacy snapshot {}", legacy.display());
            let _ = fs::remove_file(&legacy);
        }

        let packages_dir = data_dir.join(PACKAGES_DIR);
        fs::create_dir_all(&packages_dir).map_err(|err| CoreError::Io(err.to_string()))?;
        let packages_dir = packages_dir
            .canonicalize()
            .map_err(|err| CoreError::Io(err.to_string()))?;

        let snapshot_path = data_dir.join(SNAPSHOT_FILE);
        let tasks = load_snapshot(&snapshot_path);

        let store = Self {
            packages_dir,
            snapshot_path,
            tasks: Mutex::new(tasks),
            write_lock: Mutex::new(()),
        };
        store.sweep_orphans();
        Ok(store)
    }

    pub fn packages_dir(&self) -> &Path {
        &self.packages_dir
    }

    pub fn insert(&self, task: Task) -> CoreResult<()> {
        let mut tasks = self.lock_tasks()?;
        tasks.insert(task.id, task);
        Ok(())
    }

    pub fn get(&self, id: &TaskId) -> CoreResult<Task> {
        let tasks = self.lock_tasks()?;
        tasks
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(id.to_string()))
    }

    pub fn list(&self) -> CoreResult<Vec<Task>> {
        let tasks = self.lock_tasks()?;
        let mut all: Vec<Task> = tasks.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }

    pub fn remove(&self, id: &TaskId) -> CoreResult<Option<Task>> {
        let mut tasks = self.lock_tasks()?;
        Ok(tasks.remove(id))
    }

    /// Mutate one task under the map lock, returning the updated copy.
    pub fn update<F>(&self, id: &TaskId, mutate: F) -> CoreResult<Task>
    where
        F: FnOnce(&mut Task),
    {
        let mut tasks = self.lock_tasks()?;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        mutate(task);
        Ok(task.clone())
    }

    /// Write the whole snapshot: completed tasks with a live artifact only.
    /// The file is replaced via a temp-and-rename so a crash mid-write never
    /// leaves a torn snapshot behind.
    pub fn persist(&self) -> CoreResult<()> {
        let snapshot: Vec<Task> = {
            let tasks = self.lock_tasks()?;
            let mut keep: Vec<Task> = tasks
                .values()
                .filter(|task| task.status == TaskStatus::Completed && task.has_file())
                .cloned()
                .collect();
            keep.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            keep
        };

        let _io = self
            .write_lock
            .lock()
            .map_err(|_| CoreError::Storage("write lock poisoned".to_string()))?;
        let body = serde_json::to_vec_pretty(&snapshot)
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        let tmp = self.snapshot_path.with_extension("json.tmp");
        fs::write(&tmp, body).map_err(|err| CoreError::Io(err.to_string()))?;
        fs::rename(&tmp, &self.snapshot_path).map_err(|err| CoreError::Io(err.to_string()))?;
        Ok(())
    }

    /// Remove every file under the packages tree that no admitted task claims,
    /// then prune directories that ended up empty, deepest first.
    fn sweep_orphans(&self) {
        let claimed: HashSet<PathBuf> = match self.tasks.lock() {
            Ok(tasks) => tasks
                .values()
                .filter(|task| !task.file_path.is_empty())
                .map(|task| PathBuf::from(&task.file_path))
                .collect(),
            Err(_) => return,
        };

        let mut files = Vec::new();
        let mut dirs = Vec::new();
        collect_entries(&self.packages_dir, &mut files, &mut dirs);

        for file in files {
            if !claimed.contains(&file) {
                tracing::info!("removing orphaned artifact {}", file.display());
                let _ = fs::remove_file(&file);
            }
        }

        dirs.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));
        for dir in dirs {
            // remove_dir refuses non-empty directories, which is exactly
            // the pruning rule.
            let _ = fs::remove_dir(&dir);
        }
    }

    fn lock_tasks(&self) -> CoreResult<std::sync::MutexGuard<'_, HashMap<TaskId, Task>>> {
        self.tasks
            .lock()
            .map_err(|_| CoreError::Storage("task map lock poisoned".to_string()))
    }
}

fn load_snapshot(path: &Path) -> HashMap<TaskId, Task> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(_) => return HashMap::new(),
    };
    let parsed: Vec<Task> = match serde_json::from_slice(&raw) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::warn!("corrupt snapshot {}: {}; starting empty", path.display(), err);
            return HashMap::new();
        }
    };
    parsed
        .into_iter()
        .filter(|task| task.status == TaskStatus::Completed && task.has_file())
        .map(|task| (task.id, task))
        .collect()
}

fn collect_entries(dir: &Path, files: &mut Vec<PathBuf>, dirs: &mut Vec<PathBuf>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            dirs.push(path.clone());
            collect_entries(&path, files, dirs);
        } else {
            files.push(path);
        }
    }
}
