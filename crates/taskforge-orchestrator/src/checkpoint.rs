use crate::process::Process;
use crate::types::Status;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use taskforge_core::{TaskforgeError, TaskforgeResult};

/// `{task_id: (status, result)}` as written to a checkpoint file. A task with
/// no result yet is recorded with `null`.
pub type Snapshot = BTreeMap<String, (Status, Value)>;

const PREFIX: &str = "checkpoint-";

/// Capture the current state of every process.
pub fn snapshot(processes: &BTreeMap<String, Process>) -> Snapshot {
    processes
        .iter()
        .map(|(id, p)| {
            let repr = p.result().map_or(Value::Null, |r| r.repr());
            (id.clone(), (p.status(), repr))
        })
        .collect()
}

/// Directory of timestamped JSON checkpoints.
///
/// Files are named `checkpoint-<UTC timestamp>.json` so that sorting by name
/// sorts by age.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn ensure_dir(&self) -> TaskforgeResult<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| checkpoint_error(&self.dir, e))
    }

    /// Write `snapshot` to a new file and return its path.
    pub async fn save(&self, snapshot: &Snapshot) -> TaskforgeResult<PathBuf> {
        self.ensure_dir().await?;
        let timestamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.6f");
        let path = self.dir.join(format!("{PREFIX}{timestamp}.json"));

        let json = serde_json::to_vec(snapshot)?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| checkpoint_error(&path, e))?;
        Ok(path)
    }

    /// All checkpoint files, oldest first.
    pub async fn list(&self) -> TaskforgeResult<Vec<PathBuf>> {
        if !tokio::fs::try_exists(&self.dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| checkpoint_error(&self.dir, e))?;

        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name.starts_with(PREFIX) && name.ends_with(".json") {
                    entries.push(path);
                }
            }
        }

        entries.sort();
        Ok(entries)
    }

    pub async fn load(&self, path: &Path) -> TaskforgeResult<Snapshot> {
        let content = tokio::fs::read(path)
            .await
            .map_err(|e| checkpoint_error(path, e))?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// The newest checkpoint, if any was written.
    pub async fn load_latest(&self) -> TaskforgeResult<Option<Snapshot>> {
        match self.list().await?.last() {
            Some(path) => self.load(path).await.map(Some),
            None => Ok(None),
        }
    }
}

fn checkpoint_error(path: &Path, e: std::io::Error) -> TaskforgeError {
    TaskforgeError::Checkpoint(format!("{}: {e}", path.display()))
}
