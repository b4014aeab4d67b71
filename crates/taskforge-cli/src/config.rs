//! `taskforge.toml` loading.

use crate::command::CommandSpec;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use taskforge_orchestrator::{ClusterConfig, OrchestratorConfig};

/// Where tasks run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Cluster,
}

/// Contents of a `taskforge.toml` file.
#[derive(Debug, Deserialize)]
pub struct TaskforgeConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Errors retried when a task raises them, by type name or command error kind
    /// (`Spawn`, `ExitStatus`).
    #[serde(default)]
    pub retry_on: Vec<String>,
    #[serde(default, rename = "task")]
    pub tasks: Vec<CommandSpec>,
}

impl TaskforgeConfig {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text)?;
        let mut seen = HashSet::new();
        for task in &config.tasks {
            if !seen.insert(task.id.as_str()) {
                anyhow::bail!("task id '{}' is declared twice", task.id);
            }
        }
        Ok(config)
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
        })?;
        let mut config = Self::parse(&text)?;
        config.resolve_paths(path.parent().unwrap_or_else(|| Path::new(".")));
        Ok(config)
    }

    /// Make relative paths relative to the directory holding the config file.
    fn resolve_paths(&mut self, base: &Path) {
        if let Some(dir) = self.orchestrator.checkpoint_dir.take() {
            self.orchestrator.checkpoint_dir = Some(base.join(dir));
        }
        for task in &mut self.tasks {
            task.cwd = task.cwd.take().map(|cwd| base.join(cwd));
        }
    }

    pub fn checkpoint_dir(&self) -> Option<&PathBuf> {
        self.orchestrator.checkpoint_dir.as_ref()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    const SAMPLE: &str = r#"
backend = "cluster"
retry_on = ["ExitStatus"]

[orchestrator]
children = 3
timeout_sec = 30
max_attempts = 2
checkpoint_dir = "checkpoints"

[cluster]
nodes = 4
slots_per_node = 8

[[task]]
id = "tile-1"
command = "gdal_translate"
args = ["-of", "COG", "in.tif", "out.tif"]
cwd = "work"

[[task]]
id = "tile-2"
command = "true"
env = { GDAL_CACHEMAX = "512" }
"#;

    #[test]
    fn test_parse_full_config() {
        let config = TaskforgeConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.backend, BackendKind::Cluster);
        assert_eq!(config.retry_on, vec!["ExitStatus"]);
        assert_eq!(config.orchestrator.children, 3);
        assert_eq!(config.orchestrator.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.orchestrator.max_attempts, Some(2));
        assert_eq!(config.cluster.capacity(), 32);
        assert_eq!(config.tasks.len(), 2);
        assert_eq!(config.tasks[0].args.len(), 4);
        assert_eq!(config.tasks[1].env["GDAL_CACHEMAX"], "512");
    }

    #[test]
    fn test_defaults() {
        let config = TaskforgeConfig::parse("").unwrap();
        assert_eq!(config.backend, BackendKind::Local);
        assert!(config.tasks.is_empty());
        assert!(config.retry_on.is_empty());
        assert_eq!(config.orchestrator, OrchestratorConfig::default());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let text = r#"
[[task]]
id = "a"
command = "true"

[[task]]
id = "a"
command = "false"
"#;
        assert!(TaskforgeConfig::parse(text).is_err());
    }

    #[tokio::test]
    async fn test_load_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taskforge.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = TaskforgeConfig::load(&path).await.unwrap();
        assert_eq!(
            config.checkpoint_dir().unwrap(),
            &dir.path().join("checkpoints")
        );
        assert_eq!(config.tasks[0].cwd.as_ref().unwrap(), &dir.path().join("work"));
        assert!(config.tasks[1].cwd.is_none());
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = TaskforgeConfig::load(Path::new("/nonexistent/taskforge.toml"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
