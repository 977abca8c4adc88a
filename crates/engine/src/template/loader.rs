// SPDX-FileCopyrightText: 2026 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;
use std::sync::Arc;

use super::{ScenarioTemplate, TemplateError, TemplateStore};

/// Loads templates from `<repo>/scenarios/<scenario_id>/scenario.yml`.
pub struct RepoTemplateStore {
    repo_dir: PathBuf,
    cache: moka::future::Cache<String, Arc<ScenarioTemplate>>,
}

fn is_valid_scenario_id(scenario_id: &str) -> bool {
    !scenario_id.is_empty()
        && scenario_id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

impl RepoTemplateStore {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            cache: moka::future::Cache::builder().build(),
        }
    }

    fn scenarios_dir(&self) -> PathBuf {
        self.repo_dir.join("scenarios")
    }

    async fn load_from_disk(&self, scenario_id: &str) -> Result<ScenarioTemplate, TemplateError> {
        let path = self.scenarios_dir().join(scenario_id).join("scenario.yml");
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TemplateError::NotFound(scenario_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let mut template: ScenarioTemplate = serde_yaml::from_str(&content)?;
        if template.id.is_empty() {
            template.id = scenario_id.to_string();
        } else if template.id != scenario_id {
            return Err(TemplateError::Inconsistent {
                scenario_id: scenario_id.to_string(),
                reason: format!("file declares id {}", template.id),
            });
        }
        template.validate()?;
        Ok(template)
    }

    /// Drops a cached template so the next load re-reads it from disk.
    pub async fn invalidate(&self, scenario_id: &str) {
        self.cache.invalidate(scenario_id).await;
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    /// Ids of every scenario in the repository that loads cleanly.
    pub async fn available_scenarios(&self) -> Result<Vec<String>, TemplateError> {
        let dir = self.scenarios_dir();
        let mut scenarios = vec![];
        if !dir.is_dir() {
            return Ok(scenarios);
        }
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let scenario_id = entry.file_name().to_string_lossy().to_string();
            match self.load(&scenario_id).await {
                Ok(_) => scenarios.push(scenario_id),
                Err(e) => {
                    tracing::warn!(
                        "Failed to load scenario from directory {}: {}",
                        entry.path().to_string_lossy(),
                        e
                    );
                }
            }
        }
        scenarios.sort();
        Ok(scenarios)
    }
}

#[async_trait::async_trait]
impl TemplateStore for RepoTemplateStore {
    async fn load(&self, scenario_id: &str) -> Result<Arc<ScenarioTemplate>, TemplateError> {
        if !is_valid_scenario_id(scenario_id) {
            return Err(TemplateError::InvalidId(scenario_id.to_string()));
        }
        if let Some(template) = self.cache.get(scenario_id).await {
            return Ok(template);
        }
        let template = Arc::new(self.load_from_disk(scenario_id).await?);
        self.cache
            .insert(scenario_id.to_string(), template.clone())
            .await;
        Ok(template)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::template::fixtures::RANGE_YML;

    fn write_scenario(repo: &Path, dir_name: &str, content: &str) {
        let dir = repo.join("scenarios").join(dir_name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("scenario.yml"), content).unwrap();
    }

    #[tokio::test]
    async fn test_load_from_repo() {
        let repo = tempfile::tempdir().unwrap();
        write_scenario(repo.path(), "web-breach", RANGE_YML);
        let store = RepoTemplateStore::new(repo.path());
        let template = store.load("web-breach").await.unwrap();
        assert_eq!(template.name, "Web breach");
        assert_eq!(template.items.len(), 4);
    }

    #[tokio::test]
    async fn test_missing_scenario() {
        let repo = tempfile::tempdir().unwrap();
        let store = RepoTemplateStore::new(repo.path());
        assert!(matches!(
            store.load("nothing-here").await,
            Err(TemplateError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let repo = tempfile::tempdir().unwrap();
        let store = RepoTemplateStore::new(repo.path());
        assert!(matches!(
            store.load("../etc").await,
            Err(TemplateError::InvalidId(_))
        ));
        assert!(matches!(store.load("").await, Err(TemplateError::InvalidId(_))));
    }

    #[tokio::test]
    async fn test_id_mismatch() {
        let repo = tempfile::tempdir().unwrap();
        write_scenario(repo.path(), "other", RANGE_YML);
        let store = RepoTemplateStore::new(repo.path());
        assert!(matches!(
            store.load("other").await,
            Err(TemplateError::Inconsistent { .. })
        ));
    }

    #[tokio::test]
    async fn test_cache_and_invalidate() {
        let repo = tempfile::tempdir().unwrap();
        write_scenario(repo.path(), "web-breach", RANGE_YML);
        let store = RepoTemplateStore::new(repo.path());
        store.load("web-breach").await.unwrap();

        let renamed = RANGE_YML.replace("name: Web breach", "name: Web breach v2");
        write_scenario(repo.path(), "web-breach", &renamed);
        assert_eq!(store.load("web-breach").await.unwrap().name, "Web breach");

        store.invalidate("web-breach").await;
        assert_eq!(store.load("web-breach").await.unwrap().name, "Web breach v2");
    }

    #[tokio::test]
    async fn test_available_scenarios_skips_broken() {
        let repo = tempfile::tempdir().unwrap();
        write_scenario(repo.path(), "web-breach", RANGE_YML);
        write_scenario(repo.path(), "broken", "name: [unterminated");
        let store = RepoTemplateStore::new(repo.path());
        assert_eq!(store.available_scenarios().await.unwrap(), vec!["web-breach"]);
    }
}
