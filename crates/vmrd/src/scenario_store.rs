//! Scenario documents on disk, one JSON file per scenario.

use std::fs;
use std::path::{Path, PathBuf};

use vmr_core::scenario::Scenario;
use vmr_core::types::sanitize_file_name;

#[derive(Debug, thiserror::Error)]
pub enum ScenarioStoreError {
    #[error("failed to read scenario directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read scenario file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse scenario file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize scenario '{name}': {source}")]
    Serialize {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to create scenario directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write scenario file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to delete scenario file {path}: {source}")]
    Delete {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioStore {
    dir: PathBuf,
}

impl ScenarioStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_file_name(name)))
    }

    /// Every readable scenario, sorted by name. A missing directory is empty.
    pub fn load_all(&self) -> Result<Vec<Scenario>, ScenarioStoreError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.dir).map_err(|source| ScenarioStoreError::ReadDir {
            path: self.dir.clone(),
            source,
        })?;

        let mut scenarios = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match load_file(&path) {
                Ok(scenario) => scenarios.push(scenario),
                Err(err) => tracing::warn!(error = %err, "skipping scenario file"),
            }
        }
        scenarios.sort_by_key(|scenario| scenario.name.to_lowercase());
        Ok(scenarios)
    }

    /// Case-insensitive lookup by scenario name.
    pub fn find(&self, name: &str) -> Result<Option<Scenario>, ScenarioStoreError> {
        let wanted = name.trim();
        Ok(self
            .load_all()?
            .into_iter()
            .find(|scenario| scenario.name.eq_ignore_ascii_case(wanted)))
    }

    pub fn save(&self, scenario: &Scenario) -> Result<PathBuf, ScenarioStoreError> {
        fs::create_dir_all(&self.dir).map_err(|source| ScenarioStoreError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.path_for(&scenario.name);
        let json = serde_json::to_string_pretty(scenario).map_err(|source| {
            ScenarioStoreError::Serialize {
                name: scenario.name.clone(),
                source,
            }
        })?;
        fs::write(&path, json).map_err(|source| ScenarioStoreError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// Returns whether a file was removed.
    pub fn delete(&self, name: &str) -> Result<bool, ScenarioStoreError> {
        let path = self.path_for(name);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).map_err(|source| ScenarioStoreError::Delete { path, source })?;
        Ok(true)
    }
}

pub fn load_file(path: &Path) -> Result<Scenario, ScenarioStoreError> {
    let raw = fs::read_to_string(path).map_err(|source| ScenarioStoreError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ScenarioStoreError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
