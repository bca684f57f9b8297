use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use vmr_core::result::ScenarioResult;
use vmr_core::types::sanitize_file_name;

#[derive(Debug, thiserror::Error)]
pub enum ResultStoreError {
    #[error("failed to create result directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize result for '{scenario}': {source}")]
    Serialize {
        scenario: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write result file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read result file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse result file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Writes finished scenario results as pretty JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/<scenario>_<HHmmss>.json`, timed by the run's start.
    pub fn path_for(&self, result: &ScenarioResult) -> PathBuf {
        let started = result.started_at.with_timezone(&Local);
        self.dir.join(format!(
            "{}_{}.json",
            sanitize_file_name(&result.scenario_name),
            started.format("%H%M%S")
        ))
    }

    pub fn save(&self, result: &ScenarioResult) -> Result<PathBuf, ResultStoreError> {
        fs::create_dir_all(&self.dir).map_err(|source| ResultStoreError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.path_for(result);
        let json =
            serde_json::to_string_pretty(result).map_err(|source| ResultStoreError::Serialize {
                scenario: result.scenario_name.clone(),
                source,
            })?;
        fs::write(&path, json).map_err(|source| ResultStoreError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<ScenarioResult, ResultStoreError> {
        let raw = fs::read_to_string(path).map_err(|source| ResultStoreError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ResultStoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use vmr_core::scenario::Scenario;

    #[test]
    fn save_writes_pretty_json_named_after_start_time() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = ResultStore::new(dir.path().join("reports"));
        let mut result = ScenarioResult::start(&Scenario::new("Smoke/Nightly"));
        result.started_at = Local
            .with_ymd_and_hms(2026, 5, 1, 22, 4, 9)
            .single()
            .expect("valid time")
            .with_timezone(&Utc);
        result.finish();

        let path = store.save(&result).expect("save result");
        assert!(path.ends_with("Smoke_Nightly_220409.json"));

        let raw = fs::read_to_string(&path).expect("read result");
        assert!(raw.contains("\n  \"scenario_name\": \"Smoke/Nightly\""));
        assert_eq!(ResultStore::load(&path).expect("load result"), result);
    }

    #[test]
    fn load_reports_parse_errors() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("bad.json");
        fs::write(&path, "{}").expect("write");
        assert!(matches!(
            ResultStore::load(&path),
            Err(ResultStoreError::Parse { .. })
        ));
    }
}
