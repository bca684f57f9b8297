use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use vmr_core::result::ScenarioResult;
use vmr_core::types::ScenarioId;

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("sqlite error: {source}")]
    Sql {
        #[from]
        source: rusqlite::Error,
    },
    #[error("json serialization error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("timestamp parse error for value '{value}': {source}")]
    TimestampParse {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("failed to create history directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Summary row for one recorded scenario run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub run_id: i64,
    pub scenario_id: ScenarioId,
    pub scenario_name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
    pub success: bool,
    pub result_path: Option<PathBuf>,
}

#[derive(Debug)]
pub struct HistoryStore {
    conn: Connection,
}

impl HistoryStore {
    /// Opens (creating parent directories) and migrates.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, HistoryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| HistoryError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let store = Self {
            conn: Connection::open(path)?,
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, HistoryError> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn migrate(&self) -> Result<(), HistoryError> {
        self.conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS scenario_runs (
    run_id INTEGER PRIMARY KEY AUTOINCREMENT,
    scenario_id TEXT NOT NULL,
    scenario_name TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    total INTEGER NOT NULL,
    passed INTEGER NOT NULL,
    failed INTEGER NOT NULL,
    skipped INTEGER NOT NULL,
    errors INTEGER NOT NULL,
    success INTEGER NOT NULL,
    result_path TEXT,
    payload_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_scenario_runs_name ON scenario_runs(scenario_name, started_at);
"#,
        )?;
        Ok(())
    }

    /// Returns the new run id.
    pub fn record(
        &self,
        result: &ScenarioResult,
        result_path: Option<&Path>,
    ) -> Result<i64, HistoryError> {
        let payload = serde_json::to_string(result)?;
        self.conn.execute(
            r#"
INSERT INTO scenario_runs (
    scenario_id, scenario_name, started_at, ended_at,
    total, passed, failed, skipped, errors, success, result_path, payload_json
)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
"#,
            params![
                result.scenario_id.0,
                result.scenario_name,
                result.started_at.to_rfc3339(),
                result.ended_at.map(|at| at.to_rfc3339()),
                result.total_count() as i64,
                result.passed_count() as i64,
                result.failed_count() as i64,
                result.skipped_count() as i64,
                result.error_count() as i64,
                result.is_success(),
                result_path.map(|path| path.display().to_string()),
                payload,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Newest first. `scenario` filters by name, case-insensitively.
    pub fn recent(
        &self,
        limit: usize,
        scenario: Option<&str>,
    ) -> Result<Vec<HistoryEntry>, HistoryError> {
        let mut stmt = self.conn.prepare(
            r#"
SELECT run_id, scenario_id, scenario_name, started_at, ended_at,
       total, passed, failed, skipped, errors, success, result_path
FROM scenario_runs
WHERE ?1 IS NULL OR scenario_name = ?1 COLLATE NOCASE
ORDER BY started_at DESC, run_id DESC
LIMIT ?2
"#,
        )?;
        let rows = stmt.query_map(params![scenario, limit as i64], |row| {
            Ok(HistoryRow {
                run_id: row.get(0)?,
                scenario_id: row.get(1)?,
                scenario_name: row.get(2)?,
                started_at: row.get(3)?,
                ended_at: row.get(4)?,
                total: row.get(5)?,
                passed: row.get(6)?,
                failed: row.get(7)?,
                skipped: row.get(8)?,
                errors: row.get(9)?,
                success: row.get(10)?,
                result_path: row.get(11)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.into_entry()?);
        }
        Ok(entries)
    }

    pub fn load_result(&self, run_id: i64) -> Result<Option<ScenarioResult>, HistoryError> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload_json FROM scenario_runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|value| serde_json::from_str::<ScenarioResult>(&value))
            .transpose()
            .map_err(HistoryError::from)
    }
}

struct HistoryRow {
    run_id: i64,
    scenario_id: String,
    scenario_name: String,
    started_at: String,
    ended_at: Option<String>,
    total: i64,
    passed: i64,
    failed: i64,
    skipped: i64,
    errors: i64,
    success: bool,
    result_path: Option<String>,
}

impl HistoryRow {
    fn into_entry(self) -> Result<HistoryEntry, HistoryError> {
        Ok(HistoryEntry {
            run_id: self.run_id,
            scenario_id: ScenarioId(self.scenario_id),
            scenario_name: self.scenario_name,
            started_at: parse_ts(&self.started_at)?,
            ended_at: self.ended_at.as_deref().map(parse_ts).transpose()?,
            total: count(self.total),
            passed: count(self.passed),
            failed: count(self.failed),
            skipped: count(self.skipped),
            errors: count(self.errors),
            success: self.success,
            result_path: self.result_path.map(PathBuf::from),
        })
    }
}

fn count(value: i64) -> usize {
    usize::try_from(value).unwrap_or_default()
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, HistoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|source| HistoryError::TimestampParse {
            value: value.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use vmr_core::result::{StepResult, StepStatus};
    use vmr_core::scenario::{Execution, Scenario, Step};
    use vmr_core::types::VmRef;

    fn finished(name: &str, statuses: &[StepStatus], offset_mins: i64) -> ScenarioResult {
        let mut scenario = Scenario::new(name);
        for (index, _) in statuses.iter().enumerate() {
            scenario.steps.push(Step::new(
                format!("step-{index}"),
                VmRef::new("vm.vmx"),
                "clean",
                Execution::program("a.exe"),
            ));
        }
        let mut result = ScenarioResult::start(&scenario);
        result.started_at = result.started_at + Duration::minutes(offset_mins);
        for (step, status) in scenario.steps.iter().zip(statuses) {
            let mut step_result = StepResult::pending(step, "vm");
            step_result.status = *status;
            result.step_results.push(step_result);
        }
        result.ended_at = Some(result.started_at + Duration::seconds(42));
        result
    }

    #[test]
    fn record_and_list_newest_first() {
        let store = HistoryStore::open_in_memory().expect("open history");
        store
            .record(&finished("Smoke", &[StepStatus::Passed], 0), None)
            .expect("record first");
        let second = finished("Smoke", &[StepStatus::Passed, StepStatus::Failed], 5);
        store
            .record(&second, Some(Path::new("results/Smoke_101500.json")))
            .expect("record second");

        let entries = store.recent(10, None).expect("list history");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].total, 2);
        assert_eq!(entries[0].failed, 1);
        assert!(!entries[0].success);
        assert_eq!(
            entries[0].result_path.as_deref(),
            Some(Path::new("results/Smoke_101500.json"))
        );
        assert!(entries[1].success);
        assert_eq!(entries[0].started_at, second.started_at);
    }

    #[test]
    fn recent_filters_by_name_and_limits() {
        let store = HistoryStore::open_in_memory().expect("open history");
        for offset in 0..3 {
            store
                .record(&finished("Nightly", &[StepStatus::Passed], offset), None)
                .expect("record nightly");
        }
        store
            .record(&finished("Smoke", &[StepStatus::Error], 10), None)
            .expect("record smoke");

        let nightly = store.recent(2, Some("nightly")).expect("filter history");
        assert_eq!(nightly.len(), 2);
        assert!(nightly.iter().all(|entry| entry.scenario_name == "Nightly"));

        let smoke = store.recent(10, Some("Smoke")).expect("filter history");
        assert_eq!(smoke[0].errors, 1);
    }

    #[test]
    fn stored_payload_round_trips() {
        let store = HistoryStore::open_in_memory().expect("open history");
        let result = finished("Smoke", &[StepStatus::Passed], 0);
        let run_id = store.record(&result, None).expect("record");

        assert_eq!(store.load_result(run_id).expect("load"), Some(result));
        assert_eq!(store.load_result(run_id + 100).expect("load"), None);
    }

    #[test]
    fn open_creates_parent_directory() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join(".vmregress").join("history.sqlite");
        let store = HistoryStore::open(&path).expect("open history");
        assert!(store.recent(5, None).expect("list").is_empty());
        assert!(path.exists());
    }
}
