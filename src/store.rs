//! Persisted key/value state shared by the counter, the detector and the CLI.
//!
//! The document is a single JSON object whose camelCase keys match what the
//! browser extension kept in local storage. Every mutation goes through
//! [`Store::update`], which re-reads the file, applies the change and writes
//! it back atomically (temp file + rename), so one call never loses another
//! call's update within the process.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Per-task accumulation of time and completions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAggregate {
    /// Total time in milliseconds.
    #[serde(default)]
    pub time: u64,
    #[serde(default)]
    pub task_count: u64,
    /// Completions per `YYYY-MM-DD` date.
    #[serde(default)]
    pub dates: BTreeMap<String, u64>,
}

impl TaskAggregate {
    pub fn record(&mut self, elapsed: Duration, date: &str) {
        self.time += elapsed.as_millis() as u64;
        self.task_count += 1;
        *self.dates.entry(date.to_owned()).or_insert(0) += 1;
    }

    pub fn dated_total(&self) -> u64 {
        self.dates.values().sum()
    }
}

/// User-editable settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Warn when a task is submitted while counting is stopped.
    pub warn_if_forgot_to_start: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            warn_if_forgot_to_start: true,
        }
    }
}

/// The whole persisted document. A missing file yields these defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreData {
    /// Identity token; numeric ids are kept as strings to preserve precision.
    #[serde(deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub is_counting: bool,
    pub task_count: u64,
    pub tasks: BTreeMap<String, TaskAggregate>,
    /// Epoch milliseconds.
    pub start_time: i64,
    /// Epoch milliseconds.
    pub stop_time: i64,
    pub worked_seconds: f64,
    pub current_task_name: Option<String>,
    /// Epoch milliseconds of the last recorded submission.
    pub last_submit: Option<i64>,
    /// Totals computed by the bot service, kept as it sent them.
    pub total_time: serde_json::Value,
    pub total_payout: serde_json::Value,
    pub settings: Settings,
}

impl Default for StoreData {
    fn default() -> Self {
        Self {
            user_id: None,
            is_counting: false,
            task_count: 0,
            tasks: BTreeMap::new(),
            start_time: 0,
            stop_time: 0,
            worked_seconds: 0.0,
            current_task_name: None,
            last_submit: None,
            total_time: serde_json::Value::from(0),
            total_payout: serde_json::Value::from(0),
            settings: Settings::default(),
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number for userId, got {other}"
        ))),
    }
}

impl StoreData {
    /// Apply one recorded submission.
    pub fn record_submission(&mut self, task_name: &str, elapsed: Duration, date: &str, at_ms: i64) {
        self.tasks
            .entry(task_name.to_owned())
            .or_default()
            .record(elapsed, date);
        self.task_count += 1;
        self.current_task_name = Some(task_name.to_owned());
        self.last_submit = Some(at_ms);
        self.worked_seconds += elapsed.as_secs_f64();
    }

    /// Sum of the per-task times, in milliseconds.
    pub fn total_task_time(&self) -> u64 {
        self.tasks.values().map(|t| t.time).sum()
    }

    pub fn total_task_count(&self) -> u64 {
        self.tasks.values().map(|t| t.task_count).sum()
    }

    /// Worked seconds including the running session, if counting.
    pub fn session_seconds(&self, now_ms: i64) -> f64 {
        let mut seconds = self.worked_seconds;
        if self.is_counting {
            seconds += (now_ms - self.start_time).max(0) as f64 / 1000.0;
        }
        seconds
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read store {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse store {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to write store {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to encode store: {0}")]
    Encode(#[from] serde_json::Error),
}

struct StoreInner {
    path: Option<PathBuf>,
    data: StoreData,
}

/// Cloneable handle to the persisted document.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Mutex<StoreInner>>,
}

impl Store {
    /// Open the store at `path`; a missing file starts from defaults and is
    /// created on the first write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let data = read_file(&path)?.unwrap_or_default();
        tracing::debug!(path = %path.display(), "store opened");
        Ok(Self {
            inner: Arc::new(Mutex::new(StoreInner {
                path: Some(path),
                data,
            })),
        })
    }

    /// A store that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                path: None,
                data: StoreData::default(),
            })),
        }
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.inner.lock().path.clone()
    }

    /// Copy of the current document.
    pub fn load(&self) -> Result<StoreData, StoreError> {
        let mut inner = self.inner.lock();
        if let Some(path) = inner.path.clone() {
            if let Some(data) = read_file(&path)? {
                inner.data = data;
            }
        }
        Ok(inner.data.clone())
    }

    /// Read-modify-write the whole document. The closure's return value is
    /// passed through.
    pub fn update<R>(&self, f: impl FnOnce(&mut StoreData) -> R) -> Result<R, StoreError> {
        let mut inner = self.inner.lock();
        let mut data = match &inner.path {
            Some(path) => read_file(path)?.unwrap_or_else(|| inner.data.clone()),
            None => inner.data.clone(),
        };
        let result = f(&mut data);
        if let Some(path) = &inner.path {
            write_file(path, &data)?;
        }
        inner.data = data;
        Ok(result)
    }

    pub fn user_id(&self) -> Option<String> {
        match self.load() {
            Ok(data) => data.user_id,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read user id");
                None
            }
        }
    }

    pub fn set_user_id(&self, user_id: &str) -> Result<(), StoreError> {
        self.update(|data| data.user_id = Some(user_id.to_owned()))
    }

    /// Forget the identity token.
    pub fn logout(&self) -> Result<(), StoreError> {
        self.update(|data| data.user_id = None)
    }

    /// Begin a counting session. Returns false if one is already running.
    pub fn start_counting(&self, now_ms: i64) -> Result<bool, StoreError> {
        self.update(|data| {
            if data.is_counting {
                return false;
            }
            data.is_counting = true;
            data.start_time = now_ms;
            data.last_submit = Some(now_ms);
            true
        })
    }

    /// End the counting session. Returns the seconds it added, or `None`
    /// when counting was not running.
    pub fn stop_counting(&self, now_ms: i64) -> Result<Option<f64>, StoreError> {
        self.update(|data| {
            if !data.is_counting {
                return None;
            }
            let seconds = (now_ms - data.start_time).max(0) as f64 / 1000.0;
            data.worked_seconds += seconds;
            data.stop_time = now_ms;
            data.is_counting = false;
            Some(seconds)
        })
    }

    /// Clear the task history and counters. Identity and settings survive.
    pub fn reset(&self) -> Result<(), StoreError> {
        self.update(|data| {
            *data = StoreData {
                user_id: data.user_id.take(),
                settings: data.settings.clone(),
                ..StoreData::default()
            };
        })
    }

    pub fn set_server_totals(
        &self,
        total_time: serde_json::Value,
        total_payout: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.update(|data| {
            data.total_time = total_time;
            data.total_payout = total_payout;
        })
    }

    pub fn set_warn_if_forgot_to_start(&self, enabled: bool) -> Result<(), StoreError> {
        self.update(|data| data.settings.warn_if_forgot_to_start = enabled)
    }
}

fn read_file(path: &Path) -> Result<Option<StoreData>, StoreError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

fn write_file(path: &Path, data: &StoreData) -> Result<(), StoreError> {
    let write_err = |source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }
    let contents = serde_json::to_string_pretty(data)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, contents).map_err(write_err)?;
    std::fs::rename(&tmp, path).map_err(write_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_fresh_install() {
        let data = StoreData::default();
        assert!(!data.is_counting);
        assert_eq!(data.task_count, 0);
        assert!(data.tasks.is_empty());
        assert!(data.settings.warn_if_forgot_to_start);
        assert!(data.user_id.is_none());
    }

    #[test]
    fn parses_extension_document() {
        let json = r#"{
            "userId": 123456789012345678,
            "isCounting": true,
            "taskCount": 2,
            "tasks": {
                "Search": {"time": 60000, "taskCount": 2, "dates": {"2024-01-01": 2}}
            },
            "startTime": 1000,
            "settings": {"warnIfForgotToStart": false}
        }"#;
        let data: StoreData = serde_json::from_str(json).unwrap();
        assert_eq!(data.user_id.as_deref(), Some("123456789012345678"));
        assert!(data.is_counting);
        assert_eq!(data.tasks["Search"].time, 60000);
        assert_eq!(data.tasks["Search"].dated_total(), 2);
        assert!(!data.settings.warn_if_forgot_to_start);
        assert_eq!(data.worked_seconds, 0.0);
    }

    #[test]
    fn record_keeps_count_equal_to_dates() {
        let mut aggregate = TaskAggregate::default();
        aggregate.record(Duration::from_secs(10), "2024-01-01");
        aggregate.record(Duration::from_millis(2500), "2024-01-01");
        aggregate.record(Duration::from_secs(1), "2024-01-02");
        assert_eq!(aggregate.task_count, 3);
        assert_eq!(aggregate.time, 13_500);
        assert_eq!(aggregate.dated_total(), aggregate.task_count);
        assert_eq!(aggregate.dates["2024-01-01"], 2);
    }

    #[test]
    fn update_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");

        let store = Store::open(&path).unwrap();
        store.set_user_id("42").unwrap();
        store
            .update(|d| d.record_submission("T", Duration::from_secs(3), "2024-05-01", 99))
            .unwrap();

        let reopened = Store::open(&path).unwrap();
        let data = reopened.load().unwrap();
        assert_eq!(data.user_id.as_deref(), Some("42"));
        assert_eq!(data.tasks["T"].time, 3000);
        assert_eq!(data.task_count, 1);
        assert_eq!(data.last_submit, Some(99));
        assert_eq!(data.current_task_name.as_deref(), Some("T"));
    }

    #[test]
    fn update_rereads_changes_from_other_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let a = Store::open(&path).unwrap();
        let b = Store::open(&path).unwrap();

        a.update(|d| d.record_submission("T", Duration::from_secs(1), "2024-05-01", 1))
            .unwrap();
        b.update(|d| d.record_submission("T", Duration::from_secs(1), "2024-05-01", 2))
            .unwrap();

        let data = a.load().unwrap();
        assert_eq!(data.tasks["T"].task_count, 2);
        assert_eq!(data.task_count, 2);
    }

    #[test]
    fn start_and_stop_accumulate_worked_seconds() {
        let store = Store::in_memory();
        assert!(store.start_counting(10_000).unwrap());
        assert!(!store.start_counting(11_000).unwrap());
        assert_eq!(store.stop_counting(25_000).unwrap(), Some(15.0));
        assert_eq!(store.stop_counting(30_000).unwrap(), None);

        let data = store.load().unwrap();
        assert!(!data.is_counting);
        assert_eq!(data.worked_seconds, 15.0);
        assert_eq!(data.stop_time, 25_000);
        assert_eq!(data.last_submit, Some(10_000));
    }

    #[test]
    fn reset_keeps_identity_and_settings() {
        let store = Store::in_memory();
        store.set_user_id("7").unwrap();
        store.set_warn_if_forgot_to_start(false).unwrap();
        store.start_counting(1).unwrap();
        store
            .update(|d| d.record_submission("T", Duration::from_secs(1), "2024-05-01", 2))
            .unwrap();
        store
            .set_server_totals(serde_json::json!(12), serde_json::json!("3.50"))
            .unwrap();

        store.reset().unwrap();
        let data = store.load().unwrap();
        assert_eq!(data.user_id.as_deref(), Some("7"));
        assert!(!data.settings.warn_if_forgot_to_start);
        assert!(data.tasks.is_empty());
        assert!(!data.is_counting);
        assert_eq!(data.task_count, 0);
        assert_eq!(data.total_payout, serde_json::json!(0));
    }

    #[test]
    fn logout_forgets_user() {
        let store = Store::in_memory();
        store.set_user_id("7").unwrap();
        store.logout().unwrap();
        assert_eq!(store.user_id(), None);
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "{ nope").unwrap();
        assert!(matches!(Store::open(&path), Err(StoreError::Parse { .. })));
    }

    #[test]
    fn session_seconds_includes_running_session() {
        let data = StoreData {
            is_counting: true,
            start_time: 1_000,
            worked_seconds: 10.0,
            ..StoreData::default()
        };
        assert_eq!(data.session_seconds(6_000), 15.0);
    }
}
