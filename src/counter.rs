//! Task submission counting.
//!
//! Each submission measures the time since the previous one and, while
//! counting is on, folds it into the per-task aggregate in the store.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::store::{Store, StoreError};

/// A key press as delivered by the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChord {
    pub ctrl: bool,
    pub key: String,
}

impl KeyChord {
    pub fn new(ctrl: bool, key: impl Into<String>) -> Self {
        Self {
            ctrl,
            key: key.into(),
        }
    }

    fn is_submit(&self) -> bool {
        self.ctrl && self.key == "Enter"
    }
}

/// What happened to one submission event.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Added to the aggregate for `task`.
    Recorded { task: String, elapsed: Duration },
    /// Counting was off. `warn` tells the caller whether to show the
    /// "not started" warning.
    Discarded { warn: bool },
    /// Not a submission.
    Ignored,
}

pub struct TaskCounter {
    store: Store,
    last_submission: DateTime<Utc>,
}

impl TaskCounter {
    pub fn new(store: Store) -> Self {
        Self::starting_at(store, Utc::now())
    }

    pub fn starting_at(store: Store, at: DateTime<Utc>) -> Self {
        Self {
            store,
            last_submission: at,
        }
    }

    /// Pick up the reference time from the last persisted submission, so a
    /// new process measures from where the previous one stopped.
    pub fn resume(store: Store) -> Result<Self, StoreError> {
        let last = store
            .load()?
            .last_submit
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now);
        Ok(Self::starting_at(store, last))
    }

    pub fn last_submission(&self) -> DateTime<Utc> {
        self.last_submission
    }

    /// A click on the submit control.
    pub fn on_click(&mut self, task_name: &str, at: DateTime<Utc>) -> Result<Submission, StoreError> {
        self.submit(task_name, at)
    }

    /// A key press. Only ctrl+Enter while the submit control is active counts.
    pub fn on_key(
        &mut self,
        chord: &KeyChord,
        submit_active: bool,
        task_name: &str,
        at: DateTime<Utc>,
    ) -> Result<Submission, StoreError> {
        if !submit_active || !chord.is_submit() {
            return Ok(Submission::Ignored);
        }
        self.submit(task_name, at)
    }

    fn submit(&mut self, task_name: &str, at: DateTime<Utc>) -> Result<Submission, StoreError> {
        let elapsed = (at - self.last_submission).to_std().unwrap_or(Duration::ZERO);
        self.last_submission = at;

        let date = at.format("%Y-%m-%d").to_string();
        let at_ms = at.timestamp_millis();
        let outcome = self.store.update(|data| {
            if !data.is_counting {
                return Submission::Discarded {
                    warn: data.settings.warn_if_forgot_to_start,
                };
            }
            data.record_submission(task_name, elapsed, &date, at_ms);
            Submission::Recorded {
                task: task_name.to_owned(),
                elapsed,
            }
        })?;

        match &outcome {
            Submission::Recorded { task, elapsed } => {
                tracing::info!(task = %task, elapsed_secs = elapsed.as_secs_f64(), "task recorded");
            }
            Submission::Discarded { warn } => {
                tracing::debug!(task = task_name, warn, "submission while counting is off");
            }
            Submission::Ignored => {}
        }
        Ok(outcome)
    }
}
