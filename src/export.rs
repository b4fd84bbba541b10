//! CSV report of the recorded task aggregates.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::format::{format_time, rph};
use crate::store::TaskAggregate;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("no tasks have been recorded yet")]
    NoTasks,

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A rendered report and the file name it should be saved under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvReport {
    pub filename: String,
    pub contents: String,
}

/// Render one row per task (by name), the per-date counts, and a trailing
/// total row.
pub fn tasks_csv(tasks: &BTreeMap<String, TaskAggregate>) -> Result<CsvReport, ExportError> {
    let dates: BTreeSet<&str> = tasks
        .values()
        .flat_map(|t| t.dates.keys().map(String::as_str))
        .collect();
    let (Some(first), Some(last)) = (dates.first(), dates.last()) else {
        return Err(ExportError::NoTasks);
    };
    let filename = format!("tasks-{}-{}.csv", compact(first), compact(last));

    // The total row is shorter than the others.
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());

    let mut header = vec!["Task Name", "Task Count", "Time", "RPH"];
    header.extend(dates.iter().copied());
    writer.write_record(&header)?;

    let mut total_count = 0;
    let mut total_time = 0;
    for (name, task) in tasks {
        total_count += task.task_count;
        total_time += task.time;

        let mut row = vec![
            name.clone(),
            task.task_count.to_string(),
            format_time(task.time),
            rph(task.time, task.task_count).to_string(),
        ];
        row.extend(
            dates
                .iter()
                .map(|date| task.dates.get(*date).copied().unwrap_or(0).to_string()),
        );
        writer.write_record(&row)?;
    }

    writer.write_record([
        "Total".to_string(),
        total_count.to_string(),
        format_time(total_time),
        rph(total_time, total_count).to_string(),
    ])?;

    let bytes = writer
        .into_inner()
        .map_err(|e| ExportError::Io(e.into_error()))?;
    let contents = String::from_utf8_lossy(&bytes).into_owned();

    Ok(CsvReport { filename, contents })
}

/// Render the report and write it into `dir`. Returns the written path.
pub fn write_report(
    tasks: &BTreeMap<String, TaskAggregate>,
    dir: &Path,
) -> Result<PathBuf, ExportError> {
    let report = tasks_csv(tasks)?;
    std::fs::create_dir_all(dir)?;
    let path = dir.join(&report.filename);
    std::fs::write(&path, report.contents)?;
    tracing::info!(path = %path.display(), tasks = tasks.len(), "report written");
    Ok(path)
}

fn compact(date: &str) -> String {
    date.replace('-', "")
}
