use std::{
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use crate::TrainingError;

pub const PROGRESS_FILENAME: &str = "progress.log";
const HEADER: [&str; 5] = ["ep_idx", "phase", "iter", "i_p_ep", "time"];

/// Appends one tab-separated row to `path`, creating the file if needed,
/// and flushes it before returning.
pub fn append_tsv_row<I>(path: &Path, fields: I) -> Result<(), TrainingError>
where
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| {
            TrainingError::runtime(format!("failed to open log {}: {err}", path.display()))
        })?;
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_writer(file);
    writer.write_record(fields)?;
    writer
        .flush()
        .map_err(|err| TrainingError::runtime(format!("failed to write log {}: {err}", path.display())))
}

/// Append-only per-batch progress file. Every row is flushed as soon as it is written.
#[derive(Debug, Clone)]
pub struct ProgressLog {
    path: PathBuf,
}

impl ProgressLog {
    /// Opens `<output_dir>/progress.log`, writing the header only if the file is new.
    pub fn open(output_dir: &Path) -> Result<Self, TrainingError> {
        fs::create_dir_all(output_dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create output directory {}: {err}",
                output_dir.display()
            ))
        })?;
        let path = output_dir.join(PROGRESS_FILENAME);
        let log = Self { path };
        if !log.path.exists() {
            append_tsv_row(&log.path, HEADER)?;
        }
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(
        &self,
        epoch: usize,
        phase: &str,
        batch_index: usize,
        batches_per_epoch: usize,
    ) -> Result<(), TrainingError> {
        append_tsv_row(
            &self.path,
            [
                epoch.to_string(),
                phase.to_string(),
                batch_index.to_string(),
                batches_per_epoch.to_string(),
                unix_seconds().to_string(),
            ],
        )
    }
}

fn unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}
