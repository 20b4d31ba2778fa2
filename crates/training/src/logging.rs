use std::{
    collections::BTreeSet,
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;
use vision_data::Split;

use crate::{metrics::MetricsRecord, progress::append_tsv_row, TrainingError};

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub output_dir: PathBuf,
    pub tensorboard_dir: Option<PathBuf>,
}

/// Writes per-epoch metric averages to `<output_dir>/<split>_<metric>.log`,
/// stdout and, optionally, a TensorBoard event file.
pub struct Logger {
    settings: LoggingSettings,
    tensorboard: Option<TensorBoardWriter>,
    written: BTreeSet<PathBuf>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        fs::create_dir_all(&settings.output_dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create output directory {}: {err}",
                settings.output_dir.display()
            ))
        })?;
        let tensorboard = if let Some(dir) = settings.tensorboard_dir.as_ref() {
            Some(TensorBoardWriter::create(dir)?)
        } else {
            None
        };
        Ok(Self {
            settings,
            tensorboard,
            written: BTreeSet::new(),
        })
    }

    pub fn metric_path(&self, split: Split, metric: &str) -> PathBuf {
        self.settings
            .output_dir
            .join(format!("{}_{}.log", split.as_str(), metric))
    }

    /// Appends the epoch averages in `record`. Quality metrics are only
    /// written when `include_quality` is set and they were computed.
    pub fn log_epoch(
        &mut self,
        split: Split,
        epoch: usize,
        record: &MetricsRecord,
        include_quality: bool,
    ) -> Result<(), TrainingError> {
        let values: Vec<(&str, f64)> = record
            .averages()
            .into_iter()
            .filter(|(name, _)| include_quality || *name == "loss")
            .collect();

        for (metric, value) in &values {
            let path = self.metric_path(split, metric);
            append_tsv_row(&path, [epoch.to_string(), value.to_string()])?;
            self.written.insert(path);
        }

        if self.settings.enable_stdout {
            let label = match split {
                Split::Trn => "Training".to_string(),
                other => other.as_str().to_string(),
            };
            let summary = values
                .iter()
                .map(|(metric, value)| {
                    let name = if *metric == "loss" { "Loss" } else { metric };
                    format!("{label} {name}: {value:.4}")
                })
                .collect::<Vec<_>>()
                .join(", ");
            println!("{summary}");
        }

        if let Some(writer) = self.tensorboard.as_mut() {
            for (metric, value) in &values {
                let tag = format!("{}/{}", split.as_str(), metric);
                let _ = writer.write_scalar(&tag, epoch as i64, *value);
            }
        }
        Ok(())
    }

    /// Every metric file written so far.
    pub fn log_files(&self) -> Vec<PathBuf> {
        self.written.iter().cloned().collect()
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            let _ = writer.flush();
        }
    }
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
}

impl TensorBoardWriter {
    fn create(dir: &Path) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let path = dir.join(format!("events.out.tfevents.{}.{}", timestamp, hostname()));
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let event = Event {
            wall_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|dur| dur.as_secs_f64())
                .unwrap_or(0.0),
            step,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        };

        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;
        let data = buffer.freeze();
        let len_bytes = (data.len() as u64).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&masked_crc32(&len_bytes).to_le_bytes()))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&masked_crc32(&data).to_le_bytes()))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;
        // One event per metric per epoch, so flush eagerly.
        self.flush()
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ClassificationReport;

    fn settings(dir: &Path, tensorboard: bool) -> LoggingSettings {
        LoggingSettings {
            enable_stdout: false,
            output_dir: dir.to_path_buf(),
            tensorboard_dir: tensorboard.then(|| dir.join("tb")),
        }
    }

    #[test]
    fn writes_one_file_per_split_and_metric() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = Logger::new(settings(dir.path(), true)).unwrap();

        let mut record = MetricsRecord::new();
        record.loss.update(0.5, 4);
        record.add_report(0, &ClassificationReport::default(), 4);

        logger.log_epoch(Split::Trn, 0, &record, false).unwrap();
        logger.log_epoch(Split::Val, 0, &record, true).unwrap();
        logger.log_epoch(Split::Val, 1, &record, true).unwrap();
        logger.flush();

        let files = logger.log_files();
        assert_eq!(files.len(), 6);
        assert!(!logger.metric_path(Split::Trn, "iou").exists());
        let val_loss = fs::read_to_string(logger.metric_path(Split::Val, "loss")).unwrap();
        assert_eq!(val_loss, "0\t0.5\n1\t0.5\n");

        let events: Vec<_> = fs::read_dir(dir.path().join("tb")).unwrap().collect();
        assert_eq!(events.len(), 1);
    }
}
