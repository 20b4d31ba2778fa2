use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    DType, Device, D,
};
use model::{Model, ModelConfig};
use vision_data::{BatchLoader, Split};

use crate::{
    checkpoint::{self, SaveRequest, CHECKPOINT_FILENAME, FINAL_CHECKPOINT_FILENAME},
    config::ExperimentConfig,
    error::to_runtime_error,
    hyperparams::{self, ResolvedHyperparameters},
    logging::{Logger, LoggingSettings},
    loss::{CrossEntropyLoss, LossOutput},
    metrics::{ClassificationReport, MetricsRecord},
    optimizer::Adam,
    progress::ProgressLog,
    scheduler::{LRScheduler, StepLr},
    storage::{BucketSync, LocalBucket, RemoteStore},
    task::{task_strategy, TaskContext, TaskStrategy},
    TrainingError,
};

/// Optional free-form run notes uploaded with the final artifacts when present.
pub const OUTPUT_NOTES_FILENAME: &str = "output.txt";
const RUN_STAMP_FORMAT: &str = "%Y-%m-%d_%I-%M";

/// Lowest validation loss seen so far in a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestLossTracker {
    best: f64,
}

impl BestLossTracker {
    pub fn new() -> Self {
        Self { best: f64::INFINITY }
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    /// Records `loss` and reports whether it strictly improved on the best so far.
    pub fn observe(&mut self, loss: f64) -> bool {
        if loss < self.best {
            self.best = loss;
            true
        } else {
            false
        }
    }
}

impl Default for BestLossTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether precision/recall/F-score/IoU are computed for `batch_index`:
/// every test batch, and every `interval`-th validation batch when an interval is set.
pub fn should_compute_metrics(split: Split, batch_index: usize, interval: Option<usize>) -> bool {
    match split {
        Split::Tst => true,
        Split::Val => matches!(interval, Some(k) if k > 0 && batch_index % k == 0),
        Split::Trn => false,
    }
}

/// Outcome of a complete [`Trainer::run`].
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub epochs_run: usize,
    pub best_loss: f64,
    pub checkpoints_written: usize,
    pub scheduler_steps: usize,
    pub test: MetricsRecord,
    pub elapsed: Duration,
}

pub struct Trainer {
    config: ExperimentConfig,
    device: Device,
    task: Box<dyn TaskStrategy>,
    remote: Option<BucketSync>,
    data_dir: PathBuf,
    output_dir: PathBuf,
    model: Model,
    loss: CrossEntropyLoss,
    optimizer: Adam,
    scheduler: StepLr,
    hyperparameters: ResolvedHyperparameters,
    loaders: BTreeMap<Split, BatchLoader>,
    progress: ProgressLog,
    logger: Logger,
    best_loss: BestLossTracker,
    started: Instant,
    run_stamp: String,
    checkpoints_written: usize,
}

impl Trainer {
    /// Builds a trainer, opening the filesystem bucket named in the config when there is one.
    pub fn new(config: ExperimentConfig) -> Result<Self, TrainingError> {
        let store: Option<Box<dyn RemoteStore>> = match config.bucket_name() {
            Some(bucket_name) => {
                let bucket_root = config.global.bucket_root.as_deref().ok_or_else(|| {
                    TrainingError::validation(vec![
                        "global.bucket_root is required when global.bucket_name is set".to_string(),
                    ])
                })?;
                Some(Box::new(LocalBucket::open(bucket_root, bucket_name)?))
            }
            None => None,
        };
        Self::with_store(config, store)
    }

    /// Builds a trainer against an explicit remote store (or none).
    pub fn with_store(
        config: ExperimentConfig,
        store: Option<Box<dyn RemoteStore>>,
    ) -> Result<Self, TrainingError> {
        config.validate()?;
        let started = Instant::now();
        let run_stamp = chrono::Local::now().format(RUN_STAMP_FORMAT).to_string();
        let mut task = task_strategy(config.task()?);

        let (remote, data_dir, output_dir) = match store {
            Some(store) => {
                let cache = &config.global.local_cache;
                let remote = BucketSync::new(
                    store,
                    &config.global.data_path,
                    &config.training.output_path,
                    run_stamp.clone(),
                );
                (Some(remote), cache.join("data"), cache.join("output"))
            }
            None => (
                None,
                config.global.data_path.clone(),
                config.training.output_path.clone(),
            ),
        };
        fs::create_dir_all(&output_dir).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to create output directory {}: {err}",
                output_dir.display()
            ))
        })?;

        let ctx = TaskContext {
            config: &config,
            data_dir: &data_dir,
            output_dir: &output_dir,
            remote: remote.as_ref(),
        };
        task.prepare_local_data(&ctx)?;

        let logger = Logger::new(LoggingSettings {
            enable_stdout: config.training.log_stdout,
            output_dir: output_dir.clone(),
            tensorboard_dir: config.training.tensorboard_dir.clone(),
        })?;
        let progress = ProgressLog::open(&output_dir)?;

        let device = select_device(config.training.seed);
        let model = build_model(&config, &device)?;
        log::info!(
            "model '{}' ({} task, {} classes) built with {} parameter tensor(s)",
            model.architecture().name(),
            model.task(),
            config.global.num_classes,
            model.parameters().len()
        );

        let components = hyperparams::resolve(
            &config.training,
            config.global.num_classes,
            model,
            config.training.state_dict_path.as_deref(),
        )?;
        if let Some(restored) = components.restored.as_ref() {
            log::info!(
                "resumed weights from epoch {} (best loss {:.4})",
                restored.epoch,
                restored.best_loss
            );
        }

        let datasets = task.build_datasets(&ctx)?;
        let mut loaders = BTreeMap::new();
        for (split, dataset) in datasets {
            let loader = BatchLoader::new(
                dataset,
                config.training.batch_size,
                true,
                config.training.num_workers,
                config.training.seed,
            )?;
            loaders.insert(split, loader);
        }
        let counts = loaders
            .iter()
            .map(|(split, loader)| format!("'{}': {}", split, loader.num_samples()))
            .collect::<Vec<_>>()
            .join(", ");
        println!("Number of samples : {{{counts}}}");

        Ok(Self {
            config,
            device,
            task,
            remote,
            data_dir,
            output_dir,
            model: components.model,
            loss: components.loss,
            optimizer: components.optimizer,
            scheduler: components.scheduler,
            hyperparameters: components.hyperparameters,
            loaders,
            progress,
            logger,
            best_loss: BestLossTracker::new(),
            started,
            run_stamp,
            checkpoints_written: 0,
        })
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn hyperparameters(&self) -> &ResolvedHyperparameters {
        &self.hyperparameters
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.output_dir.join(CHECKPOINT_FILENAME)
    }

    pub fn loader(&self, split: Split) -> Option<&BatchLoader> {
        self.loaders.get(&split)
    }

    pub fn best_loss(&self) -> f64 {
        self.best_loss.best()
    }

    pub fn checkpoints_written(&self) -> usize {
        self.checkpoints_written
    }

    pub fn scheduler_steps(&self) -> usize {
        self.scheduler.steps_taken()
    }

    pub fn run_stamp(&self) -> &str {
        &self.run_stamp
    }

    fn split_loader(&self, split: Split) -> Result<&BatchLoader, TrainingError> {
        self.loaders
            .get(&split)
            .ok_or_else(|| TrainingError::runtime(format!("no data loader for split '{split}'")))
    }

    /// One optimisation pass over the training split followed by a single scheduler step.
    pub fn train_epoch(&mut self, epoch: usize) -> Result<MetricsRecord, TrainingError> {
        self.model.set_training(true);
        let batches = self.split_loader(Split::Trn)?.epoch(epoch)?;
        let total = batches.len();
        let mut record = MetricsRecord::new();

        for batch in batches {
            let batch = batch?;
            self.progress
                .record(epoch, Split::Trn.as_str(), batch.index, total)?;

            let (inputs, labels) = self.task.prepare_batch(&batch, &self.device)?;
            let outputs = self.model.forward(&inputs).map_err(to_runtime_error)?;
            let outputs = self.task.flatten_outputs(&outputs)?;

            let LossOutput { loss, metrics } = self.loss.compute(&outputs, &labels)?;
            record.add_batch_loss(metrics.average_loss, batch.size);

            // A fresh gradient store per batch.
            let mut grads = loss.backward().map_err(to_runtime_error)?;
            self.optimizer.step(&mut grads)?;
        }

        let lr = self.scheduler.step();
        self.optimizer.set_learning_rate(lr);
        log::debug!("epoch {epoch}: learning rate now {lr:e}");
        Ok(record)
    }

    /// Forward-only pass over `split`. Quality metrics follow [`should_compute_metrics`].
    pub fn evaluate(
        &mut self,
        split: Split,
        epoch: usize,
        metrics_interval: Option<usize>,
    ) -> Result<MetricsRecord, TrainingError> {
        self.model.set_training(false);
        let batches = self.split_loader(split)?.epoch(epoch)?;
        let total = batches.len();
        let num_classes = self.config.global.num_classes;
        let mut record = MetricsRecord::new();

        for batch in batches {
            let batch = batch?;
            self.progress.record(epoch, split.as_str(), batch.index, total)?;

            let (inputs, labels) = self.task.prepare_batch(&batch, &self.device)?;
            let outputs = self
                .model
                .forward(&inputs)
                .map_err(to_runtime_error)?
                .detach();
            let outputs = self.task.flatten_outputs(&outputs)?;

            let LossOutput { metrics, .. } = self.loss.compute(&outputs, &labels)?;
            record.add_batch_loss(metrics.average_loss, batch.size);

            if should_compute_metrics(split, batch.index, metrics_interval) {
                let predictions = outputs
                    .argmax(D::Minus1)
                    .and_then(|t| t.to_dtype(DType::U32))
                    .and_then(|t| t.to_vec1::<u32>())
                    .map_err(to_runtime_error)?;
                let targets = labels
                    .to_dtype(DType::U32)
                    .and_then(|t| t.to_vec1::<u32>())
                    .map_err(to_runtime_error)?;
                let report = ClassificationReport::from_predictions(
                    &predictions,
                    &targets,
                    num_classes,
                    self.loss.ignore_index(),
                );
                record.add_report(batch.index, &report, batch.size);
            }
        }

        Ok(record)
    }

    /// Runs every epoch, keeps the checkpoint with the lowest validation loss,
    /// then evaluates that checkpoint on the test split.
    pub fn run(&mut self) -> Result<RunSummary, TrainingError> {
        let num_epochs = self.config.training.num_epochs;
        let metrics_interval = self.config.training.batch_metrics;

        for epoch in 0..num_epochs {
            println!();
            println!("Epoch {}/{}", epoch, num_epochs - 1);
            println!("{}", "-".repeat(20));

            let trn = self.train_epoch(epoch)?;
            self.logger.log_epoch(Split::Trn, epoch, &trn, false)?;

            let val = self.evaluate(Split::Val, epoch, metrics_interval)?;
            self.logger
                .log_epoch(Split::Val, epoch, &val, val.has_quality_metrics())?;

            self.finish_epoch(epoch, val.loss.avg())?;

            println!("Current elapsed time {}", format_elapsed(self.started.elapsed()));
        }

        let checkpoint_path = self.checkpoint_path();
        if checkpoint_path.exists() {
            let metadata = checkpoint::restore_checkpoint(&checkpoint_path, &self.model, None)?;
            log::info!(
                "evaluating best checkpoint from epoch {} (val loss {:.4})",
                metadata.epoch,
                metadata.best_loss
            );
        } else {
            log::warn!(
                "no checkpoint at {}; evaluating the in-memory model",
                checkpoint_path.display()
            );
        }

        let test = self.evaluate(Split::Tst, num_epochs, metrics_interval)?;
        self.logger.log_epoch(Split::Tst, num_epochs, &test, true)?;
        self.logger.flush();
        self.sync_final_artifacts()?;

        let elapsed = self.started.elapsed();
        println!("Training complete in {}", format_elapsed(elapsed));

        Ok(RunSummary {
            epochs_run: num_epochs,
            best_loss: self.best_loss.best(),
            checkpoints_written: self.checkpoints_written,
            scheduler_steps: self.scheduler.steps_taken(),
            test,
            elapsed,
        })
    }

    /// Checkpoints the model when `val_loss` strictly beats the best loss so far,
    /// then syncs the logs. Returns whether a checkpoint was written.
    pub fn finish_epoch(&mut self, epoch: usize, val_loss: f64) -> Result<bool, TrainingError> {
        let improved = self.best_loss.observe(val_loss);
        if improved {
            self.save_best(epoch)?;
        }
        self.sync_logs()?;
        Ok(improved)
    }

    fn save_best(&mut self, epoch: usize) -> Result<(), TrainingError> {
        let path = self.checkpoint_path();
        checkpoint::save_checkpoint(SaveRequest {
            path: &path,
            config: &self.config,
            model: &self.model,
            optimizer: &self.optimizer,
            epoch,
            best_loss: self.best_loss.best(),
        })?;
        self.checkpoints_written += 1;
        log::info!(
            "epoch {epoch}: validation loss improved to {:.4}, checkpoint saved",
            self.best_loss.best()
        );
        if let Some(remote) = self.remote.as_ref() {
            remote.upload_output(&path, CHECKPOINT_FILENAME)?;
        }
        Ok(())
    }

    fn sync_logs(&self) -> Result<(), TrainingError> {
        let Some(remote) = self.remote.as_ref() else {
            return Ok(());
        };
        let mut files = self.logger.log_files();
        files.push(self.progress.path().to_path_buf());
        remote.upload_logs(&files)
    }

    fn sync_final_artifacts(&self) -> Result<(), TrainingError> {
        let Some(remote) = self.remote.as_ref() else {
            return Ok(());
        };
        self.sync_logs()?;
        let notes = self.output_dir.join(OUTPUT_NOTES_FILENAME);
        if notes.is_file() {
            remote.upload_output(&notes, OUTPUT_NOTES_FILENAME)?;
        }
        let checkpoint_path = self.checkpoint_path();
        if checkpoint_path.is_file() {
            remote.upload_output(&checkpoint_path, FINAL_CHECKPOINT_FILENAME)?;
        }
        Ok(())
    }
}

/// Assembles the configured architecture on `device`.
pub fn build_model(config: &ExperimentConfig, device: &Device) -> Result<Model, TrainingError> {
    let mut model_config = ModelConfig::new(
        config.global.model_name.clone(),
        config.task()?,
        config.global.num_classes,
    );
    model_config.in_channels = config.global.number_of_bands;
    model_config.dropout_prob = config.training.dropout_prob;
    model_config.device = device.clone();
    Model::new(model_config)
        .map_err(|err| TrainingError::initialization(format!("failed to build model: {err}")))
}

/// Metal, then CUDA, then CPU.
pub fn select_device(seed: u64) -> Device {
    let device = if metal_is_available() {
        match Device::new_metal(0) {
            Ok(device) => {
                log::info!("device: using Metal GPU #0");
                device
            }
            Err(err) => {
                log::warn!("failed to initialize metal device, falling back to CPU: {err}");
                Device::Cpu
            }
        }
    } else if cuda_is_available() {
        match Device::cuda_if_available(0) {
            Ok(device) => {
                log::info!("device: using CUDA GPU #0");
                device
            }
            Err(err) => {
                log::warn!("cuda reported available but initialization failed: {err}");
                Device::Cpu
            }
        }
    } else {
        log::info!("no GPU backend available; using CPU");
        Device::Cpu
    };
    if let Err(err) = device.set_seed(seed) {
        log::debug!("device RNG not seeded: {err}");
    }
    device
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    format!("{:.0}m {:.0}s", (secs / 60.0).floor(), secs % 60.0)
}
