use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use candle_core::{Device, Tensor};
use model::TaskKind;
use vision_data::{
    discover_classes, Batch, DataError, Dataset, ImageFolder, ImageFolderOptions,
    SegmentationArchive, Split,
};

use crate::{
    config::ExperimentConfig,
    error::to_runtime_error,
    storage::{join_key, BucketSync},
    TrainingError,
};

pub const CLASSES_FILENAME: &str = "classes.csv";

/// Everything a task needs to locate its data for one run.
pub struct TaskContext<'a> {
    pub config: &'a ExperimentConfig,
    /// Local dataset root (the download target in bucket mode).
    pub data_dir: &'a Path,
    pub output_dir: &'a Path,
    pub remote: Option<&'a BucketSync>,
}

pub type SplitDatasets = BTreeMap<Split, Arc<dyn Dataset>>;

/// The parts of a run that differ between classification and segmentation.
pub trait TaskStrategy: Send {
    fn kind(&self) -> TaskKind;

    /// Stages the dataset locally and writes any manifests before training.
    fn prepare_local_data(&mut self, ctx: &TaskContext<'_>) -> Result<(), TrainingError>;

    /// Requested sample counts for `trn`, `val` and `tst`; `None` keeps every sample.
    fn sample_counts(&self, config: &ExperimentConfig) -> [Option<usize>; 3];

    /// Opens the three splits, honouring configured sample counts.
    fn build_datasets(&self, ctx: &TaskContext<'_>) -> Result<SplitDatasets, TrainingError>;

    /// Moves a batch to `device` and returns `(inputs, labels)` with labels flattened to 1-D.
    fn prepare_batch(&self, batch: &Batch, device: &Device) -> Result<(Tensor, Tensor), TrainingError>;

    /// Reshapes raw model output into `(samples, classes)` rows aligned with the labels.
    fn flatten_outputs(&self, outputs: &Tensor) -> Result<Tensor, TrainingError>;
}

pub fn task_strategy(kind: TaskKind) -> Box<dyn TaskStrategy> {
    match kind {
        TaskKind::Classification => Box::new(ClassificationTask::default()),
        TaskKind::Segmentation => Box::new(SegmentationTask),
    }
}

/// Image-folder classification: `<data>/<split>/<class>/<image>`.
#[derive(Debug, Default)]
pub struct ClassificationTask {
    classes: Vec<String>,
}

impl ClassificationTask {
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    fn check_class_count(
        expected: usize,
        classes: &[String],
        location: PathBuf,
    ) -> Result<(), TrainingError> {
        if classes.len() != expected {
            return Err(TrainingError::ClassCountMismatch {
                expected,
                found: classes.len(),
                path: location,
            });
        }
        Ok(())
    }

    fn download_split(
        &mut self,
        ctx: &TaskContext<'_>,
        remote: &BucketSync,
        split: Split,
    ) -> Result<(), TrainingError> {
        let prefix = join_key([remote.data_prefix(), split.as_str()]);
        let classes = remote.store().list_subfolders(&prefix)?;
        Self::check_class_count(ctx.config.global.num_classes, &classes, PathBuf::from(&prefix))?;

        let split_dir = ctx.data_dir.join(split.as_str());
        for class in &classes {
            let class_prefix = join_key([prefix.as_str(), class.as_str()]);
            let class_dir = split_dir.join(class);
            fs::create_dir_all(&class_dir)?;
            for key in remote.store().list_objects(&class_prefix)? {
                let Some(name) = key.rsplit('/').next().filter(|name| !name.is_empty()) else {
                    continue;
                };
                remote.store().download(&key, &class_dir.join(name))?;
            }
        }
        self.classes = classes;
        Ok(())
    }
}

impl TaskStrategy for ClassificationTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Classification
    }

    fn prepare_local_data(&mut self, ctx: &TaskContext<'_>) -> Result<(), TrainingError> {
        let manifest = ctx.output_dir.join(CLASSES_FILENAME);
        match ctx.remote {
            Some(remote) => {
                for split in Split::ALL {
                    self.download_split(ctx, remote, split)?;
                }
                write_classes_manifest(&manifest, &self.classes)?;
                remote.upload_output(&manifest, CLASSES_FILENAME)?;
            }
            None => {
                let trn_dir = ctx.data_dir.join(Split::Trn.as_str());
                let classes = discover_classes(&trn_dir)?;
                Self::check_class_count(ctx.config.global.num_classes, &classes, trn_dir)?;
                write_classes_manifest(&manifest, &classes)?;
                self.classes = classes;
            }
        }
        log::info!("classes: {}", self.classes.join(", "));
        Ok(())
    }

    fn sample_counts(&self, _config: &ExperimentConfig) -> [Option<usize>; 3] {
        // Image folders always use every image found.
        [None; 3]
    }

    fn build_datasets(&self, ctx: &TaskContext<'_>) -> Result<SplitDatasets, TrainingError> {
        if self.classes.is_empty() {
            return Err(TrainingError::initialization(
                "classification datasets requested before class discovery",
            ));
        }
        let mut datasets = SplitDatasets::new();
        for split in Split::ALL {
            let options = ImageFolderOptions {
                image_size: ctx.config.training.image_size,
                bands: ctx.config.global.number_of_bands,
                augment: split.is_training(),
            };
            let folder = ImageFolder::open(&ctx.data_dir.join(split.as_str()), &self.classes, options)?;
            datasets.insert(split, Arc::new(folder) as Arc<dyn Dataset>);
        }
        Ok(datasets)
    }

    fn prepare_batch(&self, batch: &Batch, device: &Device) -> Result<(Tensor, Tensor), TrainingError> {
        let batch = batch.to_device(device)?;
        Ok((batch.inputs, batch.labels))
    }

    fn flatten_outputs(&self, outputs: &Tensor) -> Result<Tensor, TrainingError> {
        if outputs.rank() != 2 {
            return Err(TrainingError::runtime(format!(
                "classification output expected (batch, classes) got {:?}",
                outputs.dims()
            )));
        }
        Ok(outputs.clone())
    }
}

/// Segmentation archives at `<data>/samples/<split>_samples.safetensors`.
#[derive(Debug, Default)]
pub struct SegmentationTask;

impl SegmentationTask {
    pub fn archive_name(split: Split) -> String {
        format!("{}_samples.safetensors", split.as_str())
    }
}

impl TaskStrategy for SegmentationTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Segmentation
    }

    fn prepare_local_data(&mut self, ctx: &TaskContext<'_>) -> Result<(), TrainingError> {
        if let Some(remote) = ctx.remote {
            for split in Split::ALL {
                let name = Self::archive_name(split);
                let key = join_key([remote.data_prefix(), "samples", name.as_str()]);
                remote
                    .store()
                    .download(&key, &ctx.data_dir.join("samples").join(&name))?;
            }
        }
        Ok(())
    }

    fn sample_counts(&self, config: &ExperimentConfig) -> [Option<usize>; 3] {
        config.sample_counts()
    }

    fn build_datasets(&self, ctx: &TaskContext<'_>) -> Result<SplitDatasets, TrainingError> {
        let counts = self.sample_counts(ctx.config);
        let mut datasets = SplitDatasets::new();
        for (split, requested) in Split::ALL.into_iter().zip(counts) {
            let path = ctx
                .data_dir
                .join("samples")
                .join(Self::archive_name(split));
            let archive = SegmentationArchive::open(
                &path,
                requested,
                split.is_training(),
            )
            .map_err(|err| match err {
                DataError::SampleCountExceeded {
                    requested,
                    available,
                    ..
                } => TrainingError::SampleCountExceeded {
                    split: split.to_string(),
                    requested,
                    available,
                },
                other => other.into(),
            })?;
            if ctx.config.global.number_of_bands != archive.bands() {
                return Err(TrainingError::initialization(format!(
                    "{} stores {} band(s) but global.number_of_bands is {}",
                    path.display(),
                    archive.bands(),
                    ctx.config.global.number_of_bands
                )));
            }
            datasets.insert(split, Arc::new(archive) as Arc<dyn Dataset>);
        }
        Ok(datasets)
    }

    fn prepare_batch(&self, batch: &Batch, device: &Device) -> Result<(Tensor, Tensor), TrainingError> {
        let batch = batch.to_device(device)?;
        let labels = batch.labels.flatten_all().map_err(to_runtime_error)?;
        Ok((batch.inputs, labels))
    }

    fn flatten_outputs(&self, outputs: &Tensor) -> Result<Tensor, TrainingError> {
        let (batch, classes, height, width) = outputs.dims4().map_err(|_| {
            TrainingError::runtime(format!(
                "segmentation output expected (batch, classes, height, width) got {:?}",
                outputs.dims()
            ))
        })?;
        outputs
            .permute((0, 2, 3, 1))
            .and_then(|t| t.contiguous())
            .and_then(|t| t.reshape((batch * height * width, classes)))
            .map_err(to_runtime_error)
    }
}

/// Writes `classes` as a single CSV row.
pub fn write_classes_manifest(path: &Path, classes: &[String]) -> Result<(), TrainingError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to write classes manifest {}: {err}",
                path.display()
            ))
        })?;
    writer.write_record(classes)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segmentation_outputs_become_pixel_rows() {
        // (batch=1, classes=2, height=2, width=2); class c at pixel p holds 10*c + p.
        let values: Vec<f32> = vec![0., 1., 2., 3., 10., 11., 12., 13.];
        let outputs = Tensor::from_vec(values, (1, 2, 2, 2), &Device::Cpu).unwrap();

        let rows = SegmentationTask.flatten_outputs(&outputs).unwrap();

        assert_eq!(rows.dims(), &[4, 2]);
        assert_eq!(
            rows.to_vec2::<f32>().unwrap(),
            vec![vec![0., 10.], vec![1., 11.], vec![2., 12.], vec![3., 13.]]
        );
    }

    #[test]
    fn segmentation_labels_are_flattened() {
        let batch = Batch {
            inputs: Tensor::zeros((2, 3, 2, 2), candle_core::DType::F32, &Device::Cpu).unwrap(),
            labels: Tensor::new(&[[[0u32, 1], [2, 3]], [[4, 5], [6, 7]]], &Device::Cpu).unwrap(),
            index: 0,
            size: 2,
        };

        let (inputs, labels) = SegmentationTask.prepare_batch(&batch, &Device::Cpu).unwrap();
        assert_eq!(inputs.dims(), &[2, 3, 2, 2]);
        assert_eq!(labels.to_vec1::<u32>().unwrap(), (0..8).collect::<Vec<u32>>());
    }

    #[test]
    fn classification_outputs_pass_through() {
        let outputs = Tensor::zeros((3, 5), candle_core::DType::F32, &Device::Cpu).unwrap();
        let flat = ClassificationTask::default().flatten_outputs(&outputs).unwrap();
        assert_eq!(flat.dims(), &[3, 5]);
    }

    #[test]
    fn manifest_is_single_quoted_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CLASSES_FILENAME);
        write_classes_manifest(&path, &["ant".into(), "b,ee".into(), "cat".into()]).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "ant,\"b,ee\",cat\n");
    }
}
