use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use candle_core::{safetensors, Device, Tensor};
use tempfile::tempdir;
use training::{
    checkpoint::load_checkpoint, ExperimentConfig, Trainer, TrainingError, CHECKPOINT_FILENAME,
    CLASSES_FILENAME, FINAL_CHECKPOINT_FILENAME, PROGRESS_FILENAME,
};
use vision_data::{Split, IMAGE_KEY, LABEL_KEY};

fn write_image_split(root: &Path, classes: &[&str], per_class: usize) {
    for (label, class) in classes.iter().enumerate() {
        let dir = root.join(class);
        fs::create_dir_all(&dir).unwrap();
        for idx in 0..per_class {
            let shade = (label * 90 + idx * 7) as u8;
            let image = image::RgbImage::from_fn(8, 8, |x, y| {
                image::Rgb([shade, (x * 30) as u8, (y * 30) as u8])
            });
            image.save(dir.join(format!("{idx:02}.png"))).unwrap();
        }
    }
}

fn write_image_dataset(root: &Path, classes: &[&str]) {
    write_image_dataset_sized(root, classes, [4, 2, 2]);
}

fn write_image_dataset_sized(root: &Path, classes: &[&str], per_class: [usize; 3]) {
    for (split, count) in Split::ALL.into_iter().zip(per_class) {
        write_image_split(&root.join(split.as_str()), classes, count);
    }
}

fn write_archive(path: &Path, samples: usize) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let pixels: Vec<u8> = (0..samples * 8 * 8 * 3).map(|v| (v * 13 % 256) as u8).collect();
    let sat = Tensor::from_vec(pixels, (samples, 8, 8, 3), &Device::Cpu).unwrap();
    let labels: Vec<u8> = (0..samples * 8 * 8)
        .map(|v| match v % 5 {
            0 => 255,
            r => (r % 2) as u8,
        })
        .collect();
    let map = Tensor::from_vec(labels, (samples, 8, 8), &Device::Cpu).unwrap();
    let tensors = HashMap::from([(IMAGE_KEY.to_string(), sat), (LABEL_KEY.to_string(), map)]);
    safetensors::save(&tensors, path).unwrap();
}

fn write_config(dir: &Path, yaml: &str) -> PathBuf {
    let path = dir.join("config.yaml");
    fs::write(&path, yaml).unwrap();
    path
}

fn classification_yaml(data: &Path, output: &Path, num_classes: usize) -> String {
    format!(
        r#"
global:
  task: classification
  num_classes: {num_classes}
  data_path: {data}
  model_name: simplecnn
training:
  batch_size: 4
  num_epochs: 2
  learning_rate: 0.01
  output_path: {output}
  image_size: 8
  num_workers: 2
  log_stdout: false
"#,
        data = data.display(),
        output = output.display(),
    )
}

#[test]
fn classification_run_writes_logs_and_checkpoint() -> anyhow::Result<()> {
    let tmp = tempdir()?;
    let data = tmp.path().join("data");
    let output = tmp.path().join("out");
    write_image_dataset(&data, &["dog", "ant", "cat"]);

    let config = ExperimentConfig::from_path(write_config(
        tmp.path(),
        &classification_yaml(&data, &output, 3),
    ))?;
    let mut trainer = Trainer::new(config)?;
    assert_eq!(trainer.loader(Split::Trn).unwrap().num_batches(), 3);
    assert_eq!(trainer.loader(Split::Val).unwrap().num_batches(), 2);
    assert_eq!(trainer.loader(Split::Tst).unwrap().num_batches(), 2);

    let summary = trainer.run()?;

    assert_eq!(fs::read_to_string(output.join(CLASSES_FILENAME))?, "ant,cat,dog\n");

    let progress = fs::read_to_string(output.join(PROGRESS_FILENAME))?;
    let rows: Vec<Vec<&str>> = progress.lines().map(|line| line.split('\t').collect()).collect();
    assert_eq!(rows[0], vec!["ep_idx", "phase", "iter", "i_p_ep", "time"]);
    // Two epochs of (3 trn + 2 val) batches, then 2 tst batches.
    assert_eq!(rows.len(), 1 + 2 * (3 + 2) + 2);
    let phases: Vec<&str> = rows[1..].iter().map(|row| row[1]).collect();
    assert_eq!(&phases[..5], &["trn", "trn", "trn", "val", "val"]);
    assert_eq!(&phases[10..], &["tst", "tst"]);
    assert!(rows[11..].iter().all(|row| row[0] == "2" && row[3] == "2"));

    assert!(output.join(CHECKPOINT_FILENAME).is_file());
    assert!(summary.checkpoints_written >= 1);
    assert_eq!(summary.scheduler_steps, 2);
    assert_eq!(summary.epochs_run, 2);
    assert_eq!(summary.test.metric_batches, vec![0, 1]);

    let trn_loss = fs::read_to_string(output.join("trn_loss.log"))?;
    assert_eq!(trn_loss.lines().count(), 2);
    assert!(!output.join("trn_iou.log").exists());
    // No batch_metrics configured, so validation only logs the loss.
    assert!(!output.join("val_precision.log").exists());
    for metric in ["loss", "precision", "recall", "fscore", "iou"] {
        let contents = fs::read_to_string(output.join(format!("tst_{metric}.log")))?;
        assert!(contents.starts_with("2\t"), "tst_{metric}.log: {contents}");
    }
    Ok(())
}

#[test]
fn class_folder_count_must_match_config() -> anyhow::Result<()> {
    let tmp = tempdir()?;
    let data = tmp.path().join("data");
    write_image_dataset(&data, &["ant", "cat", "dog"]);

    let config = ExperimentConfig::from_path(write_config(
        tmp.path(),
        &classification_yaml(&data, &tmp.path().join("out"), 4),
    ))?;
    match Trainer::new(config) {
        Err(TrainingError::ClassCountMismatch {
            expected: 4,
            found: 3,
            ..
        }) => Ok(()),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("class-count mismatch must be rejected"),
    }
}

fn segmentation_yaml(data: &Path, output: &Path, model: &str, trn_samples: usize) -> String {
    format!(
        r#"
global:
  task: segmentation
  num_classes: 2
  data_path: {data}
  model_name: {model}
training:
  batch_size: 2
  num_epochs: 2
  step_size: 1
  gamma: 0.5
  ignore_index: 255
  class_weights: [1.0, 2.0]
  output_path: {output}
  batch_metrics: 1
  num_trn_samples: {trn_samples}
  num_val_samples: 2
  num_tst_samples: 2
  num_workers: 1
  dropout_prob: 0.2
  log_stdout: false
"#,
        data = data.display(),
        output = output.display(),
    )
}

fn write_segmentation_dataset(data: &Path) {
    write_archive(&data.join("samples/trn_samples.safetensors"), 6);
    write_archive(&data.join("samples/val_samples.safetensors"), 3);
    write_archive(&data.join("samples/tst_samples.safetensors"), 3);
}

#[test]
fn segmentation_run_uses_configured_sample_counts() -> anyhow::Result<()> {
    for model in ["fcn", "unetsmall"] {
        let tmp = tempdir()?;
        let data = tmp.path().join("data");
        let output = tmp.path().join("out");
        write_segmentation_dataset(&data);

        let config = ExperimentConfig::from_path(write_config(
            tmp.path(),
            &segmentation_yaml(&data, &output, model, 4),
        ))?;
        let mut trainer = Trainer::new(config)?;
        assert_eq!(trainer.loader(Split::Trn).unwrap().num_samples(), 4);
        assert_eq!(trainer.loader(Split::Val).unwrap().num_samples(), 2);
        assert_eq!(trainer.loader(Split::Tst).unwrap().num_samples(), 2);
        assert_eq!(trainer.hyperparameters().ignore_index, Some(255));

        let summary = trainer.run()?;
        assert_eq!(summary.scheduler_steps, 2);
        assert!(summary.best_loss.is_finite());
        assert_eq!(summary.test.metric_batches, vec![0]);
        assert!(summary.test.iou.avg() >= 0.0 && summary.test.iou.avg() <= 1.0);
        assert!(output.join("val_iou.log").is_file());
        assert!(!output.join(CLASSES_FILENAME).exists());
    }
    Ok(())
}

#[test]
fn oversized_sample_count_is_fatal() -> anyhow::Result<()> {
    let tmp = tempdir()?;
    let data = tmp.path().join("data");
    write_segmentation_dataset(&data);

    let config = ExperimentConfig::from_path(write_config(
        tmp.path(),
        &segmentation_yaml(&data, &tmp.path().join("out"), "fcn", 10),
    ))?;
    match Trainer::new(config) {
        Err(TrainingError::SampleCountExceeded {
            split,
            requested: 10,
            available: 6,
        }) => assert_eq!(split, "trn"),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("requesting more samples than stored must fail"),
    }
    Ok(())
}

#[test]
fn training_resumes_from_state_dict() -> anyhow::Result<()> {
    let tmp = tempdir()?;
    let data = tmp.path().join("data");
    let output = tmp.path().join("out");
    write_segmentation_dataset(&data);

    let config = ExperimentConfig::from_path(write_config(
        tmp.path(),
        &segmentation_yaml(&data, &output, "fcn", 4),
    ))?;
    Trainer::new(config.clone())?.run()?;

    let checkpoint = output.join(CHECKPOINT_FILENAME);
    let mut resumed_config = config;
    resumed_config.training.state_dict_path = Some(checkpoint.clone());
    resumed_config.training.output_path = tmp.path().join("resumed");
    let resumed = Trainer::new(resumed_config)?;

    let saved = load_checkpoint(&checkpoint, &Device::Cpu)?;
    for (name, var) in resumed.model().parameters() {
        let stored = saved
            .model_tensors
            .get(&name)
            .unwrap_or_else(|| panic!("checkpoint is missing {name}"));
        let diff = var
            .as_tensor()
            .sub(stored)?
            .abs()?
            .sum_all()?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-6, "{name} differs by {diff}");
    }
    Ok(())
}

#[test]
fn bucket_run_downloads_data_and_uploads_artifacts() -> anyhow::Result<()> {
    let tmp = tempdir()?;
    let bucket = tmp.path().join("buckets").join("demo");
    write_image_dataset(&bucket.join("datasets/shapes"), &["ant", "cat", "dog"]);

    let yaml = format!(
        r#"
global:
  task: classification
  num_classes: 3
  data_path: datasets/shapes
  bucket_name: demo
  bucket_root: {root}
  local_cache: {cache}
  model_name: simplecnn
training:
  batch_size: 4
  num_epochs: 1
  output_path: runs/exp1
  image_size: 8
  num_workers: 2
  log_stdout: false
"#,
        root = tmp.path().join("buckets").display(),
        cache = tmp.path().join("cache").display(),
    );
    let config = ExperimentConfig::from_path(write_config(tmp.path(), &yaml))?;
    let mut trainer = Trainer::new(config)?;
    assert_eq!(trainer.data_dir(), tmp.path().join("cache/data"));
    assert!(tmp.path().join("cache/data/trn/cat/00.png").is_file());
    let stamp = trainer.run_stamp().to_string();

    trainer.run()?;

    let remote_out = bucket.join("runs/exp1");
    assert_eq!(fs::read_to_string(remote_out.join(CLASSES_FILENAME))?, "ant,cat,dog\n");
    assert!(remote_out.join(CHECKPOINT_FILENAME).is_file());
    assert!(remote_out.join(FINAL_CHECKPOINT_FILENAME).is_file());
    assert!(remote_out
        .join("Logs")
        .join(format!("{stamp}_trn_loss.log"))
        .is_file());
    assert!(remote_out
        .join("Logs")
        .join(format!("{stamp}_{PROGRESS_FILENAME}"))
        .is_file());
    Ok(())
}

#[test]
fn validation_and_test_orders_change_every_epoch() -> anyhow::Result<()> {
    let tmp = tempdir()?;
    let data = tmp.path().join("data");
    write_image_dataset_sized(&data, &["ant", "cat", "dog"], [4, 12, 12]);

    let config = ExperimentConfig::from_path(write_config(
        tmp.path(),
        &classification_yaml(&data, &tmp.path().join("out"), 3),
    ))?;
    let trainer = Trainer::new(config)?;
    for split in [Split::Val, Split::Tst] {
        let loader = trainer.loader(split).unwrap();
        let first = loader.epoch_order(0);
        let second = loader.epoch_order(1);
        assert_ne!(first, second, "{split} order was not reshuffled");
        assert_eq!(loader.epoch_order(0), first);

        let mut sorted = first.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..36).collect::<Vec<_>>());
    }
    Ok(())
}

#[test]
fn checkpoints_follow_strict_validation_improvements() -> anyhow::Result<()> {
    let tmp = tempdir()?;
    let data = tmp.path().join("data");
    let output = tmp.path().join("out");
    write_image_dataset(&data, &["ant", "cat", "dog"]);

    let yaml = classification_yaml(&data, &output, 3).replace("num_epochs: 2", "num_epochs: 4");
    let config = ExperimentConfig::from_path(write_config(tmp.path(), &yaml))?;
    let summary = Trainer::new(config.clone())?.run()?;

    let val_losses: Vec<f64> = fs::read_to_string(output.join("val_loss.log"))?
        .lines()
        .map(|line| line.split('\t').nth(1).unwrap().parse().unwrap())
        .collect();
    assert_eq!(val_losses.len(), 4);
    let mut best = f64::INFINITY;
    let improvements = val_losses
        .iter()
        .filter(|&&loss| {
            let improved = loss < best;
            best = best.min(loss);
            improved
        })
        .count();
    assert_eq!(summary.checkpoints_written, improvements);
    assert_eq!(summary.best_loss, best);

    // Equal and worse losses leave the saved checkpoint alone.
    let mut manual_config = config;
    manual_config.training.output_path = tmp.path().join("manual");
    let mut trainer = Trainer::new(manual_config)?;
    let checkpoint = trainer.checkpoint_path();
    assert!(trainer.finish_epoch(0, 0.8)?);
    assert!(!trainer.finish_epoch(1, 0.8)?);
    assert!(!trainer.finish_epoch(2, 0.9)?);
    assert_eq!(trainer.checkpoints_written(), 1);
    assert_eq!(load_checkpoint(&checkpoint, &Device::Cpu)?.metadata.epoch, 0);

    assert!(trainer.finish_epoch(3, 0.5)?);
    assert_eq!(trainer.checkpoints_written(), 2);
    let metadata = load_checkpoint(&checkpoint, &Device::Cpu)?.metadata;
    assert_eq!(metadata.epoch, 3);
    assert_eq!(metadata.best_loss, 0.5);
    Ok(())
}

#[test]
fn training_loss_is_sample_weighted_mean_of_batches() -> anyhow::Result<()> {
    let tmp = tempdir()?;
    let data = tmp.path().join("data");
    write_image_dataset(&data, &["ant", "cat", "dog"]);

    let yaml = classification_yaml(&data, &tmp.path().join("out"), 3)
        .replace("batch_size: 4", "batch_size: 5");
    let config = ExperimentConfig::from_path(write_config(tmp.path(), &yaml))?;
    let mut trainer = Trainer::new(config)?;

    let record = trainer.train_epoch(0)?;

    let sizes: Vec<usize> = record.batch_losses.iter().map(|&(_, n)| n).collect();
    assert_eq!(sizes, vec![5, 5, 2]);
    let weighted = record
        .batch_losses
        .iter()
        .map(|&(loss, n)| loss * n as f64)
        .sum::<f64>()
        / 12.0;
    assert!(
        (record.loss.avg() - weighted).abs() < 1e-9,
        "{} vs {weighted}",
        record.loss.avg()
    );
    assert_eq!(record.loss.count(), 12);
    assert_eq!(trainer.scheduler_steps(), 1);
    Ok(())
}

#[test]
fn blank_bucket_name_runs_locally() -> anyhow::Result<()> {
    let tmp = tempdir()?;
    let data = tmp.path().join("data");
    write_image_dataset(&data, &["ant", "cat", "dog"]);

    let yaml = classification_yaml(&data, &tmp.path().join("out"), 3)
        .replace("  task: classification\n", "  task: classification\n  bucket_name: \"\"\n");
    let mut config = ExperimentConfig::from_path(write_config(tmp.path(), &yaml))?;
    assert!(!config.uses_bucket());

    config.global.bucket_name = Some(String::new());
    let trainer = Trainer::new(config)?;
    assert_eq!(trainer.data_dir(), data.as_path());
    assert!(tmp.path().join("out").join(CLASSES_FILENAME).is_file());
    Ok(())
}

#[test]
fn zero_sample_counts_use_whole_archive() -> anyhow::Result<()> {
    let tmp = tempdir()?;
    let data = tmp.path().join("data");
    let output = tmp.path().join("out");
    write_segmentation_dataset(&data);

    let yaml = segmentation_yaml(&data, &output, "fcn", 0)
        .replace("num_val_samples: 2", "num_val_samples: 0");
    let config = ExperimentConfig::from_path(write_config(tmp.path(), &yaml))?;
    let mut trainer = Trainer::new(config)?;
    assert_eq!(trainer.loader(Split::Trn).unwrap().num_samples(), 6);
    assert_eq!(trainer.loader(Split::Val).unwrap().num_samples(), 3);
    assert_eq!(trainer.loader(Split::Tst).unwrap().num_samples(), 2);

    let summary = trainer.run()?;
    assert!(summary.best_loss > 0.0 && summary.best_loss.is_finite());
    Ok(())
}
