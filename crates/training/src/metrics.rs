/// Running sum/count/average of a scalar.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AverageMeter {
    sum: f64,
    count: u64,
    avg: f64,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `value` observed over `n` samples.
    pub fn update(&mut self, value: f64, n: usize) {
        self.sum += value * n as f64;
        self.count += n as u64;
        if self.count > 0 {
            self.avg = self.sum / self.count as f64;
        }
    }

    pub fn avg(&self) -> f64 {
        self.avg
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Names of the quality metrics, in logging order.
pub const QUALITY_METRICS: [&str; 4] = ["precision", "recall", "fscore", "iou"];

/// Per-split accumulators for one epoch.
#[derive(Debug, Clone, Default)]
pub struct MetricsRecord {
    pub loss: AverageMeter,
    pub precision: AverageMeter,
    pub recall: AverageMeter,
    pub fscore: AverageMeter,
    pub iou: AverageMeter,
    /// Batch indices on which the quality metrics were computed.
    pub metric_batches: Vec<usize>,
    /// `(average loss, samples)` for every batch, in the order seen.
    pub batch_losses: Vec<(f64, usize)>,
}

impl MetricsRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_quality_metrics(&self) -> bool {
        !self.metric_batches.is_empty()
    }

    pub fn add_batch_loss(&mut self, loss: f64, n: usize) {
        self.loss.update(loss, n);
        self.batch_losses.push((loss, n));
    }

    pub fn add_report(&mut self, batch_index: usize, report: &ClassificationReport, n: usize) {
        self.precision.update(report.precision, n);
        self.recall.update(report.recall, n);
        self.fscore.update(report.fscore, n);
        self.iou.update(report.iou, n);
        self.metric_batches.push(batch_index);
    }

    /// `(name, average)` for the loss and, when computed, each quality metric.
    pub fn averages(&self) -> Vec<(&'static str, f64)> {
        let mut values = vec![("loss", self.loss.avg())];
        if self.has_quality_metrics() {
            values.extend(QUALITY_METRICS.iter().copied().zip([
                self.precision.avg(),
                self.recall.avg(),
                self.fscore.avg(),
                self.iou.avg(),
            ]));
        }
        values
    }
}

/// Support-weighted precision/recall/F-score and mean IoU for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClassificationReport {
    pub precision: f64,
    pub recall: f64,
    pub fscore: f64,
    pub iou: f64,
}

impl ClassificationReport {
    /// Builds the report from predicted and true class indices. Targets equal to
    /// `ignore_index` or outside `0..num_classes` are skipped.
    pub fn from_predictions(
        predictions: &[u32],
        targets: &[u32],
        num_classes: usize,
        ignore_index: Option<u32>,
    ) -> Self {
        let mut true_positive = vec![0u64; num_classes];
        let mut predicted = vec![0u64; num_classes];
        let mut support = vec![0u64; num_classes];

        for (&pred, &target) in predictions.iter().zip(targets) {
            if Some(target) == ignore_index || target as usize >= num_classes {
                continue;
            }
            support[target as usize] += 1;
            if let Some(slot) = predicted.get_mut(pred as usize) {
                *slot += 1;
            }
            if pred == target {
                true_positive[target as usize] += 1;
            }
        }

        let total: u64 = support.iter().sum();
        if total == 0 {
            return Self::default();
        }

        let mut report = Self::default();
        let mut iou_sum = 0.0;
        let mut iou_classes = 0usize;
        for class in 0..num_classes {
            let tp = true_positive[class] as f64;
            let fp = predicted[class] as f64 - tp;
            let fn_ = support[class] as f64 - tp;
            let precision = ratio(tp, tp + fp);
            let recall = ratio(tp, tp + fn_);
            let fscore = ratio(2.0 * precision * recall, precision + recall);

            let share = support[class] as f64 / total as f64;
            report.precision += share * precision;
            report.recall += share * recall;
            report.fscore += share * fscore;

            let union = tp + fp + fn_;
            if union > 0.0 {
                iou_sum += tp / union;
                iou_classes += 1;
            }
        }
        report.iou = if iou_classes > 0 {
            iou_sum / iou_classes as f64
        } else {
            0.0
        };
        report
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}
