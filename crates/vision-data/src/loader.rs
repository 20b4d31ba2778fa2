use std::{
    sync::{
        mpsc::{sync_channel, Receiver, SyncSender},
        Arc,
    },
    thread::{self, JoinHandle},
};

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::{
    dataset::{Batch, Dataset},
    error::{DataError, Result},
};

/// Batches prefetched per worker before it blocks.
const PREFETCH_PER_WORKER: usize = 2;

/// Groups a dataset into batches, reshuffled every epoch and decoded by a
/// fixed pool of worker threads.
pub struct BatchLoader {
    dataset: Arc<dyn Dataset>,
    batch_size: usize,
    shuffle: bool,
    num_workers: usize,
    seed: u64,
}

impl BatchLoader {
    pub fn new(
        dataset: Arc<dyn Dataset>,
        batch_size: usize,
        shuffle: bool,
        num_workers: usize,
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(DataError::Config(
                "batch size must be greater than zero".into(),
            ));
        }
        Ok(Self {
            dataset,
            batch_size,
            shuffle,
            num_workers: num_workers.max(1),
            seed,
        })
    }

    pub fn num_samples(&self) -> usize {
        self.dataset.len()
    }

    /// Batches per epoch; the last one may be partial.
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Sample order for `epoch`, deterministic in `(seed, epoch)`.
    pub fn epoch_order(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        order
    }

    /// Starts the workers for `epoch` and returns the batches in order.
    pub fn epoch(&self, epoch: usize) -> Result<EpochBatches> {
        let order = self.epoch_order(epoch);
        let chunks: Arc<Vec<Vec<usize>>> = Arc::new(
            order
                .chunks(self.batch_size)
                .map(|chunk| chunk.to_vec())
                .collect(),
        );
        let total = chunks.len();
        let workers = self.num_workers.min(total.max(1));

        let mut receivers = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let (sender, receiver) = sync_channel(PREFETCH_PER_WORKER);
            let dataset = Arc::clone(&self.dataset);
            let chunks = Arc::clone(&chunks);
            let seed = self.seed;
            let handle = thread::Builder::new()
                .name(format!("batch-loader-{worker}"))
                .spawn(move || {
                    run_worker(dataset, chunks, worker, workers, seed, epoch, sender)
                })
                .map_err(|err| DataError::Config(format!("failed to spawn loader worker: {err}")))?;
            receivers.push(receiver);
            handles.push(handle);
        }

        Ok(EpochBatches {
            receivers,
            handles,
            next: 0,
            total,
        })
    }
}

fn run_worker(
    dataset: Arc<dyn Dataset>,
    chunks: Arc<Vec<Vec<usize>>>,
    worker: usize,
    workers: usize,
    seed: u64,
    epoch: usize,
    sender: SyncSender<Result<Batch>>,
) {
    for batch_index in (worker..chunks.len()).step_by(workers) {
        let mut rng = StdRng::seed_from_u64(
            seed ^ ((epoch as u64) << 32) ^ (batch_index as u64).wrapping_mul(0x9e37_79b9),
        );
        let batch = chunks[batch_index]
            .iter()
            .map(|&index| dataset.get(index, &mut rng))
            .collect::<Result<Vec<_>>>()
            .and_then(|samples| Batch::collate(samples, batch_index));
        let failed = batch.is_err();
        if sender.send(batch).is_err() || failed {
            return;
        }
    }
}

/// In-order batch stream for one epoch. Dropping it stops the workers.
pub struct EpochBatches {
    receivers: Vec<Receiver<Result<Batch>>>,
    handles: Vec<JoinHandle<()>>,
    next: usize,
    total: usize,
}

impl EpochBatches {
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

impl Iterator for EpochBatches {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total {
            return None;
        }
        let receiver = &self.receivers[self.next % self.receivers.len()];
        self.next += 1;
        match receiver.recv() {
            Ok(batch) => Some(batch),
            Err(_) => {
                self.next = self.total;
                Some(Err(DataError::WorkerDisconnected))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total - self.next;
        (remaining, Some(remaining))
    }
}

impl Drop for EpochBatches {
    fn drop(&mut self) {
        self.receivers.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Tensor};
    use rand::rngs::StdRng;

    use super::*;
    use crate::dataset::Sample;

    struct Counting(usize);

    impl Dataset for Counting {
        fn len(&self) -> usize {
            self.0
        }

        fn get(&self, index: usize, _rng: &mut StdRng) -> Result<Sample> {
            let image = Tensor::full(index as f32, (1, 2, 2), &Device::Cpu)?;
            Ok(Sample::Classification {
                image,
                label: index as u32,
            })
        }
    }

    fn collect_labels(loader: &BatchLoader, epoch: usize) -> Vec<Vec<u32>> {
        loader
            .epoch(epoch)
            .unwrap()
            .map(|batch| batch.unwrap().labels.to_vec1::<u32>().unwrap())
            .collect()
    }

    #[test]
    fn keeps_partial_last_batch() {
        let loader = BatchLoader::new(Arc::new(Counting(10)), 4, false, 3, 7).unwrap();
        assert_eq!(loader.num_batches(), 3);

        let batches = collect_labels(&loader, 0);
        assert_eq!(
            batches,
            vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]]
        );
    }

    #[test]
    fn reshuffles_every_epoch_in_loader_order() {
        let loader = BatchLoader::new(Arc::new(Counting(32)), 5, true, 4, 11).unwrap();

        let first: Vec<u32> = collect_labels(&loader, 0).concat();
        let second: Vec<u32> = collect_labels(&loader, 1).concat();
        let expected: Vec<u32> = loader.epoch_order(0).into_iter().map(|i| i as u32).collect();

        assert_eq!(first, expected);
        assert_ne!(first, second);
        let mut sorted = second.clone();
        sorted.sort();
        assert_eq!(sorted, (0..32).collect::<Vec<u32>>());
    }

    #[test]
    fn dropping_mid_epoch_releases_workers() {
        let loader = BatchLoader::new(Arc::new(Counting(64)), 2, true, 4, 3).unwrap();
        let mut batches = loader.epoch(0).unwrap();
        assert!(batches.next().is_some());
        drop(batches);
    }

    #[test]
    fn rejects_zero_batch_size() {
        assert!(BatchLoader::new(Arc::new(Counting(3)), 0, true, 1, 0).is_err());
    }
}
