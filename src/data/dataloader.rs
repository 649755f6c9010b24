use std::{
    sync::{mpsc, Arc},
    thread,
};

use rand::{seq::SliceRandom, Rng};

use super::dataset::{Batch, TrackDataset};

/// Batching wrapper over an index subset of a [`TrackDataset`].
///
/// The subset is fixed for the loader's lifetime. Every call to [`epoch`]
/// replans the visiting order with the caller's generator (when shuffling
/// is enabled) and yields owned collated batches; with `prefetch > 0`
/// collation runs on a background worker feeding a bounded channel, so the
/// consumer only blocks when it outpaces the worker.
///
/// [`epoch`]: DataLoader::epoch
#[derive(Debug)]
pub struct DataLoader {
    dataset: Arc<TrackDataset>,
    indices: Vec<usize>,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    prefetch: usize,
}

impl DataLoader {
    /// # Panics
    /// If `batch_size` is 0 or any index is out of bounds for `dataset`.
    pub fn new(
        dataset: Arc<TrackDataset>,
        indices: Vec<usize>,
        batch_size: usize,
        shuffle: bool,
        drop_last: bool,
        prefetch: usize,
    ) -> Self {
        assert!(batch_size > 0, "batch_size must be > 0");
        if let Some(&bad) = indices.iter().find(|&&i| i >= dataset.len()) {
            panic!("index {bad} out of bounds for dataset of {}", dataset.len());
        }

        Self {
            dataset,
            indices,
            batch_size,
            shuffle,
            drop_last,
            prefetch,
        }
    }

    /// Number of samples in this loader's subset.
    #[inline]
    pub fn subset_len(&self) -> usize {
        self.indices.len()
    }

    /// The dataset indices this loader draws from.
    #[inline]
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Batches yielded by one full pass.
    pub fn batches_per_epoch(&self) -> usize {
        if self.drop_last {
            self.indices.len() / self.batch_size
        } else {
            self.indices.len().div_ceil(self.batch_size)
        }
    }

    /// Starts one pass over the subset.
    ///
    /// The shuffle draws from `rng`, so loaders sharing one generator stay
    /// jointly reproducible for a given seed.
    pub fn epoch<R: Rng>(&self, rng: &mut R) -> Batches {
        let mut order = self.indices.clone();
        if self.shuffle {
            order.shuffle(rng);
        }

        let limit = if self.drop_last {
            (order.len() / self.batch_size) * self.batch_size
        } else {
            order.len()
        };

        if self.prefetch > 0 && limit > 0 {
            let (tx, rx) = mpsc::sync_channel(self.prefetch);
            let dataset = Arc::clone(&self.dataset);
            let batch_size = self.batch_size;
            thread::spawn(move || {
                let mut cursor = 0;
                while cursor < limit {
                    let end = (cursor + batch_size).min(limit);
                    let batch = dataset.collate(&order[cursor..end]);
                    // a closed channel means the consumer is done with the epoch
                    if tx.send(batch).is_err() {
                        return;
                    }
                    cursor = end;
                }
            });
            Batches(BatchesInner::Prefetched { rx })
        } else {
            Batches(BatchesInner::Inline {
                dataset: Arc::clone(&self.dataset),
                order,
                batch_size: self.batch_size,
                cursor: 0,
                limit,
            })
        }
    }
}

/// Owned batches of one epoch, in plan order.
pub struct Batches(BatchesInner);

enum BatchesInner {
    Inline {
        dataset: Arc<TrackDataset>,
        order: Vec<usize>,
        batch_size: usize,
        cursor: usize,
        limit: usize,
    },
    Prefetched {
        rx: mpsc::Receiver<Batch>,
    },
}

impl Iterator for Batches {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        match &mut self.0 {
            BatchesInner::Inline {
                dataset,
                order,
                batch_size,
                cursor,
                limit,
            } => {
                if *cursor >= *limit {
                    return None;
                }
                let end = (*cursor + *batch_size).min(*limit);
                let batch = dataset.collate(&order[*cursor..end]);
                *cursor = end;
                Some(batch)
            }
            BatchesInner::Prefetched { rx } => rx.recv().ok(),
        }
    }
}
