//! Batch production, inline or on worker threads
//!
//! Workers only encode and collate. Worker `w` builds batches `w, w + N, ...`
//! into its own bounded channel and the control thread reads the channels
//! round-robin, so batches arrive in plan order whatever the worker count.

use std::sync::mpsc::{sync_channel, Receiver};

use pairtune_core::{Result, TextTokenizer, TuneError};

use crate::collate::{collate, Batch};
use crate::dataset::TrainingPair;
use crate::example::build_example;

/// Batches each worker may build ahead of the consumer.
const PREFETCH_PER_WORKER: usize = 2;

pub struct BatchFeeder<'a> {
    pairs: &'a [TrainingPair],
    tokenizer: &'a dyn TextTokenizer,
    max_seq_len: usize,
    batch_size: usize,
    workers: usize,
}

impl<'a> BatchFeeder<'a> {
    pub fn new(
        pairs: &'a [TrainingPair],
        tokenizer: &'a dyn TextTokenizer,
        max_seq_len: usize,
        batch_size: usize,
        workers: usize,
    ) -> Self {
        Self {
            pairs,
            tokenizer,
            max_seq_len,
            batch_size,
            workers,
        }
    }

    /// Batches per pass over the pairs; the last one may be short.
    pub fn batches_per_epoch(&self) -> usize {
        self.pairs.len().div_ceil(self.batch_size)
    }

    /// Build the batch made of `pairs[order[i]]` for the i-th chunk of `order`.
    fn build(&self, order: &[usize], batch_idx: usize) -> Result<Batch> {
        let start = batch_idx * self.batch_size;
        let end = (start + self.batch_size).min(order.len());

        let examples = order[start..end]
            .iter()
            .map(|&i| build_example(self.tokenizer, &self.pairs[i], self.max_seq_len))
            .collect::<Result<Vec<_>>>()?;
        collate(&examples, self.tokenizer.pad_token_id())
    }

    /// Feed every batch of one epoch, in `order`, to `consume`.
    /// Stops at the first error from either side.
    pub fn run_epoch<F>(&self, order: &[usize], mut consume: F) -> Result<()>
    where
        F: FnMut(Batch) -> Result<()>,
    {
        let num_batches = order.len().div_ceil(self.batch_size);

        if self.workers == 0 {
            for batch_idx in 0..num_batches {
                consume(self.build(order, batch_idx)?)?;
            }
            return Ok(());
        }

        let workers = self.workers.min(num_batches.max(1));
        std::thread::scope(|scope| -> Result<()> {
            let mut receivers: Vec<Receiver<Result<Batch>>> = Vec::with_capacity(workers);
            for worker in 0..workers {
                let (tx, rx) = sync_channel(PREFETCH_PER_WORKER);
                receivers.push(rx);
                scope.spawn(move || {
                    for batch_idx in (worker..num_batches).step_by(workers) {
                        let batch = self.build(order, batch_idx);
                        let failed = batch.is_err();
                        // A closed channel means the consumer stopped early.
                        if tx.send(batch).is_err() || failed {
                            break;
                        }
                    }
                });
            }

            for batch_idx in 0..num_batches {
                let batch = receivers[batch_idx % workers]
                    .recv()
                    .map_err(|_| TuneError::Worker(format!("exited before batch {batch_idx}")))??;
                consume(batch)?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::example::tests::{pair, ByteTokenizer};

    fn pairs(n: usize) -> Vec<TrainingPair> {
        (0..n).map(|i| pair(&format!("question {i}"), &"x".repeat(i + 1))).collect()
    }

    fn collect(feeder: &BatchFeeder, order: &[usize]) -> Result<Vec<Batch>> {
        let mut batches = Vec::new();
        feeder.run_epoch(order, |batch| {
            batches.push(batch);
            Ok(())
        })?;
        Ok(batches)
    }

    #[test]
    fn test_batch_count_rounds_up() {
        let data = pairs(5);
        let feeder = BatchFeeder::new(&data, &ByteTokenizer, 128, 2, 0);
        assert_eq!(feeder.batches_per_epoch(), 3);
    }

    #[test]
    fn test_workers_preserve_order() -> Result<()> {
        let data = pairs(11);
        let order: Vec<usize> = (0..11).rev().collect();

        let inline = collect(&BatchFeeder::new(&data, &ByteTokenizer, 128, 3, 0), &order)?;
        for workers in [1, 2, 3, 8] {
            let threaded = collect(&BatchFeeder::new(&data, &ByteTokenizer, 128, 3, workers), &order)?;
            assert_eq!(threaded, inline, "{workers} workers");
        }
        assert_eq!(inline.len(), 4);
        assert_eq!(inline[3].rows, 2);
        Ok(())
    }

    #[test]
    fn test_consumer_error_stops_workers() {
        let data = pairs(20);
        let order: Vec<usize> = (0..20).collect();
        let feeder = BatchFeeder::new(&data, &ByteTokenizer, 128, 1, 2);

        let mut seen = 0;
        let result = feeder.run_epoch(&order, |_| {
            seen += 1;
            if seen == 3 {
                return Err(TuneError::EmptyBatch);
            }
            Ok(())
        });
        assert!(matches!(result, Err(TuneError::EmptyBatch)));
        assert_eq!(seen, 3);
    }

    #[test]
    fn test_worker_errors_propagate() {
        let mut data = pairs(4);
        data[2].target = String::new();
        let order: Vec<usize> = (0..4).collect();
        let feeder = BatchFeeder::new(&data, &ByteTokenizer, 128, 1, 2);

        let result = feeder.run_epoch(&order, |_| Ok(()));
        assert!(matches!(result, Err(TuneError::MalformedRecord { .. })));
    }
}
