//! Batch Feed - background producer of training/test batches
//!
//! A producer thread shuffles sample indices per epoch and pushes fixed-size
//! batches into a bounded channel. The control thread pulls with `next()`.
//! Dropping the feed stops and joins the producer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, error, info};

use disp_engine::Batch;

use crate::data::Dataset;

/// What the control thread receives from a feed.
#[derive(Debug)]
pub enum FeedItem {
    Batch(Batch),
    /// No more data will arrive. Not an error.
    Exhausted,
    /// The producer could not deliver further batches.
    Failed(String),
}

#[derive(Clone, Debug)]
pub struct FeedOptions {
    pub batch_size: usize,
    /// Passes over the dataset before `Exhausted`; `None` cycles forever.
    pub epochs: Option<usize>,
    pub shuffle: bool,
    pub seed: u64,
    /// Batches buffered ahead of the consumer.
    pub capacity: usize,
}

impl FeedOptions {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            epochs: None,
            shuffle: true,
            seed: 0,
            capacity: 4,
        }
    }

    pub fn with_epochs(mut self, epochs: Option<usize>) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }
}

pub struct BatchFeed {
    name: String,
    rx: Option<Receiver<FeedItem>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    exhausted: bool,
}

impl BatchFeed {
    pub fn spawn(name: &str, dataset: Arc<Dataset>, options: FeedOptions) -> Result<Self> {
        anyhow::ensure!(options.batch_size > 0, "batch size must be > 0");
        anyhow::ensure!(
            dataset.len() >= options.batch_size,
            "{} feed: {} samples cannot fill a batch of {}",
            name,
            dataset.len(),
            options.batch_size
        );

        let (tx, rx) = sync_channel::<FeedItem>(options.capacity.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let producer_stop = stop.clone();
        let handle = thread::Builder::new()
            .name(format!("feed-{name}"))
            .spawn(move || produce(&dataset, &options, &tx, &producer_stop))
            .with_context(|| format!("Failed to start {name} feed thread"))?;

        debug!("{} feed started", name);
        let mut feed = Self::from_receiver(name, rx);
        feed.stop = stop;
        feed.handle = Some(handle);
        Ok(feed)
    }

    /// Wraps a channel filled by an external producer. The producer must end
    /// with `Exhausted` (or `Failed`); hanging up without one is reported as a
    /// failure.
    pub fn from_receiver(name: &str, rx: Receiver<FeedItem>) -> Self {
        Self {
            name: name.to_string(),
            rx: Some(rx),
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
            exhausted: false,
        }
    }

    /// Blocks until the next batch is ready. After the first `Exhausted` or
    /// `Failed` every later call returns `Exhausted`.
    pub fn next(&mut self) -> FeedItem {
        if self.exhausted {
            return FeedItem::Exhausted;
        }
        let item = match self.rx.as_ref() {
            Some(rx) => rx.recv().unwrap_or_else(|_| {
                FeedItem::Failed(format!("{} feed producer hung up before the end of input", self.name))
            }),
            // stopped
            None => FeedItem::Exhausted,
        };
        if !matches!(item, FeedItem::Batch(_)) {
            self.exhausted = true;
        }
        item
    }

    /// Signals the producer to stop and waits for it. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Dropping the receiver wakes a producer blocked on a full channel.
        self.rx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("{} feed thread panicked", self.name);
            } else {
                debug!("{} feed stopped", self.name);
            }
        }
        self.exhausted = true;
    }
}

impl Drop for BatchFeed {
    fn drop(&mut self) {
        self.stop();
    }
}

fn produce(dataset: &Dataset, options: &FeedOptions, tx: &SyncSender<FeedItem>, stop: &AtomicBool) {
    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut order: Vec<usize> = (0..dataset.len()).collect();
    let mut epoch = 0usize;

    loop {
        if options.epochs.is_some_and(|max| epoch >= max) {
            break;
        }
        if options.shuffle {
            order.shuffle(&mut rng);
        }
        // trailing partial batch is dropped
        for indices in order.chunks_exact(options.batch_size) {
            if stop.load(Ordering::SeqCst) {
                return;
            }
            let batch = match dataset.gather(indices) {
                Ok(batch) => batch,
                Err(e) => {
                    error!("Feed failed to assemble a batch: {:#}", e);
                    let _ = tx.send(FeedItem::Failed(format!("{:#}", e)));
                    return;
                }
            };
            if tx.send(FeedItem::Batch(batch)).is_err() {
                return;
            }
        }
        epoch += 1;
    }

    info!("Input feed exhausted after {} epochs", epoch);
    let _ = tx.send(FeedItem::Exhausted);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Sample;

    fn dataset(n: usize) -> Arc<Dataset> {
        let samples = (0..n)
            .map(|i| Sample {
                target: i as f32,
                confidence: 1.0,
                features: vec![i as f32, 0.0],
            })
            .collect();
        Arc::new(Dataset::from_samples(samples).unwrap())
    }

    #[test]
    fn test_epochs_then_exhausted() -> anyhow::Result<()> {
        let mut feed = BatchFeed::spawn("train", dataset(10), FeedOptions::new(3).with_epochs(Some(2)))?;
        let mut batches = 0;
        while let FeedItem::Batch(batch) = feed.next() {
            assert_eq!(batch.rows, 3);
            batches += 1;
        }
        // 3 full batches per epoch, remainder dropped
        assert_eq!(batches, 6);
        assert!(matches!(feed.next(), FeedItem::Exhausted));
        Ok(())
    }

    #[test]
    fn test_unshuffled_order() -> anyhow::Result<()> {
        let options = FeedOptions::new(2).with_epochs(Some(1)).with_shuffle(false);
        let mut feed = BatchFeed::spawn("test", dataset(4), options)?;
        let FeedItem::Batch(first) = feed.next() else {
            anyhow::bail!("expected a batch");
        };
        assert_eq!(first.targets, vec![0.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_same_seed_same_sequence() -> anyhow::Result<()> {
        let data = dataset(16);
        let collect = |seed| -> anyhow::Result<Vec<f32>> {
            let mut feed =
                BatchFeed::spawn("train", data.clone(), FeedOptions::new(4).with_epochs(Some(1)).with_seed(seed))?;
            let mut targets = Vec::new();
            while let FeedItem::Batch(b) = feed.next() {
                targets.extend(b.targets);
            }
            Ok(targets)
        };
        assert_eq!(collect(9)?, collect(9)?);
        Ok(())
    }

    #[test]
    fn test_drop_joins_blocked_producer() -> anyhow::Result<()> {
        // Infinite feed with a full channel; drop must not hang.
        let mut feed = BatchFeed::spawn("train", dataset(8), FeedOptions::new(2))?;
        assert!(matches!(feed.next(), FeedItem::Batch(_)));
        feed.stop();
        assert!(matches!(feed.next(), FeedItem::Exhausted));
        drop(feed);
        Ok(())
    }

    #[test]
    fn test_hang_up_without_end_marker_is_a_failure() -> anyhow::Result<()> {
        let (tx, rx) = sync_channel(4);
        tx.send(FeedItem::Batch(dataset(2).gather(&[0, 1])?))?;
        drop(tx);

        let mut feed = BatchFeed::from_receiver("train", rx);
        assert!(matches!(feed.next(), FeedItem::Batch(_)));
        let FeedItem::Failed(reason) = feed.next() else {
            anyhow::bail!("expected a failure");
        };
        assert!(reason.contains("train feed"));
        assert!(matches!(feed.next(), FeedItem::Exhausted));
        Ok(())
    }

    #[test]
    fn test_batch_larger_than_dataset_rejected() {
        assert!(BatchFeed::spawn("train", dataset(2), FeedOptions::new(3)).is_err());
    }
}
