use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        mpsc::{sync_channel, Receiver, SyncSender},
        Arc,
    },
    thread,
};

use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::config::{to_runtime_error, TrainingError};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// Host-side micro-batch before tensor materialization: row-major
/// `(batch, context)` token ids with targets shifted one position ahead.
#[derive(Debug, Clone)]
pub struct HostBatch {
    pub inputs: Vec<u32>,
    pub targets: Vec<u32>,
}

/// Infinite sampler over pretokenized `{split}*.bin` shards.
///
/// Shards are u16 little-endian token streams. Each epoch shuffles the
/// non-overlapping context windows across all shards with an epoch-bumped
/// seed, so coverage is uniform but the order never repeats between
/// epochs. The stream never ends; exhausting the windows starts the next
/// epoch.
pub struct TokenBatches {
    shards: Arc<Vec<Vec<u16>>>,
    pending: Vec<WindowRef>,
    batch_size: usize,
    context_length: usize,
    seed: u64,
    epoch: u64,
}

#[derive(Debug, Clone, Copy)]
struct WindowRef {
    shard: usize,
    offset: usize,
}

impl TokenBatches {
    pub fn new(
        dir: impl AsRef<Path>,
        split: &str,
        batch_size: usize,
        context_length: usize,
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch_size must be greater than zero",
            ));
        }
        if context_length == 0 {
            return Err(TrainingError::initialization(
                "context_length must be greater than zero",
            ));
        }

        let paths = shard_paths(dir.as_ref(), split)?;
        if paths.is_empty() {
            return Err(TrainingError::initialization(format!(
                "no '{}*.bin' shards found in {}",
                split,
                dir.as_ref().display()
            )));
        }

        let mut shards = Vec::with_capacity(paths.len());
        for path in &paths {
            let tokens = read_shard(path)?;
            // A usable shard needs one full window plus the shifted target.
            if tokens.len() > context_length {
                shards.push(tokens);
            } else {
                eprintln!(
                    "skipping shard {} ({} tokens, need more than {})",
                    path.display(),
                    tokens.len(),
                    context_length
                );
            }
        }

        if shards.is_empty() {
            return Err(TrainingError::initialization(format!(
                "no shard in {} holds a full context window of {} tokens",
                dir.as_ref().display(),
                context_length
            )));
        }

        let mut batches = Self {
            shards: Arc::new(shards),
            pending: Vec::new(),
            batch_size,
            context_length,
            seed,
            epoch: 0,
        };
        batches.prepare_next_epoch();
        Ok(batches)
    }

    fn prepare_next_epoch(&mut self) {
        let mut windows = Vec::new();
        for (shard_idx, tokens) in self.shards.iter().enumerate() {
            let num_windows = (tokens.len() - 1) / self.context_length;
            for window in 0..num_windows {
                windows.push(WindowRef {
                    shard: shard_idx,
                    offset: window * self.context_length,
                });
            }
        }

        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch));
        windows.shuffle(&mut rng);
        // Popped from the back, so reverse to consume in shuffled order.
        windows.reverse();
        self.pending = windows;
        self.epoch += 1;
    }

    pub fn next_host_batch(&mut self) -> HostBatch {
        let elems = self.batch_size * self.context_length;
        let mut inputs = Vec::with_capacity(elems);
        let mut targets = Vec::with_capacity(elems);

        for _ in 0..self.batch_size {
            let window = match self.pending.pop() {
                Some(window) => window,
                None => {
                    self.prepare_next_epoch();
                    match self.pending.pop() {
                        Some(window) => window,
                        // Construction guarantees at least one window.
                        None => unreachable!("epoch prepared with zero windows"),
                    }
                }
            };
            let tokens = &self.shards[window.shard];
            let span = &tokens[window.offset..window.offset + self.context_length + 1];
            inputs.extend(span[..self.context_length].iter().map(|&t| t as u32));
            targets.extend(span[1..].iter().map(|&t| t as u32));
        }

        HostBatch { inputs, targets }
    }

    pub fn next_batch(&mut self, device: &Device) -> Result<(Tensor, Tensor)> {
        let host = self.next_host_batch();
        materialize(host, self.batch_size, self.context_length, device)
    }
}

fn materialize(
    host: HostBatch,
    batch_size: usize,
    context_length: usize,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let shape = (batch_size, context_length);
    let inputs = Tensor::from_vec(host.inputs, shape, device).map_err(to_runtime_error)?;
    let targets = Tensor::from_vec(host.targets, shape, device).map_err(to_runtime_error)?;
    Ok((inputs, targets))
}

fn shard_paths(dir: &Path, split: &str) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => continue,
        };
        if name.starts_with(split) && name.ends_with(".bin") {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

fn read_shard(path: &Path) -> Result<Vec<u16>> {
    let bytes = fs::read(path)?;
    if bytes.len() % 2 != 0 {
        return Err(TrainingError::initialization(format!(
            "shard {} has an odd byte length; expected u16 little-endian tokens",
            path.display()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Wraps a sampler with worker threads that stage host batches ahead of
/// the training step through a bounded channel. Workers stay device-free;
/// tensors are materialized on the consumer side.
pub struct PrefetchBatches {
    receiver: Receiver<HostBatch>,
    batch_size: usize,
    context_length: usize,
    _workers: Vec<thread::JoinHandle<()>>,
}

impl PrefetchBatches {
    pub fn spawn(source: TokenBatches, num_workers: usize) -> Self {
        let batch_size = source.batch_size;
        let context_length = source.context_length;
        let workers = num_workers.max(1);
        let (sender, receiver) = sync_channel(workers * 2);

        let mut handles = Vec::with_capacity(workers);
        if workers == 1 {
            handles.push(spawn_worker(source, sender));
        } else {
            // Each worker owns an independently seeded sampler; window
            // coverage is per-worker rather than global.
            for worker in 0..workers {
                let mut replica = TokenBatches {
                    shards: Arc::clone(&source.shards),
                    pending: Vec::new(),
                    batch_size,
                    context_length,
                    seed: source.seed.wrapping_add(worker as u64),
                    epoch: 0,
                };
                replica.prepare_next_epoch();
                handles.push(spawn_worker(replica, sender.clone()));
            }
            drop(sender);
        }

        Self {
            receiver,
            batch_size,
            context_length,
            _workers: handles,
        }
    }

    pub fn next_batch(&mut self, device: &Device) -> Result<(Tensor, Tensor)> {
        let host = self
            .receiver
            .recv()
            .map_err(|_| TrainingError::runtime("batch prefetch workers stopped"))?;
        materialize(host, self.batch_size, self.context_length, device)
    }
}

fn spawn_worker(mut source: TokenBatches, sender: SyncSender<HostBatch>) -> thread::JoinHandle<()> {
    thread::spawn(move || loop {
        let batch = source.next_host_batch();
        // A closed channel means the consumer is gone; exit quietly.
        if sender.send(batch).is_err() {
            return;
        }
    })
}

/// Batch source selected by `data.num_workers`: direct sampling on the
/// training thread, or staged through prefetch workers.
pub enum Batches {
    Direct(TokenBatches),
    Prefetched(PrefetchBatches),
}

impl Batches {
    pub fn new(
        dir: impl AsRef<Path>,
        split: &str,
        batch_size: usize,
        context_length: usize,
        seed: u64,
        num_workers: usize,
    ) -> Result<Self> {
        let source = TokenBatches::new(dir, split, batch_size, context_length, seed)?;
        Ok(if num_workers == 0 {
            Batches::Direct(source)
        } else {
            Batches::Prefetched(PrefetchBatches::spawn(source, num_workers))
        })
    }

    pub fn next_batch(&mut self, device: &Device) -> Result<(Tensor, Tensor)> {
        match self {
            Batches::Direct(source) => source.next_batch(device),
            Batches::Prefetched(source) => source.next_batch(device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use std::io::Write;

    fn write_shard(dir: &Path, name: &str, tokens: &[u16]) {
        let mut file = fs::File::create(dir.join(name)).unwrap();
        for token in tokens {
            file.write_all(&token.to_le_bytes()).unwrap();
        }
    }

    fn sequential_tokens(len: usize) -> Vec<u16> {
        (0..len).map(|i| (i % 1000) as u16).collect()
    }

    #[test]
    fn targets_are_shifted_by_one() {
        let dir = tempfile::tempdir().unwrap();
        write_shard(dir.path(), "train0.bin", &sequential_tokens(257));

        let mut batches = TokenBatches::new(dir.path(), "train", 2, 16, 0).unwrap();
        let host = batches.next_host_batch();
        assert_eq!(host.inputs.len(), 2 * 16);
        assert_eq!(host.targets.len(), 2 * 16);
        // Sequential data: the target is always the successor token.
        for (input, target) in host.inputs.iter().zip(&host.targets) {
            assert_eq!(*target, (input + 1) % 1000);
        }
    }

    #[test]
    fn same_seed_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        write_shard(dir.path(), "train0.bin", &sequential_tokens(4097));

        let mut first = TokenBatches::new(dir.path(), "train", 4, 32, 7).unwrap();
        let mut second = TokenBatches::new(dir.path(), "train", 4, 32, 7).unwrap();
        for _ in 0..3 {
            let a = first.next_host_batch();
            let b = second.next_host_batch();
            assert_eq!(a.inputs, b.inputs);
            assert_eq!(a.targets, b.targets);
        }
    }

    #[test]
    fn splits_read_their_own_shards() {
        let dir = tempfile::tempdir().unwrap();
        write_shard(dir.path(), "train0.bin", &vec![1u16; 65]);
        write_shard(dir.path(), "val0.bin", &vec![2u16; 65]);

        let mut train = TokenBatches::new(dir.path(), "train", 1, 8, 0).unwrap();
        let mut val = TokenBatches::new(dir.path(), "val", 1, 8, 0).unwrap();
        assert!(train.next_host_batch().inputs.iter().all(|&t| t == 1));
        assert!(val.next_host_batch().inputs.iter().all(|&t| t == 2));
    }

    #[test]
    fn recycles_windows_across_epochs() {
        let dir = tempfile::tempdir().unwrap();
        // Exactly two windows of 8 tokens (17 tokens with the shift).
        write_shard(dir.path(), "train0.bin", &sequential_tokens(17));

        let mut batches = TokenBatches::new(dir.path(), "train", 1, 8, 0).unwrap();
        // More draws than windows; the stream must never end.
        for _ in 0..10 {
            let host = batches.next_host_batch();
            assert_eq!(host.inputs.len(), 8);
        }
    }

    #[test]
    fn rejects_short_shards() {
        let dir = tempfile::tempdir().unwrap();
        write_shard(dir.path(), "train0.bin", &sequential_tokens(8));
        assert!(TokenBatches::new(dir.path(), "train", 1, 16, 0).is_err());
    }

    #[test]
    fn rejects_missing_split() {
        let dir = tempfile::tempdir().unwrap();
        write_shard(dir.path(), "train0.bin", &sequential_tokens(64));
        assert!(TokenBatches::new(dir.path(), "val", 1, 8, 0).is_err());
    }

    #[test]
    fn materializes_device_tensors() {
        let dir = tempfile::tempdir().unwrap();
        write_shard(dir.path(), "train0.bin", &sequential_tokens(257));

        let mut batches = Batches::new(dir.path(), "train", 2, 16, 0, 0).unwrap();
        let (inputs, targets) = batches.next_batch(&Device::Cpu).unwrap();
        assert_eq!(inputs.dims(), &[2, 16]);
        assert_eq!(targets.dims(), &[2, 16]);
        assert_eq!(inputs.dtype(), DType::U32);
    }

    #[test]
    fn prefetch_delivers_batches() {
        let dir = tempfile::tempdir().unwrap();
        write_shard(dir.path(), "train0.bin", &sequential_tokens(1025));

        let mut batches = Batches::new(dir.path(), "train", 2, 16, 0, 2).unwrap();
        for _ in 0..5 {
            let (inputs, _) = batches.next_batch(&Device::Cpu).unwrap();
            assert_eq!(inputs.dims(), &[2, 16]);
        }
    }
}
