//! Epoch-shuffled index sampling.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Yields the indices `0..len` in a random order, one epoch at a time.
pub struct RandomSampler {
    indices: Vec<usize>,
    current: usize,
    epoch: u64,
    rng: StdRng,
}

impl RandomSampler {
    pub fn new(len: usize) -> Self {
        Self::from_rng(len, StdRng::from_entropy())
    }

    /// Reproducible order.
    pub fn with_seed(len: usize, seed: u64) -> Self {
        Self::from_rng(len, StdRng::seed_from_u64(seed))
    }

    fn from_rng(len: usize, rng: StdRng) -> Self {
        let mut sampler = Self { indices: (0..len).collect(), current: 0, epoch: 0, rng };
        sampler.indices.shuffle(&mut sampler.rng);
        sampler
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Completed passes over the data.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Starts a new epoch with a fresh permutation.
    pub fn reset(&mut self) {
        self.current = 0;
        self.indices.shuffle(&mut self.rng);
    }

    /// The next `batch_size` indices. When the epoch runs out part-way, the
    /// batch is completed from the start of a reshuffled epoch.
    pub fn next_batch(&mut self, batch_size: usize) -> Vec<usize> {
        let mut batch = Vec::with_capacity(batch_size);
        if self.indices.is_empty() {
            return batch;
        }
        while batch.len() < batch_size {
            match self.next() {
                Some(idx) => batch.push(idx),
                None => {
                    self.epoch += 1;
                    self.reset();
                }
            }
        }
        batch
    }
}

impl Iterator for RandomSampler {
    type Item = usize;

    /// Next index of the current epoch, `None` once it is exhausted.
    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.indices.get(self.current).copied()?;
        self.current += 1;
        Some(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn one_epoch_is_a_permutation() {
        let sampler = RandomSampler::with_seed(10, 42);
        let mut seen: Vec<usize> = sampler.collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn batches_roll_over_into_a_new_epoch() {
        let mut sampler = RandomSampler::with_seed(5, 1);
        let first = sampler.next_batch(3);
        let second = sampler.next_batch(3);
        assert_eq!(second.len(), 3);
        assert_eq!(sampler.epoch(), 1);

        // The first five indices drawn cover the whole dataset exactly once.
        let epoch: HashSet<usize> = first.iter().chain(&second[..2]).copied().collect();
        assert_eq!(epoch.len(), 5);
    }

    #[test]
    fn same_seed_same_order() {
        let a: Vec<usize> = RandomSampler::with_seed(50, 7).collect();
        let b: Vec<usize> = RandomSampler::with_seed(50, 7).collect();
        assert_eq!(a, b);
    }
}
