use std::collections::VecDeque;

use flowwatch_core::TrafficSample;

/// Capacity-bounded history in generation order. Pushing past capacity
/// evicts the oldest sample.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    samples: VecDeque<TrafficSample>,
    capacity: usize,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Hydrate from a checkpoint, keeping only the most recent `capacity`.
    pub fn from_samples(samples: Vec<TrafficSample>, capacity: usize) -> Self {
        let mut buffer = Self::new(capacity);
        let skip = samples.len().saturating_sub(buffer.capacity);
        buffer.samples.extend(samples.into_iter().skip(skip));
        buffer
    }

    pub fn push(&mut self, sample: TrafficSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrafficSample> {
        self.samples.iter()
    }

    /// Oldest first.
    pub fn to_vec(&self) -> Vec<TrafficSample> {
        self.samples.iter().cloned().collect()
    }
}
