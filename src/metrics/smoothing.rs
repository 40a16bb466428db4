//! Heart rate smoothing.

use std::collections::VecDeque;

/// Rolling median over the last `window_size` values.
///
/// With an even number of buffered values the two middle values are
/// averaged, then truncated.
#[derive(Debug, Clone)]
pub struct RollingMedian {
    /// Buffer of recent values, oldest first
    buffer: VecDeque<u16>,
    /// Window size in samples
    window_size: usize,
}

impl RollingMedian {
    /// Create a new rolling median with the given window size (at least 1).
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            buffer: VecDeque::with_capacity(window_size),
            window_size,
        }
    }

    /// Three-sample window used for live heart rate.
    pub fn three_sample() -> Self {
        Self::new(3)
    }

    /// Add a new value and return the current median.
    pub fn add(&mut self, value: u16) -> u16 {
        self.buffer.push_back(value);
        if self.buffer.len() > self.window_size {
            self.buffer.pop_front();
        }
        // buffer is non-empty here
        self.median().unwrap_or(value)
    }

    /// Current median without adding a value.
    pub fn median(&self) -> Option<u16> {
        if self.buffer.is_empty() {
            return None;
        }
        let mut sorted: Vec<u16> = self.buffer.iter().copied().collect();
        sorted.sort_unstable();
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 1 {
            Some(sorted[mid])
        } else {
            let sum = u32::from(sorted[mid - 1]) + u32::from(sorted[mid]);
            Some((sum / 2) as u16)
        }
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for RollingMedian {
    fn default() -> Self {
        Self::three_sample()
    }
}
