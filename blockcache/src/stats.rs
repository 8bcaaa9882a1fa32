//! Rolling averages over a fixed window of samples.

use std::{collections::VecDeque, num::NonZeroUsize};

/// The average of the most recent `window` samples.
///
/// Once the window is full, every new sample evicts the oldest one.
#[derive(Clone, Debug)]
pub struct Average {
    samples: VecDeque<u64>,
    window: usize,
    sum: u64,
}

impl Average {
    /// Create an empty average over `window` samples.
    pub fn new(window: NonZeroUsize) -> Self {
        Self {
            samples: VecDeque::with_capacity(window.get()),
            window: window.get(),
            sum: 0,
        }
    }

    /// Record a sample.
    pub fn push(&mut self, sample: u64) {
        if self.samples.len() == self.window {
            if let Some(oldest) = self.samples.pop_front() {
                self.sum -= oldest;
            }
        }
        self.samples.push_back(sample);
        self.sum += sample;
    }

    /// The number of samples currently in the window.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no samples have been recorded.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The average of the samples in the window, or `0.0` if there are none.
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.sum as f64 / self.samples.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_window() {
        let mut average = Average::new(NonZeroUsize::new(4).unwrap());
        assert!(average.is_empty());
        assert_eq!(average.average(), 0.0);

        average.push(1);
        average.push(0);
        assert_eq!(average.average(), 0.5);

        average.push(1);
        average.push(1);
        assert_eq!(average.average(), 0.75);

        // The first sample falls out of the window.
        average.push(0);
        assert_eq!(average.len(), 4);
        assert_eq!(average.average(), 0.5);

        for _ in 0..4 {
            average.push(1);
        }
        assert_eq!(average.average(), 1.0);
    }
}
