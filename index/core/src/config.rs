//! Hash table construction parameters.

use crate::freq::FREQ_COUNTER_INC_FACTOR;

/// Configuration for a [`HashTable`](crate::HashTable).
#[derive(Debug, Clone)]
pub struct HashTableConfig {
    /// Initial (and minimum) number of hash buckets. Resizing never goes
    /// below this.
    pub initial_size: usize,

    /// Number of stripe mutexes. Bucket `b` is guarded by mutex
    /// `b % num_locks`.
    pub num_locks: usize,

    /// Increment factor for the probabilistic frequency counter.
    pub freq_counter_inc_factor: f64,
}

impl HashTableConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial bucket count.
    pub fn with_initial_size(mut self, initial_size: usize) -> Self {
        self.initial_size = initial_size;
        self
    }

    /// Set the stripe lock count.
    pub fn with_num_locks(mut self, num_locks: usize) -> Self {
        self.num_locks = num_locks;
        self
    }

    /// Set the frequency counter increment factor.
    pub fn with_freq_counter_inc_factor(mut self, inc_factor: f64) -> Self {
        self.freq_counter_inc_factor = inc_factor;
        self
    }
}

impl Default for HashTableConfig {
    fn default() -> Self {
        Self {
            initial_size: 47,
            num_locks: 47,
            freq_counter_inc_factor: FREQ_COUNTER_INC_FACTOR,
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn test_builder_chain() {
        let config = HashTableConfig::new()
            .with_initial_size(193)
            .with_num_locks(16);
        assert_eq!(config.initial_size, 193);
        assert_eq!(config.num_locks, 16);
        assert_eq!(config.freq_counter_inc_factor, FREQ_COUNTER_INC_FACTOR);
    }
}
