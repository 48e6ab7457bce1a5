//! Static topic-to-worker assignment.

use sluice_core::{Error, Result, WorkerId};

/// Which handle indices each worker owns.
///
/// Item `i` belongs to worker `i mod W`. Input order is preserved inside each
/// worker's list, and workers may own nothing when there are fewer items than
/// workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    owned: Vec<Vec<usize>>,
}

impl Assignment {
    /// Deal `items` indices round-robin across `workers`.
    ///
    /// # Errors
    /// Returns a configuration error when `workers` is zero.
    pub fn round_robin(items: usize, workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(Error::configuration("worker count must be at least 1"));
        }

        let mut owned = vec![Vec::with_capacity(items / workers + 1); workers];
        for item in 0..items {
            owned[item % workers].push(item);
        }
        Ok(Self { owned })
    }

    /// Number of workers.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.owned.len()
    }

    /// Items owned by `worker`, in input order.
    #[must_use]
    pub fn owned(&self, worker: WorkerId) -> &[usize] {
        self.owned.get(worker.value()).map_or(&[], Vec::as_slice)
    }

    /// Item count per worker.
    #[must_use]
    pub fn sizes(&self) -> Vec<usize> {
        self.owned.iter().map(Vec::len).collect()
    }
}
