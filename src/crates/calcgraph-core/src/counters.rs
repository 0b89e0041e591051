//! Named per-run counters exposed to calculators through their context.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A handle to one named counter. Cheap to clone; increments are atomic.
#[derive(Clone)]
pub struct Counter {
    cell: Arc<AtomicU64>,
}

impl Counter {
    /// Adds one.
    pub fn increment(&self) {
        self.add(1);
    }

    /// Adds `n`.
    pub fn add(&self, n: u64) {
        self.cell.fetch_add(n, Ordering::Relaxed);
    }

    /// The current value.
    pub fn value(&self) -> u64 {
        self.cell.load(Ordering::Relaxed)
    }
}

/// The set of counters for one graph, shared by all nodes.
#[derive(Default)]
pub struct CounterSet {
    cells: Mutex<HashMap<String, Arc<AtomicU64>>>,
}

impl CounterSet {
    pub(crate) fn new() -> CounterSet {
        CounterSet::default()
    }

    /// The counter named `name`, created on first use.
    pub fn counter(&self, name: &str) -> Counter {
        let mut cells = self.cells.lock();
        let cell = cells
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)));
        Counter { cell: cell.clone() }
    }

    /// The value of `name`, or `None` if it was never touched.
    pub fn value(&self, name: &str) -> Option<u64> {
        self.cells
            .lock()
            .get(name)
            .map(|cell| cell.load(Ordering::Relaxed))
    }

    /// All counters, sorted by name.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.cells
            .lock()
            .iter()
            .map(|(name, cell)| (name.clone(), cell.load(Ordering::Relaxed)))
            .collect()
    }

    pub(crate) fn reset(&self) {
        self.cells.lock().clear();
    }
}
