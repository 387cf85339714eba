#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Scales a workload size down when running under miri.
pub const fn scaled(count: usize) -> usize {
    if cfg!(miri) {
        count / 100 + 1
    } else {
        count
    }
}

/// A value that counts how often it has been dropped.
#[derive(Debug)]
pub struct Tracked {
    pub value: usize,
    drops: Arc<AtomicUsize>,
}

impl Tracked {
    pub fn new(value: usize, drops: &Arc<AtomicUsize>) -> Self {
        Self { value, drops: Arc::clone(drops) }
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }
}
