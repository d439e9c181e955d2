//! In-process byte-range locks on destination files
//!
//! All writers live in the same process, so the lock table is a plain map from file
//! path to the ranges currently held. Waiters park on a [`Notify`] and re-check when
//! any range is released.

use std::collections::HashMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tracing::trace;

/// Table of byte ranges held per destination file
#[derive(Debug, Default)]
pub struct RangeLockTable {
    held: Mutex<HashMap<PathBuf, Vec<Range<u64>>>>,
    released: Notify,
}

impl RangeLockTable {
    /// Create an empty lock table
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquire `[offset, offset+length)` of `path`, waiting while it overlaps a held range
    pub async fn lock(self: &Arc<Self>, path: &Path, offset: u64, length: u64) -> RangeGuard {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if let Some(guard) = self.try_lock(path, offset, length) {
                return guard;
            }
            trace!(
                "Waiting for {}..{} of {}",
                offset,
                offset + length,
                path.display()
            );
            released.await;
        }
    }

    /// Acquire a range without waiting
    pub fn try_lock(self: &Arc<Self>, path: &Path, offset: u64, length: u64) -> Option<RangeGuard> {
        let range = offset..offset.saturating_add(length);
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        let ranges = held.entry(path.to_path_buf()).or_default();
        if ranges
            .iter()
            .any(|other| other.start < range.end && range.start < other.end)
        {
            return None;
        }
        ranges.push(range.clone());
        Some(RangeGuard {
            table: Arc::clone(self),
            path: path.to_path_buf(),
            range,
        })
    }

    /// Number of ranges currently held across all files
    pub fn held_count(&self) -> usize {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    fn release(&self, path: &Path, range: &Range<u64>) {
        {
            let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(ranges) = held.get_mut(path) {
                if let Some(index) = ranges.iter().position(|r| r == range) {
                    ranges.swap_remove(index);
                }
                if ranges.is_empty() {
                    held.remove(path);
                }
            }
        }
        self.released.notify_waiters();
    }
}

/// Exclusive hold on a byte range; released on drop
#[derive(Debug)]
pub struct RangeGuard {
    table: Arc<RangeLockTable>,
    path: PathBuf,
    range: Range<u64>,
}

impl RangeGuard {
    /// The locked range
    pub fn range(&self) -> &Range<u64> {
        &self.range
    }
}

impl Drop for RangeGuard {
    fn drop(&mut self) {
        self.table.release(&self.path, &self.range);
    }
}
