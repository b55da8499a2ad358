//! Task-range decomposition.
//!
//! A run covers the half-open task interval `[0, total)`. Each wave hands
//! every local device one chunk of `capacity * multiplier` tasks, where
//! capacity is the peer's summed `workgroup_size * compute_units`. Ranges
//! are handed out in device-list order from a single cursor, so the ranges
//! of all waves partition `[0, total)` exactly once.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::device::DeviceInfo;
use crate::error::{ExecError, Result, Stage};

/// Half-open interval of task indices `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TaskRange {
    /// First task index.
    pub start: u64,
    /// One past the last task index.
    pub end: u64,
}

impl TaskRange {
    /// Create a range.
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Number of tasks in the range.
    pub const fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// Whether the range holds no tasks.
    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Whether `task` lies in the range.
    pub const fn contains(&self, task: u64) -> bool {
        task >= self.start && task < self.end
    }

    /// Iterate the task indices.
    pub fn iter(&self) -> std::ops::Range<u64> {
        self.start..self.end
    }
}

impl fmt::Display for TaskRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Parallel-throughput proxy of a set of devices.
pub fn peer_capacity<'a>(devices: impl IntoIterator<Item = &'a DeviceInfo>) -> u64 {
    devices
        .into_iter()
        .fold(0u64, |acc, d| acc.saturating_add(d.capacity()))
}

/// Per-device chunk size for one wave.
///
/// A zero chunk would never make progress, so zero capacity is rejected
/// here, before any dispatch starts.
pub fn chunk_size(capacity: u64, multiplier: u32) -> Result<u64> {
    if capacity == 0 {
        return Err(ExecError::invalid_value(
            Stage::Sizing,
            "device capacity is zero; no device reports workgroup size and compute units",
        ));
    }
    capacity
        .checked_mul(u64::from(multiplier.max(1)))
        .ok_or_else(|| {
            ExecError::invalid_value(
                Stage::Sizing,
                format!(
                    "chunk size overflows: capacity {} x multiplier {}",
                    capacity, multiplier
                ),
            )
        })
}

/// Cursor over `[0, total)` that hands out consecutive ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeCursor {
    total: u64,
    cursor: u64,
    completed: u64,
}

impl RangeCursor {
    /// Create a cursor over `[0, total)`.
    pub fn new(total: u64) -> Self {
        Self {
            total,
            cursor: 0,
            completed: 0,
        }
    }

    /// Total number of tasks.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Next unassigned task index.
    pub fn position(&self) -> u64 {
        self.cursor
    }

    /// Tasks handed out so far.
    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// Whether every task has been handed out.
    pub fn is_exhausted(&self) -> bool {
        self.completed >= self.total
    }

    /// Take the next range of at most `chunk` tasks.
    ///
    /// Returns `None` once the cursor reaches `total`.
    pub fn next_range(&mut self, chunk: u64) -> Option<TaskRange> {
        if self.cursor >= self.total || chunk == 0 {
            return None;
        }
        let end = self.cursor.saturating_add(chunk).min(self.total);
        let range = TaskRange::new(self.cursor, end);
        self.completed += range.len();
        self.cursor = end;
        Some(range)
    }

    /// Percentage of tasks handed out, in `0.0..=100.0`.
    pub fn progress_percent(&self) -> f32 {
        if self.total == 0 {
            return 100.0;
        }
        ((100.0 * self.completed as f64) / self.total as f64) as f32
    }
}
