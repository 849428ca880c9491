use std::collections::VecDeque;
use std::sync::Mutex;

use crate::lock;
use crate::sample_record::SampleRecord;

/// Rolling window of the current session's samples, shared between the
/// producer thread and any number of readers.
///
/// Records and the last backing-read status live behind one mutex, so a
/// reader always sees a count, contents and status from the same instant.
pub struct StreamBuffer {
    inner: Mutex<StreamInner>,
    capacity: Option<usize>,
}

struct StreamInner {
    records: VecDeque<SampleRecord>,
    status: i32,
}

impl Default for StreamBuffer {
    fn default() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }
}

impl StreamBuffer {
    pub const DEFAULT_CAPACITY: usize = 1 << 20;

    /// Keep at most `capacity` records, evicting the oldest.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(StreamInner {
                records: VecDeque::new(),
                status: 0,
            }),
            capacity: Some(capacity.max(1)),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            inner: Mutex::new(StreamInner {
                records: VecDeque::new(),
                status: 0,
            }),
            capacity: None,
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn push(&self, record: SampleRecord) {
        let mut inner = lock(&self.inner);
        self.push_locked(&mut inner, record);
    }

    /// Append a block of records under a single lock acquisition.
    pub fn push_all(&self, records: &[SampleRecord]) {
        let mut inner = lock(&self.inner);
        for &record in records {
            self.push_locked(&mut inner, record);
        }
    }

    fn push_locked(&self, inner: &mut StreamInner, record: SampleRecord) {
        if let Some(capacity) = self.capacity {
            if inner.records.len() >= capacity {
                inner.records.pop_front();
            }
        }
        inner.records.push_back(record);
    }

    /// Return at most `max_points` records spread uniformly over the whole
    /// buffer, in ascending index order, always ending with the newest record.
    ///
    /// Empty when nothing is buffered or the last backing read failed.
    pub fn downsample(&self, max_points: usize) -> Vec<SampleRecord> {
        let inner = lock(&self.inner);
        if inner.status != 0 {
            return Vec::new();
        }
        decimate_indices(inner.records.len(), max_points)
            .map(|i| inner.records[i])
            .collect()
    }

    /// Drop all samples and clear the fault status.
    pub fn reset(&self) {
        let mut inner = lock(&self.inner);
        inner.records.clear();
        inner.status = 0;
    }

    /// Record the status of the most recent backing read. Nonzero hides the
    /// buffer from `downsample` until the next `reset`.
    pub fn set_status(&self, status: i32) {
        lock(&self.inner).status = status;
    }

    pub fn status(&self) -> i32 {
        lock(&self.inner).status
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).records.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).records.is_empty()
    }

    pub fn latest(&self) -> Option<SampleRecord> {
        lock(&self.inner).records.back().copied()
    }
}

/// Positions to keep when reducing `count` items to at most `max_points`.
///
/// Yields `min(count, max_points)` strictly increasing positions. When
/// decimating, the first and last positions are always included and the rest
/// are spaced by a uniform (fractional) stride of `(count - 1) / (kept - 1)`.
pub fn decimate_indices(count: usize, max_points: usize) -> impl Iterator<Item = usize> {
    let kept = count.min(max_points);
    (0..kept).map(move |i| {
        if kept == count {
            i
        } else if kept == 1 {
            count - 1
        } else {
            (i as u128 * (count - 1) as u128 / (kept - 1) as u128) as usize
        }
    })
}
