//! Sample buffers handed to the driver for the duration of a capture.
//!
//! A [`CaptureBuffer`] is counted in its [`BufferLedger`] from allocation until it is
//! released, either explicitly or on drop. Release happens at most once, so the ledger
//! count is the number of buffers still held by a capture or a result.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Sample storage shared between the owning buffer and the driver registration.
pub type SharedSamples = Arc<Mutex<Vec<i16>>>;

/// Lock shared samples, recovering the data if a writer panicked mid-copy.
pub fn lock_samples(samples: &SharedSamples) -> MutexGuard<'_, Vec<i16>> {
    samples.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Default)]
pub struct BufferLedger {
    outstanding: Arc<AtomicUsize>,
}

impl BufferLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers allocated and not yet released.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn allocate(&self, length: usize) -> CaptureBuffer {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        log::trace!("allocated capture buffer of {length} samples");
        CaptureBuffer {
            samples: Arc::new(Mutex::new(vec![0; length])),
            length,
            ledger: Some(self.clone()),
        }
    }
}

#[derive(Debug)]
pub struct CaptureBuffer {
    samples: SharedSamples,
    length: usize,
    ledger: Option<BufferLedger>,
}

impl CaptureBuffer {
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn is_released(&self) -> bool {
        self.ledger.is_none()
    }

    /// The handle registered with the driver.
    pub fn driver_view(&self) -> SharedSamples {
        Arc::clone(&self.samples)
    }

    /// Copy of the first `count` samples, or `None` once released.
    pub fn snapshot(&self, count: usize) -> Option<Vec<i16>> {
        if self.is_released() {
            return None;
        }
        let samples = lock_samples(&self.samples);
        Some(samples[..count.min(samples.len())].to_vec())
    }

    /// Write `data` at `offset`, truncating at the buffer end. Returns samples written.
    pub fn write_at(&self, offset: usize, data: &[i16]) -> usize {
        if self.is_released() {
            return 0;
        }
        let mut samples = lock_samples(&self.samples);
        let end = offset.saturating_add(data.len()).min(samples.len());
        if offset >= end {
            return 0;
        }
        let written = end - offset;
        samples[offset..end].copy_from_slice(&data[..written]);
        written
    }

    /// Give the buffer back. Releasing twice is a no-op.
    pub fn release(&mut self) {
        if let Some(ledger) = self.ledger.take() {
            ledger.outstanding.fetch_sub(1, Ordering::AcqRel);
            log::trace!("released capture buffer of {} samples", self.length);
        }
    }
}

impl Drop for CaptureBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_counts_allocation_and_release() {
        let ledger = BufferLedger::new();
        let mut a = ledger.allocate(8);
        let b = ledger.allocate(4);
        assert_eq!(ledger.outstanding(), 2);

        a.release();
        a.release();
        assert_eq!(ledger.outstanding(), 1);
        assert!(a.is_released());

        drop(b);
        drop(a);
        assert_eq!(ledger.outstanding(), 0);
    }

    #[test]
    fn test_driver_writes_are_visible() {
        let ledger = BufferLedger::new();
        let buffer = ledger.allocate(4);
        lock_samples(&buffer.driver_view()).copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(buffer.snapshot(3), Some(vec![1, 2, 3]));
        assert_eq!(buffer.snapshot(10), Some(vec![1, 2, 3, 4]));
    }

    #[test]
    fn test_write_at_truncates() {
        let ledger = BufferLedger::new();
        let buffer = ledger.allocate(4);
        assert_eq!(buffer.write_at(2, &[7, 8, 9]), 2);
        assert_eq!(buffer.write_at(4, &[1]), 0);
        assert_eq!(buffer.snapshot(4), Some(vec![0, 0, 7, 8]));
    }

    #[test]
    fn test_released_buffer_refuses_access() {
        let ledger = BufferLedger::new();
        let mut buffer = ledger.allocate(2);
        buffer.release();
        assert_eq!(buffer.snapshot(2), None);
        assert_eq!(buffer.write_at(0, &[1]), 0);
    }
}
