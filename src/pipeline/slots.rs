//! Shared slot buffer between pipeline stages.
//!
//! Each chunk index owns two cells, `raw` and `encoded`. A cell has exactly
//! one writer and one reader per lifecycle: the fetch stage fills `raw`,
//! the encode stage drains it and fills `encoded`, the upload stage drains
//! `encoded`. Synchronization therefore reduces to "wait until written"
//! rather than mutual exclusion. Occupancy per cell family is bounded by a
//! semaphore, so peak resident payload is a function of pipeline lookahead
//! and never of chunk count.

use crate::error::PipelineError;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::{Notify, Semaphore};

/// Lifecycle of a single cell.
#[derive(Debug)]
enum Cell {
    Empty,
    Present(Bytes),
    /// Drained by the downstream stage; reads and writes are both bugs.
    Consumed,
    /// The run halted before this cell could be produced.
    Aborted,
}

#[derive(Debug)]
struct ChunkSlot {
    raw: Cell,
    encoded: Cell,
}

/// Which cell family an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Raw,
    Encoded,
}

impl Family {
    fn label(self) -> &'static str {
        match self {
            Family::Raw => "raw",
            Family::Encoded => "encoded",
        }
    }
}

/// Fixed-size per-chunk holding area shared by the three stage workers.
pub struct SlotBuffer {
    slots: Mutex<Vec<ChunkSlot>>,
    raw_ready: Notify,
    encoded_ready: Notify,
    raw_capacity: Semaphore,
    encoded_capacity: Semaphore,
    resident_cells: AtomicUsize,
    peak_cells: AtomicUsize,
    resident_bytes: AtomicU64,
    peak_bytes: AtomicU64,
}

impl SlotBuffer {
    /// Create a buffer for `num_chunks` chunks with the given per-family
    /// occupancy bounds.
    pub fn new(num_chunks: usize, raw_capacity: usize, encoded_capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(num_chunks);
        for _ in 0..num_chunks {
            slots.push(ChunkSlot {
                raw: Cell::Empty,
                encoded: Cell::Empty,
            });
        }
        Self {
            slots: Mutex::new(slots),
            raw_ready: Notify::new(),
            encoded_ready: Notify::new(),
            raw_capacity: Semaphore::new(raw_capacity),
            encoded_capacity: Semaphore::new(encoded_capacity),
            resident_cells: AtomicUsize::new(0),
            peak_cells: AtomicUsize::new(0),
            resident_bytes: AtomicU64::new(0),
            peak_bytes: AtomicU64::new(0),
        }
    }

    /// Wait until a raw cell may be filled. Must precede the fetch of the
    /// payload, so in-flight network reads count against the bound.
    pub async fn reserve_raw(&self) -> Result<(), PipelineError> {
        Self::reserve(&self.raw_capacity).await
    }

    /// Wait until an encoded cell may be filled.
    pub async fn reserve_encoded(&self) -> Result<(), PipelineError> {
        Self::reserve(&self.encoded_capacity).await
    }

    async fn reserve(capacity: &Semaphore) -> Result<(), PipelineError> {
        let permit = capacity
            .acquire()
            .await
            .map_err(|_| PipelineError::SlotProtocol("capacity semaphore closed".to_string()))?;
        // Returned by the matching take
        permit.forget();
        Ok(())
    }

    /// Fill the raw cell of `index`. Precondition: the cell is empty and a
    /// reservation is held.
    pub fn put_raw(&self, index: u64, payload: Bytes) -> Result<(), PipelineError> {
        self.put(index, payload, Family::Raw)
    }

    /// Fill the encoded cell of `index`.
    pub fn put_encoded(&self, index: u64, payload: Bytes) -> Result<(), PipelineError> {
        self.put(index, payload, Family::Encoded)
    }

    fn put(&self, index: u64, payload: Bytes, family: Family) -> Result<(), PipelineError> {
        let size = payload.len() as u64;
        {
            let mut slots = self.slots.lock().expect("slot lock poisoned");
            let cell = Self::cell(&mut slots, index, family)?;
            match cell {
                Cell::Empty => *cell = Cell::Present(payload),
                other => {
                    return Err(PipelineError::SlotProtocol(format!(
                        "write to non-empty {} cell {} (state {:?})",
                        family.label(),
                        index,
                        other
                    )))
                }
            }
        }
        self.track_put(size);
        match family {
            Family::Raw => self.raw_ready.notify_waiters(),
            Family::Encoded => self.encoded_ready.notify_waiters(),
        }
        Ok(())
    }

    /// Wait for the raw cell of `index` and drain it, releasing one unit
    /// of raw capacity. Returns `None` if the upstream stage halted before
    /// producing this chunk.
    pub async fn take_raw(&self, index: u64) -> Result<Option<Bytes>, PipelineError> {
        self.take(index, Family::Raw).await
    }

    /// Wait for the encoded cell of `index` and drain it.
    pub async fn take_encoded(&self, index: u64) -> Result<Option<Bytes>, PipelineError> {
        self.take(index, Family::Encoded).await
    }

    async fn take(&self, index: u64, family: Family) -> Result<Option<Bytes>, PipelineError> {
        let ready = match family {
            Family::Raw => &self.raw_ready,
            Family::Encoded => &self.encoded_ready,
        };
        loop {
            // Register interest before re-checking, so a put between the
            // check and the await cannot be missed.
            let notified = ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut slots = self.slots.lock().expect("slot lock poisoned");
                let cell = Self::cell(&mut slots, index, family)?;
                match cell {
                    Cell::Present(_) => {
                        let Cell::Present(payload) = std::mem::replace(cell, Cell::Consumed)
                        else {
                            unreachable!()
                        };
                        drop(slots);
                        self.track_take(payload.len() as u64);
                        match family {
                            Family::Raw => self.raw_capacity.add_permits(1),
                            Family::Encoded => self.encoded_capacity.add_permits(1),
                        }
                        return Ok(Some(payload));
                    }
                    Cell::Aborted => return Ok(None),
                    Cell::Consumed => {
                        return Err(PipelineError::SlotProtocol(format!(
                            "read of already-consumed {} cell {}",
                            family.label(),
                            index
                        )))
                    }
                    Cell::Empty => {}
                }
            }

            notified.as_mut().await;
        }
    }

    /// Mark all raw cells from `index` on as aborted. Called by the fetch
    /// stage when it fails, so the encode stage halts at the failure point
    /// instead of waiting forever.
    pub fn abort_raw_from(&self, index: u64) {
        self.abort_from(index, Family::Raw);
        self.raw_ready.notify_waiters();
    }

    /// Mark all encoded cells from `index` on as aborted.
    pub fn abort_encoded_from(&self, index: u64) {
        self.abort_from(index, Family::Encoded);
        self.encoded_ready.notify_waiters();
    }

    fn abort_from(&self, index: u64, family: Family) {
        let mut slots = self.slots.lock().expect("slot lock poisoned");
        for slot in slots.iter_mut().skip(index as usize) {
            let cell = match family {
                Family::Raw => &mut slot.raw,
                Family::Encoded => &mut slot.encoded,
            };
            if matches!(cell, Cell::Empty) {
                *cell = Cell::Aborted;
            }
        }
    }

    fn cell<'a>(
        slots: &'a mut [ChunkSlot],
        index: u64,
        family: Family,
    ) -> Result<&'a mut Cell, PipelineError> {
        let slot = slots.get_mut(index as usize).ok_or_else(|| {
            PipelineError::SlotProtocol(format!("chunk index {index} out of range"))
        })?;
        Ok(match family {
            Family::Raw => &mut slot.raw,
            Family::Encoded => &mut slot.encoded,
        })
    }

    fn track_put(&self, size: u64) {
        let cells = self.resident_cells.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_cells.fetch_max(cells, Ordering::Relaxed);
        let bytes = self.resident_bytes.fetch_add(size, Ordering::Relaxed) + size;
        self.peak_bytes.fetch_max(bytes, Ordering::Relaxed);
    }

    fn track_take(&self, size: u64) {
        self.resident_cells.fetch_sub(1, Ordering::Relaxed);
        self.resident_bytes.fetch_sub(size, Ordering::Relaxed);
    }

    /// Number of cells currently holding a payload.
    pub fn resident_cells(&self) -> usize {
        self.resident_cells.load(Ordering::Relaxed)
    }

    /// High-water mark of simultaneously resident cells.
    pub fn peak_cells(&self) -> usize {
        self.peak_cells.load(Ordering::Relaxed)
    }

    /// Payload bytes currently resident across both cell families.
    pub fn resident_bytes(&self) -> u64 {
        self.resident_bytes.load(Ordering::Relaxed)
    }

    /// High-water mark of resident payload bytes.
    pub fn peak_bytes(&self) -> u64 {
        self.peak_bytes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_put_then_take() {
        let slots = SlotBuffer::new(4, 2, 2);
        slots.reserve_raw().await.unwrap();
        slots.put_raw(0, Bytes::from_static(b"abc")).unwrap();
        let taken = slots.take_raw(0).await.unwrap();
        assert_eq!(taken, Some(Bytes::from_static(b"abc")));
    }

    #[tokio::test]
    async fn test_double_put_is_protocol_error() {
        let slots = SlotBuffer::new(2, 4, 4);
        slots.put_raw(0, Bytes::from_static(b"a")).unwrap();
        let err = slots.put_raw(0, Bytes::from_static(b"b")).unwrap_err();
        assert!(matches!(err, PipelineError::SlotProtocol(_)));
    }

    #[tokio::test]
    async fn test_take_after_consume_is_protocol_error() {
        let slots = SlotBuffer::new(2, 4, 4);
        slots.put_encoded(1, Bytes::from_static(b"x")).unwrap();
        slots.take_encoded(1).await.unwrap();
        let err = slots.take_encoded(1).await.unwrap_err();
        assert!(matches!(err, PipelineError::SlotProtocol(_)));
    }

    #[tokio::test]
    async fn test_put_after_consume_is_protocol_error() {
        let slots = SlotBuffer::new(2, 4, 4);
        slots.put_raw(0, Bytes::from_static(b"x")).unwrap();
        slots.take_raw(0).await.unwrap();
        let err = slots.put_raw(0, Bytes::from_static(b"y")).unwrap_err();
        assert!(matches!(err, PipelineError::SlotProtocol(_)));
    }

    #[tokio::test]
    async fn test_take_waits_for_put() {
        let slots = Arc::new(SlotBuffer::new(2, 2, 2));
        let writer = slots.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.put_raw(0, Bytes::from_static(b"late")).unwrap();
        });
        let taken = slots.take_raw(0).await.unwrap();
        assert_eq!(taken, Some(Bytes::from_static(b"late")));
    }

    #[tokio::test]
    async fn test_capacity_blocks_until_taken() {
        let slots = Arc::new(SlotBuffer::new(8, 1, 1));
        slots.reserve_raw().await.unwrap();
        slots.put_raw(0, Bytes::from_static(b"a")).unwrap();

        // Second reservation must not resolve while chunk 0 is resident
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), slots.reserve_raw()).await;
        assert!(blocked.is_err());

        slots.take_raw(0).await.unwrap();
        tokio::time::timeout(Duration::from_millis(50), slots.reserve_raw())
            .await
            .expect("reservation should resolve after take")
            .unwrap();
    }

    #[tokio::test]
    async fn test_abort_unblocks_taker() {
        let slots = Arc::new(SlotBuffer::new(4, 2, 2));
        let taker = slots.clone();
        let handle = tokio::spawn(async move { taker.take_raw(2).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        slots.abort_raw_from(2);
        let taken = handle.await.unwrap().unwrap();
        assert_eq!(taken, None);
    }

    #[tokio::test]
    async fn test_abort_preserves_present_cells() {
        let slots = SlotBuffer::new(4, 4, 4);
        slots.put_raw(1, Bytes::from_static(b"kept")).unwrap();
        slots.abort_raw_from(0);
        // Present cell survives the abort sweep, empty ones do not
        assert_eq!(
            slots.take_raw(1).await.unwrap(),
            Some(Bytes::from_static(b"kept"))
        );
        assert_eq!(slots.take_raw(0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_occupancy_gauges() {
        let slots = SlotBuffer::new(4, 4, 4);
        slots.put_raw(0, Bytes::from(vec![0u8; 100])).unwrap();
        slots.put_encoded(0, Bytes::from(vec![0u8; 50])).unwrap();
        assert_eq!(slots.resident_cells(), 2);
        assert_eq!(slots.resident_bytes(), 150);

        slots.take_raw(0).await.unwrap();
        assert_eq!(slots.resident_cells(), 1);
        assert_eq!(slots.resident_bytes(), 50);

        // Peaks are sticky
        assert_eq!(slots.peak_cells(), 2);
        assert_eq!(slots.peak_bytes(), 150);
    }
}
