//! Fixed-size frame slot ring for camera acquisition.
//!
//! A [`FrameRing`] is the buffer pool behind one capture session: an ordered
//! set of N equally sized slots that the acquisition engine writes into in
//! round-robin order while the application reads them.
//!
//! # Allocation
//!
//! Rings are built in one of two ways:
//! - [`FrameRing::allocate`] creates every slot itself, charging the bytes
//!   against a shared [`MemoryBudget`]. Allocation is all-or-nothing: if any
//!   slot fails, the slots created so far are dropped and their budget is
//!   returned before the error is reported.
//! - [`FrameRing::attach`] wraps caller-owned buffers. They are handed back
//!   unchanged by [`FrameRing::into_buffers`].
//!
//! # Locking Model
//!
//! Each slot sits behind its own `RwLock`:
//! - Readers take a [`SlotGuard`] (an owned read lock). While any guard is
//!   alive the slot cannot be written.
//! - The single writer polls [`FrameRing::try_write`] with a short timeout,
//!   so a locked slot stalls the writer instead of being overwritten.
//! - An outstanding-guard counter lets the owner refuse to tear the ring down
//!   while frames are still locked.
//!
//! # Example
//!
//! ```
//! use dcam_pool::{FrameRing, MemoryBudget, SlotLayout};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let budget = Arc::new(MemoryBudget::new(1024 * 1024));
//! let ring = FrameRing::allocate(4, SlotLayout::new(64, 16), &budget).unwrap();
//! assert_eq!(budget.in_use(), 4 * 64 * 16);
//!
//! if let Some(mut slot) = ring.try_write(0, Duration::from_millis(10)) {
//!     slot.sequence = Some(0);
//! }
//! let guard = ring.lock(0).unwrap();
//! assert_eq!(guard.sequence(), 0);
//! drop(guard);
//!
//! drop(ring);
//! assert_eq!(budget.in_use(), 0);
//! ```

pub mod frame_data;

pub use frame_data::{FrameData, SlotLayout};

use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::{RawRwLock, RwLock, RwLockWriteGuard};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors reported by ring construction and slot access.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RingError {
    /// Requested ring has zero slots.
    #[error("a frame ring needs at least one slot")]
    NoSlots,

    /// Slot index past the end of the ring.
    #[error("slot {index} out of range (ring holds {len} slots)")]
    SlotOutOfRange {
        /// Requested slot.
        index: usize,
        /// Slots in the ring.
        len: usize,
    },

    /// Slot has not been written since the ring was armed.
    #[error("slot {0} holds no captured frame")]
    SlotEmpty(usize),

    /// Slot allocation failed or exceeded the memory budget.
    #[error("allocation of slot {slot} ({bytes} bytes) failed: {reason}")]
    OutOfMemory {
        /// Slot being allocated.
        slot: usize,
        /// Bytes requested for the slot.
        bytes: usize,
        /// Why the allocation was refused.
        reason: String,
    },

    /// Declared buffer size cannot hold one frame.
    #[error("buffer size {size_per_buffer} is smaller than one frame ({frame_bytes} bytes)")]
    SlotTooSmall {
        /// Declared size of each buffer.
        size_per_buffer: usize,
        /// Bytes one frame needs.
        frame_bytes: usize,
    },

    /// An attached buffer is shorter than its declared size.
    #[error("attached buffer {index} holds {len} bytes, {required} required")]
    BufferTooSmall {
        /// Position of the buffer in the attached list.
        index: usize,
        /// Actual length of the buffer.
        len: usize,
        /// Declared size the buffer must hold.
        required: usize,
    },
}

/// Byte budget shared by every ring allocated from it.
///
/// Attached (caller-owned) buffers are never charged.
#[derive(Debug)]
pub struct MemoryBudget {
    limit: usize,
    in_use: AtomicUsize,
}

impl MemoryBudget {
    /// Create a budget allowing at most `limit` bytes of allocated slots.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            in_use: AtomicUsize::new(0),
        }
    }

    /// Maximum number of bytes rings may hold at once.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes currently held by allocated rings.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    fn try_reserve(&self, bytes: usize) -> bool {
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(bytes).filter(|next| *next <= self.limit)
            })
            .is_ok()
    }

    fn release(&self, bytes: usize) {
        self.in_use.fetch_sub(bytes, Ordering::AcqRel);
    }
}

/// Ordered, fixed-size ring of frame slots.
pub struct FrameRing {
    slots: Vec<Arc<RwLock<FrameData>>>,
    layout: SlotLayout,
    /// Budget the slots were charged against; `None` for attached buffers.
    budget: Option<Arc<MemoryBudget>>,
    reserved_bytes: usize,
    /// Number of live `SlotGuard`s.
    locked: Arc<AtomicUsize>,
}

impl FrameRing {
    /// Allocate `count` slots of `layout.frame_bytes` each.
    ///
    /// On failure nothing stays allocated and nothing stays charged to
    /// `budget`.
    pub fn allocate(
        count: usize,
        layout: SlotLayout,
        budget: &Arc<MemoryBudget>,
    ) -> Result<Self, RingError> {
        if count == 0 {
            return Err(RingError::NoSlots);
        }

        let bytes = layout.frame_bytes;
        let mut ring = Self {
            slots: Vec::new(),
            layout,
            budget: Some(Arc::clone(budget)),
            reserved_bytes: 0,
            locked: Arc::new(AtomicUsize::new(0)),
        };

        for slot in 0..count {
            if !budget.try_reserve(bytes) {
                warn!(
                    slot,
                    bytes,
                    in_use = budget.in_use(),
                    limit = budget.limit(),
                    "Frame ring allocation exceeds memory budget, rolling back"
                );
                // `ring` drops here and returns what it reserved so far.
                return Err(RingError::OutOfMemory {
                    slot,
                    bytes,
                    reason: format!("memory budget of {} bytes exhausted", budget.limit()),
                });
            }

            let mut pixels = Vec::new();
            if let Err(err) = pixels.try_reserve_exact(bytes) {
                budget.release(bytes);
                return Err(RingError::OutOfMemory {
                    slot,
                    bytes,
                    reason: err.to_string(),
                });
            }
            pixels.resize(bytes, 0);

            ring.reserved_bytes += bytes;
            ring.slots
                .push(Arc::new(RwLock::new(FrameData::from_buffer(pixels))));
        }

        debug!(
            slots = count,
            frame_bytes = bytes,
            total_mb = (count * bytes) as f64 / (1024.0 * 1024.0),
            "Allocated frame ring"
        );
        Ok(ring)
    }

    /// Build a ring over caller-owned buffers.
    ///
    /// Every buffer must hold at least `size_per_buffer` bytes, and
    /// `size_per_buffer` must cover one frame of `layout`.
    pub fn attach(
        buffers: Vec<Vec<u8>>,
        size_per_buffer: usize,
        layout: SlotLayout,
    ) -> Result<Self, RingError> {
        if buffers.is_empty() {
            return Err(RingError::NoSlots);
        }
        if size_per_buffer < layout.frame_bytes {
            return Err(RingError::SlotTooSmall {
                size_per_buffer,
                frame_bytes: layout.frame_bytes,
            });
        }
        if let Some((index, buffer)) = buffers
            .iter()
            .enumerate()
            .find(|(_, b)| b.len() < size_per_buffer)
        {
            return Err(RingError::BufferTooSmall {
                index,
                len: buffer.len(),
                required: size_per_buffer,
            });
        }

        debug!(
            slots = buffers.len(),
            size_per_buffer, "Attached caller buffers as frame ring"
        );
        Ok(Self {
            slots: buffers
                .into_iter()
                .map(|b| Arc::new(RwLock::new(FrameData::from_buffer(b))))
                .collect(),
            layout,
            budget: None,
            reserved_bytes: 0,
            locked: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Always false; a ring holds at least one slot.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Byte layout of every slot.
    #[must_use]
    pub fn layout(&self) -> SlotLayout {
        self.layout
    }

    /// True when the slots are caller-owned buffers.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.budget.is_none()
    }

    /// Number of slot guards currently alive.
    #[must_use]
    pub fn locked_frames(&self) -> usize {
        self.locked.load(Ordering::Acquire)
    }

    /// Take a read lock on a filled slot.
    ///
    /// Blocks only while the writer is in the middle of filling that slot.
    pub fn lock(&self, index: usize) -> Result<SlotGuard, RingError> {
        let slot = self.slots.get(index).ok_or(RingError::SlotOutOfRange {
            index,
            len: self.slots.len(),
        })?;

        let data = slot.read_arc();
        if !data.is_filled() {
            return Err(RingError::SlotEmpty(index));
        }

        self.locked.fetch_add(1, Ordering::AcqRel);
        Ok(SlotGuard {
            data,
            index,
            layout: self.layout,
            locked: Arc::clone(&self.locked),
        })
    }

    /// Try to take the write lock on a slot, giving up after `timeout`.
    ///
    /// Returns `None` if the slot is still locked by a reader when the
    /// timeout expires, or if `index` is out of range.
    pub fn try_write(
        &self,
        index: usize,
        timeout: Duration,
    ) -> Option<RwLockWriteGuard<'_, FrameData>> {
        self.slots.get(index)?.try_write_for(timeout)
    }

    /// Mark every unlocked slot empty before a new capture run.
    pub fn clear(&self) {
        for slot in &self.slots {
            if let Some(mut data) = slot.try_write() {
                data.reset();
            }
        }
    }

    /// Dissolve the ring and return the slot buffers in order.
    ///
    /// Slots still shared with a live guard are copied out.
    #[must_use]
    pub fn into_buffers(mut self: Arc<Self>) -> Vec<Vec<u8>> {
        let slots = match Arc::get_mut(&mut self) {
            Some(ring) => std::mem::take(&mut ring.slots),
            None => self.slots.clone(),
        };

        slots
            .into_iter()
            .map(|slot| match Arc::try_unwrap(slot) {
                Ok(lock) => lock.into_inner().pixels,
                Err(shared) => shared.read().pixels.clone(),
            })
            .collect()
    }
}

impl Drop for FrameRing {
    fn drop(&mut self) {
        if let Some(budget) = &self.budget {
            budget.release(self.reserved_bytes);
            debug!(bytes = self.reserved_bytes, "Released frame ring");
        }
    }
}

impl std::fmt::Debug for FrameRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRing")
            .field("slots", &self.slots.len())
            .field("layout", &self.layout)
            .field("attached", &self.is_attached())
            .field("locked", &self.locked_frames())
            .finish()
    }
}

/// Owned read lock on one slot.
///
/// The slot cannot be overwritten until the guard is dropped.
pub struct SlotGuard {
    data: ArcRwLockReadGuard<RawRwLock, FrameData>,
    index: usize,
    layout: SlotLayout,
    locked: Arc<AtomicUsize>,
}

impl SlotGuard {
    /// Slot index inside the ring.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Slot byte layout.
    #[must_use]
    pub fn layout(&self) -> SlotLayout {
        self.layout
    }

    /// Frame pixels, exactly `layout().frame_bytes` long.
    #[must_use]
    pub fn pixels(&self) -> &[u8] {
        self.data.frame(self.layout)
    }

    /// Capture sequence number of the locked frame.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.data.sequence.unwrap_or_default()
    }

    /// Capture timestamp, nanoseconds since the Unix epoch.
    #[must_use]
    pub fn timestamp_ns(&self) -> i64 {
        self.data.timestamp_ns
    }

    /// Exposure the frame was taken with, in seconds.
    #[must_use]
    pub fn exposure_s(&self) -> f64 {
        self.data.exposure_s
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.locked.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard")
            .field("index", &self.index)
            .field("sequence", &self.sequence())
            .finish()
    }
}
