//! Allocation tracking for every buffer the engine allocates.

use std::{
    fmt::{self, Debug},
    mem,
    ops::{Deref, DerefMut},
};

use bytemuck::Zeroable;
use derive_more::{Display, Error};
use log::{debug, error};
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
pub enum MemoryError {
    #[display("attempted to free untracked memory at address {addr:#x}")]
    InvalidFree { addr: usize },
    #[display("could not reset memory tracking, {occupied} blocks still in use")]
    BlocksInUse { occupied: usize },
}

/// Snapshot of the tracker's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryReport {
    /// Highest number of bytes live at the same time.
    pub peak_allocated: usize,
    pub total_allocated: usize,
    pub total_freed: usize,
    /// Number of blocks allocated since the last reset.
    pub num_blocks: usize,
    /// Number of blocks currently live.
    pub occupied_blocks: usize,
}

impl MemoryReport {
    /// Bytes currently live.
    pub fn in_use(&self) -> usize {
        self.total_allocated - self.total_freed
    }
}

impl fmt::Display for MemoryReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Peak allocated memory: {} bytes", self.peak_allocated)?;
        writeln!(f, "Total allocated memory: {} bytes", self.total_allocated)?;
        writeln!(f, "Total freed memory: {} bytes", self.total_freed)?;
        writeln!(f, "Peak blocks used: {}", self.num_blocks)?;
        write!(f, "Total blocks still being used: {}", self.occupied_blocks)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MemoryBlock {
    addr: usize,
    size: usize,
}

#[derive(Debug, Default)]
struct Registry {
    blocks: Vec<MemoryBlock>,
    counters: MemoryReport,
}

/// Registry of live allocations plus usage counters.
///
/// One tracker is meant to live for the whole process and be handed by reference to every
/// allocation site. Independent trackers do not share any state.
///
/// Every buffer the engine allocates goes through the tracker, including the lists holding
/// per-layer buffers. Not tracked: model parameters, which are owned by
/// [`Model`](crate::Model), and the vector rayon collects the per-chunk gradients into in
/// [`Gym::train_batch_parallel`](crate::Gym::train_batch_parallel).
#[derive(Debug, Default)]
pub struct MemoryTracker {
    registry: Mutex<Registry>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a block of `size` bytes at `addr`.
    pub fn record_alloc(&self, addr: usize, size: usize) {
        let mut registry = self.registry.lock();
        registry.blocks.push(MemoryBlock { addr, size });
        let counters = &mut registry.counters;
        counters.num_blocks += 1;
        counters.occupied_blocks += 1;
        counters.total_allocated += size;
        counters.peak_allocated = counters.peak_allocated.max(counters.in_use());
    }

    /// Forgets the block at `addr`, returning its size.
    ///
    /// Unknown addresses are reported and leave the counters untouched.
    pub fn record_free(&self, addr: usize) -> Result<usize, MemoryError> {
        let mut registry = self.registry.lock();
        // Most frees release the most recent allocations, so search from the back.
        let Some(position) = registry.blocks.iter().rposition(|block| block.addr == addr) else {
            error!(addr = addr; "attempted to free untracked memory");
            return Err(MemoryError::InvalidFree { addr });
        };
        let block = registry.blocks.swap_remove(position);
        let counters = &mut registry.counters;
        counters.total_freed += block.size;
        counters.occupied_blocks -= 1;
        Ok(block.size)
    }

    /// Allocates `len` zeroed elements.
    pub fn alloc_zeroed<T: Zeroable>(&self, len: usize) -> TrackedBuf<'_, T> {
        self.adopt(bytemuck::zeroed_slice_box(len))
    }

    /// Allocates a copy of `src`.
    pub fn alloc_copy<T: Copy>(&self, src: &[T]) -> TrackedBuf<'_, T> {
        self.adopt(Box::from(src))
    }

    /// Starts tracking an already allocated buffer. It is reported as freed once dropped.
    pub fn adopt<T>(&self, data: Box<[T]>) -> TrackedBuf<'_, T> {
        self.record_alloc(data.as_ptr() as usize, mem::size_of_val(&*data));
        TrackedBuf {
            data,
            tracker: self,
        }
    }

    pub fn report(&self) -> MemoryReport {
        self.registry.lock().counters
    }

    /// Zeroes every counter, as long as no block is still live.
    pub fn reset(&self) -> Result<(), MemoryError> {
        let mut registry = self.registry.lock();
        let occupied = registry.counters.occupied_blocks;
        if occupied != 0 {
            error!(occupied = occupied; "could not reset memory tracking, blocks still in use");
            return Err(MemoryError::BlocksInUse { occupied });
        }
        debug!("memory tracking reset");
        registry.blocks.clear();
        registry.counters = MemoryReport::default();
        Ok(())
    }
}

/// A heap buffer whose lifetime is recorded by a [`MemoryTracker`].
///
/// Dropping the buffer frees it.
pub struct TrackedBuf<'t, T> {
    data: Box<[T]>,
    tracker: &'t MemoryTracker,
}

impl<'t, T> TrackedBuf<'t, T> {
    pub fn tracker(&self) -> &'t MemoryTracker {
        self.tracker
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }
}

impl<T> Deref for TrackedBuf<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.data
    }
}

impl<T> DerefMut for TrackedBuf<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.data
    }
}

impl<T: Debug> Debug for TrackedBuf<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(&self.data, f)
    }
}

impl<T> Drop for TrackedBuf<'_, T> {
    fn drop(&mut self) {
        // An invalid free is already reported by the tracker.
        let _ = self.tracker.record_free(self.data.as_ptr() as usize);
    }
}
