//! Fixed arena of reusable video buffers.
//!
//! Buffers are addressed by generation-checked [`FrameHandle`]s. A
//! [`FrameLease`] is the only way to hold a buffer; it goes back to the pool
//! exactly once, when the lease is dropped or explicitly released, on every
//! exit path. A handle that outlives its lease can no longer reach the data.
//! Buffer memory is only allocated the first time a slot is handed out.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameHandle {
    index: u32,
    generation: u32,
}

impl FrameHandle {
    pub fn index(&self) -> u32 {
        self.index
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("Frame pool exhausted: all {0} buffers are in use")]
    Exhausted(usize),
    #[error("Frame {0:?} was already released")]
    Released(FrameHandle),
    #[error("Frame {0:?} does not belong to this pool")]
    Unknown(FrameHandle),
    #[error("Payload of {len} bytes does not fit in a {capacity} bytes buffer")]
    TooLarge { len: usize, capacity: usize },
}

#[derive(Debug)]
struct Slot {
    data: Vec<u8>,
    generation: u32,
    in_use: bool,
}

#[derive(Debug)]
struct PoolInner {
    slots: Mutex<Vec<Slot>>,
    frame_size: usize,
}

impl PoolInner {
    fn with_slot<R>(
        &self,
        handle: FrameHandle,
        f: impl FnOnce(&mut Slot) -> R,
    ) -> Result<R, PoolError> {
        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(handle.index as usize)
            .ok_or(PoolError::Unknown(handle))?;

        if !slot.in_use || slot.generation != handle.generation {
            return Err(PoolError::Released(handle));
        }

        Ok(f(slot))
    }

    fn release(&self, handle: FrameHandle) -> Result<(), PoolError> {
        self.with_slot(handle, |slot| {
            slot.in_use = false;
            slot.generation = slot.generation.wrapping_add(1);
        })
    }
}

#[derive(Debug, Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

impl FramePool {
    pub fn new(capacity: usize, frame_size: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                data: Vec::new(),
                generation: 0,
                in_use: false,
            })
            .collect();

        Self {
            inner: Arc::new(PoolInner {
                slots: Mutex::new(slots),
                frame_size,
            }),
        }
    }

    pub fn frame_size(&self) -> usize {
        self.inner.frame_size
    }

    pub fn capacity(&self) -> usize {
        self.inner.slots.lock().len()
    }

    pub fn in_use(&self) -> usize {
        self.inner.slots.lock().iter().filter(|slot| slot.in_use).count()
    }

    /// Takes a free buffer out of the pool.
    pub fn acquire(&self) -> Result<FrameLease, PoolError> {
        let mut slots = self.inner.slots.lock();
        let capacity = slots.len();

        let (index, slot) = slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| !slot.in_use)
            .ok_or(PoolError::Exhausted(capacity))?;

        slot.in_use = true;
        if slot.data.len() != self.inner.frame_size {
            slot.data.resize(self.inner.frame_size, 0);
        }

        Ok(FrameLease {
            pool: self.inner.clone(),
            handle: FrameHandle {
                index: index as u32,
                generation: slot.generation,
            },
            len: 0,
            released: false,
        })
    }

    /// Runs `f` on the bytes behind `handle`, failing if the frame has been
    /// released since the handle was taken.
    pub fn read<R>(&self, handle: FrameHandle, f: impl FnOnce(&[u8]) -> R) -> Result<R, PoolError> {
        self.inner.with_slot(handle, |slot| f(&slot.data))
    }

    pub(crate) fn release(&self, handle: FrameHandle) -> Result<(), PoolError> {
        self.inner.release(handle)
    }
}

/// Exclusive ownership of one pooled buffer.
#[derive(Debug)]
pub struct FrameLease {
    pool: Arc<PoolInner>,
    handle: FrameHandle,
    len: usize,
    released: bool,
}

impl FrameLease {
    pub fn handle(&self) -> FrameHandle {
        self.handle
    }

    /// Number of payload bytes written into the buffer.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fills the first `len` bytes of the buffer through `f`.
    pub fn write<R>(&mut self, len: usize, f: impl FnOnce(&mut [u8]) -> R) -> Result<R, PoolError> {
        let capacity = self.pool.frame_size;
        if len > capacity {
            return Err(PoolError::TooLarge { len, capacity });
        }

        let result = self.pool.with_slot(self.handle, |slot| f(&mut slot.data[..len]))?;
        self.len = len;
        Ok(result)
    }

    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R, PoolError> {
        let len = self.len;
        self.pool.with_slot(self.handle, |slot| f(&slot.data[..len]))
    }

    /// Returns the buffer to the pool now instead of at the end of scope.
    pub fn release(mut self) -> Result<(), PoolError> {
        self.released = true;
        self.pool.release(self.handle)
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Err(error) = self.pool.release(self.handle) {
            error!("Failed returning frame to its pool: {error}");
        }
    }
}
