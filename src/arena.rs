use std::{
  alloc::{self, Layout},
  ptr::NonNull,
};

use libc::{c_void, intptr_t, sbrk};
use thiserror::Error;

use crate::align::ALIGNMENT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ArenaError {
  #[error("arena exhausted: cannot extend the break by {requested} bytes")]
  Exhausted { requested: usize },
  #[error("increment of {requested} bytes does not fit the break primitive")]
  TooLarge { requested: usize },
  #[error("growing by {requested} bytes would take the heap past {limit} bytes")]
  HeapLimit { requested: usize, limit: usize },
  #[error("the break moved outside of the allocator, heap is no longer contiguous")]
  Discontiguous,
  #[error("could not obtain a backing region of {capacity} bytes")]
  Backing { capacity: usize },
}

/// Source of raw, contiguous address space.
///
/// The break only ever moves up. `extend(0)` reports the current break.
pub trait Arena {
  /// Moves the break up by `increment` bytes and returns the previous break.
  fn extend(
    &mut self,
    increment: usize,
  ) -> Result<NonNull<u8>, ArenaError>;
}

/// The process data segment, grown with `sbrk(2)`.
///
/// Only one of these should be in use per process, and nothing else may move
/// the break while it is.
#[derive(Debug, Default)]
pub struct SbrkArena;

impl SbrkArena {
  pub const fn new() -> Self {
    Self
  }
}

impl Arena for SbrkArena {
  fn extend(
    &mut self,
    increment: usize,
  ) -> Result<NonNull<u8>, ArenaError> {
    let delta = intptr_t::try_from(increment).map_err(|_| ArenaError::TooLarge {
      requested: increment,
    })?;

    let address = unsafe { sbrk(delta) };

    if address == usize::MAX as *mut c_void {
      return Err(ArenaError::Exhausted { requested: increment });
    }

    NonNull::new(address.cast()).ok_or(ArenaError::Exhausted { requested: increment })
  }
}

/// A fixed-capacity region with a simulated break.
///
/// The region is `ALIGNMENT`-aligned and released when the arena is dropped,
/// so every block carved from it dies with it.
#[derive(Debug)]
pub struct FixedArena {
  base: NonNull<u8>,
  capacity: usize,
  brk: usize,
}

unsafe impl Send for FixedArena {}

impl FixedArena {
  pub fn with_capacity(capacity: usize) -> Result<Self, ArenaError> {
    let layout = Self::layout(capacity)?;

    let base = unsafe { alloc::alloc_zeroed(layout) };
    let base = NonNull::new(base).ok_or(ArenaError::Backing { capacity })?;

    Ok(Self {
      base,
      capacity,
      brk: 0,
    })
  }

  fn layout(capacity: usize) -> Result<Layout, ArenaError> {
    Layout::from_size_align(capacity.max(ALIGNMENT), ALIGNMENT)
      .map_err(|_| ArenaError::Backing { capacity })
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Bytes below the break.
  pub fn used(&self) -> usize {
    self.brk
  }

  pub fn remaining(&self) -> usize {
    self.capacity - self.brk
  }

  pub fn base(&self) -> NonNull<u8> {
    self.base
  }
}

impl Arena for FixedArena {
  fn extend(
    &mut self,
    increment: usize,
  ) -> Result<NonNull<u8>, ArenaError> {
    if increment > self.remaining() {
      return Err(ArenaError::Exhausted { requested: increment });
    }

    let previous = unsafe { self.base.add(self.brk) };
    self.brk += increment;

    Ok(previous)
  }
}

impl Drop for FixedArena {
  fn drop(&mut self) {
    if let Ok(layout) = Self::layout(self.capacity) {
      unsafe { alloc::dealloc(self.base.as_ptr(), layout) };
    }
  }
}
