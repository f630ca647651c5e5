use std::{
  alloc::{GlobalAlloc, Layout},
  mem, ptr,
};

use log::warn;
use spin::{Mutex, MutexGuard};
use static_assertions::const_assert;

use crate::{
  align::ALIGNMENT,
  align_to,
  arena::{Arena, SbrkArena},
  heap::Heap,
};

/// A [`Heap`] behind a single spin lock, usable as `#[global_allocator]`.
///
/// ```rust,ignore
/// use tagalloc::LockedHeap;
///
/// #[global_allocator]
/// static HEAP: LockedHeap = LockedHeap::sbrk();
/// ```
///
/// The inner heap is quiet: nothing is logged while the lock is held, so a
/// logger that allocates cannot re-enter the lock. Failures are reported after
/// it is released.
///
/// Layouts aligned beyond [`ALIGNMENT`] are served by over-allocating and
/// storing the address of the underlying block right below the aligned pointer:
///
/// ```text
///   ┌──────┬──────────────┬──────┬───────────────────────┐
///   │ hdr  │     gap      │ raw  │ payload (align-ed)    │
///   └──────┴──────────────┴──────┴───────────────────────┘
///          ▲                     ▲
///         raw                 returned
/// ```
pub struct LockedHeap<A: Arena = SbrkArena> {
  heap: Mutex<Heap<A>>,
}

impl LockedHeap<SbrkArena> {
  pub const fn sbrk() -> Self {
    Self::new(SbrkArena::new())
  }
}

impl<A: Arena> LockedHeap<A> {
  pub const fn new(arena: A) -> Self {
    Self {
      heap: Mutex::new(Heap::new_quiet(arena)),
    }
  }

  /// When this is the global allocator, nothing that allocates may run while
  /// the guard is alive. That includes logging, so `check(true)` through the
  /// guard needs a logger that does not allocate.
  pub fn lock(&self) -> MutexGuard<'_, Heap<A>> {
    self.heap.lock()
  }

  /// The heap, unless someone else holds the lock right now.
  pub fn try_lock(&self) -> Option<MutexGuard<'_, Heap<A>>> {
    self.heap.try_lock()
  }

  unsafe fn alloc_over_aligned(
    &self,
    layout: Layout,
  ) -> *mut u8 {
    let Some(padded) = layout.size().checked_add(layout.align()) else {
      return ptr::null_mut();
    };

    let raw = unsafe { self.lock().allocate(padded) };
    if raw.is_null() {
      return raw;
    }

    // Both ends are multiples of ALIGNMENT, so the gap holds at least one
    // pointer and the payload still ends inside the block.
    let offset = align_to!(raw as usize + 1, layout.align()) - raw as usize;

    unsafe {
      let aligned = raw.add(offset);
      aligned.cast::<*mut u8>().sub(1).write(raw);
      aligned
    }
  }

  unsafe fn underlying(ptr: *mut u8) -> *mut u8 {
    unsafe { ptr.cast::<*mut u8>().sub(1).read() }
  }

  fn report(
    what: &str,
    layout: Layout,
  ) {
    warn!(
      "{} of {} bytes aligned to {} failed",
      what,
      layout.size(),
      layout.align()
    );
  }
}

unsafe impl<A: Arena + Send> GlobalAlloc for LockedHeap<A> {
  unsafe fn alloc(
    &self,
    layout: Layout,
  ) -> *mut u8 {
    let ptr = if layout.align() > ALIGNMENT {
      unsafe { self.alloc_over_aligned(layout) }
    } else {
      let mut heap = self.lock();
      unsafe { heap.allocate(layout.size()) }
    };

    if ptr.is_null() {
      Self::report("allocation", layout);
    }

    ptr
  }

  unsafe fn dealloc(
    &self,
    ptr: *mut u8,
    layout: Layout,
  ) {
    if ptr.is_null() {
      return;
    }

    unsafe {
      let raw = if layout.align() > ALIGNMENT {
        Self::underlying(ptr)
      } else {
        ptr
      };

      self.lock().free(raw);
    }
  }

  unsafe fn alloc_zeroed(
    &self,
    layout: Layout,
  ) -> *mut u8 {
    let ptr = if layout.align() > ALIGNMENT {
      unsafe {
        let ptr = self.alloc_over_aligned(layout);
        if !ptr.is_null() {
          ptr::write_bytes(ptr, 0, layout.size());
        }
        ptr
      }
    } else {
      let mut heap = self.lock();
      unsafe { heap.zero_allocate(1, layout.size()) }
    };

    if ptr.is_null() {
      Self::report("zeroed allocation", layout);
    }

    ptr
  }

  unsafe fn realloc(
    &self,
    ptr: *mut u8,
    layout: Layout,
    new_size: usize,
  ) -> *mut u8 {
    if layout.align() <= ALIGNMENT {
      let moved = {
        let mut heap = self.lock();
        unsafe { heap.resize(ptr, new_size) }
      };

      if moved.is_null() && new_size > 0 {
        Self::report("reallocation", layout);
      }

      return moved;
    }

    let Ok(new_layout) = Layout::from_size_align(new_size, layout.align()) else {
      return ptr::null_mut();
    };

    unsafe {
      let moved = self.alloc(new_layout);

      if !moved.is_null() {
        ptr::copy_nonoverlapping(ptr, moved, layout.size().min(new_size));
        self.dealloc(ptr, layout);
      }

      moved
    }
  }
}

const_assert!(mem::size_of::<*mut u8>() <= ALIGNMENT);
