use std::ptr;

use crate::{
  align,
  align::{ALIGNMENT, WORD_SIZE, Word},
  arena::{Arena, ArenaError},
  block::{self, MAX_BLOCK_SIZE, State},
  free_list::FreeList,
};

/// Forwards to the `log` macro of the given level unless the heap is quiet.
macro_rules! heap_log {
  ($heap:expr, $level:ident, $($arg:tt)+) => {
    if !$heap.quiet {
      log::$level!($($arg)+);
    }
  };
}

/// A leftover is only split off when it is larger than this many bytes.
pub const SPLIT_THRESHOLD: usize = 6 * WORD_SIZE;

/// The heap never grows past this many bytes, so that any block, however many
/// neighbours it absorbs, still fits a tag and every link offset fits a word.
pub const MAX_HEAP_SIZE: usize = MAX_BLOCK_SIZE;

/// Block size for a request of `bytes`: header and footer added, rounded up to
/// the alignment. `None` when it cannot be encoded in a tag.
pub fn normalize(bytes: usize) -> Option<usize> {
  let padded = bytes.checked_add(2 * WORD_SIZE)?;

  if padded > MAX_BLOCK_SIZE {
    return None;
  }

  Some(align!(padded))
}

/// Bytes to skip at `brk` so that the first header lands one word before an
/// `ALIGNMENT` boundary.
fn padding(brk: usize) -> usize {
  (ALIGNMENT - (brk + WORD_SIZE) % ALIGNMENT) % ALIGNMENT
}

/// Boundary-tag heap over a single growable arena.
///
/// Blocks are laid out back to back between `start` and `end`; free blocks are
/// additionally threaded onto a size-ordered list. The heap is not thread safe,
/// see [`LockedHeap`](crate::LockedHeap) for a locked front end.
pub struct Heap<A: Arena> {
  arena: A,
  pub(crate) start: *mut Word,
  pub(crate) end: *mut Word,
  pub(crate) last: *mut Word,
  pub(crate) free: FreeList,
  ready: bool,
  quiet: bool,
}

unsafe impl<A: Arena + Send> Send for Heap<A> {}

impl<A: Arena> Heap<A> {
  pub const fn new(arena: A) -> Self {
    Self {
      arena,
      start: ptr::null_mut(),
      end: ptr::null_mut(),
      last: ptr::null_mut(),
      free: FreeList::new(),
      ready: false,
      quiet: false,
    }
  }

  /// A heap whose allocation paths never call into `log`.
  ///
  /// Needed whenever the logger itself may allocate from this heap, as is the
  /// case behind [`LockedHeap`](crate::LockedHeap).
  pub const fn new_quiet(arena: A) -> Self {
    let mut heap = Self::new(arena);
    heap.quiet = true;
    heap
  }

  pub fn arena(&self) -> &A {
    &self.arena
  }

  /// Forgets every block and pads the break so that payloads come out aligned.
  pub fn init(&mut self) -> Result<(), ArenaError> {
    self.start = ptr::null_mut();
    self.end = ptr::null_mut();
    self.last = ptr::null_mut();
    self.free.reset();
    self.ready = false;

    let brk = self.arena.extend(0)?.as_ptr() as usize;
    let padding = padding(brk);

    if padding > 0 {
      self.arena.extend(padding)?;
    }

    heap_log!(self, debug, "heap initialized at {:#x} with {} bytes of padding", brk, padding);
    self.ready = true;

    Ok(())
  }

  /// Bytes between the first block and the end of the heap.
  pub fn heap_size(&self) -> usize {
    self.end as usize - self.start as usize
  }

  pub fn is_empty(&self) -> bool {
    self.start == self.end
  }

  /// Grows the arena by `size` bytes, right at the current heap end.
  ///
  /// The break is inspected before it is moved: a heap whose end is no longer
  /// the break is left alone, and a misaligned break ahead of the first block is
  /// padded again.
  fn morecore(
    &mut self,
    size: usize,
  ) -> Result<*mut Word, ArenaError> {
    let heap_size = self.heap_size();
    if heap_size.checked_add(size).is_none_or(|total| total > MAX_HEAP_SIZE) {
      return Err(ArenaError::HeapLimit {
        requested: size,
        limit: MAX_HEAP_SIZE,
      });
    }

    let current = self.arena.extend(0)?.as_ptr().cast::<Word>();

    if self.start.is_null() {
      let padding = padding(current as usize);
      if padding > 0 {
        heap_log!(self, debug, "break moved to {:?}, padding {} bytes again", current, padding);
        self.arena.extend(padding)?;
      }
    } else if current != self.end {
      heap_log!(self, warn, "break is at {:?}, expected the heap to continue at {:?}", current, self.end);
      return Err(ArenaError::Discontiguous);
    }

    let brk = self.arena.extend(size)?.as_ptr().cast::<Word>();

    if self.start.is_null() {
      self.start = brk;
      self.free.set_base(brk);
    }
    self.end = unsafe { brk.byte_add(size) };

    heap_log!(self, trace, "heap grew by {} bytes, end = {:?}", size, self.end);

    Ok(brk)
  }

  /// Takes a fitting free block off the list, splitting it when the leftover is
  /// big enough to be worth keeping.
  unsafe fn take_fit(
    &mut self,
    bt: *mut Word,
    size: usize,
  ) -> (*mut Word, usize) {
    unsafe {
      self.free.remove(bt);

      let available = block::size(bt);
      let remainder = available - size;

      if remainder <= SPLIT_THRESHOLD {
        return (bt, available);
      }

      let rest = bt.byte_add(size);
      block::write(bt, size, State::Used);
      block::write(rest, remainder, State::Free);
      self.free.insert(rest);

      if bt == self.last {
        self.last = rest;
      }

      (bt, size)
    }
  }

  /// Makes room for `size` bytes at the end of the heap. When the largest free
  /// block is also the trailing block it is extended in place.
  unsafe fn grow_for(
    &mut self,
    size: usize,
    largest: *mut Word,
  ) -> Option<(*mut Word, usize)> {
    unsafe {
      if !largest.is_null() && largest == self.last {
        let shortfall = size - block::size(largest);

        if let Err(err) = self.morecore(shortfall) {
          heap_log!(self, warn, "cannot extend trailing block by {} bytes: {}", shortfall, err);
          return None;
        }

        self.free.remove(largest);
        heap_log!(self, debug, "extended trailing block {:?} in place by {} bytes", largest, shortfall);

        return Some((largest, size));
      }

      match self.morecore(size) {
        Ok(bt) => {
          self.last = bt;
          Some((bt, size))
        }
        Err(err) => {
          heap_log!(self, warn, "cannot grow heap by {} bytes: {}", size, err);
          None
        }
      }
    }
  }

  /// Allocates at least `bytes` bytes, aligned to [`ALIGNMENT`].
  ///
  /// Returns null for a zero-sized request or when the arena is exhausted.
  ///
  /// # Safety
  ///
  /// The heap must be the only user of its arena's break.
  pub unsafe fn allocate(
    &mut self,
    bytes: usize,
  ) -> *mut u8 {
    if bytes == 0 {
      return ptr::null_mut();
    }

    if !self.ready {
      if let Err(err) = self.init() {
        heap_log!(self, warn, "heap initialization failed: {}", err);
        return ptr::null_mut();
      }
    }

    let Some(size) = normalize(bytes) else {
      heap_log!(self, warn, "request of {} bytes is too large", bytes);
      return ptr::null_mut();
    };

    unsafe {
      let found = match self.free.find(size) {
        Ok(bt) => Some(self.take_fit(bt, size)),
        Err(largest) => self.grow_for(size, largest),
      };

      let Some((bt, size)) = found else {
        return ptr::null_mut();
      };

      block::write(bt, size, State::Used);
      let payload = block::payload(bt);

      heap_log!(self, trace, "allocate({}) = {:?}, block size {}", bytes, payload, size);

      payload
    }
  }

  /// Releases a block returned by this heap. Null is ignored.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live pointer obtained from this heap.
  pub unsafe fn free(
    &mut self,
    ptr: *mut u8,
  ) {
    if ptr.is_null() {
      return;
    }

    unsafe {
      let bt = block::from_payload(ptr);

      if block::is_free(bt) {
        heap_log!(self, warn, "ignoring free of {:?}, block is not allocated", ptr);
        return;
      }

      heap_log!(self, trace, "free({:?}), block size {}", ptr, block::size(bt));
      self.coalesce(bt);
    }
  }

  /// Resizes the allocation at `ptr` to hold at least `bytes` bytes.
  ///
  /// Never shrinks a block. Grows into a free right neighbour when possible and
  /// otherwise moves the contents to a fresh block. On failure the original
  /// block is left untouched and null is returned.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live pointer obtained from this heap.
  pub unsafe fn resize(
    &mut self,
    ptr: *mut u8,
    bytes: usize,
  ) -> *mut u8 {
    unsafe {
      if ptr.is_null() {
        return self.allocate(bytes);
      }

      if bytes == 0 {
        self.free(ptr);
        return ptr::null_mut();
      }

      let bt = block::from_payload(ptr);
      let size = block::size(bt);
      let usable = block::usable(size);

      if usable >= bytes {
        return ptr;
      }

      let next = block::next(bt);
      if next < self.end && block::is_free(next) {
        let combined = size + block::size(next);

        if block::usable(combined) >= bytes {
          self.free.remove(next);
          if next == self.last {
            self.last = bt;
          }
          block::write(bt, combined, State::Used);

          heap_log!(self, trace, "resize({:?}, {}) grew in place to {}", ptr, bytes, combined);
          return ptr;
        }
      }

      let moved = self.allocate(bytes);
      if moved.is_null() {
        return ptr::null_mut();
      }

      ptr::copy_nonoverlapping(ptr, moved, usable.min(bytes));
      self.free(ptr);

      heap_log!(self, trace, "resize({:?}, {}) moved to {:?}", ptr, bytes, moved);
      moved
    }
  }

  /// Allocates `count * size` zeroed bytes. Null on overflow or exhaustion.
  ///
  /// # Safety
  ///
  /// Same as [`Heap::allocate`].
  pub unsafe fn zero_allocate(
    &mut self,
    count: usize,
    size: usize,
  ) -> *mut u8 {
    let Some(bytes) = count.checked_mul(size) else {
      heap_log!(self, warn, "zero_allocate({}, {}) overflows", count, size);
      return ptr::null_mut();
    };

    unsafe {
      let ptr = self.allocate(bytes);

      if !ptr.is_null() {
        ptr::write_bytes(ptr, 0, bytes);
      }

      ptr
    }
  }

  /// Bytes the caller may use at `ptr`, zero for null.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live pointer obtained from this heap.
  pub unsafe fn usable_size(
    &self,
    ptr: *mut u8,
  ) -> usize {
    if ptr.is_null() {
      return 0;
    }

    unsafe { block::usable(block::size(block::from_payload(ptr))) }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::ptr::NonNull;

  use crate::arena::FixedArena;

  fn heap(capacity: usize) -> Heap<FixedArena> {
    let mut heap = Heap::new(FixedArena::with_capacity(capacity).unwrap());
    heap.init().unwrap();
    heap
  }

  #[test]
  fn test_normalize() {
    assert_eq!(normalize(1), Some(16));
    assert_eq!(normalize(8), Some(16));
    assert_eq!(normalize(9), Some(32));
    assert_eq!(normalize(10), Some(32));
    assert_eq!(normalize(4096), Some(4112));
    assert_eq!(normalize(usize::MAX), None);
    assert_eq!(normalize(MAX_BLOCK_SIZE), None);
  }

  #[test]
  fn test_init_pads_to_alignment() {
    let heap = heap(1024);

    assert_eq!(heap.arena().used(), ALIGNMENT - WORD_SIZE);
    assert!(heap.is_empty());
  }

  #[test]
  fn test_zero_bytes_is_null() {
    let mut heap = heap(1024);

    unsafe {
      assert!(heap.allocate(0).is_null());
    }
    assert_eq!(heap.heap_size(), 0);
  }

  #[test]
  fn test_payloads_are_aligned_and_disjoint() {
    let mut heap = heap(4096);

    unsafe {
      let a = heap.allocate(1);
      let b = heap.allocate(24);
      let c = heap.allocate(100);

      for ptr in [a, b, c] {
        assert_eq!(ptr as usize % ALIGNMENT, 0);
      }
      assert_eq!(b as usize - a as usize, 16);
      assert_eq!(c as usize - b as usize, 32);
      assert_eq!(heap.usable_size(c), 104);
    }
    assert_eq!(heap.heap_size(), 16 + 32 + 112);
  }

  #[test]
  fn test_lazy_init() {
    let mut heap = Heap::new(FixedArena::with_capacity(256).unwrap());

    let ptr = unsafe { heap.allocate(8) };

    assert!(!ptr.is_null());
    assert_eq!(ptr as usize % ALIGNMENT, 0);
  }

  #[test]
  fn test_freed_block_is_reused() {
    let mut heap = heap(4096);

    unsafe {
      let a = heap.allocate(40);
      let _guard = heap.allocate(8);
      heap.free(a);

      assert_eq!(heap.allocate(40), a);
    }
  }

  #[test]
  fn test_best_fit_picks_smallest_block() {
    let mut heap = heap(4096);

    unsafe {
      let big = heap.allocate(200);
      let _g1 = heap.allocate(8);
      let small = heap.allocate(40);
      let _g2 = heap.allocate(8);

      heap.free(big);
      heap.free(small);

      assert_eq!(heap.allocate(30), small);
    }
  }

  #[test]
  fn test_split_leaves_free_remainder() {
    let mut heap = heap(4096);

    unsafe {
      let big = heap.allocate(200);
      let _guard = heap.allocate(8);
      heap.free(big);

      let small = heap.allocate(8);
      assert_eq!(small, big);
      assert_eq!(heap.usable_size(small), 8);

      let bt = block::next(block::from_payload(small));
      assert!(block::is_free(bt));
      assert_eq!(block::size(bt), 208 - 16);
      assert_eq!(heap.free.head(), bt);
    }
  }

  #[test]
  fn test_small_remainder_is_not_split() {
    let mut heap = heap(4096);

    unsafe {
      let a = heap.allocate(40);
      let _guard = heap.allocate(8);
      heap.free(a);

      let b = heap.allocate(24);
      assert_eq!(b, a);
      assert_eq!(heap.usable_size(b), 40);
      assert!(heap.free.head().is_null());
    }
  }

  #[test]
  fn test_exhaustion_returns_null() {
    let mut heap = heap(256);

    unsafe {
      let a = heap.allocate(100);
      assert!(!a.is_null());

      let used = heap.arena().used();
      assert!(heap.allocate(1000).is_null());
      assert_eq!(heap.arena().used(), used);
      assert!(heap.free.head().is_null());
    }
  }

  #[test]
  fn test_trailing_extension_failure_keeps_free_block() {
    let mut heap = heap(256);

    unsafe {
      let a = heap.allocate(100);
      heap.free(a);

      assert!(heap.allocate(1000).is_null());
      assert_eq!(heap.free.head(), block::from_payload(a));
      assert!(block::is_free(block::from_payload(a)));
    }
  }

  #[test]
  fn test_double_free_is_ignored() {
    let mut heap = heap(1024);

    unsafe {
      let a = heap.allocate(16);
      let _guard = heap.allocate(16);
      heap.free(a);
      heap.free(a);

      assert_eq!(heap.free_blocks().count(), 1);
    }
  }

  #[test]
  fn test_resize_null_and_zero() {
    let mut heap = heap(1024);

    unsafe {
      let a = heap.resize(ptr::null_mut(), 16);
      assert!(!a.is_null());

      assert!(heap.resize(a, 0).is_null());
      assert!(block::is_free(block::from_payload(a)));
    }
  }

  #[test]
  fn test_resize_moves_contents() {
    let mut heap = heap(4096);

    unsafe {
      let a = heap.allocate(16);
      let _guard = heap.allocate(16);
      for i in 0..16 {
        a.add(i).write(i as u8);
      }

      let b = heap.resize(a, 100);
      assert_ne!(b, a);
      for i in 0..16 {
        assert_eq!(b.add(i).read(), i as u8);
      }
      assert!(block::is_free(block::from_payload(a)));
    }
  }

  #[test]
  fn test_resize_failure_keeps_block() {
    let mut heap = heap(128);

    unsafe {
      let a = heap.allocate(16);
      let _guard = heap.allocate(16);
      a.write(7);

      assert!(heap.resize(a, 1000).is_null());
      assert!(block::is_used(block::from_payload(a)));
      assert_eq!(a.read(), 7);
    }
  }

  #[test]
  fn test_resize_absorbs_trailing_block() {
    let mut heap = heap(1024);

    unsafe {
      let a = heap.allocate(16);
      let b = heap.allocate(64);
      heap.free(b);

      assert_eq!(heap.resize(a, 60), a);
      assert_eq!(heap.last, block::from_payload(a));
      assert!(heap.free.head().is_null());
    }
  }

  #[test]
  fn test_zero_allocate() {
    let mut heap = heap(1024);

    unsafe {
      let a = heap.allocate(64);
      ptr::write_bytes(a, 0xAB, 64);
      heap.free(a);

      let z = heap.zero_allocate(8, 8);
      assert_eq!(z, a);
      assert!((0..64).all(|i| z.add(i).read() == 0));

      assert!(heap.zero_allocate(usize::MAX, 2).is_null());
      assert!(heap.zero_allocate(0, 8).is_null());
    }
  }

  /// Fixed arena whose break is moved by someone else right before the
  /// `shift_on`-th call to `extend`.
  struct ShiftingArena {
    inner: FixedArena,
    calls: usize,
    shift_on: usize,
  }

  impl Arena for ShiftingArena {
    fn extend(
      &mut self,
      increment: usize,
    ) -> Result<NonNull<u8>, ArenaError> {
      self.calls += 1;
      if self.calls == self.shift_on {
        self.inner.extend(WORD_SIZE)?;
      }
      self.inner.extend(increment)
    }
  }

  fn shifting_heap(shift_on: usize) -> Heap<ShiftingArena> {
    let mut heap = Heap::new(ShiftingArena {
      inner: FixedArena::with_capacity(4096).unwrap(),
      calls: 0,
      shift_on,
    });
    heap.init().unwrap();
    heap
  }

  #[test]
  fn test_break_moved_before_first_block_is_padded_again() {
    let mut heap = shifting_heap(3);

    unsafe {
      for _ in 0..5 {
        let ptr = heap.allocate(100);
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % ALIGNMENT, 0);
      }
    }

    assert_eq!(heap.heap_size(), 5 * 112);
    assert_eq!(heap.arena().inner.used(), 12 + 4 + 12 + 5 * 112);
    assert_eq!(heap.check(false), Ok(()));
  }

  #[test]
  fn test_break_moved_after_heap_stops_growth() {
    let mut heap = shifting_heap(5);

    unsafe {
      let a = heap.allocate(100);
      assert!(!a.is_null());
      assert_eq!(heap.arena().inner.used(), 12 + 112);

      for _ in 0..3 {
        assert!(heap.allocate(100).is_null());
        assert_eq!(heap.arena().inner.used(), 12 + 112 + 4);
      }

      heap.free(a);
      assert_eq!(heap.allocate(100), a);
    }

    assert_eq!(heap.heap_size(), 112);
    assert_eq!(heap.check(false), Ok(()));
  }

  #[test]
  fn test_trailing_block_extended_only_when_largest() {
    let mut heap = heap(4096);

    unsafe {
      let a = heap.allocate(200);
      let _guard = heap.allocate(8);
      let t = heap.allocate(40);
      heap.free(a);
      heap.free(t);

      let bt = block::from_payload(t);
      assert_eq!(heap.last, bt);
      assert_ne!(heap.free.find(1024), Err(bt));

      let big = heap.allocate(1000);
      assert_ne!(big, t);
      assert!(block::is_free(bt));
      assert_eq!(heap.last, block::from_payload(big));

      heap.free(big);
      assert_eq!(heap.free.find(4096), Err(bt));

      let huge = heap.allocate(2000);
      assert_eq!(huge, t);
      assert_eq!(heap.last, bt);
    }

    assert_eq!(heap.check(false), Ok(()));
  }

  #[test]
  fn test_quiet_heap_still_allocates() {
    let mut heap = Heap::new_quiet(FixedArena::with_capacity(256).unwrap());

    unsafe {
      let a = heap.allocate(64);
      assert!(!a.is_null());
      assert!(heap.allocate(1000).is_null());
      heap.free(a);
      heap.free(a);
    }

    assert!(heap.quiet);
    assert_eq!(heap.check(false), Ok(()));
  }
}
