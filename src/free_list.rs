//! Explicit free list, sorted ascending by block size.
//!
//! A free block stores two links right after its header:
//!
//! ```text
//!   ┌────────┬─────────────┬─────────────┬─────────┬────────┐
//!   │ header │ prev offset │ next offset │   ...   │ footer │
//!   └────────┴─────────────┴─────────────┴─────────┴────────┘
//! ```
//!
//! Links are word offsets from the heap start, `NONE` marks the end of the list.

use std::ptr;

use crate::{align::Word, block};

/// Link value meaning "no block".
pub const NONE: Word = Word::MAX;

const PREV: usize = 1;
const NEXT: usize = 2;

pub struct FreeList {
  base: *mut Word,
  head: *mut Word,
}

impl FreeList {
  pub const fn new() -> Self {
    Self {
      base: ptr::null_mut(),
      head: ptr::null_mut(),
    }
  }

  /// Forgets every node and the base offsets are resolved against.
  pub fn reset(&mut self) {
    self.base = ptr::null_mut();
    self.head = ptr::null_mut();
  }

  pub fn set_base(
    &mut self,
    base: *mut Word,
  ) {
    self.base = base;
  }

  pub fn head(&self) -> *mut Word {
    self.head
  }

  /// Raw `(prev, next)` link words of a free block.
  pub unsafe fn links(bt: *const Word) -> (Word, Word) {
    unsafe { (bt.add(PREV).read(), bt.add(NEXT).read()) }
  }

  /// Address a link word refers to, without checking it lies inside the heap.
  pub fn resolve(
    &self,
    link: Word,
  ) -> *mut Word {
    if link == NONE {
      ptr::null_mut()
    } else {
      self.base.wrapping_add(link as usize)
    }
  }

  pub unsafe fn prev(
    &self,
    bt: *mut Word,
  ) -> *mut Word {
    self.resolve(unsafe { bt.add(PREV).read() })
  }

  pub unsafe fn next(
    &self,
    bt: *mut Word,
  ) -> *mut Word {
    self.resolve(unsafe { bt.add(NEXT).read() })
  }

  fn offset_of(
    &self,
    bt: *mut Word,
  ) -> Word {
    if bt.is_null() {
      NONE
    } else {
      unsafe { bt.offset_from(self.base) as Word }
    }
  }

  unsafe fn set_prev(
    &self,
    bt: *mut Word,
    prev: *mut Word,
  ) {
    unsafe { bt.add(PREV).write(self.offset_of(prev)) }
  }

  unsafe fn set_next(
    &self,
    bt: *mut Word,
    next: *mut Word,
  ) {
    unsafe { bt.add(NEXT).write(self.offset_of(next)) }
  }

  /// Links `bt` into the list right before `after`.
  pub unsafe fn link_before(
    &mut self,
    bt: *mut Word,
    after: *mut Word,
  ) {
    unsafe {
      let prev = self.prev(after);

      if prev.is_null() {
        self.head = bt;
      } else {
        self.set_next(prev, bt);
      }

      self.set_prev(bt, prev);
      self.set_next(bt, after);
      self.set_prev(after, bt);
    }
  }

  /// Inserts `bt` after every node no larger than it.
  pub unsafe fn insert(
    &mut self,
    bt: *mut Word,
  ) {
    unsafe {
      if self.head.is_null() {
        self.set_prev(bt, ptr::null_mut());
        self.set_next(bt, ptr::null_mut());
        self.head = bt;
        return;
      }

      let size = block::size(bt);
      let mut current = self.head;

      loop {
        if block::size(current) > size {
          self.link_before(bt, current);
          return;
        }

        let next = self.next(current);
        if next.is_null() {
          break;
        }
        current = next;
      }

      self.set_next(current, bt);
      self.set_prev(bt, current);
      self.set_next(bt, ptr::null_mut());
    }
  }

  /// Unlinks `bt`. Its tags are left alone.
  pub unsafe fn remove(
    &mut self,
    bt: *mut Word,
  ) {
    unsafe {
      let prev = self.prev(bt);
      let next = self.next(bt);

      match (prev.is_null(), next.is_null()) {
        (true, true) => self.head = ptr::null_mut(),
        (true, false) => {
          self.head = next;
          self.set_prev(next, ptr::null_mut());
        }
        (false, true) => self.set_next(prev, ptr::null_mut()),
        (false, false) => {
          self.set_next(prev, next);
          self.set_prev(next, prev);
        }
      }
    }
  }

  /// Smallest node of at least `size` bytes. On a miss the error carries the
  /// tail, which is the largest free block, or null for an empty list.
  pub unsafe fn find(
    &self,
    size: usize,
  ) -> Result<*mut Word, *mut Word> {
    let mut current = self.head;
    let mut tail = ptr::null_mut();

    unsafe {
      while !current.is_null() {
        if block::size(current) >= size {
          return Ok(current);
        }
        tail = current;
        current = self.next(current);
      }
    }

    Err(tail)
  }
}
