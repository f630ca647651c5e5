//! Merging of a freed block with its physical neighbours.
//!
//! ```text
//!   before:  ┌──────┬──────┬──────┐      after:  ┌────────────────────┐
//!            │ FREE │  bt  │ FREE │              │        FREE        │
//!            └──────┴──────┴──────┘              └────────────────────┘
//! ```

use crate::{
  align::Word,
  arena::Arena,
  block::{self, State},
  heap::Heap,
};

impl<A: Arena> Heap<A> {
  /// Marks `bt` free, folds in whichever neighbours are free and puts the
  /// resulting block on the free list. Returns its header.
  ///
  /// Afterwards no two adjacent blocks around `bt` are both free.
  pub(crate) unsafe fn coalesce(
    &mut self,
    bt: *mut Word,
  ) -> *mut Word {
    unsafe {
      let prev_free = bt != self.start && block::is_free(block::prev_footer(bt));

      let next = block::next(bt);
      let next_free = next < self.end && block::is_free(next);

      let (merged, size) = match (prev_free, next_free) {
        (true, true) => {
          let prev = block::prev(bt);
          self.free.remove(prev);
          self.free.remove(next);
          (prev, block::size(prev) + block::size(bt) + block::size(next))
        }
        (true, false) => {
          let prev = block::prev(bt);
          self.free.remove(prev);
          (prev, block::size(prev) + block::size(bt))
        }
        (false, true) => {
          self.free.remove(next);
          (bt, block::size(bt) + block::size(next))
        }
        (false, false) => (bt, block::size(bt)),
      };

      if self.last == bt || (next_free && self.last == next) {
        self.last = merged;
      }

      block::write(merged, size, State::Free);
      self.free.insert(merged);

      merged
    }
  }
}

#[cfg(test)]
mod tests {
  use crate::{
    align::Word,
    arena::FixedArena,
    block::{self, State},
    heap::Heap,
  };

  fn heap() -> Heap<FixedArena> {
    let mut heap = Heap::new(FixedArena::with_capacity(4096).unwrap());
    heap.init().unwrap();
    heap
  }

  fn listed(heap: &Heap<FixedArena>) -> Vec<*mut Word> {
    let mut nodes = Vec::new();
    let mut current = heap.free.head();

    while !current.is_null() {
      nodes.push(current);
      current = unsafe { heap.free.next(current) };
    }

    nodes
  }

  #[test]
  fn test_no_free_neighbours() {
    let mut heap = heap();

    unsafe {
      let a = heap.allocate(32);
      let b = heap.allocate(32);
      let _c = heap.allocate(32);

      heap.free(b);

      let bt = block::from_payload(b);
      assert_eq!(block::state(bt), State::Free);
      assert_eq!(block::size(bt), 48);
      assert!(block::is_used(block::from_payload(a)));
      assert_eq!(heap.free.head(), bt);
    }
  }

  #[test]
  fn test_merge_with_previous() {
    let mut heap = heap();

    unsafe {
      let a = heap.allocate(32);
      let b = heap.allocate(32);
      let _c = heap.allocate(32);

      heap.free(a);
      heap.free(b);

      let bt = block::from_payload(a);
      assert_eq!(block::size(bt), 96);
      assert_eq!(*block::footer(bt), *bt);
      assert_eq!(listed(&heap), vec![bt]);
    }
  }

  #[test]
  fn test_merge_with_next() {
    let mut heap = heap();

    unsafe {
      let _a = heap.allocate(32);
      let b = heap.allocate(32);
      let c = heap.allocate(32);
      let _d = heap.allocate(32);

      heap.free(c);
      heap.free(b);

      let bt = block::from_payload(b);
      assert_eq!(block::size(bt), 96);
      assert_eq!(listed(&heap), vec![bt]);
    }
  }

  #[test]
  fn test_merge_both_sides() {
    let mut heap = heap();

    unsafe {
      let a = heap.allocate(32);
      let b = heap.allocate(32);
      let c = heap.allocate(32);

      heap.free(a);
      heap.free(c);
      assert_eq!(listed(&heap).len(), 2);

      heap.free(b);

      let bt = block::from_payload(a);
      assert_eq!(block::size(bt), 144);
      assert_eq!(listed(&heap), vec![bt]);
      assert_eq!(heap.last, bt);
      assert_eq!(block::size(bt), heap.heap_size());
    }
  }

  #[test]
  fn test_merging_into_last_block_moves_last() {
    let mut heap = heap();

    unsafe {
      let _a = heap.allocate(32);
      let b = heap.allocate(32);
      let c = heap.allocate(32);

      heap.free(c);
      assert_eq!(heap.last, block::from_payload(c));

      heap.free(b);
      assert_eq!(heap.last, block::from_payload(b));
    }
  }
}
