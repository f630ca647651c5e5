//! Heap consistency checking and inspection.
//!
//! [`Heap::check`] walks the free list and then the blocks in address order,
//! cross-checking the two:
//!
//! ```text
//!   free list:   head ──▶ [16] ──▶ [48] ──▶ [208] ──▶ NONE      sorted, all FREE
//!   heap walk:   │U│F│  U  │    F    │ U │        F        │    no FREE│FREE
//!                start                                    end
//! ```

use std::{fmt, process};

use log::{error, info};
use thiserror::Error;

use crate::{
  align::{ALIGNMENT, Word},
  arena::Arena,
  block::{self, MIN_BLOCK_SIZE, State},
  free_list::{FreeList, NONE},
  heap::Heap,
};

/// An invariant violation. Offsets are in bytes from the heap start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Corruption {
  #[error("block at {offset:#x} is on the free list but not marked free")]
  ListedNotFree { offset: usize },
  #[error("free-list link {link:#x} of block at {offset:#x} points outside the heap")]
  LinkOutOfBounds { offset: usize, link: Word },
  #[error("blocks at {offset:#x} and its successor are both free")]
  AdjacentFree { offset: usize },
  #[error("free block at {offset:#x} is not on the free list")]
  Unlisted { offset: usize },
  #[error("free list holds {listed} blocks but {tagged} blocks are marked free")]
  FreeCountMismatch { listed: usize, tagged: usize },
  #[error("header {header:#x} and footer {footer:#x} of block at {offset:#x} differ")]
  TagMismatch {
    offset: usize,
    header: Word,
    footer: Word,
  },
  #[error("block at {offset:#x} has invalid size {size}")]
  BadBlockSize { offset: usize, size: usize },
  #[error("free list is out of order at block {offset:#x}")]
  Unsorted { offset: usize },
  #[error("last block is tracked at {tracked:#x} but the heap ends with {found:#x}")]
  LastBlockMismatch { tracked: usize, found: usize },
}

impl Corruption {
  /// Process exit status identifying the class of violation.
  pub fn exit_code(&self) -> i32 {
    match self {
      Corruption::ListedNotFree { .. } => 1,
      Corruption::LinkOutOfBounds { .. } => 2,
      Corruption::AdjacentFree { .. } => 3,
      Corruption::Unlisted { .. } | Corruption::FreeCountMismatch { .. } => 4,
      Corruption::TagMismatch { .. } => 5,
      Corruption::BadBlockSize { .. } => 6,
      Corruption::Unsorted { .. } => 7,
      Corruption::LastBlockMismatch { .. } => 8,
    }
  }
}

/// A block as seen by a heap walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
  /// Byte offset of the header from the heap start.
  pub offset: usize,
  /// Size including header and footer.
  pub size: usize,
  pub state: State,
}

impl fmt::Display for BlockInfo {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    let state = match self.state {
      State::Free => 'F',
      State::Used => 'U',
    };
    write!(f, "{} {:#08x} {:>8}", state, self.offset, self.size)
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
  pub heap_bytes: usize,
  pub used_blocks: usize,
  pub used_bytes: usize,
  pub free_blocks: usize,
  pub free_bytes: usize,
  pub largest_free: usize,
}

/// Address-order walk over a consistent heap.
pub struct Blocks<'a, A: Arena> {
  heap: &'a Heap<A>,
  current: *mut Word,
}

impl<A: Arena> Iterator for Blocks<'_, A> {
  type Item = BlockInfo;

  fn next(&mut self) -> Option<Self::Item> {
    if self.current.is_null() || self.current >= self.heap.end {
      return None;
    }

    let bt = self.current;
    let size = unsafe { block::size(bt) };

    self.current = if size == 0 {
      self.heap.end
    } else {
      unsafe { bt.byte_add(size) }
    };

    Some(unsafe { self.heap.info(bt) })
  }
}

/// Free-list-order walk over a consistent heap.
pub struct FreeBlocks<'a, A: Arena> {
  heap: &'a Heap<A>,
  current: *mut Word,
}

impl<A: Arena> Iterator for FreeBlocks<'_, A> {
  type Item = BlockInfo;

  fn next(&mut self) -> Option<Self::Item> {
    if !self.heap.contains(self.current) {
      return None;
    }

    let bt = self.current;
    self.current = unsafe { self.heap.free.next(bt) };

    Some(unsafe { self.heap.info(bt) })
  }
}

impl<A: Arena> Heap<A> {
  fn offset(
    &self,
    bt: *const Word,
  ) -> usize {
    (bt as usize).wrapping_sub(self.start as usize)
  }

  fn contains(
    &self,
    bt: *const Word,
  ) -> bool {
    !bt.is_null() && bt >= self.start.cast_const() && bt < self.end.cast_const()
  }

  unsafe fn info(
    &self,
    bt: *mut Word,
  ) -> BlockInfo {
    unsafe {
      BlockInfo {
        offset: self.offset(bt),
        size: block::size(bt),
        state: block::state(bt),
      }
    }
  }

  /// Iterates the blocks in address order.
  pub fn blocks(&self) -> Blocks<'_, A> {
    Blocks {
      heap: self,
      current: self.start,
    }
  }

  /// Iterates the free list from its smallest block.
  pub fn free_blocks(&self) -> FreeBlocks<'_, A> {
    FreeBlocks {
      heap: self,
      current: self.free.head(),
    }
  }

  pub fn stats(&self) -> HeapStats {
    let mut stats = HeapStats {
      heap_bytes: self.heap_size(),
      ..HeapStats::default()
    };

    for info in self.blocks() {
      match info.state {
        State::Used => {
          stats.used_blocks += 1;
          stats.used_bytes += info.size;
        }
        State::Free => {
          stats.free_blocks += 1;
          stats.free_bytes += info.size;
          stats.largest_free = stats.largest_free.max(info.size);
        }
      }
    }

    stats
  }

  /// Upper bound on the number of blocks, used to cut off cyclic lists.
  fn max_blocks(&self) -> usize {
    self.heap_size() / MIN_BLOCK_SIZE
  }

  fn is_listed(
    &self,
    bt: *mut Word,
  ) -> bool {
    let limit = self.max_blocks();
    let mut current = self.free.head();
    let mut steps = 0;

    while self.contains(current) && steps <= limit {
      if current == bt {
        return true;
      }
      current = unsafe { self.free.next(current) };
      steps += 1;
    }

    false
  }

  /// Walks the free list; returns how many blocks it holds.
  fn check_free_list(&self) -> Result<usize, Corruption> {
    let limit = self.max_blocks();
    let mut current = self.free.head();
    let mut listed = 0;
    let mut previous_size = 0;

    if !current.is_null() && !self.contains(current) {
      return Err(Corruption::LinkOutOfBounds {
        offset: self.offset(current),
        link: NONE,
      });
    }

    while !current.is_null() {
      listed += 1;
      let offset = self.offset(current);

      if listed > limit {
        return Err(Corruption::FreeCountMismatch {
          listed,
          tagged: limit,
        });
      }

      let (prev, next) = unsafe { FreeList::links(current) };
      for link in [prev, next] {
        if link != NONE && !self.contains(self.free.resolve(link)) {
          return Err(Corruption::LinkOutOfBounds { offset, link });
        }
      }

      if unsafe { block::is_used(current) } {
        return Err(Corruption::ListedNotFree { offset });
      }

      let size = unsafe { block::size(current) };
      if size < previous_size {
        return Err(Corruption::Unsorted { offset });
      }
      previous_size = size;

      current = self.free.resolve(next);
    }

    Ok(listed)
  }

  /// Walks the blocks in address order; returns how many are free.
  fn check_blocks(
    &self,
    verbose: bool,
  ) -> Result<usize, Corruption> {
    let mut current = self.start;
    let mut last = self.start;
    let mut previous_free = false;
    let mut tagged = 0;

    while current < self.end {
      let offset = self.offset(current);
      let remaining = self.end as usize - current as usize;
      let header = unsafe { current.read() };
      let size = block::decode_size(header);

      if size < MIN_BLOCK_SIZE || size % ALIGNMENT != 0 || size > remaining {
        return Err(Corruption::BadBlockSize { offset, size });
      }

      let footer = unsafe { block::footer(current).read() };
      if footer != header {
        return Err(Corruption::TagMismatch {
          offset,
          header,
          footer,
        });
      }

      let info = unsafe { self.info(current) };
      let free = info.state == State::Free;

      if verbose {
        if free {
          let (prev, next) = unsafe { FreeList::links(current) };
          info!("{} prev={:#x} next={:#x}", info, prev, next);
        } else {
          info!("{}", info);
        }
      }

      if free {
        if previous_free {
          return Err(Corruption::AdjacentFree {
            offset: self.offset(last),
          });
        }
        if !self.is_listed(current) {
          return Err(Corruption::Unlisted { offset });
        }
        tagged += 1;
      }

      previous_free = free;
      last = current;
      current = unsafe { current.byte_add(size) };
    }

    if last != self.last {
      return Err(Corruption::LastBlockMismatch {
        tracked: self.offset(self.last),
        found: self.offset(last),
      });
    }

    Ok(tagged)
  }

  /// Verifies every heap invariant.
  ///
  /// With `verbose` set the blocks are dumped through the `log` facade as they
  /// are visited.
  pub fn check(
    &self,
    verbose: bool,
  ) -> Result<(), Corruption> {
    if verbose {
      info!(
        "heap {:?}..{:?}, {} bytes",
        self.start,
        self.end,
        self.heap_size()
      );
    }

    if self.start.is_null() {
      if verbose {
        info!("empty heap");
      }
      if !self.free.head().is_null() {
        return Err(Corruption::FreeCountMismatch {
          listed: 1,
          tagged: 0,
        });
      }
      return Ok(());
    }

    let listed = self.check_free_list()?;
    let tagged = self.check_blocks(verbose)?;

    if listed != tagged {
      return Err(Corruption::FreeCountMismatch { listed, tagged });
    }

    Ok(())
  }

  /// Like [`Heap::check`], but a violation terminates the process with
  /// [`Corruption::exit_code`] as its status.
  pub fn check_or_exit(
    &self,
    verbose: bool,
  ) {
    if let Err(corruption) = self.check(verbose) {
      error!("heap corrupted: {}", corruption);
      process::exit(corruption.exit_code());
    }
  }
}
