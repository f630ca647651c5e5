//! # tagalloc - A Boundary-Tag Heap Allocator
//!
//! This crate implements `malloc`, `free`, `realloc` and `calloc` over a single
//! contiguous, growable address range, together with a consistency checker.
//!
//! ## Overview
//!
//! Every block carries a boundary tag at both ends. Free blocks reuse their own
//! body to link themselves into an explicit free list kept sorted by size:
//!
//! ```text
//!   Heap Layout:
//!
//!   ┌─────┬───────────────────────────────────────────────────────────────┐
//!   │ pad │  USED   │      FREE      │ USED │           FREE              │
//!   └─────┴─────────┴────────────────┴──────┴─────────────────────────────┘
//!         ▲                 │                               │             ▲
//!         │                 └───────────┐    ┌──────────────┘             │
//!       start                           ▼    ▼                          end
//!                            free list: [ 96 ] ──▶ [ 208 ] ──▶ NONE    (break)
//! ```
//!
//! ## Crate Structure
//!
//! ```text
//!   tagalloc
//!   ├── align      - ALIGNMENT, tag word, alignment macros (align!, align_to!)
//!   ├── block      - Boundary tag codec (internal)
//!   ├── free_list  - Size-ordered, offset-linked free list (internal)
//!   ├── coalesce   - Merging of adjacent free blocks (internal)
//!   ├── heap       - Heap: allocate / free / resize / zero_allocate
//!   ├── check      - Consistency checker, block walks and statistics
//!   ├── arena      - Arena trait, SbrkArena and FixedArena
//!   └── global     - LockedHeap, a GlobalAlloc front end
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tagalloc::{FixedArena, Heap};
//!
//! fn main() {
//!     let mut heap = Heap::new(FixedArena::with_capacity(1 << 20).unwrap());
//!     heap.init().unwrap();
//!
//!     unsafe {
//!         let ptr = heap.allocate(64);
//!         ptr.write_bytes(0xAB, 64);
//!
//!         let ptr = heap.resize(ptr, 256);
//!         heap.free(ptr);
//!     }
//!
//!     heap.check(false).unwrap();
//! }
//! ```
//!
//! ## How It Works
//!
//! A block is a multiple of [`ALIGNMENT`] bytes, delimited by two identical
//! tag words holding its size and state:
//!
//! ```text
//!   Used Block:                             Free Block:
//!   ┌────────┬─────────────────┬────────┐   ┌────────┬──────┬──────┬───┬────────┐
//!   │ size|1 │  user payload   │ size|1 │   │ size|0 │ prev │ next │   │ size|0 │
//!   └────────┴─────────────────┴────────┘   └────────┴──────┴──────┴───┴────────┘
//!            ▲
//!            └── Pointer returned to user
//! ```
//!
//! - **Allocation** takes the smallest free block that fits (the free list is
//!   sorted, so the first fit is the best fit) and splits off the leftover when
//!   it is worth keeping. When nothing fits and the largest free block is the
//!   last one in the heap, it is extended in place, otherwise the arena is grown.
//! - **Freeing** merges the block with free neighbours, so no two adjacent
//!   blocks are ever free.
//! - **Resizing** never shrinks, grows into a free right neighbour when it can
//!   and otherwise moves the data.
//!
//! ## Logging
//!
//! Diagnostics go through the [`log`](https://docs.rs/log) facade: `trace!` on
//! every entry point, `debug!` for initialization and growth, `warn!` for
//! failures and double frees, and `info!` for the dump of
//! [`Heap::check`]`(true)`. Nothing is printed until the program installs a
//! logger. [`Heap::new_quiet`] heaps, including the one inside [`LockedHeap`],
//! stay silent on their allocation paths.
//!
//! ## Limitations
//!
//! - **Single-threaded core**: [`Heap`] has no synchronization, wrap it in
//!   [`LockedHeap`] to share it
//! - **Never shrinks**: memory is not returned to the arena
//! - **Misuse is not detected**: freeing a foreign pointer or writing past an
//!   allocation corrupts the heap, [`Heap::check`] can find the damage later
//! - **Alignment**: [`Heap`] aligns to [`ALIGNMENT`] bytes; [`LockedHeap`] serves
//!   larger alignments by over-allocating
//! - **Size**: the heap never grows past [`MAX_HEAP_SIZE`] bytes, the largest
//!   size a tag can hold
//!
//! ## Safety
//!
//! The allocation entry points are `unsafe`: they hand out and take back raw
//! pointers into memory the heap owns.

pub mod align;
mod arena;
mod block;
mod check;
mod coalesce;
mod free_list;
mod global;
mod heap;

pub use align::{ALIGNMENT, WORD_SIZE, Word};
pub use arena::{Arena, ArenaError, FixedArena, SbrkArena};
pub use block::State;
pub use check::{BlockInfo, Blocks, Corruption, FreeBlocks, HeapStats};
pub use global::LockedHeap;
pub use heap::{Heap, MAX_HEAP_SIZE, SPLIT_THRESHOLD, normalize};
