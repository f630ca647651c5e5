//! Boundary tag codec.
//!
//! ```text
//!   ┌────────┬──────────────────────────────────────┬────────┐
//!   │ header │   payload (USED) / prev,next (FREE)  │ footer │
//!   └────────┴──────────────────────────────────────┴────────┘
//!     size|state                                     size|state
//! ```
//!
//! Header and footer hold the same word. The footer of the preceding block sits
//! one word before a header, which is what makes backward traversal possible.

use crate::align::{ALIGNMENT, WORD_SIZE, Word};

/// Low bits of a tag not used by the size.
const FLAGS_MASK: Word = (ALIGNMENT - 1) as Word;

/// Allocation state stored in the low bit of a tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum State {
  Free = 0,
  Used = 1,
}

/// Smallest block that can hold a header, two links and a footer.
pub const MIN_BLOCK_SIZE: usize = ALIGNMENT;

/// Largest block size a tag can encode.
pub const MAX_BLOCK_SIZE: usize = (Word::MAX & !FLAGS_MASK) as usize;

pub fn encode(
  size: usize,
  state: State,
) -> Word {
  debug_assert_eq!(size % ALIGNMENT, 0);
  debug_assert!(size <= MAX_BLOCK_SIZE);
  size as Word | state as Word
}

pub fn decode_size(tag: Word) -> usize {
  (tag & !FLAGS_MASK) as usize
}

pub fn decode_state(tag: Word) -> State {
  if tag & State::Used as Word != 0 {
    State::Used
  } else {
    State::Free
  }
}

pub unsafe fn size(bt: *const Word) -> usize {
  decode_size(unsafe { bt.read() })
}

pub unsafe fn state(bt: *const Word) -> State {
  decode_state(unsafe { bt.read() })
}

pub unsafe fn is_used(bt: *const Word) -> bool {
  unsafe { state(bt) == State::Used }
}

pub unsafe fn is_free(bt: *const Word) -> bool {
  unsafe { state(bt) == State::Free }
}

/// Address of the footer of the block whose header is at `bt`.
pub unsafe fn footer(bt: *mut Word) -> *mut Word {
  unsafe { bt.byte_add(size(bt) - WORD_SIZE) }
}

/// Writes the same tag into the header at `bt` and the footer `size` bytes on.
pub unsafe fn write(
  bt: *mut Word,
  size: usize,
  state: State,
) {
  let tag = encode(size, state);

  unsafe {
    bt.write(tag);
    bt.byte_add(size - WORD_SIZE).write(tag);
  }
}

/// The block physically following `bt`. May equal the heap end.
pub unsafe fn next(bt: *mut Word) -> *mut Word {
  unsafe { bt.byte_add(size(bt)) }
}

/// The block physically preceding `bt`, found through its footer. The caller
/// must make sure `bt` is not the first block.
pub unsafe fn prev(bt: *mut Word) -> *mut Word {
  unsafe { bt.byte_sub(size(bt.sub(1))) }
}

/// Footer of the block physically preceding `bt`.
pub unsafe fn prev_footer(bt: *mut Word) -> *mut Word {
  unsafe { bt.sub(1) }
}

pub unsafe fn payload(bt: *mut Word) -> *mut u8 {
  unsafe { bt.add(1).cast() }
}

pub unsafe fn from_payload(ptr: *mut u8) -> *mut Word {
  unsafe { ptr.cast::<Word>().sub(1) }
}

/// Bytes of a block available to the caller.
pub fn usable(size: usize) -> usize {
  size - 2 * WORD_SIZE
}
