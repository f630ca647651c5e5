use std::mem;

use static_assertions::const_assert;

/// Boundary tag word. The heap is treated as an array of these.
pub type Word = u32;

/// Width of a single boundary tag word in bytes.
pub const WORD_SIZE: usize = mem::size_of::<Word>();

/// Block alignment. Every block size is a multiple of this and every payload
/// address handed out is aligned to it.
pub const ALIGNMENT: usize = 16;

const_assert!(ALIGNMENT.is_power_of_two());
const_assert!(ALIGNMENT >= 2 * WORD_SIZE);

/// Rounds `value` up to the next multiple of `align` (a power of two).
///
/// # Examples
///
/// ```rust
/// use tagalloc::align_to;
///
/// assert_eq!(align_to!(13, 8), 16);
/// assert_eq!(align_to!(32, 16), 32);
/// ```
#[macro_export]
macro_rules! align_to {
  ($value:expr, $align:expr) => {
    ($value + $align - 1) & !($align - 1)
  };
}

/// Rounds `value` up to the block alignment.
///
/// # Examples
///
/// ```rust
/// use tagalloc::align;
///
/// assert_eq!(align!(1), 16);
/// assert_eq!(align!(18), 32);
/// ```
#[macro_export]
macro_rules! align {
  ($value:expr) => {
    $crate::align_to!($value, $crate::align::ALIGNMENT)
  };
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_align() {
    let mut alignments = Vec::new();

    for i in 0..10 {
      let sizes = (ALIGNMENT * i + 1)..=(ALIGNMENT * (i + 1));

      let expected_alignment = ALIGNMENT * (i + 1);

      alignments.push((sizes, expected_alignment));
    }

    for (sizes, expected) in alignments {
      for size in sizes {
        assert_eq!(expected, align!(size));
      }
    }
  }

  #[test]
  fn test_align_to() {
    assert_eq!(align_to!(0usize, 8), 0);
    assert_eq!(align_to!(1usize, 4), 4);
    assert_eq!(align_to!(4usize, 4), 4);
    assert_eq!(align_to!(17usize, 16), 32);
  }
}
