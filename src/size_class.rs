//! Size classes of the free-list bins.
//!
//! Bin `k` covers chunk sizes in `[k * BIN_INCREMENT, (k + 1) * BIN_INCREMENT)`
//! for every bin but the last, which takes everything from
//! `(NUM_BINS - 1) * BIN_INCREMENT` upwards and is scanned linearly.

use crate::align::{CHUNK_ALIGNMENT, align_checked};
use crate::chunk::HEADER_SIZE;

/// Number of bins in the free-list table.
pub const NUM_BINS: usize = 16;

/// Width in bytes of each bounded bin.
pub const BIN_INCREMENT: usize = 128;

/// Smallest chunk the allocator creates: a header plus one alignment unit.
pub const MIN_CHUNK_SIZE: usize = HEADER_SIZE + CHUNK_ALIGNMENT;

/// Total chunk size serving a request of `requested` payload bytes.
///
/// Returns `None` when the header-inclusive size overflows.
pub fn chunk_size(requested: usize) -> Option<usize> {
  let total = requested.checked_add(HEADER_SIZE)?;
  let aligned = align_checked(total, CHUNK_ALIGNMENT)?;
  Some(aligned.max(MIN_CHUNK_SIZE))
}

/// Bin whose chain serves chunks of `size` bytes.
pub const fn bin_index(size: usize) -> usize {
  let index = size / BIN_INCREMENT;
  if index < NUM_BINS { index } else { NUM_BINS - 1 }
}

/// Smallest chunk size that maps to `bin`.
pub const fn bin_floor(bin: usize) -> usize {
  bin * BIN_INCREMENT
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_chunk_size_includes_header() {
    assert_eq!(chunk_size(4), Some(crate::align!(4 + HEADER_SIZE)));
    assert_eq!(chunk_size(8), Some(crate::align!(8 + HEADER_SIZE)));
    assert_eq!(chunk_size(100), Some(crate::align!(100 + HEADER_SIZE)));
  }

  #[test]
  fn test_chunk_size_clamps_to_minimum() {
    assert_eq!(chunk_size(0), Some(MIN_CHUNK_SIZE));
    assert_eq!(chunk_size(1), Some(MIN_CHUNK_SIZE));
  }

  #[test]
  fn test_chunk_size_overflow() {
    assert_eq!(chunk_size(usize::MAX), None);
    assert_eq!(chunk_size(usize::MAX - HEADER_SIZE + 1), None);
  }

  #[test]
  fn test_bin_index() {
    assert_eq!(bin_index(MIN_CHUNK_SIZE), 0);
    assert_eq!(bin_index(BIN_INCREMENT - CHUNK_ALIGNMENT), 0);
    assert_eq!(bin_index(BIN_INCREMENT), 1);
    assert_eq!(bin_index(3 * BIN_INCREMENT + 8), 3);
  }

  #[test]
  fn test_bin_index_saturates() {
    let catch_all = bin_floor(NUM_BINS - 1);

    assert_eq!(bin_index(catch_all - CHUNK_ALIGNMENT), NUM_BINS - 2);
    assert_eq!(bin_index(catch_all), NUM_BINS - 1);
    assert_eq!(bin_index(catch_all * 100), NUM_BINS - 1);
    assert_eq!(bin_index(usize::MAX), NUM_BINS - 1);
  }
}
