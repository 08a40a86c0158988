/// Alignment every chunk address and chunk size honors.
pub const CHUNK_ALIGNMENT: usize = 8;

/// Rounds `value` up to the next multiple of a power-of-two alignment.
///
/// With one argument the alignment is [`CHUNK_ALIGNMENT`].
///
/// # Examples
///
/// ```rust
/// use protalloc::align;
///
/// assert_eq!(align!(13), 16);
/// assert_eq!(align!(4097, 4096), 8192);
/// ```
#[macro_export]
macro_rules! align {
  ($value:expr) => {
    $crate::align!($value, $crate::align::CHUNK_ALIGNMENT)
  };
  ($value:expr, $to:expr) => {
    (($value) + ($to) - 1) & !(($to) - 1)
  };
}

/// Overflow-checked form of [`align!`].
pub const fn align_checked(
  value: usize,
  to: usize,
) -> Option<usize> {
  debug_assert!(to.is_power_of_two());
  match value.checked_add(to - 1) {
    Some(bumped) => Some(bumped & !(to - 1)),
    None => None,
  }
}

/// Rounds `addr` down to the start of its page.
pub const fn page_floor(
  addr: usize,
  page_size: usize,
) -> usize {
  addr & !(page_size - 1)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_align() {
    let mut alignments = Vec::new();

    for i in 0..10 {
      let sizes = (CHUNK_ALIGNMENT * i + 1)..=(CHUNK_ALIGNMENT * (i + 1));

      let expected_alignment = CHUNK_ALIGNMENT * (i + 1);

      alignments.push((sizes, expected_alignment));
    }

    for (sizes, expected) in alignments {
      for size in sizes {
        assert_eq!(expected, align!(size));
      }
    }
  }

  #[test]
  fn test_align_to_page() {
    assert_eq!(align!(0usize, 4096), 0);
    assert_eq!(align!(1usize, 4096), 4096);
    assert_eq!(align!(4096usize, 4096), 4096);
    assert_eq!(align!(4097usize, 4096), 8192);
  }

  #[test]
  fn test_align_checked_overflow() {
    assert_eq!(align_checked(usize::MAX, 8), None);
    assert_eq!(align_checked(usize::MAX - 7, 8), Some(usize::MAX - 7));
    assert_eq!(align_checked(17, 8), Some(24));
  }

  #[test]
  fn test_page_floor() {
    assert_eq!(page_floor(0x1fff, 0x1000), 0x1000);
    assert_eq!(page_floor(0x2000, 0x1000), 0x2000);
  }
}
