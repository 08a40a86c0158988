use std::{mem, ptr::NonNull};

use bitflags::bitflags;

bitflags! {
  /// Access a caller requests for a chunk's payload.
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
  pub struct Permission: u8 {
    const READ = 0x1;
    const WRITE = 0x2;
    const EXEC = 0x4;
  }
}

/// Per-chunk bookkeeping.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkState {
  pub in_use: bool,
  /// Whether the chunk physically preceding this one is live.
  pub prev_in_use: bool,
  /// Chunk came from a dedicated mapping instead of heap growth.
  pub mapped: bool,
  pub permission: Permission,
  /// Bin chain the chunk is threaded on.
  pub bin: u8,
}

/// Header placed in front of every payload.
#[repr(C)]
pub struct ChunkHeader {
  /// Total bytes of the chunk, header included.
  pub size: usize,
  pub state: ChunkState,
  pub forward: Option<NonNull<ChunkHeader>>,
  pub backward: Option<NonNull<ChunkHeader>>,
}

pub const HEADER_SIZE: usize = mem::size_of::<ChunkHeader>();

/// Trailing word in which a free chunk repeats its size.
pub const FOOTER_SIZE: usize = mem::size_of::<usize>();

impl ChunkHeader {
  pub fn new(
    size: usize,
    state: ChunkState,
  ) -> Self {
    Self {
      size,
      state,
      forward: None,
      backward: None,
    }
  }

  /// Payload area of `chunk`.
  pub fn payload(chunk: NonNull<ChunkHeader>) -> NonNull<u8> {
    // SAFETY: every chunk is at least MIN_CHUNK_SIZE bytes, so the payload
    // start stays inside the chunk's allocation.
    unsafe { chunk.cast::<u8>().add(HEADER_SIZE) }
  }

  /// Header of the chunk whose payload starts at `payload`.
  ///
  /// Returns `None` if the address cannot be a payload at all: too low to
  /// have a header in front of it, or misaligned.
  pub fn from_payload(payload: NonNull<u8>) -> Option<NonNull<ChunkHeader>> {
    let addr = payload.as_ptr() as usize;
    if addr % crate::align::CHUNK_ALIGNMENT != 0 {
      return None;
    }
    let header = addr.checked_sub(HEADER_SIZE)?;
    NonNull::new(header as *mut ChunkHeader)
  }

  /// First byte past the chunk.
  pub fn end(&self) -> usize {
    self as *const Self as usize + self.size
  }

  /// Copies the chunk's size into its last word, where the chunk physically
  /// following it looks when `prev_in_use` is clear.
  ///
  /// # Safety
  ///
  /// `chunk` must point at a live, free header whose last word is
  /// writable.
  pub unsafe fn write_footer(chunk: NonNull<ChunkHeader>) {
    let header = unsafe { chunk.as_ref() };
    let footer = (header.end() - FOOTER_SIZE) as *mut usize;
    unsafe { footer.write(header.size) };
  }
}

/// Snapshot of a chunk, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
  pub addr: usize,
  pub size: usize,
  pub in_use: bool,
  pub prev_in_use: bool,
  pub mapped: bool,
  pub permission: Permission,
  pub bin: usize,
}

impl ChunkInfo {
  /// # Safety
  ///
  /// `chunk` must point at a live header.
  pub unsafe fn read(chunk: NonNull<ChunkHeader>) -> Self {
    let header = unsafe { chunk.as_ref() };
    Self {
      addr: chunk.as_ptr() as usize,
      size: header.size,
      in_use: header.state.in_use,
      prev_in_use: header.state.prev_in_use,
      mapped: header.state.mapped,
      permission: header.state.permission,
      bin: header.state.bin as usize,
    }
  }

  /// Payload address of the chunk.
  pub fn payload(&self) -> usize {
    self.addr + HEADER_SIZE
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_header_layout() {
    assert_eq!(HEADER_SIZE % crate::align::CHUNK_ALIGNMENT, 0);
    assert_eq!(
      mem::size_of::<Option<NonNull<ChunkHeader>>>(),
      mem::size_of::<usize>()
    );
  }

  #[test]
  fn test_payload_round_trip() {
    let mut buffer = [0u64; 16];
    let chunk = NonNull::new(buffer.as_mut_ptr().cast::<ChunkHeader>()).unwrap();

    let payload = ChunkHeader::payload(chunk);

    assert_eq!(payload.as_ptr() as usize - chunk.as_ptr() as usize, HEADER_SIZE);
    assert_eq!(ChunkHeader::from_payload(payload), Some(chunk));
  }

  #[test]
  fn test_from_payload_rejects_misaligned() {
    let payload = NonNull::new(0x1003 as *mut u8).unwrap();
    assert_eq!(ChunkHeader::from_payload(payload), None);

    let low = NonNull::new(0x8 as *mut u8).unwrap();
    assert_eq!(ChunkHeader::from_payload(low), None);
  }

  #[test]
  fn test_footer_repeats_size() {
    let mut buffer = [0u64; 8];
    let chunk = NonNull::new(buffer.as_mut_ptr().cast::<ChunkHeader>()).unwrap();

    unsafe {
      chunk.write(ChunkHeader::new(48, ChunkState::default()));
      ChunkHeader::write_footer(chunk);
    }

    assert_eq!(buffer[5], 48);
    assert_eq!(buffer[6], 0);
  }

  #[test]
  fn test_permission_bits() {
    assert_eq!(Permission::from_bits(0x7), Some(Permission::all()));
    assert_eq!(Permission::from_bits(0x8), None);
    assert_eq!(Permission::from_bits(0), Some(Permission::empty()));
  }
}
