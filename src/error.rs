use std::io;

use thiserror::Error;

/// Integer codes published through the error side channel.
///
/// The values are part of the shared segment's contract. Don't renumber.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
  AlreadyInitialized = 0x11,
  SegmentOpenFailed = 0x15,
  SegmentSizeFailed = 0x16,
  SegmentMapFailed = 0x17,
  InvalidPermission = 0x51,
  PermissionSetFailed = 0x52,
  HeapAdjustFailed = 0x55,
  DoubleFree = 0x69,
  InvalidPointer = 0x70,
}

impl ErrorCode {
  /// Decodes a raw side-channel value. `0` means no error.
  pub fn from_raw(raw: i32) -> Option<Self> {
    Some(match raw {
      0x11 => Self::AlreadyInitialized,
      0x15 => Self::SegmentOpenFailed,
      0x16 => Self::SegmentSizeFailed,
      0x17 => Self::SegmentMapFailed,
      0x51 => Self::InvalidPermission,
      0x52 => Self::PermissionSetFailed,
      0x55 => Self::HeapAdjustFailed,
      0x69 => Self::DoubleFree,
      0x70 => Self::InvalidPointer,
      _ => return None,
    })
  }

  pub fn raw(self) -> i32 {
    self as i32
  }
}

#[derive(Debug, Error)]
pub enum AllocError {
  #[error("invalid pointer {addr:#x}")]
  InvalidPointer { addr: usize },

  #[error("double free of chunk at {addr:#x}")]
  DoubleFree { addr: usize },

  #[error("permission bits {bits:#x} outside READ|WRITE|EXEC")]
  InvalidPermission { bits: u8 },

  #[error("failed to adjust heap by {bytes} bytes")]
  HeapAdjust {
    bytes: usize,
    #[source]
    source: io::Error,
  },

  #[error("failed to set protection on {start:#x}..{end:#x}")]
  PermissionSet {
    start: usize,
    end: usize,
    #[source]
    source: io::Error,
  },

  #[error("failed to open shared segment {name}")]
  SegmentOpen {
    name: String,
    #[source]
    source: io::Error,
  },

  #[error("failed to size shared segment {name}")]
  SegmentSize {
    name: String,
    #[source]
    source: io::Error,
  },

  #[error("failed to map shared segment {name}")]
  SegmentMap {
    name: String,
    #[source]
    source: io::Error,
  },

  #[error("allocator state already initialized")]
  AlreadyInitialized,
}

impl AllocError {
  pub fn code(&self) -> ErrorCode {
    match self {
      Self::InvalidPointer { .. } => ErrorCode::InvalidPointer,
      Self::DoubleFree { .. } => ErrorCode::DoubleFree,
      Self::InvalidPermission { .. } => ErrorCode::InvalidPermission,
      Self::HeapAdjust { .. } => ErrorCode::HeapAdjustFailed,
      Self::PermissionSet { .. } => ErrorCode::PermissionSetFailed,
      Self::SegmentOpen { .. } => ErrorCode::SegmentOpenFailed,
      Self::SegmentSize { .. } => ErrorCode::SegmentSizeFailed,
      Self::SegmentMap { .. } => ErrorCode::SegmentMapFailed,
      Self::AlreadyInitialized => ErrorCode::AlreadyInitialized,
    }
  }
}
