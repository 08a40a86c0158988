//! The bin table in a named POSIX shared-memory segment.
//!
//! ```text
//!   /dev/shm/<name>
//!   ┌──────────────────────────────┬────────────┬─────────────┬─────┐
//!   │ bins[NUM_BINS] (ptr-sized)   │ error: i32 │ init: u8    │ pad │
//!   └──────────────────────────────┴────────────┴─────────────┴─────┘
//! ```
//!
//! The segment carries no lock. Processes attached to the same name race on
//! every bin head; anything beyond diagnostics needs external serialization.

use std::{
  ffi::{CStr, CString},
  io, mem,
  ptr::NonNull,
};

use libc::{c_int, c_void, off_t};
use log::{debug, warn};

use crate::{bins::AllocatorState, error::AllocError};

const SEGMENT_MODE: libc::c_uint = 0o666;

/// A mapping of the shared allocator state. Unmapped on drop; the name
/// itself persists until [`SharedSegment::unlink`].
pub struct SharedSegment {
  name: String,
  state: NonNull<AllocatorState>,
  created: bool,
}

impl SharedSegment {
  /// Bytes the segment occupies.
  pub const SIZE: usize = mem::size_of::<AllocatorState>();

  /// Attaches to the segment `name`, creating and initializing it when it
  /// does not exist yet.
  pub fn open_or_create(name: &str) -> Result<Self, AllocError> {
    let c_name = segment_name(name)?;
    let descriptor = Descriptor::open(name, &c_name)?;
    let created = descriptor.created;

    // SAFETY: fd is an open shared-memory descriptor.
    if unsafe { libc::ftruncate(descriptor.fd, Self::SIZE as off_t) } == -1 {
      let source = descriptor.abandon(&c_name, io::Error::last_os_error());
      warn!("ftruncate of shared segment {name} failed: {source}");
      return Err(AllocError::SegmentSize {
        name: name.to_string(),
        source,
      });
    }

    // SAFETY: mapping the freshly sized segment.
    let ptr = unsafe {
      libc::mmap(
        std::ptr::null_mut(),
        Self::SIZE,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED,
        descriptor.fd,
        0,
      )
    };
    if ptr == libc::MAP_FAILED {
      let source = descriptor.abandon(&c_name, io::Error::last_os_error());
      warn!("mmap of shared segment {name} failed: {source}");
      return Err(AllocError::SegmentMap {
        name: name.to_string(),
        source,
      });
    }

    // The mapping keeps the segment alive without the descriptor.
    drop(descriptor);

    let Some(state) = NonNull::new(ptr.cast::<AllocatorState>()) else {
      return Err(AllocError::SegmentMap {
        name: name.to_string(),
        source: io::Error::other("mmap returned null"),
      });
    };

    let mut segment = Self {
      name: name.to_string(),
      state,
      created,
    };
    if created || segment.state().initialized == 0 {
      segment.state_mut().reset();
    }
    debug!(
      "{} shared segment {name} ({} bytes)",
      if created { "created" } else { "attached to" },
      Self::SIZE
    );

    Ok(segment)
  }

  /// Removes the name `name`. Existing mappings stay valid.
  pub fn unlink(name: &str) -> Result<(), AllocError> {
    let c_name = segment_name(name)?;
    // SAFETY: c_name is a valid NUL-terminated string.
    if unsafe { libc::shm_unlink(c_name.as_ptr()) } == -1 {
      return Err(open_error(name, io::Error::last_os_error()));
    }
    debug!("unlinked shared segment {name}");
    Ok(())
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Whether this handle created the segment rather than attaching to it.
  pub fn created(&self) -> bool {
    self.created
  }

  pub fn state(&self) -> &AllocatorState {
    // SAFETY: the mapping lives as long as self.
    unsafe { self.state.as_ref() }
  }

  pub fn state_mut(&mut self) -> &mut AllocatorState {
    // SAFETY: the mapping lives as long as self. Other processes may write
    // it concurrently; that hazard is the caller's to serialize.
    unsafe { self.state.as_mut() }
  }
}

impl Drop for SharedSegment {
  fn drop(&mut self) {
    // SAFETY: unmapping exactly the mapping created in open_or_create.
    unsafe { libc::munmap(self.state.as_ptr().cast::<c_void>(), Self::SIZE) };
  }
}

/// Open descriptor of a segment, closed on drop.
struct Descriptor {
  fd: c_int,
  created: bool,
}

impl Descriptor {
  /// Opens `name` read-write, creating it when it does not exist yet.
  fn open(
    name: &str,
    c_name: &CStr,
  ) -> Result<Self, AllocError> {
    // SAFETY: c_name is a valid NUL-terminated string.
    let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, SEGMENT_MODE) };
    if fd != -1 {
      return Ok(Self { fd, created: false });
    }

    let source = io::Error::last_os_error();
    if source.raw_os_error() != Some(libc::ENOENT) {
      return Err(open_error(name, source));
    }
    // SAFETY: as above.
    let fd = unsafe {
      libc::shm_open(
        c_name.as_ptr(),
        libc::O_CREAT | libc::O_RDWR,
        SEGMENT_MODE,
      )
    };
    if fd == -1 {
      return Err(open_error(name, io::Error::last_os_error()));
    }
    Ok(Self { fd, created: true })
  }

  /// Gives up on a segment that could not be set up. The name is removed
  /// only if this descriptor created it.
  fn abandon(
    self,
    c_name: &CStr,
    source: io::Error,
  ) -> io::Error {
    if self.created {
      // SAFETY: c_name is a valid NUL-terminated string.
      unsafe { libc::shm_unlink(c_name.as_ptr()) };
    }
    source
  }
}

impl Drop for Descriptor {
  fn drop(&mut self) {
    // SAFETY: fd was opened by Descriptor::open and is closed only here.
    unsafe { libc::close(self.fd) };
  }
}

fn segment_name(name: &str) -> Result<CString, AllocError> {
  CString::new(name).map_err(|err| {
    open_error(
      name,
      io::Error::new(io::ErrorKind::InvalidInput, err),
    )
  })
}

fn open_error(
  name: &str,
  source: io::Error,
) -> AllocError {
  warn!("shm_open of shared segment {name} failed: {source}");
  AllocError::SegmentOpen {
    name: name.to_string(),
    source,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::size_class::NUM_BINS;

  #[test]
  fn test_layout_is_stable() {
    let ptr = mem::size_of::<usize>();

    assert_eq!(mem::offset_of!(AllocatorState, bins), 0);
    assert_eq!(mem::offset_of!(AllocatorState, error_code), NUM_BINS * ptr);
    assert_eq!(mem::offset_of!(AllocatorState, initialized), NUM_BINS * ptr + 4);
    assert_eq!(SharedSegment::SIZE, crate::align!(NUM_BINS * ptr + 5, ptr));
  }

  fn exists(c_name: &CStr) -> bool {
    let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
    if fd == -1 {
      return false;
    }
    unsafe { libc::close(fd) };
    true
  }

  #[test]
  fn test_abandoned_create_removes_the_name() {
    let name = format!("/protalloc-unit-{}-create", std::process::id());
    let c_name = segment_name(&name).unwrap();
    unsafe { libc::shm_unlink(c_name.as_ptr()) };

    let descriptor = Descriptor::open(&name, &c_name).unwrap();
    assert!(descriptor.created);
    assert!(exists(&c_name));

    let source = descriptor.abandon(&c_name, io::Error::other("sizing failed"));
    assert_eq!(source.to_string(), "sizing failed");
    assert!(!exists(&c_name));
  }

  #[test]
  fn test_abandoned_attach_keeps_the_name() {
    let name = format!("/protalloc-unit-{}-attach", std::process::id());
    let c_name = segment_name(&name).unwrap();
    unsafe { libc::shm_unlink(c_name.as_ptr()) };

    let owner = Descriptor::open(&name, &c_name).unwrap();
    let attached = Descriptor::open(&name, &c_name).unwrap();
    assert!(!attached.created);

    attached.abandon(&c_name, io::Error::other("mapping failed"));
    assert!(exists(&c_name));

    owner.abandon(&c_name, io::Error::other("mapping failed"));
    assert!(!exists(&c_name));
  }

  #[test]
  fn test_interior_nul_is_an_open_error() {
    let err = SharedSegment::open_or_create("/bad\0name").err().unwrap();
    assert!(matches!(err, AllocError::SegmentOpen { .. }));
  }
}
