use std::{collections::BTreeSet, io, ptr::NonNull, sync::OnceLock};

use libc::c_int;
use log::{trace, warn};

use crate::{
  align::{CHUNK_ALIGNMENT, align_checked, page_floor},
  chunk::{ChunkHeader, ChunkState, HEADER_SIZE, Permission},
  config::ProtectionPolicy,
  error::AllocError,
};

const FALLBACK_PAGE_SIZE: usize = 4096;

/// OS page size, queried once.
pub fn page_size() -> usize {
  static CACHED: OnceLock<usize> = OnceLock::new();
  *CACHED.get_or_init(|| {
    // SAFETY: sysconf has no preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    match usize::try_from(raw) {
      Ok(size) if size.is_power_of_two() => size,
      _ => {
        warn!(
          "sysconf(_SC_PAGESIZE) returned {raw}, assuming {FALLBACK_PAGE_SIZE}"
        );
        FALLBACK_PAGE_SIZE
      }
    }
  })
}

/// Turns chunk permissions into page protection.
pub(crate) struct PageGuard {
  policy: ProtectionPolicy,
  page_size: usize,
  /// Pages made executable under the read-write floor. Those pages may
  /// hold several chunks, so they are never downgraded again.
  exec_pages: BTreeSet<usize>,
}

impl PageGuard {
  pub fn new(policy: ProtectionPolicy) -> Self {
    Self {
      policy,
      page_size: page_size(),
      exec_pages: BTreeSet::new(),
    }
  }

  pub fn page_size(&self) -> usize {
    self.page_size
  }

  /// Alignment a fresh heap region must start on.
  pub fn region_alignment(&self) -> usize {
    match self.policy {
      ProtectionPolicy::ReadWriteFloor => CHUNK_ALIGNMENT,
      ProtectionPolicy::ReadFloor => self.page_size,
    }
  }

  /// Rounds an aligned chunk size to what the policy needs.
  pub fn chunk_size(
    &self,
    aligned: usize,
  ) -> Option<usize> {
    match self.policy {
      ProtectionPolicy::ReadWriteFloor => Some(aligned),
      ProtectionPolicy::ReadFloor => align_checked(aligned, self.page_size),
    }
  }

  pub fn flags(
    &self,
    permission: Permission,
  ) -> c_int {
    match self.policy {
      ProtectionPolicy::ReadWriteFloor => {
        if permission.contains(Permission::EXEC) {
          libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC
        } else {
          libc::PROT_READ | libc::PROT_WRITE
        }
      }
      ProtectionPolicy::ReadFloor => {
        let mut flags = libc::PROT_READ;
        if permission.contains(Permission::WRITE) {
          flags |= libc::PROT_WRITE;
        }
        if permission.contains(Permission::EXEC) {
          flags |= libc::PROT_EXEC;
        }
        flags
      }
    }
  }

  /// Applies `permission` to every page the chunk touches.
  ///
  /// # Safety
  ///
  /// `chunk` must point at a live header whose pages belong to this
  /// allocator.
  pub unsafe fn protect(
    &mut self,
    chunk: NonNull<ChunkHeader>,
    permission: Permission,
  ) -> Result<(), AllocError> {
    let addr = chunk.as_ptr() as usize;
    let size = unsafe { chunk.as_ref() }.size;
    let start = page_floor(addr, self.page_size);
    let end = crate::align!(addr + size, self.page_size);

    let mut flags = self.flags(permission);
    if self.policy == ProtectionPolicy::ReadWriteFloor {
      if flags & libc::PROT_EXEC != 0 {
        self.exec_pages.extend((start..end).step_by(self.page_size));
      } else if self.exec_pages.range(start..end).next().is_some() {
        flags |= libc::PROT_EXEC;
      }
    }

    unsafe { self.mprotect(start, end, flags) }
  }

  /// Drops the executable-page records of a range that was unmapped.
  pub fn forget(
    &mut self,
    start: usize,
    end: usize,
  ) {
    self.exec_pages.retain(|&page| page < start || page >= end);
  }

  /// Runs `f` on the chunk's header, lifting a read-only protection around
  /// the write when the policy put one there.
  ///
  /// A chunk that stops being read-only inside `f` (it was freed) is left
  /// writable across its whole extent.
  ///
  /// # Safety
  ///
  /// `chunk` must point at a live header of this allocator.
  pub unsafe fn edit<R>(
    &self,
    chunk: NonNull<ChunkHeader>,
    f: impl FnOnce(&mut ChunkHeader) -> R,
  ) -> Result<R, AllocError> {
    let header = chunk.as_ptr();

    let before = unsafe { (*header).state };
    if !self.read_only(before) {
      return Ok(f(unsafe { &mut *header }));
    }

    let addr = header as usize;
    let start = page_floor(addr, self.page_size);
    let header_end = crate::align!(addr + HEADER_SIZE, self.page_size);
    trace!("unlocking header page of read-only chunk {addr:#x}");
    unsafe { self.mprotect(start, header_end, libc::PROT_READ | libc::PROT_WRITE)? };

    let result = f(unsafe { &mut *header });

    let after = unsafe { (*header).state };
    if self.read_only(after) {
      unsafe { self.mprotect(start, header_end, self.flags(after.permission))? };
    } else {
      let end = crate::align!(addr + unsafe { (*header).size }, self.page_size);
      unsafe { self.mprotect(start, end, libc::PROT_READ | libc::PROT_WRITE)? };
    }

    Ok(result)
  }

  fn read_only(
    &self,
    state: ChunkState,
  ) -> bool {
    self.policy == ProtectionPolicy::ReadFloor
      && state.in_use
      && !state.permission.contains(Permission::WRITE)
  }

  unsafe fn mprotect(
    &self,
    start: usize,
    end: usize,
    flags: c_int,
  ) -> Result<(), AllocError> {
    // SAFETY: callers only pass page-aligned ranges of memory this
    // allocator grew or mapped.
    let rc = unsafe { libc::mprotect(start as *mut libc::c_void, end - start, flags) };
    if rc != 0 {
      let source = io::Error::last_os_error();
      warn!("mprotect({start:#x}..{end:#x}, {flags:#x}) failed: {source}");
      return Err(AllocError::PermissionSet { start, end, source });
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_page_size_is_power_of_two() {
    assert!(page_size().is_power_of_two());
    assert!(page_size() >= FALLBACK_PAGE_SIZE / 4);
  }

  #[test]
  fn test_read_write_floor_flags() {
    let guard = PageGuard::new(ProtectionPolicy::ReadWriteFloor);
    let rw = libc::PROT_READ | libc::PROT_WRITE;

    assert_eq!(guard.flags(Permission::empty()), rw);
    assert_eq!(guard.flags(Permission::READ), rw);
    assert_eq!(guard.flags(Permission::WRITE), rw);
    assert_eq!(guard.flags(Permission::EXEC), rw | libc::PROT_EXEC);
    assert_eq!(guard.flags(Permission::all()), rw | libc::PROT_EXEC);
  }

  #[test]
  fn test_read_floor_flags() {
    let guard = PageGuard::new(ProtectionPolicy::ReadFloor);

    assert_eq!(guard.flags(Permission::empty()), libc::PROT_READ);
    assert_eq!(guard.flags(Permission::READ), libc::PROT_READ);
    assert_eq!(
      guard.flags(Permission::WRITE),
      libc::PROT_READ | libc::PROT_WRITE
    );
    assert_eq!(
      guard.flags(Permission::READ | Permission::EXEC),
      libc::PROT_READ | libc::PROT_EXEC
    );
  }

  #[test]
  fn test_read_floor_rounds_to_pages() {
    let guard = PageGuard::new(ProtectionPolicy::ReadFloor);
    let page = guard.page_size();

    assert_eq!(guard.chunk_size(40), Some(page));
    assert_eq!(guard.chunk_size(page + 8), Some(2 * page));
    assert_eq!(guard.region_alignment(), page);

    let floor = PageGuard::new(ProtectionPolicy::ReadWriteFloor);
    assert_eq!(floor.chunk_size(40), Some(40));
    assert_eq!(floor.region_alignment(), CHUNK_ALIGNMENT);
  }
}
