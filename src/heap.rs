//! Sources of fresh heap memory and the map of what this allocator grew.

use std::{io, ops::Range, ptr::NonNull};

use libc::{c_void, intptr_t, sbrk};
use log::debug;

use crate::{
  chunk::{ChunkHeader, FOOTER_SIZE, HEADER_SIZE},
  size_class::MIN_CHUNK_SIZE,
};

/// Something the allocator can grow its heap from.
pub trait HeapSource {
  /// Extends the heap at its high-water mark by `bytes`, after first padding
  /// the mark up to `align`. Returns the (aligned) start of the new region.
  ///
  /// # Safety
  ///
  /// The returned region is handed to the allocator, which writes chunk
  /// headers into it.
  unsafe fn grow(
    &mut self,
    bytes: usize,
    align: usize,
  ) -> io::Result<NonNull<u8>>;

  /// Current end of the heap.
  fn high_water(&self) -> usize;
}

/// The process heap, grown with `sbrk(2)`.
///
/// Other users of the program break (the system `malloc` among them) may
/// grow it in between, so consecutive regions are not guaranteed to touch.
#[derive(Debug, Default)]
pub struct ProgramBreak;

impl HeapSource for ProgramBreak {
  unsafe fn grow(
    &mut self,
    bytes: usize,
    align: usize,
  ) -> io::Result<NonNull<u8>> {
    let current = self.high_water();
    let pad = crate::align!(current, align) - current;
    let total = bytes
      .checked_add(pad)
      .and_then(|total| intptr_t::try_from(total).ok())
      .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;

    // SAFETY: sbrk only moves the break; failure is reported as -1.
    let previous = unsafe { sbrk(total) };
    if previous == usize::MAX as *mut c_void {
      return Err(io::Error::last_os_error());
    }

    let start = previous as usize + pad;
    NonNull::new(start as *mut u8).ok_or_else(|| io::Error::other("sbrk returned null"))
  }

  fn high_water(&self) -> usize {
    // SAFETY: sbrk(0) only queries the break.
    unsafe { sbrk(0) as usize }
  }
}

/// A private anonymous mapping reserved up front and handed out
/// bump-style.
///
/// It behaves like the program break without sharing it with anyone, and
/// starts page-aligned.
pub struct ReservedHeap {
  base: NonNull<u8>,
  capacity: usize,
  used: usize,
}

impl ReservedHeap {
  pub fn new(capacity: usize) -> io::Result<Self> {
    let capacity = crate::align!(capacity, crate::protect::page_size());
    if capacity == 0 {
      return Err(io::Error::from(io::ErrorKind::InvalidInput));
    }

    // SAFETY: fresh anonymous mapping, no existing memory involved.
    let ptr = unsafe {
      libc::mmap(
        std::ptr::null_mut(),
        capacity,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
      )
    };
    if ptr == libc::MAP_FAILED {
      return Err(io::Error::last_os_error());
    }

    let base =
      NonNull::new(ptr.cast::<u8>()).ok_or_else(|| io::Error::other("mmap returned null"))?;
    debug!("reserved {capacity} byte heap at {base:p}");

    Ok(Self {
      base,
      capacity,
      used: 0,
    })
  }

  pub fn base(&self) -> NonNull<u8> {
    self.base
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }
}

impl HeapSource for ReservedHeap {
  unsafe fn grow(
    &mut self,
    bytes: usize,
    align: usize,
  ) -> io::Result<NonNull<u8>> {
    let base = self.base.as_ptr() as usize;
    let start = crate::align!(base + self.used, align);
    let used = (start - base)
      .checked_add(bytes)
      .filter(|&used| used <= self.capacity)
      .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;

    self.used = used;
    // SAFETY: start lies inside the reservation.
    Ok(unsafe { self.base.add(start - base) })
  }

  fn high_water(&self) -> usize {
    self.base.as_ptr() as usize + self.used
  }
}

impl Drop for ReservedHeap {
  fn drop(&mut self) {
    // SAFETY: unmapping exactly the reservation made in `new`.
    unsafe { libc::munmap(self.base.as_ptr().cast::<c_void>(), self.capacity) };
  }
}

/// Regions the allocator grew, and which chunk currently sits at the top.
#[derive(Debug, Default)]
pub(crate) struct HeapMap {
  extents: Vec<Range<usize>>,
  top: Option<NonNull<ChunkHeader>>,
}

impl HeapMap {
  /// Records a newly grown region.
  ///
  /// Returns the chunk physically preceding it, if the region continues the
  /// last one.
  pub fn extend(
    &mut self,
    start: usize,
    len: usize,
  ) -> Option<NonNull<ChunkHeader>> {
    match self.extents.last_mut() {
      Some(last) if last.end == start => {
        last.end += len;
        self.top
      }
      _ => {
        self.extents.push(start..start + len);
        None
      }
    }
  }

  pub fn set_top(
    &mut self,
    chunk: NonNull<ChunkHeader>,
  ) {
    self.top = Some(chunk);
  }

  /// Moves the top to `survivor` when `absorbed` was the top.
  pub fn replace_top(
    &mut self,
    absorbed: NonNull<ChunkHeader>,
    survivor: NonNull<ChunkHeader>,
  ) {
    if self.top == Some(absorbed) {
      self.top = Some(survivor);
    }
  }

  /// Whether `chunk` has a header inside memory this allocator grew.
  pub fn owns(
    &self,
    chunk: NonNull<ChunkHeader>,
  ) -> bool {
    self.extent_of(chunk.as_ptr() as usize).is_some()
  }

  /// Chunk physically following `chunk`, if its extent continues.
  ///
  /// # Safety
  ///
  /// `chunk` must point at a live header.
  pub unsafe fn successor(
    &self,
    chunk: NonNull<ChunkHeader>,
  ) -> Option<NonNull<ChunkHeader>> {
    let extent = self.extent_of(chunk.as_ptr() as usize)?;
    let next = unsafe { chunk.as_ref() }.end();
    if next + HEADER_SIZE <= extent.end {
      NonNull::new(next as *mut ChunkHeader)
    } else {
      None
    }
  }

  /// Chunk physically preceding `chunk` when that one is free, located
  /// through the size it left in its footer.
  ///
  /// # Safety
  ///
  /// `chunk` must point at a live header whose `prev_in_use` bit is
  /// accurate.
  pub unsafe fn free_predecessor(
    &self,
    chunk: NonNull<ChunkHeader>,
  ) -> Option<NonNull<ChunkHeader>> {
    let addr = chunk.as_ptr() as usize;
    let extent = self.extent_of(addr)?;
    if unsafe { chunk.as_ref() }.state.prev_in_use || addr < extent.start + MIN_CHUNK_SIZE {
      return None;
    }

    let size = unsafe { ((addr - FOOTER_SIZE) as *const usize).read() };
    if size < MIN_CHUNK_SIZE {
      return None;
    }
    let start = addr.checked_sub(size).filter(|&start| start >= extent.start)?;
    NonNull::new(start as *mut ChunkHeader)
  }

  pub fn extents(&self) -> &[Range<usize>] {
    &self.extents
  }

  fn extent_of(
    &self,
    addr: usize,
  ) -> Option<&Range<usize>> {
    self
      .extents
      .iter()
      .find(|extent| extent.start <= addr && addr + HEADER_SIZE <= extent.end)
  }
}
