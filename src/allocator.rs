use std::{
  io,
  ptr::{self, NonNull},
};

use libc::c_void;
use log::{debug, trace, warn};

use crate::{
  align::{CHUNK_ALIGNMENT, align_checked},
  bins::{self, AllocatorState, Fit, FreeLists},
  chunk::{ChunkHeader, ChunkInfo, ChunkState, HEADER_SIZE, Permission},
  config::{AllocatorConfig, StateBacking},
  error::{AllocError, ErrorCode},
  heap::{HeapMap, HeapSource, ProgramBreak},
  protect::PageGuard,
  shared::SharedSegment,
  size_class::{MIN_CHUNK_SIZE, NUM_BINS, bin_index, chunk_size},
};

/// Where the bin table currently lives.
enum StateHandle {
  Local(Box<AllocatorState>),
  Shared(SharedSegment),
}

impl StateHandle {
  fn open(backing: &StateBacking) -> Result<Self, AllocError> {
    match backing {
      StateBacking::Local => {
        debug!("using process-local bin table");
        Ok(Self::Local(Box::default()))
      }
      StateBacking::Shared { name } => SharedSegment::open_or_create(name).map(Self::Shared),
    }
  }

  fn table(&self) -> &AllocatorState {
    match self {
      Self::Local(state) => state.as_ref(),
      Self::Shared(segment) => segment.state(),
    }
  }

  fn table_mut(&mut self) -> &mut AllocatorState {
    match self {
      Self::Local(state) => state.as_mut(),
      Self::Shared(segment) => segment.state_mut(),
    }
  }
}

/// Maps the state on first use.
fn ensure_state<'a>(
  slot: &'a mut Option<StateHandle>,
  backing: &StateBacking,
) -> Result<&'a mut StateHandle, AllocError> {
  let handle = match slot.take() {
    Some(handle) => handle,
    None => StateHandle::open(backing)?,
  };
  Ok(slot.insert(handle))
}

/// Allocator handing out chunks with their own page protection.
///
/// Chunks are binned by size in a table of [`NUM_BINS`] chains, reused
/// first-fit, split when a reused chunk is larger than needed and merged
/// with free neighbours when released. New chunks are grown from `H`.
pub struct Allocator<H: HeapSource = ProgramBreak> {
  config: AllocatorConfig,
  heap: H,
  map: HeapMap,
  guard: PageGuard,
  state: Option<StateHandle>,
  mapped: Vec<NonNull<ChunkHeader>>,
  last_error: Option<ErrorCode>,
}

impl Allocator<ProgramBreak> {
  pub fn new() -> Self {
    Self::with_config(AllocatorConfig::default())
  }

  pub fn with_config(config: AllocatorConfig) -> Self {
    Self::with_heap(ProgramBreak, config)
  }
}

impl Default for Allocator<ProgramBreak> {
  fn default() -> Self {
    Self::new()
  }
}

impl<H: HeapSource> Allocator<H> {
  pub fn with_heap(
    heap: H,
    config: AllocatorConfig,
  ) -> Self {
    Self {
      guard: PageGuard::new(config.policy),
      config,
      heap,
      map: HeapMap::default(),
      state: None,
      mapped: Vec::new(),
      last_error: None,
    }
  }

  pub fn config(&self) -> &AllocatorConfig {
    &self.config
  }

  /// Maps the allocator state now instead of on the first call.
  pub fn init(&mut self) -> Result<(), AllocError> {
    let result = if self.state.is_some() {
      Err(AllocError::AlreadyInitialized)
    } else {
      ensure_state(&mut self.state, &self.config.backing).map(|_| ())
    };
    if let Err(err) = &result {
      self.record(err);
    }
    result
  }

  pub fn is_initialized(&self) -> bool {
    self.state.is_some()
  }

  /// The shared segment backing the bin table, once mapped.
  pub fn segment(&self) -> Option<&SharedSegment> {
    match &self.state {
      Some(StateHandle::Shared(segment)) => Some(segment),
      _ => None,
    }
  }

  /// Returns at least `size` bytes protected according to `permission`, a
  /// mask of [`Permission`] bits.
  ///
  /// # Safety
  ///
  /// Chunk headers of earlier allocations must not have been overwritten.
  /// With a shared bin table, no other process may mutate the table
  /// during the call.
  pub unsafe fn allocate(
    &mut self,
    size: usize,
    permission: u8,
  ) -> Result<NonNull<u8>, AllocError> {
    let result = unsafe { self.try_allocate(size, permission) };
    if let Err(err) = &result {
      self.record(err);
    }
    result
  }

  /// Releases a chunk returned by [`Allocator::allocate`].
  ///
  /// Null pointers and pointers outside this allocator's heap are rejected
  /// with [`AllocError::InvalidPointer`]. A second free of a chunk that
  /// still heads its bin is reported as [`AllocError::DoubleFree`]; other
  /// stale frees go unnoticed.
  ///
  /// # Safety
  ///
  /// A pointer inside the heap must be a payload this allocator returned.
  /// See also [`Allocator::allocate`].
  pub unsafe fn free(
    &mut self,
    ptr: *mut u8,
  ) -> Result<(), AllocError> {
    let result = unsafe { self.try_free(ptr) };
    if let Err(err) = &result {
      self.record(err);
    }
    result
  }

  /// Code of the most recent failure, if it was not cleared since.
  ///
  /// With a shared bin table this reads the segment's error field, which
  /// any attached process may have written.
  pub fn last_error(&self) -> Option<ErrorCode> {
    self
      .state
      .as_ref()
      .and_then(|handle| ErrorCode::from_raw(handle.table().error_code))
      .or(self.last_error)
  }

  pub fn clear_error(&mut self) {
    self.last_error = None;
    if let Some(handle) = self.state.as_mut() {
      handle.table_mut().error_code = 0;
    }
  }

  /// Chunks on the chain of `bin`, head first.
  pub fn bin_chunks(
    &self,
    bin: usize,
  ) -> Vec<ChunkInfo> {
    match &self.state {
      // SAFETY: chain only follows links into memory this allocator grew.
      Some(handle) if bin < NUM_BINS => unsafe { bins::chain(handle.table(), &self.map, bin) },
      _ => Vec::new(),
    }
  }

  /// Every chunk of the grown heap, in address order.
  pub fn heap_chunks(&self) -> Vec<ChunkInfo> {
    let mut chunks = Vec::new();
    for extent in self.map.extents() {
      let mut addr = extent.start;
      while addr + HEADER_SIZE <= extent.end {
        let Some(chunk) = NonNull::new(addr as *mut ChunkHeader) else {
          break;
        };
        // SAFETY: chunks tile every extent, so addr is a header.
        let info = unsafe { ChunkInfo::read(chunk) };
        if info.size == 0 {
          break;
        }
        chunks.push(info);
        addr += info.size;
      }
    }
    chunks
  }

  /// Chunks served from their own mapping and not yet freed.
  pub fn mapped_chunks(&self) -> Vec<ChunkInfo> {
    self
      .mapped
      .iter()
      // SAFETY: every recorded mapping is still live.
      .map(|&chunk| unsafe { ChunkInfo::read(chunk) })
      .collect()
  }

  /// Current end of the heap source.
  pub fn heap_high_water(&self) -> usize {
    self.heap.high_water()
  }

  fn lists(&mut self) -> Result<FreeLists<'_>, AllocError> {
    let handle = ensure_state(&mut self.state, &self.config.backing)?;
    Ok(FreeLists::new(handle.table_mut(), &mut self.map, &self.guard))
  }

  fn record(
    &mut self,
    err: &AllocError,
  ) {
    let code = err.code();
    trace!("recording error {code:?}: {err}");
    self.last_error = Some(code);
    if let Some(handle) = self.state.as_mut() {
      handle.table_mut().error_code = code.raw();
    }
  }

  unsafe fn try_allocate(
    &mut self,
    size: usize,
    bits: u8,
  ) -> Result<NonNull<u8>, AllocError> {
    ensure_state(&mut self.state, &self.config.backing)?;

    let permission = Permission::from_bits(bits).ok_or(AllocError::InvalidPermission { bits })?;
    let aligned = chunk_size(size)
      .and_then(|aligned| self.guard.chunk_size(aligned))
      .ok_or_else(|| AllocError::HeapAdjust {
        bytes: size,
        source: io::Error::from(io::ErrorKind::InvalidInput),
      })?;

    if self.config.mmap_threshold.is_some_and(|threshold| aligned >= threshold) {
      return unsafe { self.allocate_mapped(aligned, permission) };
    }

    let bin = bin_index(aligned);
    let fit = unsafe { self.lists()?.first_fit(bin, aligned) };
    let chunk = match fit {
      Fit::Reuse(chunk) => {
        trace!("bin {bin}: reusing {chunk:p} for {aligned} bytes");
        unsafe { self.reuse(chunk, aligned, permission)? };
        chunk
      }
      Fit::Grow { tail } => unsafe { self.grow(bin, tail, aligned, permission)? },
    };

    Ok(ChunkHeader::payload(chunk))
  }

  /// Hands out a free chunk, splitting off what the request doesn't need.
  unsafe fn reuse(
    &mut self,
    chunk: NonNull<ChunkHeader>,
    aligned: usize,
    permission: Permission,
  ) -> Result<(), AllocError> {
    let mut lists = self.lists()?;

    let leftover = unsafe { chunk.as_ref() }.size - aligned;
    if leftover >= MIN_CHUNK_SIZE {
      // SAFETY: the remainder lies inside the donor.
      let remainder = unsafe { chunk.cast::<u8>().add(aligned) }.cast::<ChunkHeader>();
      let state = ChunkState {
        prev_in_use: true,
        ..ChunkState::default()
      };
      unsafe {
        remainder.write(ChunkHeader::new(leftover, state));
        lists.guard.edit(chunk, |h| h.size = aligned)?;
        lists.insert_after(chunk, remainder)?;
        lists.mark_successor(remainder, false)?;
      }
      lists.map.replace_top(chunk, remainder);
      debug!("split {chunk:p}: {aligned} bytes used, {leftover} left at {remainder:p}");
    }

    unsafe {
      lists.guard.edit(chunk, |h| {
        h.state.in_use = true;
        h.state.permission = permission;
      })?;
      lists.mark_successor(chunk, true)?;
    }

    unsafe { self.guard.protect(chunk, permission) }
  }

  /// Grows the heap by one chunk of `aligned` bytes and links it into `bin`.
  unsafe fn grow(
    &mut self,
    bin: usize,
    tail: Option<NonNull<ChunkHeader>>,
    aligned: usize,
    permission: Permission,
  ) -> Result<NonNull<ChunkHeader>, AllocError> {
    let align = self.guard.region_alignment();
    let start = unsafe { self.heap.grow(aligned, align) }.map_err(|source| {
      warn!("failed to grow heap by {aligned} bytes: {source}");
      AllocError::HeapAdjust { bytes: aligned, source }
    })?;
    if aligned < self.guard.page_size() {
      // SAFETY: the region was just grown for this chunk.
      unsafe { ptr::write_bytes(start.as_ptr(), 0, aligned) };
    }

    let predecessor = self.map.extend(start.as_ptr() as usize, aligned);
    let prev_in_use = predecessor.is_none_or(|prev| unsafe { prev.as_ref() }.state.in_use);

    let chunk = start.cast::<ChunkHeader>();
    let state = ChunkState {
      in_use: true,
      prev_in_use,
      mapped: false,
      permission,
      bin: bin as u8,
    };
    unsafe { chunk.write(ChunkHeader::new(aligned, state)) };
    self.map.set_top(chunk);
    debug!("grew heap by {aligned} bytes: chunk {chunk:p} in bin {bin}");

    unsafe { self.lists()?.append(bin, tail, chunk)? };
    unsafe { self.guard.protect(chunk, permission)? };
    // Live chunks come back untouched.
    unsafe { self.lists()?.merge(chunk) }
  }

  /// Serves a chunk from its own anonymous mapping.
  unsafe fn allocate_mapped(
    &mut self,
    aligned: usize,
    permission: Permission,
  ) -> Result<NonNull<u8>, AllocError> {
    let len =
      align_checked(aligned, self.guard.page_size()).ok_or_else(|| AllocError::HeapAdjust {
        bytes: aligned,
        source: io::Error::from(io::ErrorKind::InvalidInput),
      })?;

    // SAFETY: fresh anonymous mapping, no existing memory involved.
    let ptr = unsafe {
      libc::mmap(
        ptr::null_mut(),
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
      )
    };
    if ptr == libc::MAP_FAILED {
      let source = io::Error::last_os_error();
      warn!("failed to map {len} bytes: {source}");
      return Err(AllocError::HeapAdjust { bytes: len, source });
    }
    let Some(chunk) = NonNull::new(ptr.cast::<ChunkHeader>()) else {
      return Err(AllocError::HeapAdjust {
        bytes: len,
        source: io::Error::other("mmap returned null"),
      });
    };

    let state = ChunkState {
      in_use: true,
      prev_in_use: true,
      mapped: true,
      permission,
      bin: bin_index(len) as u8,
    };
    unsafe { chunk.write(ChunkHeader::new(len, state)) };
    self.mapped.push(chunk);
    debug!("mapped {len} bytes for chunk {chunk:p}");

    unsafe { self.guard.protect(chunk, permission)? };
    Ok(ChunkHeader::payload(chunk))
  }

  unsafe fn try_free(
    &mut self,
    ptr: *mut u8,
  ) -> Result<(), AllocError> {
    ensure_state(&mut self.state, &self.config.backing)?;

    let Some(payload) = NonNull::new(ptr) else {
      warn!("free of a null pointer");
      return Err(AllocError::InvalidPointer { addr: 0 });
    };
    let mapped = self.mapped.iter().position(|&chunk| ChunkHeader::payload(chunk) == payload);
    if let Some(index) = mapped {
      return unsafe { self.release_mapped(index) };
    }

    let addr = payload.as_ptr() as usize;
    let owned = ChunkHeader::from_payload(payload).filter(|&chunk| self.map.owns(chunk));
    let Some(chunk) = owned else {
      warn!("free of {addr:#x}, which this allocator never returned");
      return Err(AllocError::InvalidPointer { addr });
    };

    let header = unsafe { chunk.as_ref() };
    debug_assert!(
      header.size >= MIN_CHUNK_SIZE && header.size % CHUNK_ALIGNMENT == 0,
      "corrupt chunk header at {chunk:p}: size {}",
      header.size
    );
    debug_assert!(!header.state.mapped, "heap chunk {chunk:p} flagged as mapped");
    let in_use = header.state.in_use;

    let mut lists = self.lists()?;
    if !in_use && lists.table.is_head(chunk) {
      warn!("double free of chunk {chunk:p}");
      return Err(AllocError::DoubleFree { addr });
    }

    unsafe {
      lists.guard.edit(chunk, |h| h.state.in_use = false)?;
      let survivor = lists.merge(chunk)?;
      lists.mark_successor(survivor, false)?;
      lists.rebin(survivor)?;
      trace!("freed {chunk:p}, survivor {survivor:p} ({} bytes)", survivor.as_ref().size);
    }
    Ok(())
  }

  unsafe fn release_mapped(
    &mut self,
    index: usize,
  ) -> Result<(), AllocError> {
    let chunk = self.mapped.swap_remove(index);
    let len = unsafe { chunk.as_ref() }.size;
    let start = chunk.as_ptr() as usize;

    // SAFETY: unmapping exactly the mapping made in allocate_mapped.
    if unsafe { libc::munmap(chunk.as_ptr().cast::<c_void>(), len) } != 0 {
      let source = io::Error::last_os_error();
      warn!("failed to unmap chunk {chunk:p}: {source}");
      self.mapped.push(chunk);
      return Err(AllocError::HeapAdjust { bytes: len, source });
    }
    self.guard.forget(start, start + len);
    debug!("unmapped {len} byte chunk {chunk:p}");
    Ok(())
  }
}

impl<H: HeapSource> Drop for Allocator<H> {
  fn drop(&mut self) {
    for chunk in self.mapped.drain(..) {
      // SAFETY: every recorded mapping is live and owned by us.
      unsafe {
        let len = chunk.as_ref().size;
        libc::munmap(chunk.as_ptr().cast::<c_void>(), len);
      }
    }
  }
}
