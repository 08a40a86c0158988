//! The bin table and the chains threaded through chunk headers.
//!
//! Every heap chunk sits on exactly one bin chain, linked through its
//! header's `forward`/`backward` pointers. Chunks grown for a bin are
//! appended to that bin's chain, so a chain follows allocation order and
//! holds live chunks next to free ones; first-fit skips the live ones.

use std::ptr::NonNull;

use log::trace;

use crate::{
  chunk::{ChunkHeader, ChunkInfo},
  error::AllocError,
  heap::HeapMap,
  protect::PageGuard,
  size_class::{NUM_BINS, bin_index},
};

/// Bin heads plus the error side channel.
///
/// This exact layout is what the shared segment holds; keep it byte-stable.
#[repr(C)]
pub struct AllocatorState {
  pub bins: [Option<NonNull<ChunkHeader>>; NUM_BINS],
  pub error_code: i32,
  pub initialized: u8,
}

impl AllocatorState {
  pub const fn new() -> Self {
    Self {
      bins: [None; NUM_BINS],
      error_code: 0,
      initialized: 1,
    }
  }

  /// Empties the table and marks it initialized.
  pub fn reset(&mut self) {
    self.bins = [None; NUM_BINS];
    self.error_code = 0;
    self.initialized = 1;
  }

  /// Whether `chunk` is the head of any bin.
  pub fn is_head(
    &self,
    chunk: NonNull<ChunkHeader>,
  ) -> bool {
    self.bins.contains(&Some(chunk))
  }
}

impl Default for AllocatorState {
  fn default() -> Self {
    Self::new()
  }
}

/// Outcome of a first-fit scan.
pub(crate) enum Fit {
  /// A free chunk large enough for the request.
  Reuse(NonNull<ChunkHeader>),
  /// Nothing fits; a new chunk should follow `tail`, or head the bin.
  Grow { tail: Option<NonNull<ChunkHeader>> },
}

/// Mutable view over the bin table and the heap it indexes.
pub(crate) struct FreeLists<'a> {
  pub table: &'a mut AllocatorState,
  pub map: &'a mut HeapMap,
  pub guard: &'a PageGuard,
}

impl<'a> FreeLists<'a> {
  pub fn new(
    table: &'a mut AllocatorState,
    map: &'a mut HeapMap,
    guard: &'a PageGuard,
  ) -> Self {
    Self { table, map, guard }
  }

  /// Scans `bin` for the first free chunk of at least `size` bytes.
  ///
  /// The walk stops at the first chunk outside this process's heap; such
  /// links were published by another process through a shared table.
  ///
  /// # Safety
  ///
  /// Local chunks on the chain must be live.
  pub unsafe fn first_fit(
    &self,
    bin: usize,
    size: usize,
  ) -> Fit {
    let mut tail = None;
    let mut current = self.table.bins[bin];

    while let Some(chunk) = current {
      if !self.map.owns(chunk) {
        trace!("bin {bin}: stopping at foreign chunk {chunk:p}");
        break;
      }
      let header = unsafe { chunk.as_ref() };
      if header.size >= size && !header.state.in_use {
        return Fit::Reuse(chunk);
      }
      tail = Some(chunk);
      current = header.forward;
    }

    Fit::Grow { tail }
  }

  /// Pushes `chunk` onto the head of `bin`.
  ///
  /// # Safety
  ///
  /// `chunk` must be live and on no chain.
  pub unsafe fn insert(
    &mut self,
    bin: usize,
    chunk: NonNull<ChunkHeader>,
  ) -> Result<(), AllocError> {
    let head = self.table.bins[bin].filter(|&head| self.map.owns(head));
    if let Some(head) = head {
      unsafe { self.guard.edit(head, |h| h.backward = Some(chunk))? };
    }
    unsafe {
      self.guard.edit(chunk, |h| {
        h.forward = head;
        h.backward = None;
        h.state.bin = bin as u8;
      })?
    };
    self.table.bins[bin] = Some(chunk);
    Ok(())
  }

  /// Unlinks `chunk` from its chain, moving the bin head past it if it was
  /// the head.
  ///
  /// # Safety
  ///
  /// `chunk` and its chain neighbours must be live.
  pub unsafe fn remove(
    &mut self,
    chunk: NonNull<ChunkHeader>,
  ) -> Result<(), AllocError> {
    let (forward, backward) = {
      let header = unsafe { chunk.as_ref() };
      (header.forward, header.backward)
    };

    match backward {
      Some(prev) => unsafe { self.guard.edit(prev, |h| h.forward = forward)? },
      None => {
        for head in self.table.bins.iter_mut() {
          if *head == Some(chunk) {
            *head = forward;
          }
        }
      }
    }
    if let Some(next) = forward {
      unsafe { self.guard.edit(next, |h| h.backward = backward)? };
    }

    unsafe {
      self.guard.edit(chunk, |h| {
        h.forward = None;
        h.backward = None;
      })?
    };
    Ok(())
  }

  /// Threads `chunk` directly behind `donor`, on the donor's chain.
  ///
  /// # Safety
  ///
  /// Both chunks must be live; `chunk` must be on no chain.
  pub unsafe fn insert_after(
    &mut self,
    donor: NonNull<ChunkHeader>,
    chunk: NonNull<ChunkHeader>,
  ) -> Result<(), AllocError> {
    let (forward, bin) = {
      let header = unsafe { donor.as_ref() };
      (header.forward, header.state.bin)
    };

    if let Some(next) = forward {
      unsafe { self.guard.edit(next, |h| h.backward = Some(chunk))? };
    }
    unsafe {
      self.guard.edit(chunk, |h| {
        h.forward = forward;
        h.backward = Some(donor);
        h.state.bin = bin;
      })?
    };
    unsafe { self.guard.edit(donor, |h| h.forward = Some(chunk))? };
    Ok(())
  }

  /// Links a freshly grown chunk into `bin`: after `tail` when there is
  /// one, as the new head otherwise.
  ///
  /// A head published by another process is replaced, not followed.
  ///
  /// # Safety
  ///
  /// `chunk` and `tail` must be live; `chunk` must be on no chain.
  pub unsafe fn append(
    &mut self,
    bin: usize,
    tail: Option<NonNull<ChunkHeader>>,
    chunk: NonNull<ChunkHeader>,
  ) -> Result<(), AllocError> {
    match tail {
      Some(tail) => unsafe { self.insert_after(tail, chunk) },
      None => {
        unsafe {
          self.guard.edit(chunk, |h| {
            h.forward = None;
            h.backward = None;
            h.state.bin = bin as u8;
          })?
        };
        self.table.bins[bin] = Some(chunk);
        Ok(())
      }
    }
  }

  /// Moves a free chunk to the bin matching its size, if it has outgrown
  /// the chain it sits on. A chunk already in the right bin keeps its place.
  ///
  /// # Safety
  ///
  /// `chunk` and its chain neighbours must be live.
  pub unsafe fn rebin(
    &mut self,
    chunk: NonNull<ChunkHeader>,
  ) -> Result<(), AllocError> {
    let (size, bin) = {
      let header = unsafe { chunk.as_ref() };
      (header.size, header.state.bin as usize)
    };
    let target = bin_index(size);
    if bin == target {
      return Ok(());
    }

    trace!("moving {chunk:p} ({size} bytes) from bin {bin} to bin {target}");
    unsafe {
      self.remove(chunk)?;
      self.insert(target, chunk)
    }
  }

  /// # Safety
  ///
  /// See [`chain`].
  #[cfg(test)]
  pub unsafe fn chain(
    &self,
    bin: usize,
  ) -> Vec<ChunkInfo> {
    unsafe { chain(self.table, self.map, bin) }
  }
}

/// Snapshot of the local part of `bin`'s chain.
///
/// # Safety
///
/// Local chunks on the chain must be live.
pub(crate) unsafe fn chain(
  table: &AllocatorState,
  map: &HeapMap,
  bin: usize,
) -> Vec<ChunkInfo> {
  let mut chunks = Vec::new();
  let mut current = table.bins.get(bin).copied().flatten();
  while let Some(chunk) = current.filter(|&chunk| map.owns(chunk)) {
    chunks.push(unsafe { ChunkInfo::read(chunk) });
    current = unsafe { chunk.as_ref() }.forward;
  }
  chunks
}
