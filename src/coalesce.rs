//! Merging of free chunks with their neighbours.
//!
//! One hop in each direction per call, both by address:
//!
//! ```text
//!   forward:  the chunk at `chunk + chunk.size`
//!   backward: the chunk ending at `chunk`, reached through the size it
//!             leaves in its last word while free
//!
//!   ┌────────────────────────┬──────────────────────┐
//!   │ prev (free)     size ──┤ chunk  prev_in_use=0 │
//!   └────────────────────────┴──────────────────────┘
//! ```
//!
//! A merged survivor may move to another bin afterwards; its neighbours
//! still find it, since neither direction follows the bin chains.

use std::ptr::NonNull;

use log::trace;

use crate::{bins::FreeLists, chunk::ChunkHeader, error::AllocError};

impl FreeLists<'_> {
  /// Merges `chunk` with its free neighbours and returns the surviving
  /// chunk. Live chunks are returned untouched.
  ///
  /// Absorbed chunks are unlinked from their chains, so no bin head is left
  /// pointing at one, and must never be dereferenced again.
  ///
  /// # Safety
  ///
  /// `chunk` and its address neighbours must be live, with accurate
  /// `prev_in_use` bits and footers.
  pub unsafe fn merge(
    &mut self,
    chunk: NonNull<ChunkHeader>,
  ) -> Result<NonNull<ChunkHeader>, AllocError> {
    if unsafe { chunk.as_ref() }.state.in_use {
      return Ok(chunk);
    }

    if let Some(next) = unsafe { self.map.successor(chunk) } {
      let neighbour = unsafe { next.as_ref() };
      if !neighbour.state.in_use && !neighbour.state.mapped {
        let size = neighbour.size;
        trace!("merging {next:p} forward into {chunk:p}");
        unsafe { self.remove(next)? };
        unsafe { self.guard.edit(chunk, |h| h.size += size)? };
        self.map.replace_top(next, chunk);
      }
    }

    let Some(prev) = (unsafe { self.map.free_predecessor(chunk) }) else {
      return Ok(chunk);
    };
    let candidate = unsafe { prev.as_ref() };
    if candidate.state.in_use || candidate.end() != chunk.as_ptr() as usize {
      trace!("stale footer in front of {chunk:p}, not merging backward");
      return Ok(chunk);
    }

    let size = unsafe { chunk.as_ref() }.size;
    trace!("merging {chunk:p} backward into {prev:p}");
    unsafe { self.remove(chunk)? };
    unsafe { self.guard.edit(prev, |h| h.size += size)? };
    self.map.replace_top(chunk, prev);

    Ok(prev)
  }

  /// Records on the address successor of `chunk` whether `chunk` is live.
  /// A free chunk also gets its footer, for the successor grown or freed
  /// later to find it.
  ///
  /// # Safety
  ///
  /// `chunk` and its successor must be live. A free `chunk` must be
  /// writable.
  pub unsafe fn mark_successor(
    &mut self,
    chunk: NonNull<ChunkHeader>,
    in_use: bool,
  ) -> Result<(), AllocError> {
    if !in_use {
      unsafe { ChunkHeader::write_footer(chunk) };
    }
    match unsafe { self.map.successor(chunk) } {
      Some(next) => unsafe { self.guard.edit(next, |h| h.state.prev_in_use = in_use) },
      None => Ok(()),
    }
  }
}
