//! # protalloc - A Permission-Aware Memory Allocator
//!
//! This crate provides a user-space allocator whose chunks each carry their
//! own page protection (read, write, execute). Memory comes from the program
//! break (`sbrk`) by default, is handed out through size-classed free lists
//! and is merged back together when released. That makes it usable for
//! things like emitting machine code at runtime and calling it.
//!
//! ## Overview
//!
//! Every chunk starts with a header; the caller gets the payload behind it:
//!
//! ```text
//!   Single Chunk:
//!   ┌──────────────────────────┬─────────────────────────────────┐
//!   │      Chunk Header        │            Payload              │
//!   │  ┌────────────────────┐  │                                 │
//!   │  │ size (incl. header)│  │  ┌───────────────────────────┐  │
//!   │  │ in_use, prev_in_use│  │  │                           │  │
//!   │  │ mapped, permission │  │  │  >= requested bytes,      │  │
//!   │  │ bin                │  │  │  protected R / RW / RWX   │  │
//!   │  │ forward, backward  │  │  │                           │  │
//!   │  └────────────────────┘  │  └───────────────────────────┘  │
//!   │        32 bytes          │                                 │
//!   └──────────────────────────┴─────────────────────────────────┘
//!                              ▲
//!                              └── Pointer returned to user
//! ```
//!
//! Chunks tile the heap with no gaps: the next chunk always starts at
//! `chunk + chunk.size`. Each one is also threaded on one of sixteen bin
//! chains, picked by size:
//!
//! ```text
//!   Bin Table:
//!
//!   bins[0]  ──▶ [ 40 ] ◀──▶ [ 80 ] ◀──▶ [ 40 ]         sizes    0..128
//!   bins[1]  ──▶ [232 ]                                  sizes  128..256
//!     ...
//!   bins[15] ──▶ [2064] ◀──▶ [4096] ◀──▶ ...             sizes 1920..
//!
//!   forward ──▶   ◀── backward
//! ```
//!
//! - **allocate** scans the request's bin first-fit, splits an oversized
//!   free chunk, or grows the heap and appends a new chunk to the chain.
//! - **free** clears the chunk's in-use bit and merges it one hop forward
//!   (its address successor) and one hop backward (its address
//!   predecessor, found through the size a free chunk keeps in its last
//!   word), then moves the survivor to the bin its new size belongs to.
//!
//! ## Crate Structure
//!
//! ```text
//!   protalloc
//!   ├── align       - Alignment macro and helpers (align!)
//!   ├── size_class  - Chunk sizes and bin indices
//!   ├── chunk       - Chunk header, Permission bits, ChunkInfo snapshots
//!   ├── bins        - Bin table and chain operations (internal)
//!   ├── coalesce    - Merging of free neighbours (internal)
//!   ├── heap        - Heap sources: ProgramBreak, ReservedHeap
//!   ├── protect     - Permission to mprotect translation
//!   ├── shared      - Bin table in a POSIX shared-memory segment
//!   ├── config      - AllocatorConfig
//!   ├── error       - AllocError and the numeric ErrorCode side channel
//!   └── allocator   - Allocator
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use protalloc::{Allocator, Permission};
//!
//! fn main() -> Result<(), protalloc::AllocError> {
//!     let mut allocator = Allocator::new();
//!     let rw = (Permission::READ | Permission::WRITE).bits();
//!
//!     unsafe {
//!         let ptr = allocator.allocate(8, rw)?.cast::<u64>();
//!         ptr.write(42);
//!         println!("Value: {}", ptr.read());
//!
//!         allocator.free(ptr.as_ptr().cast())?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Errors
//!
//! Every failing call returns an [`AllocError`] and also records its
//! [`ErrorCode`], readable through [`Allocator::last_error`]. With a shared
//! bin table the code lands in the segment's error field as well.
//!
//! ## Protection Policies
//!
//! ```text
//!   requested     ReadWriteFloor (default)    ReadFloor
//!   ─────────     ────────────────────────    ─────────
//!   R             R|W                         R
//!   R|W           R|W                         R|W
//!   R|X           R|W|X                       R|X
//!   R|W|X         R|W|X                       R|W|X
//! ```
//!
//! Under `ReadWriteFloor` chunks share pages, so protection is only as fine
//! as a page and a page once made executable stays executable. `ReadFloor`
//! rounds every chunk to whole pages so a read-only chunk really faults on
//! write.
//!
//! ## Limitations
//!
//! - **Single-threaded only**: no synchronization primitives
//! - **Shared mode is unlocked**: processes attached to one segment race on
//!   its bin heads
//! - **Partial double-free detection**: only a chunk that still heads its
//!   bin is caught
//! - **No rollback**: a protection failure leaves the chunk marked in use
//! - **Unix-only**: requires `libc`, `sbrk`, `mprotect` and `shm_open`
//!
//! ## Safety
//!
//! This crate is inherently unsafe as it deals with raw memory management.
//! All allocation and deallocation operations require `unsafe` blocks.

pub mod align;
mod allocator;
mod bins;
mod chunk;
mod coalesce;
mod config;
mod error;
mod heap;
mod protect;
mod shared;
pub mod size_class;

pub use allocator::Allocator;
pub use bins::AllocatorState;
pub use chunk::{ChunkHeader, ChunkInfo, ChunkState, HEADER_SIZE, Permission};
pub use config::{AllocatorConfig, DEFAULT_SEGMENT_NAME, ProtectionPolicy, StateBacking};
pub use error::{AllocError, ErrorCode};
pub use heap::{HeapSource, ProgramBreak, ReservedHeap};
pub use protect::page_size;
pub use shared::SharedSegment;
pub use size_class::{BIN_INCREMENT, MIN_CHUNK_SIZE, NUM_BINS, bin_index, chunk_size};
