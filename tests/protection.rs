/*
 * protection.rs
 *
 * page protection as seen from the payload: writes to read-only chunks
 * fault, executable chunks run code. faults are observed in a forked
 * child so the test process survives them.
 */

use std::ptr::NonNull;

use protalloc::{Allocator, AllocatorConfig, Permission, ProtectionPolicy, ReservedHeap};

const READ: u8 = Permission::READ.bits();
const RW: u8 = Permission::READ.bits() | Permission::WRITE.bits();

fn allocator(policy: ProtectionPolicy) -> Allocator<ReservedHeap> {
  let heap = ReservedHeap::new(1 << 20).expect("reserve heap");
  Allocator::with_heap(heap, AllocatorConfig::default().with_policy(policy))
}

/* runs f in a forked child and reports whether it died of a memory fault */
fn faults(f: impl FnOnce()) -> bool {
  unsafe {
    let pid = libc::fork();
    assert!(pid >= 0, "fork failed");
    if pid == 0 {
      f();
      libc::_exit(0);
    }

    let mut status = 0;
    assert_eq!(libc::waitpid(pid, &mut status, 0), pid);
    libc::WIFSIGNALED(status) && matches!(libc::WTERMSIG(status), libc::SIGSEGV | libc::SIGBUS)
  }
}

fn poke(ptr: NonNull<u8>) {
  unsafe { ptr.as_ptr().write_volatile(0x42) };
}

fn peek(ptr: NonNull<u8>) {
  let _ = unsafe { ptr.as_ptr().read_volatile() };
}

/* ============================================================================
 * ReadFloor
 * ============================================================================ */

#[test]
fn read_only_chunk_faults_on_write() {
  let mut allocator = allocator(ProtectionPolicy::ReadFloor);
  let chunk = unsafe { allocator.allocate(16, READ) }.unwrap();

  assert!(!faults(|| peek(chunk)));
  assert!(faults(|| poke(chunk)));
}

#[test]
fn writable_neighbour_of_read_only_chunk() {
  let mut allocator = allocator(ProtectionPolicy::ReadFloor);

  unsafe {
    let read_only = allocator.allocate(16, READ).unwrap();
    let writable = allocator.allocate(16, RW).unwrap();

    poke(writable);
    assert_eq!(*writable.as_ptr(), 0x42);
    assert!(faults(|| poke(read_only)));
  }
}

#[test]
fn freed_read_only_chunk_is_writable_again() {
  let mut allocator = allocator(ProtectionPolicy::ReadFloor);

  unsafe {
    let chunk = allocator.allocate(16, READ).unwrap();
    allocator.free(chunk.as_ptr()).unwrap();
    let reused = allocator.allocate(16, RW).unwrap();

    assert_eq!(reused, chunk);
    assert!(!faults(|| poke(reused)));
    poke(reused);
  }
}

#[test]
fn write_request_keeps_read() {
  let mut allocator = allocator(ProtectionPolicy::ReadFloor);
  let chunk = unsafe { allocator.allocate(16, Permission::WRITE.bits()) }.unwrap();

  poke(chunk);
  assert_eq!(unsafe { chunk.as_ptr().read() }, 0x42);
}

/* ============================================================================
 * ReadWriteFloor
 * ============================================================================ */

#[test]
fn read_request_still_grants_write() {
  let mut allocator = allocator(ProtectionPolicy::ReadWriteFloor);
  let chunk = unsafe { allocator.allocate(16, READ) }.unwrap();

  assert!(!faults(|| poke(chunk)));
  poke(chunk);
}

/* ============================================================================
 * Executable chunks
 * ============================================================================ */

#[cfg(target_arch = "x86_64")]
mod exec {
  use super::*;

  /* nop; nop; mov eax, 0x69; ret */
  const CODE: [u8; 8] = [0x90, 0x90, 0xB8, 0x69, 0x00, 0x00, 0x00, 0xC3];

  unsafe fn emit(
    allocator: &mut Allocator<ReservedHeap>,
    permission: u8,
  ) -> extern "C" fn() -> u32 {
    unsafe {
      let chunk = allocator.allocate(CODE.len(), permission).unwrap();
      chunk.as_ptr().copy_from_nonoverlapping(CODE.as_ptr(), CODE.len());
      std::mem::transmute::<*mut u8, extern "C" fn() -> u32>(chunk.as_ptr())
    }
  }

  #[test]
  fn jit_returns_0x69() {
    let mut allocator = allocator(ProtectionPolicy::ReadWriteFloor);

    let function = unsafe { emit(&mut allocator, Permission::all().bits()) };

    assert_eq!(function(), 0x69);
  }

  #[test]
  fn jit_under_read_floor() {
    let mut allocator = allocator(ProtectionPolicy::ReadFloor);

    let function = unsafe { emit(&mut allocator, Permission::all().bits()) };

    assert_eq!(function(), 0x69);
  }

  #[test]
  fn shared_exec_page_is_not_downgraded() {
    let mut allocator = allocator(ProtectionPolicy::ReadWriteFloor);

    unsafe {
      let function = emit(&mut allocator, Permission::all().bits());
      /* Lands on the same page and asks for R|W only. */
      let data = allocator.allocate(16, RW).unwrap();
      poke(data);

      assert_eq!(function(), 0x69);
    }
  }

  #[test]
  fn data_chunk_does_not_execute() {
    let mut allocator = allocator(ProtectionPolicy::ReadFloor);

    let function = unsafe { emit(&mut allocator, RW) };

    assert!(faults(|| {
      function();
    }));
  }
}
