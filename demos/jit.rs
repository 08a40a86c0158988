//! Emits a tiny x86-64 function into an executable chunk and calls it.

#[cfg(target_arch = "x86_64")]
use protalloc::{Allocator, Permission};

/// `nop; nop; mov eax, 0x69; ret`
const CODE: [u8; 8] = [0x90, 0x90, 0xB8, 0x69, 0x00, 0x00, 0x00, 0xC3];

#[cfg(target_arch = "x86_64")]
fn main() -> Result<(), protalloc::AllocError> {
  let mut allocator = Allocator::new();
  let rwx = Permission::all().bits();

  unsafe {
    let chunk = allocator.allocate(CODE.len(), rwx)?;
    chunk.as_ptr().copy_from_nonoverlapping(CODE.as_ptr(), CODE.len());

    let function: extern "C" fn() -> u32 = std::mem::transmute(chunk.as_ptr());
    println!("function at {:?} returned {:#x}", chunk, function());

    allocator.free(chunk.as_ptr())?;
  }

  Ok(())
}

#[cfg(not(target_arch = "x86_64"))]
fn main() {
  eprintln!("this demo emits x86-64 code: {CODE:02x?}");
}
