use std::{io::Read, ptr};

use libc::sbrk;
use protalloc::{Allocator, ChunkInfo, NUM_BINS, Permission};

/// Waits until the user presses ENTER.
/// Useful when you want to inspect memory state with tools like `pmap`, `htop`,
/// `gdb`, or just visually track how allocations change the program break.
fn block_until_enter_pressed() {
  println!("\n>>> Press ENTER to continue...");
  let _ = std::io::stdin().bytes().next();
}

/// Prints the current program break using `sbrk(0)`.
unsafe fn print_program_break(label: &str) {
  println!(
    "[{}] PID = {}, program break (sbrk(0)) = {:?}",
    label,
    std::process::id(),
    unsafe { sbrk(0) },
  );
}

fn print_alloc(
  size: usize,
  addr: *mut u8,
) {
  println!(
    "Allocated {} bytes, address = {:?}, program break = {:?}",
    size,
    addr,
    unsafe { sbrk(0) }
  );
}

fn print_chunk(info: &ChunkInfo) {
  println!(
    "    {:#x}  size {:>5}  {:<4}  bin {:>2}  {:?}",
    info.addr,
    info.size,
    if info.in_use { "used" } else { "free" },
    info.bin,
    info.permission,
  );
}

/// Dumps the heap in address order, then every non-empty bin chain.
fn print_heap(allocator: &Allocator) {
  println!("  heap:");
  allocator.heap_chunks().iter().for_each(print_chunk);
  for bin in 0..NUM_BINS {
    let chain = allocator.bin_chunks(bin);
    if !chain.is_empty() {
      println!("  bins[{bin}]:");
      chain.iter().for_each(print_chunk);
    }
  }
}

fn main() -> Result<(), protalloc::AllocError> {
  let mut allocator = Allocator::new();
  let rw = (Permission::READ | Permission::WRITE).bits();

  unsafe {
    // Initial heap state
    print_program_break("start");
    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 1) Allocate space for a u32. The chunk also holds a 32 byte header.
    // --------------------------------------------------------------------
    let first_block = allocator.allocate(4, rw)?;
    println!("\n[1] Allocate u32");
    print_alloc(4, first_block.as_ptr());

    let first_ptr = first_block.cast::<u32>().as_ptr();
    first_ptr.write(0xDEADBEEF);
    println!("[1] Value written to first_block = 0x{:X}", first_ptr.read());
    print_heap(&allocator);

    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 2) Allocate 12 bytes and a u64. All three land in bin 0, appended to
    //    its chain in allocation order.
    // --------------------------------------------------------------------
    let second_block = allocator.allocate(12, rw)?;
    ptr::write_bytes(second_block.as_ptr(), 0xAB, 12);
    let third_block = allocator.allocate(8, rw)?;
    println!("\n[2] Allocate [u8; 12] and u64");
    print_alloc(12, second_block.as_ptr());
    print_alloc(8, third_block.as_ptr());
    println!(
      "[2] Address = {:#X}, addr % 8 = {}",
      third_block.as_ptr() as usize,
      third_block.as_ptr() as usize % 8
    );
    print_heap(&allocator);

    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 3) Free the first block, then allocate 2 bytes. The freed chunk heads
    //    bin 0 and is reused without moving the break.
    // --------------------------------------------------------------------
    allocator.free(first_block.as_ptr())?;
    println!("\n[3] Freed first_block at {:?}", first_block);
    print_program_break("before reuse");

    let fourth_block = allocator.allocate(2, rw)?;
    print_alloc(2, fourth_block.as_ptr());
    println!(
      "[3] fourth_block == first_block? {}",
      if fourth_block == first_block {
        "Yes, it reused the freed block"
      } else {
        "No, it allocated somewhere else"
      }
    );
    print_program_break("after reuse");

    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 4) Free the middle block, then its neighbours. Forward and backward
    //    merges fold the three chunks into one.
    // --------------------------------------------------------------------
    allocator.free(second_block.as_ptr())?;
    allocator.free(fourth_block.as_ptr())?;
    allocator.free(third_block.as_ptr())?;
    println!("\n[4] Freed all three small blocks");
    print_heap(&allocator);

    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 5) Allocate a large block to observe heap growth.
    // --------------------------------------------------------------------
    print_program_break("before large alloc");

    let big_block = allocator.allocate(64 * 1024, rw)?;
    println!("\n[5] Allocate large 64 KiB block");
    print_alloc(64 * 1024, big_block.as_ptr());

    print_program_break("after large alloc");
    print_heap(&allocator);
    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 6) End of demo. The break is never lowered again; the OS reclaims
    //    everything when the process exits.
    // --------------------------------------------------------------------
    println!("\n[6] End of example. Process will exit and the OS will reclaim all memory.");
  }

  Ok(())
}
