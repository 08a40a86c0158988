/*
 * shared_segment.rs
 *
 * bin table in a named POSIX shared-memory segment: creation, attachment
 * from a second handle, visibility of bin heads and errors, unlink.
 * every test uses its own segment name.
 */

use std::sync::atomic::{AtomicUsize, Ordering};

use protalloc::{
  AllocError, Allocator, AllocatorConfig, ErrorCode, HEADER_SIZE, NUM_BINS, ReservedHeap,
  SharedSegment,
};

const RW: u8 = 0x3;

/* segment name unlinked again when the test ends */
struct Segment(String);

impl Segment {
  fn unique() -> Self {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    Self(format!("/protalloc-test-{}-{n}", std::process::id()))
  }

  fn allocator(&self) -> Allocator<ReservedHeap> {
    let heap = ReservedHeap::new(1 << 16).expect("reserve heap");
    Allocator::with_heap(heap, AllocatorConfig::shared(self.0.as_str()))
  }
}

impl Drop for Segment {
  fn drop(&mut self) {
    let _ = SharedSegment::unlink(&self.0);
  }
}

#[test]
fn create_then_attach() {
  let name = Segment::unique();

  let mut first = SharedSegment::open_or_create(&name.0).unwrap();
  assert!(first.created());
  assert_eq!(first.name(), name.0);
  assert_eq!(first.state().initialized, 1);
  assert!(first.state().bins.iter().all(Option::is_none));

  first.state_mut().error_code = ErrorCode::DoubleFree.raw();

  let second = SharedSegment::open_or_create(&name.0).unwrap();
  assert!(!second.created());
  assert_eq!(second.state().error_code, ErrorCode::DoubleFree.raw());
}

#[test]
fn state_outlives_handles_until_unlink() {
  let name = Segment::unique();

  {
    let mut segment = SharedSegment::open_or_create(&name.0).unwrap();
    segment.state_mut().error_code = ErrorCode::InvalidPointer.raw();
  }

  let attached = SharedSegment::open_or_create(&name.0).unwrap();
  assert!(!attached.created());
  assert_eq!(attached.state().error_code, ErrorCode::InvalidPointer.raw());
  drop(attached);

  SharedSegment::unlink(&name.0).unwrap();
  let fresh = SharedSegment::open_or_create(&name.0).unwrap();
  assert!(fresh.created());
  assert_eq!(fresh.state().error_code, 0);
}

#[test]
fn second_allocator_sees_bin_heads() {
  let name = Segment::unique();
  let mut first = name.allocator();
  let mut second = name.allocator();

  unsafe {
    let chunk = first.allocate(4, RW).unwrap();
    second.init().unwrap();

    let table = second.segment().unwrap().state();
    let head = table.bins[0].map(|head| head.as_ptr() as usize);
    assert_eq!(head, Some(chunk.as_ptr() as usize - HEADER_SIZE));

    /* The head belongs to another heap: it is reported, never followed. */
    assert!(second.bin_chunks(0).is_empty());
    assert_eq!(first.bin_chunks(0).len(), 1);
  }
}

#[test]
fn foreign_head_is_replaced_on_growth() {
  let name = Segment::unique();
  let mut first = name.allocator();
  let mut second = name.allocator();

  unsafe {
    first.allocate(4, RW).unwrap();
    let mine = second.allocate(4, RW).unwrap();

    assert_eq!(second.bin_chunks(0).len(), 1);
    assert_eq!(second.bin_chunks(0)[0].payload(), mine.as_ptr() as usize);
    assert!(first.bin_chunks(0).is_empty());
    assert!((1..NUM_BINS).all(|bin| second.bin_chunks(bin).is_empty()));
  }
}

#[test]
fn errors_are_published_in_the_segment() {
  let name = Segment::unique();
  let mut first = name.allocator();
  let mut second = name.allocator();

  first.init().unwrap();
  let err = unsafe { second.allocate(16, 0x8) }.unwrap_err();

  assert!(matches!(err, AllocError::InvalidPermission { bits: 0x8 }));
  assert_eq!(first.last_error(), Some(ErrorCode::InvalidPermission));

  first.clear_error();
  assert_eq!(first.last_error(), None);
  assert_eq!(second.segment().unwrap().state().error_code, 0);
}

#[test]
fn bad_segment_name() {
  let mut allocator = Allocator::with_heap(
    ReservedHeap::new(1 << 16).unwrap(),
    AllocatorConfig::shared("/protalloc/nested"),
  );

  let err = unsafe { allocator.allocate(16, RW) }.unwrap_err();
  assert!(matches!(err, AllocError::SegmentOpen { .. }));
  assert_eq!(err.code(), ErrorCode::SegmentOpenFailed);
  assert_eq!(allocator.last_error(), Some(ErrorCode::SegmentOpenFailed));
  assert!(!allocator.is_initialized());

  /* Failure is fatal to the call only. */
  let err = allocator.init().unwrap_err();
  assert!(matches!(err, AllocError::SegmentOpen { .. }));
  assert!(allocator.heap_chunks().is_empty());
}
