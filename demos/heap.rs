use std::ptr;

use log::{LevelFilter, Log, Metadata, Record};
use tagalloc::{FixedArena, Heap};

/// Prints records to stdout, which is all the verbose heap check needs.
struct StdoutLogger;

impl Log for StdoutLogger {
  fn enabled(
    &self,
    metadata: &Metadata,
  ) -> bool {
    metadata.level() <= log::max_level()
  }

  fn log(
    &self,
    record: &Record,
  ) {
    if self.enabled(record.metadata()) {
      println!("    [{:<5}] {}", record.level(), record.args());
    }
  }

  fn flush(&self) {}
}

static LOGGER: StdoutLogger = StdoutLogger;

/// Prints every block in address order followed by the free list.
fn print_heap(
  label: &str,
  heap: &Heap<FixedArena>,
) {
  let stats = heap.stats();

  println!(
    "\n[{}] heap = {} bytes, {} used / {} free blocks, largest free = {}",
    label, stats.heap_bytes, stats.used_blocks, stats.free_blocks, stats.largest_free
  );

  for block in heap.blocks() {
    println!("    {}", block);
  }

  let free: Vec<_> = heap.free_blocks().map(|b| b.size).collect();
  println!("    free list: {:?}", free);
}

fn print_alloc(
  heap: &Heap<FixedArena>,
  requested: usize,
  addr: *mut u8,
) {
  println!(
    "Allocated {} bytes, address = {:?}, usable = {}, arena break = {:#x}",
    requested,
    addr,
    unsafe { heap.usable_size(addr) },
    heap.arena().used(),
  );
}

fn main() {
  if log::set_logger(&LOGGER).is_ok() {
    log::set_max_level(LevelFilter::Info);
  }

  // A 64 KiB region stands in for the data segment, so the demo does not race
  // the system allocator for the program break.
  let mut heap = Heap::new(FixedArena::with_capacity(64 * 1024).expect("arena"));
  heap.init().expect("init");

  unsafe {
    // --------------------------------------------------------------------
    // 1) Three allocations, carved from fresh arena space.
    // --------------------------------------------------------------------
    let a = heap.allocate(32);
    print_alloc(&heap, 32, a);
    let b = heap.allocate(32);
    print_alloc(&heap, 32, b);
    let c = heap.allocate(32);
    print_alloc(&heap, 32, c);

    ptr::write_bytes(b, 0xAB, 32);
    print_heap("three blocks", &heap);

    // --------------------------------------------------------------------
    // 2) Free the middle block: it has no free neighbour to merge with.
    // --------------------------------------------------------------------
    heap.free(b);
    print_heap("freed b", &heap);

    // --------------------------------------------------------------------
    // 3) Free its left neighbour: the two coalesce.
    // --------------------------------------------------------------------
    heap.free(a);
    print_heap("freed a", &heap);

    // --------------------------------------------------------------------
    // 4) A small request is served from the merged block, best fit, and
    //    the leftover is split off.
    // --------------------------------------------------------------------
    let d = heap.allocate(8);
    print_alloc(&heap, 8, d);
    println!("d == a? {}", d == a);
    print_heap("split", &heap);

    // --------------------------------------------------------------------
    // 5) Grow c: it is the last block, so it moves; then free it and ask
    //    for more than the heap holds. The trailing free block is also the
    //    largest one, so it is extended in place instead of growing a second
    //    block.
    // --------------------------------------------------------------------
    let c = heap.resize(c, 200);
    print_alloc(&heap, 200, c);
    heap.free(c);
    print_heap("freed c", &heap);

    let big = heap.allocate(4096);
    print_alloc(&heap, 4096, big);
    print_heap("extended trailing block", &heap);

    // --------------------------------------------------------------------
    // 6) Zeroed allocation and a final consistency check.
    // --------------------------------------------------------------------
    let z = heap.zero_allocate(16, 4);
    print_alloc(&heap, 64, z);

    heap.free(big);
    heap.free(d);
    heap.free(z);
    print_heap("all freed", &heap);
  }

  println!("\nverbose check:");
  match heap.check(true) {
    Ok(()) => println!("\nheap is consistent"),
    Err(err) => println!("\nheap is corrupted: {} (class {})", err, err.exit_code()),
  }
}
