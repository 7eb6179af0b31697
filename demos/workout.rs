//! Drives a deterministic mixed workload over the allocator and then
//! runs the consistency checker. Run with `RUST_LOG=debug` to see the
//! block-by-block heap dump.

use std::ptr;

use brkalloc::BrkAllocator;

fn main() {
    env_logger::init();

    let mut heap = BrkAllocator::new().expect("failed to reserve the heap segment");

    unsafe {
        let mut slots: Vec<*mut u8> = Vec::new();

        // Grow with a spread of sizes, each block carrying its own tag byte.
        for round in 0..64usize {
            let size = 16 + (round * 37) % 480;
            let p = heap.malloc(size);
            assert!(!p.is_null());
            ptr::write_bytes(p, round as u8, size);
            slots.push(p);
        }

        // Free every other block to fragment the heap.
        for i in (0..slots.len()).step_by(2) {
            heap.free(slots[i]);
            slots[i] = ptr::null_mut();
        }

        // Stretch the survivors; their contents must move with them.
        for i in (1..slots.len()).step_by(2) {
            let size = 16 + (i * 37) % 480;
            let p = heap.realloc(slots[i], size + 64);
            assert!(!p.is_null());
            assert_eq!(i as u8, p.read());
            slots[i] = p;
        }

        for p in slots {
            heap.free(p);
        }
    }

    println!("Heap in use after the workout: {} bytes", heap.heap_size());

    let errors = heap.check(true);
    println!("Checker violations: {errors}");
    assert_eq!(0, errors);
}
