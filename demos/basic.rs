use brkalloc::BrkAllocator;

fn log_alloc(addr: *mut u8, size: usize) {
    println!("Requested {size} bytes of memory");
    println!("Received this address: {addr:?}");
}

fn main() {
    env_logger::init();

    let mut heap = BrkAllocator::new().expect("failed to reserve the heap segment");

    unsafe {
        let a = heap.malloc(64);
        log_alloc(a, 64);

        let b = heap.calloc(8, 16);
        log_alloc(b, 128);

        let a = heap.realloc(a, 256);
        log_alloc(a, 256);

        heap.free(a);
        heap.free(b);
    }

    println!("Heap in use: {} bytes", heap.heap_size());
    println!("Checker violations: {}", heap.check(true));
}
