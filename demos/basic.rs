use brkheap::{Heap, print_all_blocks, print_heap};

fn log_alloc(addr: *mut u8, size: usize) {
    println!("Requested {} bytes of memory", size);
    println!("Received this address: {addr:?}");
}

fn main() {
    let mut heap = Heap::new();

    let test = heap.allocate(123).unwrap();
    log_alloc(test.as_ptr(), 123);

    let long = heap.allocate(size_of::<u64>()).unwrap();
    log_alloc(long.as_ptr(), size_of::<u64>());

    let char = heap.allocate(size_of::<u8>()).unwrap();
    log_alloc(char.as_ptr(), size_of::<u8>());

    print_heap(&heap);

    unsafe {
        heap.release(test.as_ptr());
        print_heap(&heap);

        let test = heap.reallocate(char.as_ptr(), 64).unwrap();
        println!("Grew the last allocation in place: {}", test == char);
        print_all_blocks(&heap);

        heap.release(long.as_ptr());
        heap.release(test.as_ptr());
    }

    print_heap(&heap);
}
