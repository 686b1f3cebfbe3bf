use std::{ops::Div, thread};

use hazalloc::allocator::{free, Heap, SizeClass};
use hazalloc::smr;

const ITERATIONS: usize = 1000000;
const THREADS: usize = 4;

static SIZE_CLASS: SizeClass = SizeClass::new(64);
static HEAP: Heap = Heap::new(&SIZE_CLASS);

pub fn main() {
    SIZE_CLASS.init();

    let ths: Vec<_> = (0..THREADS)
        .map(|_| {
            thread::spawn(|| {
                smr::register_thread();

                let start = std::time::Instant::now();
                for round in 0..ITERATIONS {
                    let ptr = HEAP.alloc();
                    unsafe { (ptr as *mut u64).write(round as u64) };
                    assert_eq!(round as u64, unsafe { (ptr as *mut u64).read() });
                    unsafe { free(ptr) };
                }
                let duration = start.elapsed();

                let per_cycle = duration.div(ITERATIONS as u32);

                println!("Duration: {:?} / {}", duration, ITERATIONS);
                println!("Duration-Per-Alloc-Free: {:?}", per_cycle);
            })
        })
        .collect();

    for th in ths {
        th.join().unwrap();
    }

    smr::try_free_all();

    println!("Consistent: {}", HEAP.check_consistency());
    println!("Deferred frees: {}", smr::deferred_frees());
    println!("Delayed-free contended spins: {}", smr::contended_spins());
}
