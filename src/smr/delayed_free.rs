//! The delayed-free buffer, an unordered multi-producer multi-consumer bag
//! of objects whose reclamation had to be postponed
//!
//! Storage is a linked list of page-sized chunks that grows on demand and
//! never shrinks. Every cell runs through a small state machine:
//! FREE -> BUSY -> USED while a producer fills it and
//! USED -> BUSY -> FREE while a consumer moves the item back out. A BUSY
//! cell is only ever held across a handful of instructions, so the waiting
//! side simply spins.
//!
//! Cell indices are claimed directly from the fill counter, producers
//! fetch-add it forwards and consumers CAS it backwards, which makes the
//! buffer LIFO-ish and keeps every claimed index matched to exactly one
//! producer and at most one consumer.

use crate::os;

use std::{cell::UnsafeCell, mem::MaybeUninit, sync::atomic};

const STATE_FREE: u32 = 0;
const STATE_USED: u32 = 1;
const STATE_BUSY: u32 = 2;

/// One parked reclamation
#[derive(Clone, Copy)]
pub(super) struct DelayedItem {
    pub ptr: *mut (),
    pub free_fn: super::FreeFn,
}

struct Entry {
    state: atomic::AtomicU32,
    item: UnsafeCell<MaybeUninit<DelayedItem>>,
}

/// Chunks are carved out of one page each, fresh from the OS and therefore
/// zeroed, which makes every cell start out as STATE_FREE
const CHUNK_BYTES: usize = 4096;
const CHUNK_HEADER: usize = std::mem::size_of::<usize>();
const ENTRIES_PER_CHUNK: usize = (CHUNK_BYTES - CHUNK_HEADER) / std::mem::size_of::<Entry>();

#[repr(C)]
struct Chunk {
    next: atomic::AtomicPtr<Chunk>,
    entries: [Entry; ENTRIES_PER_CHUNK],
}

static CHUNK_LIST: atomic::AtomicPtr<Chunk> = atomic::AtomicPtr::new(std::ptr::null_mut());
/// The fill counter, doubles as the index source for producers
static NUM_USED_ENTRIES: atomic::AtomicUsize = atomic::AtomicUsize::new(0);
static CONTENDED_SPINS: atomic::AtomicU64 = atomic::AtomicU64::new(0);

fn alloc_chunk() -> *mut Chunk {
    os::alloc(CHUNK_BYTES, true) as *mut Chunk
}

unsafe fn free_chunk(chunk: *mut Chunk) {
    unsafe { os::free(chunk as *mut u8, CHUNK_BYTES) };
}

/// Walks (and if needed grows) the chunk list up to the chunk holding the
/// given index
///
/// Publication of fresh chunks pairs a release CAS with the acquire loads
/// here, so a claimed index always observes fully initialised storage.
fn get_entry(index: usize) -> &'static Entry {
    let mut chunk_ptr = CHUNK_LIST.load(atomic::Ordering::Acquire);
    if chunk_ptr.is_null() {
        let fresh = alloc_chunk();
        chunk_ptr = match CHUNK_LIST.compare_exchange(
            std::ptr::null_mut(),
            fresh,
            atomic::Ordering::AcqRel,
            atomic::Ordering::Acquire,
        ) {
            Ok(_) => fresh,
            Err(existing) => {
                unsafe { free_chunk(fresh) };
                existing
            }
        };
    }

    let mut index = index;
    loop {
        let chunk = unsafe { &*chunk_ptr };
        if index < ENTRIES_PER_CHUNK {
            return &chunk.entries[index];
        }
        index -= ENTRIES_PER_CHUNK;

        let mut next = chunk.next.load(atomic::Ordering::Acquire);
        if next.is_null() {
            let fresh = alloc_chunk();
            next = match chunk.next.compare_exchange(
                std::ptr::null_mut(),
                fresh,
                atomic::Ordering::AcqRel,
                atomic::Ordering::Acquire,
            ) {
                Ok(_) => fresh,
                Err(existing) => {
                    unsafe { free_chunk(fresh) };
                    existing
                }
            };
        }

        chunk_ptr = next;
    }
}

fn spin() {
    CONTENDED_SPINS.fetch_add(1, atomic::Ordering::Relaxed);
    std::hint::spin_loop();
}

/// Parks the given item in the buffer
pub(super) fn push(item: DelayedItem) {
    let index = NUM_USED_ENTRIES.fetch_add(1, atomic::Ordering::SeqCst);
    let entry = get_entry(index);

    // The cell can still be BUSY or USED while the consumer of a previous
    // round at this index is mid-move, that clears up on its own
    while entry
        .state
        .compare_exchange(
            STATE_FREE,
            STATE_BUSY,
            atomic::Ordering::Acquire,
            atomic::Ordering::Relaxed,
        )
        .is_err()
    {
        spin();
    }

    unsafe { (*entry.item.get()).as_mut_ptr().write(item) };
    entry.state.store(STATE_USED, atomic::Ordering::Release);
}

/// Takes one parked item back out of the buffer, None if it is empty
pub(super) fn pop() -> Option<DelayedItem> {
    let index;
    loop {
        let current = NUM_USED_ENTRIES.load(atomic::Ordering::SeqCst);
        if current == 0 {
            return None;
        }

        if NUM_USED_ENTRIES
            .compare_exchange(
                current,
                current - 1,
                atomic::Ordering::SeqCst,
                atomic::Ordering::Relaxed,
            )
            .is_ok()
        {
            index = current - 1;
            break;
        }
    }

    let entry = get_entry(index);

    // The matching producer may not have finished filling the cell yet
    while entry
        .state
        .compare_exchange(
            STATE_USED,
            STATE_BUSY,
            atomic::Ordering::Acquire,
            atomic::Ordering::Relaxed,
        )
        .is_err()
    {
        spin();
    }

    let item = unsafe { (*entry.item.get()).as_ptr().read() };
    entry.state.store(STATE_FREE, atomic::Ordering::Release);

    Some(item)
}

/// The current fill of the buffer
///
/// Only a snapshot, concurrent pushes and pops move it immediately.
pub(super) fn size() -> usize {
    NUM_USED_ENTRIES.load(atomic::Ordering::SeqCst)
}

/// The Number of times a push or pop had to spin on a contended cell so far
pub fn contended_spins() -> u64 {
    CONTENDED_SPINS.load(atomic::Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_layout() {
        assert!(ENTRIES_PER_CHUNK > 0);
        assert!(std::mem::size_of::<Chunk>() <= CHUNK_BYTES);
    }

    #[test]
    fn push_pop_roundtrip() {
        static FREED_ELSEWHERE: atomic::AtomicUsize = atomic::AtomicUsize::new(0);

        const FIRST: *mut () = 0x10 as *mut ();
        const SECOND: *mut () = 0x20 as *mut ();

        unsafe fn count_own(ptr: *mut ()) {
            if ptr == FIRST || ptr == SECOND {
                FREED_ELSEWHERE.fetch_add(1, atomic::Ordering::SeqCst);
            }
        }

        push(DelayedItem {
            ptr: FIRST,
            free_fn: count_own,
        });
        push(DelayedItem {
            ptr: SECOND,
            free_fn: count_own,
        });

        // The buffer is shared with every other test in the binary, a
        // concurrent sweep may consume our items for us, so only the sum of
        // both outcomes can be asserted
        let mut popped_ourselves = 0;
        let mut foreign = Vec::new();
        while let Some(item) = pop() {
            if item.ptr == FIRST || item.ptr == SECOND {
                popped_ourselves += 1;
            } else {
                foreign.push(item);
            }
        }
        for item in foreign {
            push(item);
        }

        for _ in 0..1000 {
            if popped_ourselves + FREED_ELSEWHERE.load(atomic::Ordering::SeqCst) == 2 {
                break;
            }
            std::thread::yield_now();
        }
        assert_eq!(
            2,
            popped_ourselves + FREED_ELSEWHERE.load(atomic::Ordering::SeqCst)
        );
    }
}
