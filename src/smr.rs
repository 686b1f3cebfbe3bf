//! Hazard-Pointers and the delayed-free machinery built on top of them
//!
//! Every registered thread owns a small row of hazard slots in one shared
//! table. Publishing a pointer into a slot keeps the pointed-to memory from
//! being reclaimed: [`free_or_queue`] either frees an object right away or,
//! if any thread currently publishes it, parks it in the delayed-free buffer
//! until a later sweep finds it unprotected.
//!
//! The table is indexed by the dense per-thread id handed out by
//! [`register_thread`]. Address space for the whole table is reserved up
//! front and pages are only made accessible as higher ids get registered,
//! so scanning stays a flat loop over `0..=highest_small_id`.
//!
//! This module provides the two halves of the reclamation handshake, the
//! publishing side and the scanning side. It does not synchronise them for
//! you: a data structure removing a node must still follow the usual
//! publish / re-read discipline (see [`hazardous_load`]) before it
//! dereferences anything.
//!
//! # Reference:
//! * [Hazard Pointers: Safe Memory Reclamation for Lock-Free Objects](https://www.eecg.utoronto.ca/~amza/ece1747h/papers/hazard_pointers.pdf)

mod registry;
pub use registry::{register_thread, registered_id, MAX_THREADS};

mod delayed_free;
use delayed_free::DelayedItem;
pub use delayed_free::contended_spins;

use crate::os;

use std::sync::atomic;

/// The Number of Hazard-Slots each registered Thread owns
///
/// Three slots cover the widest window any structure in this crate needs,
/// two for queue head/tail traversal plus one for the descriptor free-list.
pub const HAZARD_SLOTS_PER_THREAD: usize = 3;

/// One thread's row of Hazard-Pointer slots
///
/// A slot containing a non-null pointer marks the pointed-to object as
/// in-use, any concurrent reclaimer will defer freeing it.
#[repr(C)]
pub struct HazardRecord {
    slots: [atomic::AtomicPtr<()>; HAZARD_SLOTS_PER_THREAD],
}

impl HazardRecord {
    const fn empty() -> Self {
        Self {
            slots: [
                atomic::AtomicPtr::new(std::ptr::null_mut()),
                atomic::AtomicPtr::new(std::ptr::null_mut()),
                atomic::AtomicPtr::new(std::ptr::null_mut()),
            ],
        }
    }

    /// Publishes the given Ptr in the given Slot of this Record
    ///
    /// The sequentially-consistent store doubles as the barrier between the
    /// publication and the re-read that the hazardous-load idiom requires.
    pub fn set(&self, slot: usize, ptr: *mut ()) {
        self.slots[slot].store(ptr, atomic::Ordering::SeqCst);
    }

    /// Retracts whatever Ptr is currently published in the given Slot
    pub fn clear(&self, slot: usize) {
        self.slots[slot].store(std::ptr::null_mut(), atomic::Ordering::SeqCst);
    }

    fn clear_all(&self) {
        for slot in 0..HAZARD_SLOTS_PER_THREAD {
            self.clear(slot);
        }
    }
}

/// The one shared table of HazardRecords, reserved PROT_NONE for
/// MAX_THREADS rows on first registration and promoted page by page
static HAZARD_TABLE: atomic::AtomicPtr<HazardRecord> =
    atomic::AtomicPtr::new(std::ptr::null_mut());
/// The Number of Rows that are currently backed by accessible pages
static HAZARD_TABLE_SIZE: atomic::AtomicUsize = atomic::AtomicUsize::new(0);
/// Monotone scan hint, the highest small-id that has ever been registered.
/// Never raised past the accessible part of the table.
static HIGHEST_SMALL_ID: atomic::AtomicIsize = atomic::AtomicIsize::new(-1);

/// Shared fallback Row for Threads that never called [`register_thread`].
/// Multiple such threads clobber each others Slots, so this is only a
/// best-effort recovery path.
static EMERGENCY_ROW: HazardRecord = HazardRecord::empty();
static EMERGENCY_WARNED: atomic::AtomicBool = atomic::AtomicBool::new(false);

static DEFERRED_FREES: atomic::AtomicU64 = atomic::AtomicU64::new(0);

/// Grows the hazard table so that the row for `id` is accessible and
/// publishes the new scan hint.
///
/// Must only be called from the registration path, which serialises growth
/// behind the small-id mutex.
fn note_registered(id: usize) {
    assert!(id < MAX_THREADS);

    let mut table = HAZARD_TABLE.load(atomic::Ordering::Acquire);
    if table.is_null() {
        let bytes = MAX_THREADS * std::mem::size_of::<HazardRecord>();
        table = os::alloc(bytes, false) as *mut HazardRecord;
        HAZARD_TABLE.store(table, atomic::Ordering::Release);
    }

    let record_size = std::mem::size_of::<HazardRecord>();
    let page = os::page_size();

    let size = HAZARD_TABLE_SIZE.load(atomic::Ordering::Relaxed);
    if id >= size {
        let mut pages = (size * record_size + page - 1) / page;
        let mut new_size = size;
        while id >= new_size {
            unsafe { os::protect((table as *mut u8).add(pages * page), page, true) };
            pages += 1;
            new_size = pages * page / record_size;
        }
        HAZARD_TABLE_SIZE.store(new_size, atomic::Ordering::Release);
    }

    record_for(id).clear_all();

    // The hint may only move once the pages backing the row are accessible,
    // scanners trust it blindly
    if (id as isize) > HIGHEST_SMALL_ID.load(atomic::Ordering::Relaxed) {
        HIGHEST_SMALL_ID.store(id as isize, atomic::Ordering::Release);
    }
}

/// Zeroes the row of a Thread that is going away, so stale publications do
/// not keep blocking reclamation after the id is reused
fn release_row(id: usize) {
    record_for(id).clear_all();
}

fn record_for(id: usize) -> &'static HazardRecord {
    let table = HAZARD_TABLE.load(atomic::Ordering::Acquire);
    debug_assert!(!table.is_null());
    debug_assert!(id < HAZARD_TABLE_SIZE.load(atomic::Ordering::Relaxed));

    unsafe { &*table.add(id) }
}

/// The HazardRecord of the current Thread
///
/// A thread that never called [`register_thread`] gets the shared emergency
/// Record instead, together with a one-time diagnostic line. That keeps the
/// operation safe but degraded, concurrent unregistered threads overwrite
/// each others Slots.
pub fn hazard_record() -> &'static HazardRecord {
    match registered_id() {
        Some(id) => record_for(id),
        None => {
            if !EMERGENCY_WARNED.swap(true, atomic::Ordering::Relaxed) {
                eprintln!(
                    "hazalloc: hazardous operation from an unregistered thread, using the shared emergency record"
                );
            }
            &EMERGENCY_ROW
        }
    }
}

/// Publishes the given Ptr in the given Slot of the current Threads Record
pub fn set<T>(slot: usize, ptr: *mut T) {
    hazard_record().set(slot, ptr as *mut ());
}

/// Clears the given Slot of the current Threads Record
pub fn clear(slot: usize) {
    hazard_record().clear(slot);
}

/// Loads the Ptr stored in `pp` and publishes it in the given Slot of the
/// current Threads Record, retrying until a re-read confirms that the Ptr
/// was still current after it became visible as a hazard
///
/// This is the one idiom that makes dereferencing across an atomic window
/// safe: every pointer that will be dereferenced while other threads may
/// concurrently retire it has to be loaded through here. The returned Ptr
/// stays protected until the Slot is cleared or republished.
pub fn hazardous_load<T>(pp: &atomic::AtomicPtr<T>, slot: usize) -> *mut T {
    let record = hazard_record();

    loop {
        let ptr = pp.load(atomic::Ordering::SeqCst);
        record.set(slot, ptr as *mut ());

        // Check that it is still the same, otherwise the publication came
        // too late and a reclaimer may already have missed it
        if pp.load(atomic::Ordering::SeqCst) == ptr {
            return ptr;
        }
    }
}

/// Checks whether any Thread currently publishes the given Ptr
fn is_pointer_hazardous(ptr: *mut ()) -> bool {
    let highest = HIGHEST_SMALL_ID.load(atomic::Ordering::Acquire);
    if highest >= 0 {
        let table = HAZARD_TABLE.load(atomic::Ordering::Acquire);
        debug_assert!((highest as usize) < HAZARD_TABLE_SIZE.load(atomic::Ordering::Relaxed));

        for id in 0..=(highest as usize) {
            let record = unsafe { &*table.add(id) };
            for slot in 0..HAZARD_SLOTS_PER_THREAD {
                if record.slots[slot].load(atomic::Ordering::SeqCst) == ptr {
                    return true;
                }
            }
        }
    }

    EMERGENCY_ROW
        .slots
        .iter()
        .any(|slot| slot.load(atomic::Ordering::SeqCst) == ptr)
}

/// The Function used to finally reclaim a retired object
pub type FreeFn = unsafe fn(*mut ());

/// Attempts to free one parked item, re-parking it if it is still hazardous
///
/// Returns whether an item was actually freed.
fn try_free_one() -> bool {
    let item = match delayed_free::pop() {
        Some(i) => i,
        None => return false,
    };

    if is_pointer_hazardous(item.ptr) {
        delayed_free::push(item);
        return false;
    }

    unsafe { (item.free_fn)(item.ptr) };
    true
}

/// Frees the given object right away if no Thread currently publishes it,
/// otherwise parks it in the delayed-free buffer
///
/// Before looking at `ptr` itself, up to 3 previously parked items are
/// drained to amortise the buffer.
///
/// # Safety
/// The Caller must have already unlinked `ptr` from every shared structure,
/// so that the only remaining accesses run under a hazard published *before*
/// the unlinking. `free_fn` must be safe to call with `ptr` once no hazard
/// covers it anymore.
pub unsafe fn free_or_queue(ptr: *mut (), free_fn: FreeFn) {
    for _ in 0..3 {
        if !try_free_one() {
            break;
        }
    }

    if is_pointer_hazardous(ptr) {
        DEFERRED_FREES.fetch_add(1, atomic::Ordering::Relaxed);
        delayed_free::push(DelayedItem { ptr, free_fn });
    } else {
        unsafe { free_fn(ptr) };
    }
}

/// Sweeps the delayed-free buffer once, freeing every parked item that is no
/// longer hazardous and re-parking the rest
pub fn try_free_all() {
    // Bound the sweep by the current fill so re-parked items are not chased
    // around forever
    let mut budget = delayed_free::size();

    while budget > 0 {
        budget -= 1;

        let item = match delayed_free::pop() {
            Some(i) => i,
            None => return,
        };

        if is_pointer_hazardous(item.ptr) {
            delayed_free::push(item);
        } else {
            unsafe { (item.free_fn)(item.ptr) };
        }
    }
}

/// The Number of retirements so far that had to be parked because the object
/// was still hazardous at retire time
pub fn deferred_frees() -> u64 {
    DEFERRED_FREES.load(atomic::Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent() {
        let first = register_thread();
        let second = register_thread();

        assert_eq!(first, second);
        assert_eq!(Some(first), registered_id());
    }

    #[test]
    fn protect_and_release() {
        register_thread();

        let boxed = Box::into_raw(Box::new(13_u32));
        let shared = atomic::AtomicPtr::new(boxed);

        let loaded = hazardous_load(&shared, 2);
        assert_eq!(boxed, loaded);
        assert_eq!(13, unsafe { *loaded });
        assert!(is_pointer_hazardous(loaded as *mut ()));

        clear(2);
        assert!(!is_pointer_hazardous(loaded as *mut ()));

        drop(unsafe { Box::from_raw(boxed) });
    }

    #[test]
    fn free_runs_once_unprotected() {
        static FREED: atomic::AtomicUsize = atomic::AtomicUsize::new(0);

        unsafe fn count_free(_ptr: *mut ()) {
            FREED.fetch_add(1, atomic::Ordering::SeqCst);
        }

        register_thread();

        let target = 0x1000 as *mut ();

        set(2, target);
        unsafe { free_or_queue(target, count_free) };
        assert_eq!(0, FREED.load(atomic::Ordering::SeqCst));

        clear(2);
        try_free_all();
        assert_eq!(1, FREED.load(atomic::Ordering::SeqCst));
    }
}
