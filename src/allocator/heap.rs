//! The Heap with its three allocation paths, the free path and the
//! consistency checker

use crate::{os, queue, smr};

use super::{
    descriptor::{self, Descriptor},
    Anchor, AnchorState, MAX_CREDITS, MAX_SMALL_SIZE, MIN_SLOT_SIZE, SB_USABLE_SIZE,
};

use std::sync::atomic;

/// A slot size together with the shared queue of partially used
/// superblocks for it
///
/// Every [`Heap`] serves exactly one SizeClass. The SizeClass embeds a
/// lock-free queue, so its address must not change anymore once
/// [`init`](SizeClass::init) ran; in practice SizeClasses are statics or
/// leaked once at startup.
pub struct SizeClass {
    partial: queue::Queue,
    slot_size: usize,
}

impl SizeClass {
    /// Creates a new SizeClass for the given slot size, see
    /// [`init`](SizeClass::init)
    pub const fn new(slot_size: usize) -> Self {
        Self {
            partial: queue::Queue::new(),
            slot_size,
        }
    }

    /// Initialises the SizeClass at its final address
    ///
    /// Slot sizes up to [`MAX_SMALL_SIZE`] are served from superblocks and
    /// must be multiples of 8 between [`MIN_SLOT_SIZE`] and
    /// [`MAX_SMALL_SIZE`]; anything larger is passed through to the OS
    /// provider by the owning Heap.
    pub fn init(&self) {
        if self.slot_size <= MAX_SMALL_SIZE {
            assert!(self.slot_size >= MIN_SLOT_SIZE);
            assert_eq!(0, self.slot_size % 8);
            // Slot indices and counts must fit the 10-bit anchor fields
            assert!(SB_USABLE_SIZE / self.slot_size <= 1023);
        }

        self.partial.init();
    }

    /// The slot size served by this SizeClass
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }
}

fn active_ptr(word: usize) -> *mut Descriptor {
    (word & !MAX_CREDITS) as *mut Descriptor
}
fn active_credits(word: usize) -> usize {
    word & MAX_CREDITS
}
fn active_make(desc: *mut Descriptor, credits: usize) -> usize {
    debug_assert_eq!(0, (desc as usize) & MAX_CREDITS);
    debug_assert!(credits <= MAX_CREDITS);

    (desc as usize) | credits
}

/// One allocator instance, serving fixed-size slots for a single
/// [`SizeClass`]
///
/// All operations are lock-free: any number of threads may allocate and
/// free concurrently, and no thread is ever blocked by the stall of
/// another. Slots handed out by different Heaps of the same SizeClass mix
/// freely, [`free`] recovers the owning Descriptor from the slot address
/// alone.
///
/// A Heap is expected to live as long as any slot allocated from it, so it
/// is normally a static (or leaked).
pub struct Heap {
    /// A Descriptor pointer with the credit counter packed into the low 6
    /// bits, or 0 if no active superblock is installed
    active: atomic::AtomicUsize,
    /// One Descriptor kept out of the shared partial queue, the first stop
    /// of the partial allocation path
    partial: atomic::AtomicPtr<Descriptor>,
    sc: &'static SizeClass,
}

impl Heap {
    /// Creates a new Heap serving the given SizeClass
    pub const fn new(sc: &'static SizeClass) -> Self {
        Self {
            active: atomic::AtomicUsize::new(0),
            partial: atomic::AtomicPtr::new(std::ptr::null_mut()),
            sc,
        }
    }

    /// The SizeClass this Heap serves
    pub fn size_class(&self) -> &'static SizeClass {
        self.sc
    }

    /// Allocates one slot
    ///
    /// Never returns null for slot sizes up to [`MAX_SMALL_SIZE`]; larger
    /// size classes are served directly from the OS provider. Retries
    /// internally until a slot is carved, running out of memory aborts the
    /// process inside the OS provider.
    pub fn alloc(&self) -> *mut u8 {
        if self.sc.slot_size > MAX_SMALL_SIZE {
            return os::alloc(self.sc.slot_size, true);
        }

        // Every path below performs hazardous loads, the thread has to be
        // registered first. This is idempotent and cheap after the first
        // call.
        smr::register_thread();

        let addr = loop {
            if let Some(addr) = self.alloc_from_active() {
                break addr;
            }
            if let Some(addr) = self.alloc_from_partial() {
                break addr;
            }
            if let Some(addr) = self.alloc_from_new_sb() {
                break addr;
            }
        };

        #[cfg(debug_assertions)]
        debug_mark_carved(addr, self.sc.slot_size);

        addr
    }

    /// Frees a slot obtained from [`Heap::alloc`]
    ///
    /// Only needed for size classes above [`MAX_SMALL_SIZE`], whose slots
    /// carry no superblock header; everything else can equally go through
    /// the free-standing [`free`].
    ///
    /// # Safety
    /// `ptr` must have been returned by [`Heap::alloc`] on a Heap of the
    /// same SizeClass and must not have been freed since.
    pub unsafe fn free(&self, ptr: *mut u8) {
        if self.sc.slot_size > MAX_SMALL_SIZE {
            unsafe { os::free(ptr, self.sc.slot_size) };
            return;
        }

        unsafe { free(ptr) };
    }

    /// The fast path: carve a slot from the currently active superblock
    fn alloc_from_active(&self) -> Option<*mut u8> {
        let old_credits;
        let desc_ptr;

        // Take one credit, or take the whole active pointer down if we got
        // the last one
        loop {
            let old_active = self.active.load(atomic::Ordering::SeqCst);
            if old_active == 0 {
                return None;
            }

            let credits = active_credits(old_active);
            let new_active = if credits == 0 {
                0
            } else {
                active_make(active_ptr(old_active), credits - 1)
            };

            if self
                .active
                .compare_exchange(
                    old_active,
                    new_active,
                    atomic::Ordering::SeqCst,
                    atomic::Ordering::Relaxed,
                )
                .is_ok()
            {
                old_credits = credits;
                desc_ptr = active_ptr(old_active);
                break;
            }
        }

        let desc = unsafe { &*desc_ptr };
        let mut more_credits = 0;
        let addr;
        loop {
            let old_anchor = desc.anchor();
            let mut new_anchor = old_anchor;
            debug_assert!(old_anchor.state != AnchorState::Empty);

            let slot = desc.slot_address(old_anchor.avail as usize);
            let next = descriptor::read_slot_index(slot);
            // Another thread may have allocated this slot already and
            // overwritten the link with user data. Even in range the value
            // might be stale, but then the anchor moved and the CAS below
            // fails, the range check is for efficiency, not correctness.
            if next as usize >= desc.max_count() {
                continue;
            }

            new_anchor.avail = next;
            new_anchor.tag = old_anchor.tag + 1;

            if old_credits == 0 {
                debug_assert_eq!(AnchorState::Active, old_anchor.state);
                if old_anchor.count == 0 {
                    new_anchor.state = AnchorState::Full;
                } else {
                    more_credits = old_anchor.count.min(MAX_CREDITS as u32);
                    new_anchor.count -= more_credits;
                }
            }

            if desc.update_anchor(old_anchor, new_anchor) {
                addr = slot;
                break;
            }
        }

        if old_credits == 0 && more_credits > 0 {
            self.update_active(desc_ptr, more_credits);
        }

        Some(addr)
    }

    /// Reinstalls a Descriptor as the active superblock with the given
    /// credits, one of which is spent by the caller
    fn update_active(&self, desc_ptr: *mut Descriptor, more_credits: u32) {
        let new_active = active_make(desc_ptr, more_credits as usize - 1);

        if self
            .active
            .compare_exchange(
                0,
                new_active,
                atomic::Ordering::SeqCst,
                atomic::Ordering::Relaxed,
            )
            .is_ok()
        {
            return;
        }

        // Someone else installed another active superblock. Return the
        // credits to the anchor and surface the Descriptor as partial.
        let desc = unsafe { &*desc_ptr };
        loop {
            let old_anchor = desc.anchor();
            let mut new_anchor = old_anchor;
            debug_assert!(old_anchor.state != AnchorState::Empty);

            new_anchor.count += more_credits;
            new_anchor.state = AnchorState::Partial;
            new_anchor.tag = old_anchor.tag + 1;

            if desc.update_anchor(old_anchor, new_anchor) {
                break;
            }
        }

        self.put_partial(desc_ptr);
    }

    /// Takes a partial Descriptor, preferring the heap-local slot over the
    /// shared queue
    fn get_partial(&self) -> Option<*mut Descriptor> {
        loop {
            let desc = self.partial.load(atomic::Ordering::SeqCst);
            if desc.is_null() {
                return list_get_partial(self.sc);
            }

            if self
                .partial
                .compare_exchange(
                    desc,
                    std::ptr::null_mut(),
                    atomic::Ordering::SeqCst,
                    atomic::Ordering::Relaxed,
                )
                .is_ok()
            {
                return Some(desc);
            }
        }
    }

    /// Publishes a partial Descriptor into the heap-local slot, pushing a
    /// displaced previous occupant into the shared queue
    fn put_partial(&self, desc: *mut Descriptor) {
        let prev = self.partial.swap(desc, atomic::Ordering::SeqCst);
        if !prev.is_null() {
            list_put_partial(self.sc, prev);
        }
    }

    /// Retires an EMPTY Descriptor that just transitioned, removing it from
    /// the heap-local slot if it sits there, otherwise skimming the shared
    /// queue for leftovers
    fn remove_empty_desc(&self, desc: *mut Descriptor) {
        if self
            .partial
            .compare_exchange(
                desc,
                std::ptr::null_mut(),
                atomic::Ordering::SeqCst,
                atomic::Ordering::Relaxed,
            )
            .is_ok()
        {
            unsafe { descriptor::desc_retire(desc) };
        } else {
            list_remove_empty_desc(self.sc);
        }
    }

    /// The middle path: re-promote a partially used superblock
    fn alloc_from_partial(&self) -> Option<*mut u8> {
        'retry: loop {
            let desc_ptr = self.get_partial()?;
            let desc = unsafe { &*desc_ptr };
            desc.set_heap(self as *const Heap as *mut Heap);

            // Reserve one slot for the caller plus as many credits as the
            // count allows
            let more_credits;
            loop {
                let old_anchor = desc.anchor();
                if old_anchor.state == AnchorState::Empty {
                    // Emptied while it was parked, retire it and take the
                    // next one
                    unsafe { descriptor::desc_retire(desc_ptr) };
                    continue 'retry;
                }

                debug_assert_eq!(AnchorState::Partial, old_anchor.state);
                debug_assert!(old_anchor.count > 0);

                let credits = (old_anchor.count - 1).min(MAX_CREDITS as u32);
                let mut new_anchor = old_anchor;
                new_anchor.count -= credits + 1;
                new_anchor.state = if credits > 0 {
                    AnchorState::Active
                } else {
                    AnchorState::Full
                };
                new_anchor.tag = old_anchor.tag + 1;

                if desc.update_anchor(old_anchor, new_anchor) {
                    more_credits = credits;
                    break;
                }
            }

            // Carve the caller's slot
            let addr = loop {
                let old_anchor = desc.anchor();
                let mut new_anchor = old_anchor;

                let slot = desc.slot_address(old_anchor.avail as usize);
                let next = descriptor::read_slot_index(slot);
                if next as usize >= desc.max_count() {
                    // The link was overwritten by a concurrent allocation,
                    // then the anchor moved as well and rereading it makes
                    // progress. Treating this as fatal would only be valid
                    // single-threaded.
                    continue;
                }

                new_anchor.avail = next;
                new_anchor.tag = old_anchor.tag + 1;

                if desc.update_anchor(old_anchor, new_anchor) {
                    break slot;
                }
            };

            if more_credits > 0 {
                self.update_active(desc_ptr, more_credits);
            }

            return Some(addr);
        }
    }

    /// The slow path: install a fresh superblock
    fn alloc_from_new_sb(&self) -> Option<*mut u8> {
        let desc_ptr = descriptor::desc_alloc();
        let desc = unsafe { &*desc_ptr };

        let slot_size = self.sc.slot_size;
        let max_count = SB_USABLE_SIZE / slot_size;

        let sb = descriptor::alloc_superblock(desc_ptr);
        desc.set_superblock(sb);
        desc.set_slot_size(slot_size);
        desc.set_max_count(max_count);
        desc.set_heap(self as *const Heap as *mut Heap);

        // Thread all slots after the first into the free list. Slot 0 is
        // handed to the caller right away; the last slot ends the list, its
        // link stays the mapping's zero fill and is never followed.
        for index in 1..max_count - 1 {
            descriptor::write_slot_index(
                unsafe { sb.add(index * slot_size) },
                (index + 1) as u32,
            );
        }

        // One slot goes to the caller, `credits` are pre-reserved in the
        // active word, the rest stays as anchor count
        let credits = (max_count - 1).min(MAX_CREDITS) - 1;
        desc.set_anchor(Anchor {
            avail: 1,
            count: ((max_count - 1) - (credits + 1)) as u32,
            state: AnchorState::Active,
            tag: 0,
        });

        let new_active = active_make(desc_ptr, credits);

        if self
            .active
            .compare_exchange(
                0,
                new_active,
                atomic::Ordering::SeqCst,
                atomic::Ordering::Relaxed,
            )
            .is_ok()
        {
            Some(sb)
        } else {
            // Another thread was quicker, roll everything back and let the
            // caller retry against the new active superblock
            unsafe { descriptor::free_superblock(sb) };
            desc.set_anchor(Anchor {
                avail: 0,
                count: max_count as u32,
                state: AnchorState::Empty,
                tag: 0,
            });
            unsafe { descriptor::desc_retire(desc_ptr) };
            None
        }
    }

    /// Validates every Descriptor reachable from this Heap
    ///
    /// This is a test-harness tool: the caller must guarantee that no other
    /// thread mutates the allocator while the check runs. The shared
    /// partial queue is drained and re-filled in the process.
    pub fn check_consistency(&self) -> bool {
        if self.sc.slot_size > MAX_SMALL_SIZE {
            return true;
        }

        smr::register_thread();

        let mut consistent = true;

        let active = self.active.load(atomic::Ordering::SeqCst);
        if active != 0 {
            let desc = active_ptr(active);
            let credits = active_credits(active);

            consistent &= unsafe { &*desc }.anchor().state == AnchorState::Active;
            // The credits plus the slot the next holder would carve are all
            // reachable from avail but not part of the anchor count
            consistent &= check_descriptor(self, desc, credits + 1);
        }

        let partial = self.partial.load(atomic::Ordering::SeqCst);
        if !partial.is_null() {
            consistent &= unsafe { &*partial }.anchor().state == AnchorState::Partial;
            consistent &= check_descriptor(self, partial, 0);
        }

        let mut parked = Vec::new();
        while let Some(node) = self.sc.partial.dequeue() {
            let desc = node as *mut Descriptor;
            unsafe { &*desc }.node.reset();

            let state = unsafe { &*desc }.anchor().state;
            consistent &= state == AnchorState::Partial || state == AnchorState::Empty;
            consistent &= check_descriptor(self, desc, 0);
            parked.push(desc);
        }
        for desc in parked {
            list_put_partial(self.sc, desc);
        }

        consistent
    }
}

/// Pops partial Descriptors off the shared queue until a usable one turns
/// up, retiring any that emptied while parked
fn list_get_partial(sc: &SizeClass) -> Option<*mut Descriptor> {
    loop {
        let node = sc.partial.dequeue()?;
        let desc = node as *mut Descriptor;
        unsafe { &*desc }.node.reset();

        if unsafe { &*desc }.anchor().state != AnchorState::Empty {
            return Some(desc);
        }

        unsafe { descriptor::desc_retire(desc) };
    }
}

fn list_put_partial(sc: &SizeClass, desc: *mut Descriptor) {
    let node = unsafe { &(*desc).node as *const queue::Node as *mut queue::Node };
    unsafe { sc.partial.enqueue(node) };
}

/// Skims the shared queue, retiring EMPTY Descriptors until two non-empty
/// ones in a row went past
fn list_remove_empty_desc(sc: &SizeClass) {
    let mut non_empty = 0;

    while let Some(node) = sc.partial.dequeue() {
        let desc = node as *mut Descriptor;
        unsafe { &*desc }.node.reset();

        // No atomic dance needed for the check, this thread is the only
        // one referencing the dequeued Descriptor
        if unsafe { &*desc }.anchor().state == AnchorState::Empty {
            unsafe { descriptor::desc_retire(desc) };
        } else {
            list_put_partial(sc, desc);
            non_empty += 1;
            if non_empty >= 2 {
                return;
            }
        }
    }
}

/// Returns a slot to its owning Descriptor
///
/// The Descriptor (and with it the slot size) is recovered from the
/// superblock header, no size argument is needed. Emptying a superblock
/// returns it to the OS and retires its Descriptor; freeing into a FULL
/// one publishes the Descriptor as partial again.
///
/// # Safety
/// `ptr` must be a slot previously returned by [`Heap::alloc`] on a
/// SizeClass with slots up to [`MAX_SMALL_SIZE`], and must not have been
/// freed since. The slot's first bytes may be overwritten before this
/// returns, the caller must not rely on the content anymore.
pub unsafe fn free(ptr: *mut u8) {
    let desc_ptr = unsafe { descriptor::descriptor_for(ptr) };
    let desc = unsafe { &*desc_ptr };
    let sb = desc.superblock();
    debug_assert_eq!(
        descriptor::sb_header_for(ptr),
        descriptor::sb_header_for(sb)
    );

    let slot_size = desc.slot_size();
    let max_count = desc.max_count();

    #[cfg(debug_assertions)]
    debug_mark_freed(ptr, slot_size);

    let mut heap_ptr = std::ptr::null_mut::<Heap>();
    let (old_anchor, new_anchor) = loop {
        let old_anchor = desc.anchor();
        let mut new_anchor = old_anchor;

        // Thread the slot in front of the free list. A concurrent
        // allocator may observe this write mid-flight, which it tolerates,
        // see read_slot_index.
        descriptor::write_slot_index(ptr, old_anchor.avail);
        new_anchor.avail = ((ptr as usize - sb as usize) / slot_size) as u32;
        debug_assert!((new_anchor.avail as usize) < max_count);

        if old_anchor.state == AnchorState::Full {
            new_anchor.state = AnchorState::Partial;
        }

        new_anchor.count += 1;
        if new_anchor.count as usize == max_count {
            // Latch the owning heap before the transition commits, the
            // cleanup below has to know whose partial slot to check
            heap_ptr = desc.heap();
            new_anchor.state = AnchorState::Empty;
        }
        new_anchor.tag = old_anchor.tag + 1;

        if desc.update_anchor(old_anchor, new_anchor) {
            break (old_anchor, new_anchor);
        }
    };

    if new_anchor.state == AnchorState::Empty {
        debug_assert!(old_anchor.state != AnchorState::Empty);

        unsafe { descriptor::free_superblock(sb) };
        let heap = unsafe { &*heap_ptr };
        heap.remove_empty_desc(desc_ptr);
    } else if old_anchor.state == AnchorState::Full {
        let heap = unsafe { &*desc.heap() };
        heap.put_partial(desc_ptr);
    }
}

/// The per-slot double-free marker, kept in the last byte of every slot in
/// debug builds: set while the slot is handed out, zero while it sits on
/// the free list. Catches a second free of a live slot before it corrupts
/// the free list. A caller that fills its whole slot keeps the check
/// intact as long as the last byte stays non-zero.
#[cfg(debug_assertions)]
fn debug_mark_carved(slot: *mut u8, slot_size: usize) {
    let last = unsafe { slot.add(slot_size - 1) };
    assert_eq!(0, unsafe { last.read() }, "carved a slot that was not free");
    unsafe { last.write(1) };
}

#[cfg(debug_assertions)]
fn debug_mark_freed(slot: *mut u8, slot_size: usize) {
    let last = unsafe { slot.add(slot_size - 1) };
    assert_ne!(0, unsafe { last.read() }, "double free of a slot");
    unsafe { last.write(0) };
}

#[cfg(debug_assertions)]
fn debug_marker(desc: &Descriptor, index: usize) -> u8 {
    unsafe { desc.slot_address(index).add(desc.slot_size() - 1).read() }
}

/// Validates a single Descriptor: not on the free-list, state matching
/// count, free list acyclic and in bounds
fn check_descriptor(heap: &Heap, desc_ptr: *mut Descriptor, extra: usize) -> bool {
    let desc = unsafe { &*desc_ptr };
    let anchor = desc.anchor();
    let max_count = desc.max_count();

    if descriptor::desc_avail_contains(desc_ptr) {
        return false;
    }
    if desc.slot_size() != heap.sc.slot_size {
        return false;
    }

    let count = anchor.count as usize + extra;
    let state_ok = match anchor.state {
        AnchorState::Active => count <= max_count,
        AnchorState::Full => anchor.count == 0,
        AnchorState::Partial => count > 0 && count < max_count,
        AnchorState::Empty => count == max_count,
    };
    if !state_ok {
        return false;
    }

    // The superblock of an EMPTY Descriptor is already back at the OS,
    // there is no free list left to walk
    if anchor.state == AnchorState::Empty {
        return true;
    }

    // Following `count` links from avail has to visit `count` distinct
    // in-range slots
    let mut linked = vec![false; max_count];
    let mut index = anchor.avail as usize;
    for _ in 0..count {
        if index >= max_count || linked[index] {
            return false;
        }
        linked[index] = true;
        // A slot on the free list must have had its carve marker cleared
        #[cfg(debug_assertions)]
        {
            if debug_marker(desc, index) != 0 {
                return false;
            }
        }
        index = descriptor::read_slot_index(desc.slot_address(index)) as usize;
    }

    // Everything not reachable from avail is currently handed out and must
    // still carry its marker
    #[cfg(debug_assertions)]
    for (index, was_linked) in linked.iter().enumerate() {
        if !*was_linked && debug_marker(desc, index) == 0 {
            return false;
        }
    }

    true
}
