//! Descriptors, their superblocks and the global Descriptor free-list

use crate::{os, queue, smr};

use super::{heap::Heap, Anchor, AnchorState, SB_HEADER_SIZE, SB_SIZE};

use std::sync::atomic;

/// Fresh Descriptors are mapped in batches of this many
const DESC_BATCH: usize = 64;

/// The hazard slot used for protecting the free-list head. Slot 0 belongs
/// to the queue operations that may run in the same call chain.
const HAZARD_SLOT: usize = 1;

/// The metadata for one superblock
///
/// A Descriptor owns its superblock for its whole lifetime and is at least
/// 64-byte aligned, which is what frees the low 6 bits of every Descriptor
/// pointer for the credit counter in `Heap::active`.
#[repr(C, align(64))]
pub(super) struct Descriptor {
    /// Linkage for the size-class partial queue. Must stay the first field,
    /// a dequeued node pointer is cast straight back to the Descriptor.
    pub(super) node: queue::Node,
    /// The packed Anchor word, see [`Anchor`]
    anchor: atomic::AtomicU64,
    /// The owning Heap, latched before EMPTY transitions so the cleanup
    /// path knows which heap's partial slot to check
    heap: atomic::AtomicPtr<Heap>,
    /// The first slot of the owned superblock
    sb: atomic::AtomicPtr<u8>,
    /// Link for the global Descriptor free-list
    next: atomic::AtomicPtr<Descriptor>,
    slot_size: atomic::AtomicU32,
    max_count: atomic::AtomicU32,
    #[cfg(debug_assertions)]
    in_use: atomic::AtomicBool,
}

impl Descriptor {
    fn empty() -> Self {
        Self {
            node: queue::Node::new(),
            anchor: atomic::AtomicU64::new(0),
            heap: atomic::AtomicPtr::new(std::ptr::null_mut()),
            sb: atomic::AtomicPtr::new(std::ptr::null_mut()),
            next: atomic::AtomicPtr::new(std::ptr::null_mut()),
            slot_size: atomic::AtomicU32::new(0),
            max_count: atomic::AtomicU32::new(0),
            #[cfg(debug_assertions)]
            in_use: atomic::AtomicBool::new(false),
        }
    }

    /// The current unpacked Anchor
    pub(super) fn anchor(&self) -> Anchor {
        Anchor::from(self.anchor.load(atomic::Ordering::Acquire))
    }

    /// Attempts to move the Anchor from `old` to `new` with a single
    /// compare-exchange of the packed word
    pub(super) fn update_anchor(&self, old: Anchor, new: Anchor) -> bool {
        if old.state == AnchorState::Empty {
            debug_assert_eq!(AnchorState::Empty, new.state);
        }

        self.anchor
            .compare_exchange(
                old.into(),
                new.into(),
                atomic::Ordering::AcqRel,
                atomic::Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Plainly overwrites the Anchor, only valid while this thread owns the
    /// Descriptor exclusively (fresh from the free-list, before publication)
    pub(super) fn set_anchor(&self, anchor: Anchor) {
        self.anchor.store(anchor.into(), atomic::Ordering::Release);
    }

    pub(super) fn heap(&self) -> *mut Heap {
        self.heap.load(atomic::Ordering::Acquire)
    }
    pub(super) fn set_heap(&self, heap: *mut Heap) {
        self.heap.store(heap, atomic::Ordering::Release);
    }

    pub(super) fn superblock(&self) -> *mut u8 {
        self.sb.load(atomic::Ordering::Acquire)
    }
    pub(super) fn set_superblock(&self, sb: *mut u8) {
        self.sb.store(sb, atomic::Ordering::Release);
    }

    pub(super) fn slot_size(&self) -> usize {
        self.slot_size.load(atomic::Ordering::Relaxed) as usize
    }
    pub(super) fn set_slot_size(&self, slot_size: usize) {
        self.slot_size
            .store(slot_size as u32, atomic::Ordering::Relaxed);
    }

    pub(super) fn max_count(&self) -> usize {
        self.max_count.load(atomic::Ordering::Relaxed) as usize
    }
    pub(super) fn set_max_count(&self, max_count: usize) {
        self.max_count
            .store(max_count as u32, atomic::Ordering::Relaxed);
    }

    /// The address of the slot with the given index inside the superblock
    pub(super) fn slot_address(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.max_count());
        unsafe { self.superblock().add(index * self.slot_size()) }
    }

    fn mark_allocated(&self) {
        #[cfg(debug_assertions)]
        {
            assert!(!self.in_use.swap(true, atomic::Ordering::SeqCst));
        }
    }

    fn mark_retired(&self) {
        #[cfg(debug_assertions)]
        {
            assert!(self.in_use.swap(false, atomic::Ordering::SeqCst));
        }
    }
}

/// The head of the global Descriptor free-list, a treiber stack linked
/// through `Descriptor::next`
static DESC_AVAIL: atomic::AtomicPtr<Descriptor> = atomic::AtomicPtr::new(std::ptr::null_mut());

/// Takes a Descriptor off the free-list, mapping a fresh batch from the OS
/// if the list is empty
///
/// The list head is hazardously loaded before its `next` field is read:
/// a concurrent thread may pop and immediately retire-and-recycle the same
/// Descriptor, and without the hazard the `next` read would race with its
/// reinitialisation.
pub(super) fn desc_alloc() -> *mut Descriptor {
    loop {
        let desc = smr::hazardous_load(&DESC_AVAIL, HAZARD_SLOT);

        if !desc.is_null() {
            let next = unsafe { &*desc }.next.load(atomic::Ordering::Acquire);
            let claimed = DESC_AVAIL
                .compare_exchange(
                    desc,
                    next,
                    atomic::Ordering::SeqCst,
                    atomic::Ordering::Relaxed,
                )
                .is_ok();
            smr::clear(HAZARD_SLOT);

            if claimed {
                unsafe { &*desc }.mark_allocated();
                return desc;
            }
        } else {
            let batch_bytes = std::mem::size_of::<Descriptor>() * DESC_BATCH;
            let batch = os::alloc(batch_bytes, true) as *mut Descriptor;

            // Organise the batch into a linked list before publishing it
            for index in 0..DESC_BATCH {
                let entry = unsafe { batch.add(index) };
                unsafe { entry.write(Descriptor::empty()) };

                let next = if index + 1 == DESC_BATCH {
                    std::ptr::null_mut()
                } else {
                    unsafe { batch.add(index + 1) }
                };
                unsafe { &*entry }.next.store(next, atomic::Ordering::Release);
            }

            // Keep the first entry for ourselves, hand the rest to the list
            let rest = unsafe { batch.add(1) };
            let installed = DESC_AVAIL
                .compare_exchange(
                    std::ptr::null_mut(),
                    rest,
                    atomic::Ordering::SeqCst,
                    atomic::Ordering::Relaxed,
                )
                .is_ok();
            smr::clear(HAZARD_SLOT);

            if installed {
                unsafe { &*batch }.mark_allocated();
                return batch;
            }

            // Someone else refilled the list in the meantime, try again
            // with their batch instead
            unsafe { os::free(batch as *mut u8, batch_bytes) };
        }
    }
}

/// Pushes a reclaimed Descriptor back onto the free-list, the delayed half
/// of [`desc_retire`]
unsafe fn desc_enqueue_avail(ptr: *mut ()) {
    let desc = ptr as *mut Descriptor;
    debug_assert_eq!(AnchorState::Empty, unsafe { &*desc }.anchor().state);

    loop {
        let old_head = DESC_AVAIL.load(atomic::Ordering::SeqCst);
        unsafe { &*desc }
            .next
            .store(old_head, atomic::Ordering::Release);

        if DESC_AVAIL
            .compare_exchange(
                old_head,
                desc,
                atomic::Ordering::SeqCst,
                atomic::Ordering::Relaxed,
            )
            .is_ok()
        {
            break;
        }
    }
}

/// Retires an EMPTY Descriptor through the SMR system
///
/// The Descriptor only reaches the free-list once no thread can still hold
/// a hazardous reference to it, a stale reader from the partial queue or
/// the free-list itself may otherwise observe it mid-reinitialisation.
///
/// # Safety
/// The Descriptor must be EMPTY and unlinked from every heap and queue, and
/// the calling thread must have exclusive ownership of it.
pub(super) unsafe fn desc_retire(desc: *mut Descriptor) {
    let desc_ref = unsafe { &*desc };
    debug_assert_eq!(AnchorState::Empty, desc_ref.anchor().state);
    desc_ref.mark_retired();

    unsafe { smr::free_or_queue(desc as *mut (), desc_enqueue_avail) };
}

/// Whether the given Descriptor is currently linked into the free-list
///
/// Only meaningful while no other thread mutates the allocator, used by the
/// consistency check.
pub(super) fn desc_avail_contains(desc: *mut Descriptor) -> bool {
    let mut current = DESC_AVAIL.load(atomic::Ordering::SeqCst);
    while !current.is_null() {
        if current == desc {
            return true;
        }
        current = unsafe { &*current }.next.load(atomic::Ordering::Acquire);
    }

    false
}

/// Maps a fresh superblock for the given Descriptor and writes the
/// back-pointer into its header
///
/// Returns the address of the first slot, right past the header.
pub(super) fn alloc_superblock(desc: *mut Descriptor) -> *mut u8 {
    let header = os::alloc_aligned(SB_SIZE, SB_SIZE, true);
    debug_assert_eq!(header, sb_header_for(header));

    unsafe { (header as *mut *mut Descriptor).write(desc) };
    unsafe { header.add(SB_HEADER_SIZE) }
}

/// Returns a superblock to the OS
///
/// # Safety
/// `sb` must be the slot-area pointer of a superblock previously returned
/// by [`alloc_superblock`] and no live slot may remain in it.
pub(super) unsafe fn free_superblock(sb: *mut u8) {
    let header = sb_header_for(sb);
    debug_assert_eq!(sb, unsafe { header.add(SB_HEADER_SIZE) });

    unsafe { os::free(header, SB_SIZE) };
}

/// The superblock header containing the given address, recovered by masking
/// the low bits (superblocks are aligned to their own size)
pub(super) fn sb_header_for(addr: *mut u8) -> *mut u8 {
    ((addr as usize) & !(SB_SIZE - 1)) as *mut u8
}

/// The owning Descriptor of the slot at the given address
///
/// # Safety
/// `addr` must point into a live superblock of this allocator.
pub(super) unsafe fn descriptor_for(addr: *mut u8) -> *mut Descriptor {
    unsafe { (sb_header_for(addr) as *mut *mut Descriptor).read() }
}

/// Reads the free-list index stored in the first 4 bytes of a slot
///
/// The returned value is untrusted: between the anchor read and this read
/// another thread may have allocated the slot and scribbled user data over
/// it. Callers bounds-check and retry, the anchor CAS is what linearises
/// the decision. The relaxed atomic access only keeps the race defined, it
/// is never relied on for ordering.
pub(super) fn read_slot_index(slot: *mut u8) -> u32 {
    let cell = unsafe { &*(slot as *const atomic::AtomicU32) };
    cell.load(atomic::Ordering::Relaxed)
}

/// Threads a slot into the free-list by writing the index of the current
/// list head into its first 4 bytes
pub(super) fn write_slot_index(slot: *mut u8, index: u32) {
    let cell = unsafe { &*(slot as *const atomic::AtomicU32) };
    cell.store(index, atomic::Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_fits_credit_encoding() {
        // The low 6 bits of a Descriptor pointer carry the credit counter,
        // so Descriptors must be at least 64-byte aligned and sized
        assert!(std::mem::align_of::<Descriptor>() >= 64);
        assert_eq!(0, std::mem::size_of::<Descriptor>() % 64);
    }

    #[test]
    fn header_recovery() {
        let addr = (3 * SB_SIZE + 72) as *mut u8;
        assert_eq!((3 * SB_SIZE) as *mut u8, sb_header_for(addr));
    }

    #[test]
    fn alloc_retire_roundtrip() {
        smr::register_thread();

        let desc = desc_alloc();
        let desc_ref = unsafe { &*desc };

        assert_eq!(0, desc as usize % 64);

        desc_ref.set_slot_size(64);
        desc_ref.set_max_count(4);
        desc_ref.set_anchor(Anchor {
            avail: 0,
            count: 4,
            state: AnchorState::Empty,
            tag: 0,
        });

        unsafe { desc_retire(desc) };
    }

    #[test]
    fn superblock_backpointer() {
        smr::register_thread();

        let desc = desc_alloc();
        let sb = alloc_superblock(desc);

        assert_eq!(desc, unsafe { descriptor_for(sb) });
        assert_eq!(desc, unsafe { descriptor_for(sb.wrapping_add(10_000)) });

        unsafe { free_superblock(sb) };
        unsafe { &*desc }.set_anchor(Anchor {
            avail: 0,
            count: 0,
            state: AnchorState::Empty,
            tag: 0,
        });
        unsafe { desc_retire(desc) };
    }
}
