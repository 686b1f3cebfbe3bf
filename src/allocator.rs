//! A lock-free slab Allocator for small fixed-size objects
//!
//! # Internal design
//! Each [`Heap`] serves one [`SizeClass`] and carves slots out of 16 KiB
//! superblocks. The complete allocation state of a superblock (free-list
//! head, free count, lifecycle state and an ABA tag) lives in one packed
//! 64-bit anchor word inside its Descriptor, so every transition commits
//! with a single compare-exchange.
//!
//! The free slots of a superblock form a linked list threaded through the
//! slots themselves: the first 4 bytes of every free slot hold the index of
//! the next free slot. The heap's `active` word additionally packs a small
//! credit counter into the low bits of the Descriptor pointer, a credit is
//! a pre-reserved right to carve one slot without consulting the anchor
//! again.
//!
//! Descriptors are recycled over a global free-list and partially used
//! superblocks wait in a per-size-class [`crate::queue`]; both are
//! protected against unsafe reuse by [`crate::smr`].
//!
//! # References
//! * [Scalable Lock-Free Dynamic Memory Allocation](https://www.cs.tufts.edu/~nr/cs257/archive/maged-michael/pldi-2004.pdf)

mod anchor;
pub(crate) use anchor::{Anchor, AnchorState};

mod descriptor;

mod heap;
pub use heap::{free, Heap, SizeClass};

/// The size of every superblock in bytes, superblocks are aligned to this
/// as well so the owning header is found by masking a slot address
pub const SB_SIZE: usize = 16384;
/// The reserved space at the start of a superblock, holding the
/// back-pointer to its Descriptor
pub const SB_HEADER_SIZE: usize = 16;
/// The slot-carrying part of a superblock
pub const SB_USABLE_SIZE: usize = SB_SIZE - SB_HEADER_SIZE;

/// The largest slot size served from superblocks, larger size classes fall
/// through to the OS provider
pub const MAX_SMALL_SIZE: usize = 8184;
/// The smallest supported slot size, keeps the per-superblock slot count
/// inside the 10-bit anchor fields
pub const MIN_SLOT_SIZE: usize = 16;
/// The most credits the active word can carry, it uses the 6 alignment
/// bits of the Descriptor pointer
pub const MAX_CREDITS: usize = 63;
