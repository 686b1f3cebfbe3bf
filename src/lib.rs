#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs, unsafe_op_in_unsafe_fn)]
#![warn(rust_2018_idioms)]
//! A lock-free dynamic memory allocator for small fixed-size objects,
//! together with the safe-memory-reclamation substrate it is built on
//!
//! The crate is made up of three lock-free subsystems that depend on each
//! other:
//! * [`allocator`]: a descriptor-based slab allocator that carves fixed-size
//!   slots out of page-aligned superblocks, coordinated through a single
//!   packed 64-bit anchor word per superblock
//! * [`smr`]: hazard pointers and a delayed-free buffer, so that memory that
//!   is concurrently read can be reclaimed safely
//! * [`queue`]: a Michael-Scott style FIFO queue with caller-owned nodes,
//!   used by the allocator to keep track of partially filled superblocks
//!
//! The [`os`] module provides the page-granularity mappings everything else
//! is placed in, so none of the subsystems ever call back into the process
//! allocator.
//!
//! # Feature-Flags
//! * `os`: Enables the page-granularity memory provider
//! * `smr`: Enables the Hazard-Pointer implementation
//! * `queue`: Enables the lock-free FIFO Queue
//! * `allocator`: Enables the slab Allocator
//! * `full`: Enables all the Feature-Flags

#[cfg(feature = "allocator")]
#[cfg_attr(docsrs, doc(cfg(feature = "allocator")))]
pub mod allocator;
#[cfg(feature = "os")]
#[cfg_attr(docsrs, doc(cfg(feature = "os")))]
pub mod os;
#[cfg(feature = "queue")]
#[cfg_attr(docsrs, doc(cfg(feature = "queue")))]
pub mod queue;
#[cfg(feature = "smr")]
#[cfg_attr(docsrs, doc(cfg(feature = "smr")))]
pub mod smr;
