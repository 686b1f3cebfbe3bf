//! The packed Anchor word, the load-bearing state of every Descriptor
//!
//! All four fields share one 64-bit word so that any state transition of a
//! superblock commits with a single compare-exchange. Splitting them into
//! separate atomics would break the allocator, see the update loops in the
//! heap module.

/// The lifecycle state of a Descriptor, encoded in 2 bits of the Anchor
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum AnchorState {
    /// The Descriptor is (or was) installed as a heap's active superblock
    Active,
    /// No free slot is reachable through the Anchor anymore, remaining free
    /// slots (if any) are credits held by the active pointer
    Full,
    /// Some, but not all, slots are free and reachable
    Partial,
    /// Every slot is free, the Descriptor is ready to be retired
    Empty,
}

impl From<u64> for AnchorState {
    fn from(raw: u64) -> Self {
        match raw {
            0b00 => Self::Active,
            0b01 => Self::Full,
            0b10 => Self::Partial,
            0b11 => Self::Empty,
            _ => unreachable!("The Anchor-State has been corrupted"),
        }
    }
}
impl From<AnchorState> for u64 {
    fn from(raw: AnchorState) -> Self {
        match raw {
            AnchorState::Active => 0b00,
            AnchorState::Full => 0b01,
            AnchorState::Partial => 0b10,
            AnchorState::Empty => 0b11,
        }
    }
}

const FIELD_MASK: u64 = 0x3ff;
const TAG_BITS: u32 = 42;
const TAG_MASK: u64 = (1 << TAG_BITS) - 1;

/// The unpacked view of a Descriptor's 64-bit Anchor word
///
/// Bit layout, low to high: avail:10 | count:10 | state:2 | tag:42. Slot
/// indices and counts are limited to 10 bits by this packing, which is why
/// a superblock holds at most 1024 slots.
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct Anchor {
    /// The index of the first free slot in the in-slot free list
    pub avail: u32,
    /// The Number of free slots reachable from avail, excluding any credits
    /// held by the active pointer
    pub count: u32,
    /// The lifecycle state
    pub state: AnchorState,
    /// Monotone counter, bumped on every successful update to defeat ABA.
    /// 42 bits last for the lifetime of the process.
    pub tag: u64,
}

impl From<u64> for Anchor {
    fn from(raw: u64) -> Self {
        Self {
            avail: (raw & FIELD_MASK) as u32,
            count: ((raw >> 10) & FIELD_MASK) as u32,
            state: ((raw >> 20) & 0b11).into(),
            tag: raw >> 22,
        }
    }
}
impl From<Anchor> for u64 {
    fn from(anchor: Anchor) -> Self {
        debug_assert!(anchor.avail as u64 <= FIELD_MASK);
        debug_assert!(anchor.count as u64 <= FIELD_MASK);

        (anchor.avail as u64)
            | ((anchor.count as u64) << 10)
            | (u64::from(anchor.state) << 20)
            | ((anchor.tag & TAG_MASK) << 22)
    }
}
