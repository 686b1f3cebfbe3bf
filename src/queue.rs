//! A lock-free FIFO Queue with caller-owned nodes
//!
//! The Queue stores no data itself: callers embed a [`Node`] in their own
//! structures and enqueue a pointer to it, and dequeue hands the node
//! pointer back out in FIFO order. Because the Queue never owns node
//! storage, a dequeued node is "hazardous", the caller has to reclaim it
//! through [`crate::smr`] once it is done with it.
//!
//! Two deviations from the textbook algorithm:
//! * The ABA problem on head and tail is ruled out with hazard pointers
//!   instead of modification counters, which keeps a node at exactly one
//!   pointer wide.
//! * The list always contains exactly one dummy node, so the head is never
//!   null and `tail.next` is the only place where new nodes attach. Since
//!   the dummy must never be handed to a caller, dequeuing it retires it
//!   through SMR, reinstalls a fresh dummy and retries. Fresh dummies come
//!   from a small embedded pool that grows with page-backed chunks when
//!   rotated-out dummies are held up behind slow readers, so a dummy to
//!   reinstall is always available.
//!
//! # Reference:
//! * [Simple, Fast, and Practical Non-Blocking and Blocking Concurrent Queue Algorithms](https://www.cs.rochester.edu/~scott/papers/1996_PODC_queues.pdf)

use crate::{os, smr};

use std::sync::atomic;

/// The hazard slot used for protecting head/tail while traversing
const HAZARD_SLOT: usize = 0;

/// Reserved non-null bit patterns for `Node::next`. They sit in the first
/// page, which the OS never hands out, so they can never collide with a
/// real node address.
///
/// A node that is the current list tail
const END_MARKER: *mut Node = 0x1 as *mut Node;
/// A node that is in no queue and free to be enqueued
const FREE_NEXT: *mut Node = 0x2 as *mut Node;
/// A node that was dequeued and not yet released for reuse
const INVALID_NEXT: *mut Node = 0x3 as *mut Node;

/// A Queue linkage, embedded by the caller into whatever structure should
/// be queueable
pub struct Node {
    next: atomic::AtomicPtr<Node>,
    #[cfg(debug_assertions)]
    in_queue: atomic::AtomicBool,
}

impl Node {
    /// Creates a fresh Node that is in no Queue
    pub const fn new() -> Self {
        Self {
            next: atomic::AtomicPtr::new(FREE_NEXT),
            #[cfg(debug_assertions)]
            in_queue: atomic::AtomicBool::new(false),
        }
    }

    /// Releases a previously dequeued Node for reuse, so it can be enqueued
    /// again
    ///
    /// Dequeuing poisons the Node's link on purpose, accidental traversal
    /// of a dequeued Node should trip the debug assertions instead of
    /// silently reading stale memory.
    pub fn reset(&self) {
        debug_assert_eq!(INVALID_NEXT, self.next.load(atomic::Ordering::SeqCst));
        self.next.store(FREE_NEXT, atomic::Ordering::SeqCst);
    }
}

impl Default for Node {
    fn default() -> Self {
        Self::new()
    }
}

const DUMMY_POOL: usize = 2;

#[repr(C)]
struct Dummy {
    node: Node,
    in_use: atomic::AtomicBool,
}

impl Dummy {
    const fn new() -> Self {
        Self {
            node: Node::new(),
            in_use: atomic::AtomicBool::new(false),
        }
    }
}

fn claim_dummy(dummy: &Dummy) -> bool {
    if dummy.in_use.load(atomic::Ordering::SeqCst) {
        return false;
    }

    dummy
        .in_use
        .compare_exchange(
            false,
            true,
            atomic::Ordering::SeqCst,
            atomic::Ordering::SeqCst,
        )
        .is_ok()
}

/// Overflow storage for Dummies, one page per chunk, linked and never
/// returned. Only grown while every other dummy of the Queue is stuck
/// behind a long-held hazard.
const DUMMY_CHUNK_BYTES: usize = 4096;
const DUMMY_CHUNK_HEADER: usize = std::mem::size_of::<usize>();
const DUMMIES_PER_CHUNK: usize = (DUMMY_CHUNK_BYTES - DUMMY_CHUNK_HEADER) / std::mem::size_of::<Dummy>();

#[repr(C)]
struct DummyChunk {
    next: atomic::AtomicPtr<DummyChunk>,
    dummies: [Dummy; DUMMIES_PER_CHUNK],
}

/// The lock-free FIFO Queue
///
/// The Queue embeds its dummy pool, so its address must not change anymore
/// once [`init`](Queue::init) ran. Operations from unregistered threads fall
/// back to the shared emergency hazard record, see [`smr::register_thread`].
pub struct Queue {
    head: atomic::AtomicPtr<Node>,
    tail: atomic::AtomicPtr<Node>,
    dummies: [Dummy; DUMMY_POOL],
    /// Chunks of additional Dummies, grown on demand
    extra_dummies: atomic::AtomicPtr<DummyChunk>,
    has_dummy: atomic::AtomicBool,
}

/// Reclaims a rotated-out Dummy once no thread can still observe it
unsafe fn free_dummy(ptr: *mut ()) {
    let dummy = unsafe { &*(ptr as *mut Dummy) };
    dummy.node.reset();
    dummy.in_use.store(false, atomic::Ordering::SeqCst);
}

impl Queue {
    /// Creates a new, not yet usable Queue, see [`init`](Queue::init)
    pub const fn new() -> Self {
        Self {
            head: atomic::AtomicPtr::new(std::ptr::null_mut()),
            tail: atomic::AtomicPtr::new(std::ptr::null_mut()),
            dummies: [Dummy::new(), Dummy::new()],
            extra_dummies: atomic::AtomicPtr::new(std::ptr::null_mut()),
            has_dummy: atomic::AtomicBool::new(false),
        }
    }

    /// Initialises the Queue by installing the first Dummy
    ///
    /// Must be called exactly once, after the Queue reached the address it
    /// will keep for its whole lifetime and before any other operation.
    pub fn init(&self) {
        debug_assert!(self.head.load(atomic::Ordering::SeqCst).is_null());

        let dummy = &self.dummies[0];
        dummy.in_use.store(true, atomic::Ordering::SeqCst);
        dummy.node.next.store(END_MARKER, atomic::Ordering::SeqCst);
        #[cfg(debug_assertions)]
        dummy.node.in_queue.store(true, atomic::Ordering::SeqCst);
        self.has_dummy.store(true, atomic::Ordering::SeqCst);

        let node_ptr = &dummy.node as *const Node as *mut Node;
        self.head.store(node_ptr, atomic::Ordering::SeqCst);
        self.tail.store(node_ptr, atomic::Ordering::SeqCst);
    }

    fn is_dummy(&self, node: *mut Node) -> bool {
        if self
            .dummies
            .iter()
            .any(|dummy| node == &dummy.node as *const Node as *mut Node)
        {
            return true;
        }

        let mut chunk_ptr = self.extra_dummies.load(atomic::Ordering::Acquire);
        while !chunk_ptr.is_null() {
            let chunk = unsafe { &*chunk_ptr };
            if chunk
                .dummies
                .iter()
                .any(|dummy| node == &dummy.node as *const Node as *mut Node)
            {
                return true;
            }
            chunk_ptr = chunk.next.load(atomic::Ordering::Acquire);
        }

        false
    }

    /// Claims a free Dummy, growing the pool if every existing one is
    /// either in the list or still awaiting reclamation. Never fails, a
    /// rotation must always be able to reinstall a dummy.
    fn get_free_dummy(&self) -> &Dummy {
        for dummy in self.dummies.iter() {
            if claim_dummy(dummy) {
                return dummy;
            }
        }

        let mut chunk_ptr = self.extra_dummies.load(atomic::Ordering::Acquire);
        while !chunk_ptr.is_null() {
            let chunk = unsafe { &*chunk_ptr };
            for dummy in chunk.dummies.iter() {
                if claim_dummy(dummy) {
                    return dummy;
                }
            }
            chunk_ptr = chunk.next.load(atomic::Ordering::Acquire);
        }

        self.grow_dummy_pool()
    }

    /// Maps one more chunk of Dummies and claims the first of them for the
    /// caller
    fn grow_dummy_pool(&self) -> &Dummy {
        let chunk_ptr = os::alloc(DUMMY_CHUNK_BYTES, true) as *mut DummyChunk;
        // The mapping comes back zeroed, which is a valid state for every
        // field except the node links
        let chunk = unsafe { &*chunk_ptr };
        for dummy in chunk.dummies.iter() {
            dummy.node.next.store(FREE_NEXT, atomic::Ordering::Relaxed);
        }

        // Claim one before the chunk becomes visible to other threads
        chunk.dummies[0].in_use.store(true, atomic::Ordering::Relaxed);

        loop {
            let head = self.extra_dummies.load(atomic::Ordering::SeqCst);
            chunk.next.store(head, atomic::Ordering::Release);

            if self
                .extra_dummies
                .compare_exchange(
                    head,
                    chunk_ptr,
                    atomic::Ordering::SeqCst,
                    atomic::Ordering::Relaxed,
                )
                .is_ok()
            {
                break;
            }
        }

        &chunk.dummies[0]
    }

    /// Puts a fresh Dummy back into the list, unless someone else already
    /// claimed the re-install
    fn try_reenqueue_dummy(&self) -> bool {
        if self.has_dummy.load(atomic::Ordering::SeqCst) {
            return false;
        }

        let dummy = self.get_free_dummy();

        if self
            .has_dummy
            .compare_exchange(
                false,
                true,
                atomic::Ordering::SeqCst,
                atomic::Ordering::SeqCst,
            )
            .is_err()
        {
            dummy.in_use.store(false, atomic::Ordering::SeqCst);
            return false;
        }

        unsafe { self.enqueue(&dummy.node as *const Node as *mut Node) };
        true
    }

    /// Appends the given Node at the tail of the Queue
    ///
    /// Never blocks and never fails. On return the Node is linked into the
    /// list; the trailing tail swing is best effort, a lagging tail is
    /// repaired by whichever operation observes it next.
    ///
    /// # Safety
    /// The Node must be valid, currently in no queue ([`Node::new`] fresh,
    /// or [`Node::reset`] after a dequeue) and must stay alive until it has
    /// been dequeued again.
    pub unsafe fn enqueue(&self, node: *mut Node) {
        let node_ref = unsafe { &*node };

        #[cfg(debug_assertions)]
        {
            assert!(!node_ref.in_queue.swap(true, atomic::Ordering::SeqCst));
        }
        debug_assert_eq!(FREE_NEXT, node_ref.next.load(atomic::Ordering::SeqCst));
        node_ref.next.store(END_MARKER, atomic::Ordering::SeqCst);

        let mut tail;
        loop {
            tail = smr::hazardous_load(&self.tail, HAZARD_SLOT);
            let tail_ref = unsafe { &*tail };

            // next is never dereferenced, so no hazardous load is needed
            let next = tail_ref.next.load(atomic::Ordering::SeqCst);

            // Are tail and next consistent?
            if tail != self.tail.load(atomic::Ordering::SeqCst) {
                continue;
            }

            if next == END_MARKER {
                if tail_ref
                    .next
                    .compare_exchange(
                        END_MARKER,
                        node,
                        atomic::Ordering::SeqCst,
                        atomic::Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    break;
                }
            } else {
                // Help the lagging tail along
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    atomic::Ordering::SeqCst,
                    atomic::Ordering::SeqCst,
                );
            }
        }

        let _ = self.tail.compare_exchange(
            tail,
            node,
            atomic::Ordering::SeqCst,
            atomic::Ordering::SeqCst,
        );
        smr::clear(HAZARD_SLOT);
    }

    /// Removes and returns the oldest Node of the Queue, None if the Queue
    /// is empty
    ///
    /// The returned Node is hazardous: a concurrent dequeuer may still be
    /// reading it, so the caller must reclaim its storage through
    /// [`smr::free_or_queue`] (or re-enqueue it after [`Node::reset`]), not
    /// free it directly.
    pub fn dequeue(&self) -> Option<*mut Node> {
        loop {
            let head = loop {
                let head = smr::hazardous_load(&self.head, HAZARD_SLOT);
                let tail = self.tail.load(atomic::Ordering::SeqCst);
                let next = unsafe { &*head }.next.load(atomic::Ordering::SeqCst);

                // Are head, tail and next consistent?
                if head != self.head.load(atomic::Ordering::SeqCst) {
                    continue;
                }

                debug_assert!(next != FREE_NEXT && next != INVALID_NEXT);

                if head == tail {
                    if next == END_MARKER {
                        smr::clear(HAZARD_SLOT);

                        // A caller-owned node must never stay stuck as the
                        // sacrificial list head. If the dummy is currently
                        // missing, reinstall it behind the node and have
                        // another look. We only continue if we reenqueued
                        // the dummy ourselves, so as not to wait for
                        // threads that might not actually run.
                        if !self.is_dummy(head) && self.try_reenqueue_dummy() {
                            continue;
                        }

                        return None;
                    }

                    // Try to advance the lagging tail
                    let _ = self.tail.compare_exchange(
                        tail,
                        next,
                        atomic::Ordering::SeqCst,
                        atomic::Ordering::SeqCst,
                    );
                } else {
                    debug_assert!(next != END_MARKER);
                    if self
                        .head
                        .compare_exchange(
                            head,
                            next,
                            atomic::Ordering::SeqCst,
                            atomic::Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        break head;
                    }
                }
            };

            // The head is dequeued now, so it is this thread's
            // responsibility to release it - no other thread can
            smr::clear(HAZARD_SLOT);

            let head_ref = unsafe { &*head };
            #[cfg(debug_assertions)]
            {
                assert!(head_ref.in_queue.swap(false, atomic::Ordering::SeqCst));
            }
            head_ref.next.store(INVALID_NEXT, atomic::Ordering::SeqCst);

            if self.is_dummy(head) {
                // The dummy never reaches a caller: rotate it out through
                // SMR, reinstall a fresh one and retry the dequeue. With
                // the pool growing on demand the re-install only ever
                // fails when another thread already claimed it, so the
                // retry finds the queue progressing either way.
                debug_assert!(self.has_dummy.load(atomic::Ordering::SeqCst));
                self.has_dummy.store(false, atomic::Ordering::SeqCst);

                unsafe { smr::free_or_queue(head as *mut (), free_dummy) };

                let _ = self.try_reenqueue_dummy();
                continue;
            }

            return Some(head);
        }
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaked_queue() -> &'static Queue {
        let queue = Box::leak(Box::new(Queue::new()));
        queue.init();
        queue
    }

    fn leaked_node() -> *mut Node {
        Box::into_raw(Box::new(Node::new()))
    }

    #[test]
    fn dequeue_empty() {
        smr::register_thread();
        let queue = leaked_queue();

        assert_eq!(None, queue.dequeue());
    }

    #[test]
    fn enqueue_dequeue_single() {
        smr::register_thread();
        let queue = leaked_queue();

        let node = leaked_node();
        unsafe { queue.enqueue(node) };

        assert_eq!(Some(node), queue.dequeue());
        assert_eq!(None, queue.dequeue());
    }

    #[test]
    fn fifo_order() {
        smr::register_thread();
        let queue = leaked_queue();

        let nodes: Vec<_> = (0..8).map(|_| leaked_node()).collect();
        for node in nodes.iter() {
            unsafe { queue.enqueue(*node) };
        }

        for node in nodes.iter() {
            assert_eq!(Some(*node), queue.dequeue());
        }
        assert_eq!(None, queue.dequeue());
    }

    #[test]
    fn dummy_rotates_on_dequeue() {
        smr::register_thread();
        let queue = leaked_queue();

        let initial_dummy = &queue.dummies[0].node as *const Node as *mut Node;
        assert_eq!(initial_dummy, queue.head.load(atomic::Ordering::SeqCst));

        let node = leaked_node();
        unsafe { queue.enqueue(node) };
        assert_eq!(Some(node), queue.dequeue());

        // The first dequeue had to take the initial dummy out of the list,
        // retire it and install a fresh one behind the returned node, which
        // then became the sacrificial head again
        assert!(queue.has_dummy.load(atomic::Ordering::SeqCst));
        let head = queue.head.load(atomic::Ordering::SeqCst);
        assert!(queue.is_dummy(head));
    }

    #[test]
    fn dummy_chunk_layout() {
        assert!(DUMMIES_PER_CHUNK > 0);
        assert!(std::mem::size_of::<DummyChunk>() <= DUMMY_CHUNK_BYTES);
    }

    /// Holds a hazard on the given address from a helper thread until the
    /// returned sender fires
    fn hold_hazard(addr: usize) -> (std::sync::mpsc::Sender<()>, std::thread::JoinHandle<()>) {
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<()>();

        let handle = std::thread::spawn(move || {
            smr::register_thread();
            smr::set(2, addr as *mut ());

            ready_tx.send(()).unwrap();
            release_rx.recv().unwrap();

            smr::clear(2);
        });
        ready_rx.recv().unwrap();

        (release_tx, handle)
    }

    #[test]
    fn rotation_survives_delayed_reclaims() {
        smr::register_thread();
        let queue = leaked_queue();

        let dummy0 = &queue.dummies[0].node as *const Node as usize;
        let dummy1 = &queue.dummies[1].node as *const Node as usize;

        // First rotation while a delayed reader still sits on the initial
        // dummy, so its reclamation stays parked
        let (release0, reader0) = hold_hazard(dummy0);
        let first = leaked_node();
        unsafe { queue.enqueue(first) };
        assert_eq!(Some(first), queue.dequeue());
        assert!(queue.dummies[0].in_use.load(atomic::Ordering::SeqCst));

        // Second rotation with the first dummy still unreclaimed: the
        // embedded pool is exhausted now and has to grow. Before the pool
        // grew on demand this dequeue answered None with the node still
        // linked.
        let (release1, reader1) = hold_hazard(dummy1);
        let second = leaked_node();
        unsafe { queue.enqueue(second) };
        assert_eq!(Some(second), queue.dequeue());
        assert!(!queue.extra_dummies.load(atomic::Ordering::SeqCst).is_null());

        // The queue keeps working off the grown pool
        let third = leaked_node();
        unsafe { queue.enqueue(third) };
        assert_eq!(Some(third), queue.dequeue());
        assert_eq!(None, queue.dequeue());

        release0.send(()).unwrap();
        release1.send(()).unwrap();
        reader0.join().unwrap();
        reader1.join().unwrap();

        // With the hazards gone the embedded dummies become reclaimable
        for _ in 0..1_000 {
            if !queue.dummies[0].in_use.load(atomic::Ordering::SeqCst)
                && !queue.dummies[1].in_use.load(atomic::Ordering::SeqCst)
            {
                break;
            }
            smr::try_free_all();
            std::thread::yield_now();
        }
        assert!(!queue.dummies[0].in_use.load(atomic::Ordering::SeqCst));
        assert!(!queue.dummies[1].in_use.load(atomic::Ordering::SeqCst));
    }

    #[test]
    fn reenqueue_after_reset() {
        smr::register_thread();
        let queue = leaked_queue();

        let node = leaked_node();
        unsafe { queue.enqueue(node) };
        assert_eq!(Some(node), queue.dequeue());

        unsafe { &*node }.reset();
        unsafe { queue.enqueue(node) };
        assert_eq!(Some(node), queue.dequeue());
    }
}
