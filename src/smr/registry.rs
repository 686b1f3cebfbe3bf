//! The small-id registry, handing out the dense per-thread indices into the
//! hazard table

use lazy_static::lazy_static;

use std::{cell::RefCell, sync::Mutex};

/// The maximum Number of concurrently registered Threads
///
/// The hazard table reserves address space for this many rows up front, so
/// the limit is a hard one.
pub const MAX_THREADS: usize = 16384;

struct IdTable {
    used: Vec<bool>,
    /// Rotating start hint for the free-slot scan, keeps reassignment dense
    /// without always probing from zero
    next: usize,
}

impl IdTable {
    fn alloc_id(&mut self) -> usize {
        let start = self.next.min(self.used.len());

        let found = (start..self.used.len())
            .chain(0..start)
            .find(|index| !self.used[*index]);

        let id = match found {
            Some(index) => index,
            None => {
                self.used.push(false);
                self.used.len() - 1
            }
        };
        assert!(id < MAX_THREADS, "hazalloc: thread limit exceeded");

        self.used[id] = true;
        self.next = id + 1;
        if self.next >= self.used.len() {
            self.next = 0;
        }

        id
    }

    fn free_id(&mut self, id: usize) {
        debug_assert!(self.used[id]);
        self.used[id] = false;
    }
}

lazy_static! {
    static ref SMALL_IDS: Mutex<IdTable> = Mutex::new(IdTable {
        used: Vec::new(),
        next: 0,
    });
}

/// Keeps the id alive for the lifetime of the owning Thread and gives it
/// back on Thread exit
struct Registration {
    id: usize,
}

impl Drop for Registration {
    fn drop(&mut self) {
        // Zero the row first, a stale publication must not outlive the id
        super::release_row(self.id);

        let mut table = SMALL_IDS.lock().unwrap();
        table.free_id(self.id);
    }
}

thread_local! {
    static REGISTRATION: RefCell<Option<Registration>> = RefCell::new(None);
}

/// Registers the current Thread with the SMR System and returns its
/// small-id
///
/// Must be called before the Thread performs any hazardous operation.
/// Calling it again on an already registered Thread just returns the
/// existing id. The id is given back automatically when the Thread exits
/// and may then be handed out to a different Thread.
pub fn register_thread() -> usize {
    REGISTRATION.with(|cell| {
        if let Some(registration) = cell.borrow().as_ref() {
            return registration.id;
        }

        let id = {
            let mut table = SMALL_IDS.lock().unwrap();
            let id = table.alloc_id();
            // Grow the hazard table while still holding the lock, growth
            // must be serialised and the scan hint may not overtake it
            super::note_registered(id);
            id
        };

        *cell.borrow_mut() = Some(Registration { id });
        id
    })
}

/// The small-id of the current Thread, None if it never registered
pub fn registered_id() -> Option<usize> {
    REGISTRATION
        .try_with(|cell| cell.borrow().as_ref().map(|registration| registration.id))
        .ok()
        .flatten()
}
