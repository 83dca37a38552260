//! Interactive side of the server: the bounded table of session
//! slots, the per-slot request workers, and the hostess servicing the
//! rendezvous FIFO.

use std::fs::File;
use std::path::PathBuf;
use std::sync::{Condvar, Mutex};

use crate::fifo;

pub(crate) mod registrar;
pub(crate) mod worker;

/// Number of preallocated session slots.
pub const MAX_SESSIONS: usize = 10;

/// Subscription capacity of one session.
pub const MAX_SUBS_PER_SESSION: usize = 10;

/// Lifecycle state of one session slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Unoccupied; content empty.
    Free,
    /// Reserved by the registrar, not yet handed to its worker.
    Claimed,
    /// Serving a client; all pipes installed.
    Active,
    /// Being torn down; no further operations accepted.
    Draining,
}

/// The client-owned pipes installed in an ACTIVE slot.
///
/// The notification write end is opened once during activation and
/// kept for the life of the session, so delivery is a single atomic
/// `write` per record.
pub(crate) struct Pipes {
    pub(crate) req_path: PathBuf,
    pub(crate) resp_path: PathBuf,
    pub(crate) notif_path: PathBuf,
    pub(crate) notif: File,
}

/// Mutable content of one slot, guarded by the per-slot mutex.
///
/// `generation` is bumped on every activation and release; a worker
/// or notifier that captured slot state before a teardown presents
/// its generation and becomes a no-op instead of freeing a slot that
/// has already been handed to the next client.
pub(crate) struct SlotContent {
    pub(crate) generation: u64,
    pub(crate) pipes: Option<Pipes>,
    pub(crate) subscriptions: Vec<String>,
}

struct Slot {
    content: Mutex<SlotContent>,
}

/// Bounded array of session slots.
///
/// One mutex + condvar covers the `state` column (the registrar waits
/// here for a FREE slot, workers wait for their slot to turn ACTIVE);
/// a per-slot mutex covers the content. Code that needs both takes
/// the content lock first.
pub struct SessionTable {
    states: Mutex<[SessionState; MAX_SESSIONS]>,
    state_changed: Condvar,
    slots: Vec<Slot>,
}

impl Default for SessionTable {
    fn default() -> Self {
        SessionTable::new()
    }
}

impl SessionTable {
    /// Creates a table with every slot FREE.
    pub fn new() -> Self {
        SessionTable {
            states: Mutex::new([SessionState::Free; MAX_SESSIONS]),
            state_changed: Condvar::new(),
            slots: (0..MAX_SESSIONS)
                .map(|_| Slot {
                    content: Mutex::new(SlotContent {
                        generation: 0,
                        pipes: None,
                        subscriptions: Vec::new(),
                    }),
                })
                .collect(),
        }
    }

    /// Reads one slot's state.
    pub fn state(&self, idx: usize) -> SessionState {
        self.states.lock().unwrap()[idx]
    }

    pub(crate) fn set_state(&self, idx: usize, state: SessionState) {
        let mut states = self.states.lock().unwrap();
        states[idx] = state;
        self.state_changed.notify_all();
    }

    /// Claims the first FREE slot, blocking until one exists.
    pub(crate) fn claim(&self) -> usize {
        let mut states = self.states.lock().unwrap();
        loop {
            if let Some(idx) = states.iter().position(|s| *s == SessionState::Free) {
                states[idx] = SessionState::Claimed;
                self.state_changed.notify_all();
                return idx;
            }
            states = self.state_changed.wait(states).unwrap();
        }
    }

    /// Installs a client in a CLAIMED slot and marks it ACTIVE.
    ///
    /// Returns the new generation, which teardown paths present back.
    pub(crate) fn activate(&self, idx: usize, pipes: Pipes) -> u64 {
        let generation;
        {
            let mut content = self.slots[idx].content.lock().unwrap();
            content.generation += 1;
            generation = content.generation;
            content.pipes = Some(pipes);
            content.subscriptions.clear();
        }
        self.set_state(idx, SessionState::Active);
        generation
    }

    /// Runs `f` against the slot's content under the per-slot lock.
    pub(crate) fn with_content<R>(&self, idx: usize, f: impl FnOnce(&mut SlotContent) -> R) -> R {
        let mut content = self.slots[idx].content.lock().unwrap();
        f(&mut content)
    }

    /// Parks until the slot is ACTIVE.
    pub(crate) fn wait_for_active(&self, idx: usize) {
        let mut states = self.states.lock().unwrap();
        while states[idx] != SessionState::Active {
            states = self.state_changed.wait(states).unwrap();
        }
    }

    /// Tears a slot down if `generation` still names the same session.
    ///
    /// DRAINING→FREE: content is emptied (closing the notification
    /// write end) and the FREE transition is broadcast. Returns
    /// whether this call performed the teardown. The client's FIFOs
    /// stay on disk; whoever owns their removal does it afterwards.
    pub(crate) fn release_if(&self, idx: usize, generation: u64) -> bool {
        let pipes;
        {
            let mut content = self.slots[idx].content.lock().unwrap();
            if content.generation != generation {
                return false;
            }
            self.set_state(idx, SessionState::Draining);
            content.generation += 1;
            pipes = content.pipes.take();
            content.subscriptions.clear();
        }
        self.set_state(idx, SessionState::Free);
        if let Some(pipes) = &pipes {
            // The slot's worker may be parked in open() on the request
            // pipe; a transient zero-byte write end turns its pending
            // read into an EOF so it notices the teardown.
            drop(fifo::try_open_write(&pipes.req_path));
        }
        true
    }
}
