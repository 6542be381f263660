//! In-flight operation tracking for one pooled client.
//!
//! Operations form a doubly-linked list stored in an arena. Slot `ROOT` is a
//! permanent sentinel, so the list is never empty and "busy" is simply
//! `tail != ROOT`. `next` links are the owning direction; `previous` is a
//! plain index back-reference.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::SessionError;

const ROOT: usize = 0;

#[derive(Debug, Clone, Copy)]
struct Node {
    previous: usize,
    next: Option<usize>,
}

#[derive(Debug)]
struct LedgerState {
    nodes: Vec<Node>,
    free: Vec<usize>,
    tail: usize,
    linked: usize,
    closed: bool,
}

impl LedgerState {
    fn new() -> Self {
        Self {
            nodes: vec![Node {
                previous: ROOT,
                next: None,
            }],
            free: Vec::new(),
            tail: ROOT,
            linked: 0,
            closed: false,
        }
    }

    fn link(&mut self) -> usize {
        let node = Node {
            previous: self.tail,
            next: None,
        };
        let index = if let Some(index) = self.free.pop() {
            self.nodes[index] = node;
            index
        } else {
            self.nodes.push(node);
            self.nodes.len() - 1
        };
        self.nodes[self.tail].next = Some(index);
        self.tail = index;
        self.linked += 1;
        index
    }

    fn unlink(&mut self, index: usize) {
        if index == ROOT {
            return;
        }
        let Node { previous, next } = self.nodes[index];
        self.nodes[previous].next = next;
        match next {
            Some(next) => self.nodes[next].previous = previous,
            None => self.tail = previous,
        }
        self.free.push(index);
        self.linked -= 1;
    }
}

/// Tracks the requests currently executing against one client.
///
/// Also owns the client's closed flag so that "is idle, then close" and
/// "is open, then link" are each a single critical section.
#[derive(Clone)]
pub struct OperationLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl OperationLedger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LedgerState::new())),
        }
    }

    /// Links a new operation after the current tail.
    ///
    /// # Errors
    /// Returns [`SessionError::ClientClosed`] once the ledger was closed.
    pub fn operation(&self) -> Result<Operation, SessionError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(SessionError::ClientClosed);
        }
        let index = state.link();
        Ok(Operation {
            state: Arc::clone(&self.state),
            index,
        })
    }

    /// True while at least one operation besides the root is linked.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.lock().tail != ROOT
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.lock().linked
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Marks the ledger closed if nothing is running and it is still open.
    ///
    /// Returns whether this call performed the transition.
    pub fn close_if_idle(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed || state.tail != ROOT {
            return false;
        }
        state.closed = true;
        true
    }
}

impl Default for OperationLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OperationLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("OperationLedger")
            .field("in_flight", &state.linked)
            .field("closed", &state.closed)
            .finish()
    }
}

/// Membership of one request in a ledger. Unlinks on [`Operation::complete`]
/// or drop, whichever happens first.
pub struct Operation {
    state: Arc<Mutex<LedgerState>>,
    index: usize,
}

impl Operation {
    pub fn complete(self) {
        drop(self);
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        self.state.lock().unlink(self.index);
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}
