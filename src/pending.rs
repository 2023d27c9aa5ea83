//! Outstanding-request table and message id allocation, owned by the
//! driver task (single-owner, no locking).

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};

use crate::error::{LdapError, Result};
use crate::protocol::Message;
use crate::search::SearchItem;

/// Message ids are 1..=2^31-1; 0 is reserved by LDAP convention. The counter
/// starts at 0 so the first allocation yields 1, and wraps back to 1.
pub(crate) struct MessageIdGen {
    last: i32,
}

impl MessageIdGen {
    pub(crate) fn new() -> Self {
        MessageIdGen { last: 0 }
    }

    pub(crate) fn next_id(&mut self) -> i32 {
        self.last = if self.last >= i32::MAX { 1 } else { self.last + 1 };
        self.last
    }
}

/// How a request completes back to the caller.
pub(crate) enum Completion {
    /// One terminal response (everything except search/abandon/unbind).
    Single(oneshot::Sender<Result<Message>>),
    /// Streaming search sink; `Done` or an error is the last event.
    Search(mpsc::UnboundedSender<Result<SearchItem>>),
    /// Write-acknowledged operations: abandon (after the write) and unbind
    /// (at transport teardown).
    Ack(oneshot::Sender<Result<()>>),
}

/// Expected success codes, or the sentinel kinds that have no response.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expected {
    Codes(Vec<u32>),
    Abandon,
    Unbind,
}

pub(crate) struct Pending {
    pub expected: Expected,
    pub completion: Completion,
    /// Retained request PDU for paged-search resends.
    pub request: Option<Message>,
}

#[derive(Default)]
pub(crate) struct PendingMap {
    entries: HashMap<i32, Pending>,
}

impl PendingMap {
    pub(crate) fn new() -> Self {
        PendingMap {
            entries: HashMap::new(),
        }
    }

    pub(crate) fn install(&mut self, id: i32, pending: Pending) {
        debug_assert!(!self.entries.contains_key(&id));
        self.entries.insert(id, pending);
    }

    pub(crate) fn take(&mut self, id: i32) -> Option<Pending> {
        self.entries.remove(&id)
    }

    pub(crate) fn contains(&self, id: i32) -> bool {
        self.entries.contains_key(&id)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn search_sink(
        &self,
        id: i32,
    ) -> Option<&mpsc::UnboundedSender<Result<SearchItem>>> {
        match self.entries.get(&id) {
            Some(Pending {
                completion: Completion::Search(sink),
                ..
            }) => Some(sink),
            _ => None,
        }
    }

    pub(crate) fn request_mut(&mut self, id: i32) -> Option<&mut Message> {
        self.entries.get_mut(&id).and_then(|p| p.request.as_mut())
    }

    /// Remove every entry, resolving each exactly once: a pending unbind
    /// succeeds, everything else gets an error built by `err`.
    pub(crate) fn drain(&mut self, err: impl Fn() -> LdapError) {
        for (_, pending) in self.entries.drain() {
            match (pending.expected, pending.completion) {
                (Expected::Unbind, Completion::Ack(tx)) => {
                    let _ = tx.send(Ok(()));
                }
                (_, Completion::Ack(tx)) => {
                    let _ = tx.send(Err(err()));
                }
                (_, Completion::Single(tx)) => {
                    let _ = tx.send(Err(err()));
                }
                (_, Completion::Search(tx)) => {
                    let _ = tx.send(Err(err()));
                }
            }
        }
    }
}
