//! Correlation of outbound requests with inbound responses.
//!
//! Each pending request owns a one-shot slot. The table entry is removed by
//! exactly one of: delivery of the matching response, or release by the
//! waiting caller (timeout, cancellation, drop). Whoever removes the entry
//! resolves the request; the other path finds nothing and does nothing.

use crate::{
    error::SyncError,
    peer::PeerId,
    protocol::{BlockHeader, RawRlp},
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseKind {
    BlockHeaders,
    BlockBodies,
}

impl ResponseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseKind::BlockHeaders => "headers",
            ResponseKind::BlockBodies => "bodies",
        }
    }
}

#[derive(Debug)]
pub enum ResponsePayload {
    Headers(Vec<BlockHeader>),
    Bodies(Vec<RawRlp>),
}

impl ResponsePayload {
    pub fn kind(&self) -> ResponseKind {
        match self {
            ResponsePayload::Headers(_) => ResponseKind::BlockHeaders,
            ResponsePayload::Bodies(_) => ResponseKind::BlockBodies,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ResponsePayload::Headers(h) => h.len(),
            ResponsePayload::Bodies(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A response handed from the read loop to the waiting caller.
#[derive(Debug)]
pub struct Response {
    pub request_id: u64,
    pub payload: ResponsePayload,
    pub received_at: Instant,
    /// Acknowledgement back to the delivering task.
    pub done: oneshot::Sender<()>,
}

struct PendingRequest {
    peer: PeerId,
    kind: ResponseKind,
    slot: oneshot::Sender<Response>,
    created: Instant,
    deadline: Instant,
}

/// Outcome of handing a response to the table.
#[derive(Debug)]
pub enum Delivery {
    /// The waiting caller owns the response now.
    Delivered(oneshot::Receiver<()>),
    /// No live request for this id: late, canceled or unsolicited.
    Discarded,
}

#[derive(Default)]
struct Inner {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
}

/// Shared by every session; cheap to clone.
#[derive(Clone, Default)]
pub struct PendingRequestTable {
    inner: Arc<Inner>,
}

impl PendingRequestTable {
    pub fn new() -> Self {
        let inner = Inner { next_id: AtomicU64::new(rand::random()), pending: Mutex::default() };
        Self { inner: Arc::new(inner) }
    }

    /// Allocate a fresh correlation token and its one-shot slot.
    pub fn register(&self, peer: PeerId, kind: ResponseKind, ttl: Duration) -> PendingHandle {
        let (slot, rx) = oneshot::channel();
        let now = Instant::now();
        let mut pending = self.inner.pending.lock();
        let mut id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        while pending.contains_key(&id) {
            id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        }
        pending.insert(id, PendingRequest { peer, kind, slot, created: now, deadline: now + ttl });
        PendingHandle { id, table: self.clone(), rx }
    }

    /// Hand a response to the caller waiting on `request_id`.
    ///
    /// Never blocks: the response goes into the one-shot slot and the
    /// acknowledgement receiver is returned for the delivering side to keep
    /// or drop.
    pub fn deliver(&self, from: &PeerId, request_id: u64, payload: ResponsePayload) -> Result<Delivery, SyncError> {
        let entry = {
            let mut pending = self.inner.pending.lock();
            match pending.get(&request_id) {
                None => None,
                Some(req) if req.peer != *from => None,
                Some(req) if req.kind != payload.kind() => {
                    return Err(SyncError::UnexpectedMessage {
                        code: request_id,
                        reason: format!(
                            "{} response for {} request",
                            payload.kind().as_str(),
                            req.kind.as_str()
                        ),
                    });
                }
                Some(_) => pending.remove(&request_id),
            }
        };
        let Some(req) = entry else {
            debug!(peer = %from, request_id, "discarding response without pending request");
            return Ok(Delivery::Discarded);
        };

        let (done, ack) = oneshot::channel();
        let response = Response { request_id, payload, received_at: Instant::now(), done };
        if req.slot.send(response).is_err() {
            // Waiter went away between our removal and the send.
            debug!(peer = %from, request_id, "waiter dropped before delivery");
            return Ok(Delivery::Discarded);
        }
        debug!(
            peer = %from,
            request_id,
            kind = req.kind.as_str(),
            elapsed = ?req.created.elapsed(),
            "response delivered"
        );
        Ok(Delivery::Delivered(ack))
    }

    /// Remove the entry if still present. Idempotent.
    pub fn release(&self, request_id: u64) -> bool {
        self.inner.pending.lock().remove(&request_id).is_some()
    }

    /// Drop entries whose deadline has passed. Callers normally release their
    /// own entries; this only catches waiters that were leaked.
    pub fn expire(&self, now: Instant) -> usize {
        let mut pending = self.inner.pending.lock();
        let before = pending.len();
        pending.retain(|_, req| req.deadline > now);
        before - pending.len()
    }

    pub fn contains(&self, request_id: u64) -> bool {
        self.inner.pending.lock().contains_key(&request_id)
    }

    pub fn len(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Caller side of a pending request. Dropping it releases the table entry.
pub struct PendingHandle {
    id: u64,
    table: PendingRequestTable,
    rx: oneshot::Receiver<Response>,
}

impl PendingHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn receiver(&mut self) -> &mut oneshot::Receiver<Response> {
        &mut self.rx
    }
}

impl Drop for PendingHandle {
    fn drop(&mut self) {
        self.table.release(self.id);
    }
}
