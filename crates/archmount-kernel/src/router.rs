//! Routing of engine messages back to their requesters.
//!
//! Every request posted to the engine registers a pending reply under its
//! [`CorrelationKey`] before it is sent. Inbound messages are matched on the
//! full key, never on the request id alone: two volumes routinely use the
//! same request id at the same time.
//!
//! Messages for entities that no longer exist (a volume unmounted while a
//! read was in flight, a compressor already cleaned up) are dropped. That is
//! an expected race, not an error.
//!
//! Dropping a [`Reply`] withdraws its registration, so a caller that gives
//! up (a timed out host callback, an aborted task) leaves nothing behind.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use archmount_types::{
    CompressorId, CorrelationKey, EngineMessage, EntityId, PackEvent, RequestId, UnpackEvent,
    VolumeId,
};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Registry membership the router consults before delivering.
pub trait EntityLookup {
    fn has_volume(&self, id: &VolumeId) -> bool;
    fn has_compressor(&self, id: CompressorId) -> bool;
}

/// Where an inbound message ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    Delivered,
    Dropped,
    /// The engine needs a passphrase to continue `request` on `volume`.
    PassphraseRequested { volume: VolumeId, request: RequestId },
}

#[derive(Debug, Clone)]
enum PendingReply {
    Unpack(mpsc::UnboundedSender<UnpackEvent>),
    Pack(mpsc::UnboundedSender<PackEvent>),
}

/// A registration. The ticket tells a re-registration under the same key
/// apart from the original.
#[derive(Debug)]
struct Pending {
    ticket: u64,
    reply: PendingReply,
}

type PendingMap = DashMap<CorrelationKey, Pending>;

/// Receiving end of one request's replies.
///
/// Single-reply requests yield one event; paged requests yield events until
/// one reports `is_final()`. `None` means the request was cancelled because
/// its entity went away or the engine died.
#[derive(Debug)]
pub struct Reply<T> {
    key: CorrelationKey,
    ticket: u64,
    rx: mpsc::UnboundedReceiver<T>,
    pending: Arc<PendingMap>,
}

impl<T> Reply<T> {
    pub fn key(&self) -> &CorrelationKey {
        &self.key
    }

    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

impl<T> Drop for Reply<T> {
    fn drop(&mut self) {
        let ticket = self.ticket;
        self.pending.remove_if(&self.key, |_, pending| pending.ticket == ticket);
    }
}

#[derive(Debug, Default)]
pub struct RequestRouter {
    pending: Arc<PendingMap>,
    next_ticket: AtomicU64,
}

impl RequestRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in replies to an unpack request.
    pub fn expect_unpack(&self, volume: &VolumeId, request: RequestId) -> Reply<UnpackEvent> {
        let key = CorrelationKey::volume(volume.clone(), request);
        let (tx, rx) = mpsc::unbounded_channel();
        self.insert(key, PendingReply::Unpack(tx), rx)
    }

    /// Register interest in replies to a pack request.
    pub fn expect_pack(&self, compressor: CompressorId, request: RequestId) -> Reply<PackEvent> {
        let key = CorrelationKey::compressor(compressor, request);
        let (tx, rx) = mpsc::unbounded_channel();
        self.insert(key, PendingReply::Pack(tx), rx)
    }

    fn insert<T>(&self, key: CorrelationKey, reply: PendingReply, rx: mpsc::UnboundedReceiver<T>) -> Reply<T> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        if self.pending.insert(key.clone(), Pending { ticket, reply }).is_some() {
            warn!(%key, "replaced a pending request with the same key");
        }
        Reply {
            key,
            ticket,
            rx,
            pending: Arc::clone(&self.pending),
        }
    }

    /// Stop waiting for `key`. Its receiver sees the end of the stream.
    pub fn cancel(&self, key: &CorrelationKey) {
        self.pending.remove(key);
    }

    /// Drop every pending request owned by `entity`. Returns how many.
    pub fn forget_entity(&self, entity: &EntityId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|key, _| &key.entity != entity);
        let dropped = before.saturating_sub(self.pending.len());
        if dropped > 0 {
            debug!(%entity, dropped, "cancelled pending requests");
        }
        dropped
    }

    /// Drop every pending request. Used when the engine dies: nothing it
    /// was asked will ever be answered.
    pub fn fail_all(&self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        if dropped > 0 {
            debug!(dropped, "cancelled all pending requests");
        }
        dropped
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Hand one inbound engine message to whoever is waiting for it.
    pub fn dispatch_inbound(&self, message: EngineMessage, lookup: &impl EntityLookup) -> Routed {
        let key = message.correlation();
        match message {
            EngineMessage::Unpack {
                volume_id,
                request_id,
                event,
            } => {
                if !lookup.has_volume(&volume_id) {
                    debug!(%key, "dropping reply for unknown volume");
                    self.pending.remove(&key);
                    return Routed::Dropped;
                }
                if matches!(event, UnpackEvent::PassphraseRequired) {
                    return Routed::PassphraseRequested {
                        volume: volume_id,
                        request: request_id,
                    };
                }
                let last = event.is_final();
                match self.take(&key, last) {
                    Some(PendingReply::Unpack(tx)) => deliver(&key, &tx, event),
                    Some(PendingReply::Pack(_)) => {
                        warn!(%key, "unpack reply for a pack request");
                        Routed::Dropped
                    }
                    None => {
                        debug!(%key, "no pending request for unpack reply");
                        Routed::Dropped
                    }
                }
            }
            EngineMessage::Pack {
                compressor_id,
                event,
                ..
            } => {
                if !lookup.has_compressor(compressor_id) {
                    debug!(%key, "dropping reply for unknown compressor");
                    self.pending.remove(&key);
                    return Routed::Dropped;
                }
                let last = event.is_final();
                match self.take(&key, last) {
                    Some(PendingReply::Pack(tx)) => deliver(&key, &tx, event),
                    Some(PendingReply::Unpack(_)) => {
                        warn!(%key, "pack reply for an unpack request");
                        Routed::Dropped
                    }
                    None => {
                        debug!(%key, "no pending request for pack reply");
                        Routed::Dropped
                    }
                }
            }
        }
    }

    /// Final replies consume the pending entry, partial ones leave it.
    fn take(&self, key: &CorrelationKey, last: bool) -> Option<PendingReply> {
        if last {
            self.pending.remove(key).map(|(_, pending)| pending.reply)
        } else {
            self.pending.get(key).map(|pending| pending.reply.clone())
        }
    }
}

fn deliver<T>(key: &CorrelationKey, tx: &mpsc::UnboundedSender<T>, event: T) -> Routed {
    if tx.send(event).is_err() {
        trace!(%key, "requester stopped listening");
        return Routed::Dropped;
    }
    Routed::Delivered
}
