//! Correlation table
//!
//! Maps a request id to whoever is waiting for its reply:
//! - single calls hold one result slot per socket the request was fanned out
//!   to; the first reply resolves every slot and later replies are dropped
//! - stream calls hold an ordered chunk queue fed by the one owning socket
//!
//! Entries are removed by the [`SingleCall`] / [`StreamCall`] guards when they
//! drop, so an entry never outlives the HTTP handler that opened it.

use crate::socket::SocketId;
use backhaul_proto::{TunnelReply, SSE_DELIMITER};
use dashmap::DashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// One item of a stream call's queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    /// A pre-framed SSE chunk
    Event(String),
    /// Completion sentinel
    End,
}

/// Outcome of routing a reply into the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The reply reached this many waiters
    Delivered { waiters: usize },
    /// Unknown, expired or already resolved id
    Dropped,
}

/// What happens to single calls whose only remaining target disconnects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisconnectPolicy {
    /// Leave the entry alone; the dispatcher's deadline reports the failure
    #[default]
    AwaitTimeout,
    /// Fail the call right away with an "agent disconnected" error
    FailFast,
}

impl fmt::Display for DisconnectPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectPolicy::AwaitTimeout => f.write_str("await-timeout"),
            DisconnectPolicy::FailFast => f.write_str("fail-fast"),
        }
    }
}

impl FromStr for DisconnectPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "await-timeout" | "timeout" => Ok(DisconnectPolicy::AwaitTimeout),
            "fail-fast" | "failfast" => Ok(DisconnectPolicy::FailFast),
            other => Err(format!(
                "unknown disconnect policy '{}' (expected await-timeout or fail-fast)",
                other
            )),
        }
    }
}

/// Failure waiting on a single call
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("No tunnel targets left for this request")]
    NoTargets,

    #[error("Every target agent disconnected before replying")]
    Disconnected,
}

/// What `release_socket` cleaned up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseSummary {
    pub streams_closed: usize,
    pub singles_failed: usize,
}

enum Entry {
    Single {
        slots: Vec<(SocketId, oneshot::Sender<TunnelReply>)>,
    },
    Stream {
        owner: SocketId,
        tx: mpsc::UnboundedSender<StreamChunk>,
    },
}

/// Shared id -> waiter map
#[derive(Clone, Default)]
pub struct CorrelationTable {
    entries: Arc<DashMap<String, Entry>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a single call fanned out to `targets`, one result slot each
    pub fn open_single(&self, id: impl Into<String>, targets: &[SocketId]) -> SingleCall {
        let id = id.into();
        let mut senders = Vec::with_capacity(targets.len());
        let mut receivers = Vec::with_capacity(targets.len());

        for socket_id in targets {
            let (tx, rx) = oneshot::channel();
            senders.push((*socket_id, tx));
            receivers.push((*socket_id, rx));
        }

        if self
            .entries
            .insert(id.clone(), Entry::Single { slots: senders })
            .is_some()
        {
            warn!(request_id = %id, "Correlation id reused while still open");
        }
        debug!(request_id = %id, fanout = targets.len(), "Opened single call");

        SingleCall {
            id,
            table: self.clone(),
            slots: receivers,
        }
    }

    /// Open a stream call owned by `owner`
    pub fn open_stream(&self, id: impl Into<String>, owner: SocketId) -> StreamCall {
        let id = id.into();
        let (tx, rx) = mpsc::unbounded_channel();

        if self
            .entries
            .insert(id.clone(), Entry::Stream { owner, tx })
            .is_some()
        {
            warn!(request_id = %id, "Correlation id reused while still open");
        }
        debug!(request_id = %id, owner = %owner, "Opened stream call");

        StreamCall {
            id,
            owner,
            table: self.clone(),
            rx,
        }
    }

    /// Route any decoded reply to its entry
    pub fn route(&self, reply: TunnelReply) -> Resolution {
        match reply {
            TunnelReply::Response { .. } => self.resolve(reply),
            TunnelReply::Chunk { id, event } => self.feed(&id, StreamChunk::Event(event)),
            TunnelReply::End { id } => self.feed(&id, StreamChunk::End),
        }
    }

    /// Resolve a single call with a terminal reply. First reply wins.
    ///
    /// A terminal reply addressed to a stream call is forwarded as one `data:`
    /// event followed by the end sentinel.
    pub fn resolve(&self, reply: TunnelReply) -> Resolution {
        let id = reply.id().to_string();

        if self.is_stream(&id) {
            let event = match &reply {
                TunnelReply::Response { data, .. } => format!(
                    "data: {}{}",
                    data.clone().unwrap_or_default(),
                    SSE_DELIMITER
                ),
                TunnelReply::Chunk { event, .. } => event.clone(),
                TunnelReply::End { .. } => return self.feed(&id, StreamChunk::End),
            };
            let delivered = self.feed(&id, StreamChunk::Event(event));
            self.feed(&id, StreamChunk::End);
            return delivered;
        }

        let removed = self
            .entries
            .remove_if(&id, |_, entry| matches!(entry, Entry::Single { .. }));

        match removed {
            Some((_, Entry::Single { slots })) => {
                let waiters = slots
                    .into_iter()
                    .filter(|(_, tx)| !tx.is_closed())
                    .map(|(_, tx)| tx.send(reply.clone()).is_ok())
                    .filter(|sent| *sent)
                    .count();
                debug!(request_id = %id, waiters, "Resolved single call");
                Resolution::Delivered { waiters }
            }
            _ => {
                debug!(request_id = %id, "Dropping reply for unknown or resolved id");
                Resolution::Dropped
            }
        }
    }

    /// Push a chunk into a stream call's queue. Unknown ids are dropped.
    pub fn feed(&self, id: &str, chunk: StreamChunk) -> Resolution {
        let tx = match self.entries.get(id) {
            Some(entry) => match entry.value() {
                Entry::Stream { tx, .. } => tx.clone(),
                Entry::Single { .. } => {
                    debug!(request_id = %id, "Dropping stream chunk for single call");
                    return Resolution::Dropped;
                }
            },
            None => {
                debug!(request_id = %id, "Dropping stream chunk for unknown id");
                return Resolution::Dropped;
            }
        };

        if tx.send(chunk).is_ok() {
            Resolution::Delivered { waiters: 1 }
        } else {
            Resolution::Dropped
        }
    }

    /// Remove an entry whatever its state. Returns whether one was present.
    pub fn close(&self, id: &str) -> bool {
        let removed = self.entries.remove(id).is_some();
        if removed {
            debug!(request_id = %id, "Closed correlation entry");
        }
        removed
    }

    /// Detach a dead socket from every entry that names it.
    ///
    /// Stream calls it owned are closed. Single calls lose that socket's slot
    /// only under [`DisconnectPolicy::FailFast`], and are failed once no slot
    /// remains.
    pub fn release_socket(&self, socket_id: SocketId, policy: DisconnectPolicy) -> ReleaseSummary {
        let mut summary = ReleaseSummary::default();

        self.entries.retain(|_, entry| match entry {
            Entry::Stream { owner, .. } => {
                if *owner == socket_id {
                    summary.streams_closed += 1;
                    false
                } else {
                    true
                }
            }
            Entry::Single { slots } => {
                if policy == DisconnectPolicy::AwaitTimeout {
                    return true;
                }
                let before = slots.len();
                slots.retain(|(target, _)| *target != socket_id);
                if before != slots.len() && slots.is_empty() {
                    summary.singles_failed += 1;
                    false
                } else {
                    true
                }
            }
        });

        if summary != ReleaseSummary::default() {
            debug!(
                socket_id = %socket_id,
                streams_closed = summary.streams_closed,
                singles_failed = summary.singles_failed,
                "Released entries of disconnected socket"
            );
        }
        summary
    }

    pub fn is_open(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    fn is_stream(&self, id: &str) -> bool {
        self.entries
            .get(id)
            .map(|entry| matches!(entry.value(), Entry::Stream { .. }))
            .unwrap_or(false)
    }

    /// Number of single calls awaiting a reply
    pub fn pending_single(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.value(), Entry::Single { .. }))
            .count()
    }

    /// Number of stream calls in flight
    pub fn active_streams(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.value(), Entry::Stream { .. }))
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for CorrelationTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelationTable")
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// Guard for an open single call. Dropping it closes the entry.
pub struct SingleCall {
    id: String,
    table: CorrelationTable,
    slots: Vec<(SocketId, oneshot::Receiver<TunnelReply>)>,
}

impl SingleCall {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Slots still waiting for a reply
    pub fn outstanding(&self) -> usize {
        self.slots.len()
    }

    /// Give up on one target (its send failed)
    pub fn abandon(&mut self, socket_id: SocketId) {
        self.slots.retain(|(target, _)| *target != socket_id);

        if let Some(mut entry) = self.table.entries.get_mut(&self.id) {
            if let Entry::Single { slots } = entry.value_mut() {
                slots.retain(|(target, _)| *target != socket_id);
            }
        }
    }

    /// Wait for the first reply on any slot
    pub async fn wait(&mut self) -> Result<TunnelReply, CallError> {
        let slots = std::mem::take(&mut self.slots);
        if slots.is_empty() {
            return Err(CallError::NoTargets);
        }

        let receivers = slots.into_iter().map(|(_, rx)| rx);
        match futures::future::select_ok(receivers).await {
            Ok((reply, _)) => Ok(reply),
            Err(_) => Err(CallError::Disconnected),
        }
    }
}

impl Drop for SingleCall {
    fn drop(&mut self) {
        self.table.close(&self.id);
    }
}

impl fmt::Debug for SingleCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleCall")
            .field("id", &self.id)
            .field("outstanding", &self.slots.len())
            .finish()
    }
}

/// Guard for an open stream call. Dropping it closes the entry.
pub struct StreamCall {
    id: String,
    owner: SocketId,
    table: CorrelationTable,
    rx: mpsc::UnboundedReceiver<StreamChunk>,
}

impl StreamCall {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner(&self) -> SocketId {
        self.owner
    }

    /// Next chunk, or `None` once the entry was released (owner socket died)
    pub async fn recv(&mut self) -> Option<StreamChunk> {
        self.rx.recv().await
    }
}

impl Drop for StreamCall {
    fn drop(&mut self) {
        self.table.close(&self.id);
    }
}

impl fmt::Debug for StreamCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCall")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .finish()
    }
}
