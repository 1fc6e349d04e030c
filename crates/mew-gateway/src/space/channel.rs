//! Channel abstraction shared by all transports
//!
//! A channel is one connected participant endpoint, whatever the wire. The
//! transport side owns the socket or FIFO pair; the space core only ever
//! sees a [`ChannelHandle`] for writing and a stream of [`GatewayEvent`]s
//! for everything inbound.
//!
//! Outbound frames go through a bounded per-channel queue drained by the
//! transport's writer task. A full queue means the participant is not
//! keeping up; the send fails and the core closes the channel rather than
//! stalling other senders.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;

/// Outbound queue depth per channel. Overflow closes the channel.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Queue depth of the shared inbound event channel into the core.
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Allocate the next channel id.
    pub fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// An item on a channel's outbound queue.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// One serialized text frame (envelope JSON or `#stream#` data).
    Frame(Arc<str>),
    /// Terminate the connection after draining.
    Close,
}

/// Failure to enqueue an outbound frame.
#[derive(Debug, Error)]
pub enum ChannelSendError {
    /// Bounded queue is full; the participant is too slow.
    #[error("outbound queue full")]
    Overflow,
    /// Writer task is gone; the connection is already dead.
    #[error("channel closed")]
    Closed,
}

/// Write-side handle to a connected channel.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    id: ChannelId,
    outbound: mpsc::Sender<Outbound>,
}

impl ChannelHandle {
    pub fn new(id: ChannelId, outbound: mpsc::Sender<Outbound>) -> Self {
        Self { id, outbound }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Enqueue one frame without blocking.
    pub fn try_send_frame(&self, frame: Arc<str>) -> Result<(), ChannelSendError> {
        self.outbound
            .try_send(Outbound::Frame(frame))
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => ChannelSendError::Overflow,
                mpsc::error::TrySendError::Closed(_) => ChannelSendError::Closed,
            })
    }

    /// Ask the transport to terminate the connection. Best-effort: a full
    /// queue still ends the channel because the writer side is dropped by
    /// the core right after.
    pub fn close(&self) {
        let _ = self.outbound.try_send(Outbound::Close);
    }
}

/// Inbound events from transports into the space core.
#[derive(Debug)]
pub enum GatewayEvent {
    /// A transport accepted a new connection.
    Connected { handle: ChannelHandle },
    /// One complete text frame arrived on a channel.
    Frame { channel_id: ChannelId, text: String },
    /// The transport detected a framing violation on a channel.
    Malformed { channel_id: ChannelId, reason: String },
    /// The connection ended (peer close, error, or writer failure).
    Disconnected { channel_id: ChannelId },
}

/// Sender half used by transports to feed the core.
pub type EventSender = mpsc::Sender<GatewayEvent>;

/// Create a channel handle plus the outbound receiver for its writer task.
pub fn channel_pair() -> (ChannelHandle, mpsc::Receiver<Outbound>) {
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    (ChannelHandle::new(ChannelId::next(), tx), rx)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_ids_are_unique() {
        assert_ne!(ChannelId::next(), ChannelId::next());
    }

    #[tokio::test]
    async fn test_try_send_delivers_frame() {
        let (handle, mut rx) = channel_pair();
        handle.try_send_frame(Arc::from("hello")).unwrap();
        match rx.recv().await.unwrap() {
            Outbound::Frame(frame) => assert_eq!(&*frame, "hello"),
            other => panic!("unexpected outbound item: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_overflow_reported_when_queue_full() {
        let (handle, _rx) = channel_pair();
        for _ in 0..OUTBOUND_QUEUE_CAPACITY {
            handle.try_send_frame(Arc::from("x")).unwrap();
        }
        assert!(matches!(
            handle.try_send_frame(Arc::from("y")),
            Err(ChannelSendError::Overflow)
        ));
    }

    #[tokio::test]
    async fn test_send_after_writer_drop_reports_closed() {
        let (handle, rx) = channel_pair();
        drop(rx);
        assert!(matches!(
            handle.try_send_frame(Arc::from("x")),
            Err(ChannelSendError::Closed)
        ));
    }
}
