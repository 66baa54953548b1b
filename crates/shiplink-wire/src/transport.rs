//! Framed transport abstraction.
//!
//! A transport moves whole SHIP frames. Outbound frames go through
//! [`FrameTransport::send_frame`]; inbound frames and the close notification
//! arrive as [`TransportEvent`]s on the receiver returned together with the
//! transport. The connection driver is the only consumer of that receiver.

use async_trait::async_trait;
use shiplink_types::{ShipError, ShipResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Close code for a regular close.
pub const CLOSE_CODE_NORMAL: u16 = 4001;

/// Close code sent when the local application rejects the peer.
pub const CLOSE_CODE_REJECTED: u16 = 4452;

/// Close reason paired with [`CLOSE_CODE_REJECTED`].
pub const CLOSE_REASON_REJECTED: &str = "Node rejected by application";

/// Something that happened on the inbound side of a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A complete frame, header byte included.
    Frame(Vec<u8>),
    /// The transport closed. `code` is the close code the peer sent, if any.
    Closed { code: Option<u16>, reason: String },
}

/// Outbound half of a framed, bidirectional connection.
#[async_trait]
pub trait FrameTransport: Send + Sync {
    /// Queue one frame for sending. Fails if the transport is closed, the
    /// frame exceeds the size limit, or the outbound queue is full.
    fn send_frame(&self, frame: Vec<u8>) -> ShipResult<()>;

    /// Close the transport with the given close code and reason.
    async fn close(&self, code: u16, reason: &str);

    fn is_closed(&self) -> bool;
}

/// Check a frame against the transport's size limit.
pub(crate) fn check_frame_size(frame: &[u8], max_frame_size: usize) -> ShipResult<()> {
    if frame.len() > max_frame_size {
        return Err(ShipError::TransportFailure(format!(
            "frame of {} bytes exceeds limit of {max_frame_size}",
            frame.len()
        )));
    }
    Ok(())
}

/// In-process transport, one end of a [`memory_pair`].
pub struct MemoryTransport {
    peer: mpsc::Sender<TransportEvent>,
    closed: Arc<AtomicBool>,
    max_frame_size: usize,
}

/// Create two connected in-process transports.
///
/// Frames sent on one end arrive on the other end's event receiver. Closing
/// either end closes the link for both and notifies the other end.
pub fn memory_pair(
    max_frame_size: usize,
    capacity: usize,
) -> (
    (MemoryTransport, mpsc::Receiver<TransportEvent>),
    (MemoryTransport, mpsc::Receiver<TransportEvent>),
) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    let closed = Arc::new(AtomicBool::new(false));
    let a = MemoryTransport {
        peer: b_tx,
        closed: closed.clone(),
        max_frame_size,
    };
    let b = MemoryTransport {
        peer: a_tx,
        closed,
        max_frame_size,
    };
    ((a, a_rx), (b, b_rx))
}

#[async_trait]
impl FrameTransport for MemoryTransport {
    fn send_frame(&self, frame: Vec<u8>) -> ShipResult<()> {
        if self.is_closed() {
            return Err(ShipError::TransportFailure("transport closed".into()));
        }
        check_frame_size(&frame, self.max_frame_size)?;
        self.peer
            .try_send(TransportEvent::Frame(frame))
            .map_err(|e| ShipError::TransportFailure(format!("send failed: {e}")))
    }

    async fn close(&self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self
            .peer
            .send(TransportEvent::Closed {
                code: Some(code),
                reason: reason.to_string(),
            })
            .await;
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
