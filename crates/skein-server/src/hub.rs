//! Per-connection outbound queues.
//!
//! The driver decides who receives a frame; the hub only delivers it. Each
//! connection has an unbounded queue drained by its own writer task, so a
//! slow client never stalls the worker's event loop. Sending to a connection
//! that is already gone is a no-op.

use std::{collections::HashMap, time::Duration};

use skein_core::write_frame;
use skein_proto::Frame;
use tokio::sync::mpsc;

use crate::transport::QuinnConnection;

/// How long a closing connection waits for its last frames to be acknowledged.
const CLOSE_LINGER: Duration = Duration::from_secs(1);

/// Work item for a connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    /// Write this frame
    Frame(Frame),
    /// Finish the stream and close the connection
    Close(String),
}

/// Outbound queues of every live connection on this worker.
#[derive(Debug, Default)]
pub struct Hub {
    connections: HashMap<u64, mpsc::UnboundedSender<Outbound>>,
}

impl Hub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection's queue.
    pub fn insert(&mut self, session_id: u64, queue: mpsc::UnboundedSender<Outbound>) {
        self.connections.insert(session_id, queue);
    }

    /// Forget a connection.
    pub fn remove(&mut self, session_id: u64) {
        self.connections.remove(&session_id);
    }

    /// Queue a frame. Returns false if the connection is gone.
    pub fn send(&self, session_id: u64, frame: Frame) -> bool {
        self.connections.get(&session_id).is_some_and(|queue| queue.send(Outbound::Frame(frame)).is_ok())
    }

    /// Close a connection after its queued frames are written.
    pub fn close(&mut self, session_id: u64, reason: String) {
        if let Some(queue) = self.connections.remove(&session_id) {
            let _ = queue.send(Outbound::Close(reason));
        }
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connections are live.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

/// Drain one connection's queue onto its QUIC stream.
pub(crate) async fn connection_writer(
    session_id: u64,
    connection: QuinnConnection,
    mut stream: quinn::SendStream,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(item) = queue.recv().await {
        match item {
            Outbound::Frame(frame) => {
                if let Err(e) = write_frame(&mut stream, &frame).await {
                    tracing::debug!(session_id, error = %e, "write failed, dropping connection");
                    connection.close("write failed");
                    return;
                }
            },
            Outbound::Close(reason) => {
                // Let queued frames (an Error explaining the close) land first.
                if stream.finish().is_ok() {
                    let _ = tokio::time::timeout(CLOSE_LINGER, stream.stopped()).await;
                }
                connection.close(&reason);
                return;
            },
        }
    }
}
