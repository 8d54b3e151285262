//! Coordinator service: shared log authority and relay hub.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use skein_core::{read_frame, write_frame};
use skein_proto::{
    AppendOutcome, AppendReply, AppendRequest, BroadcastEvent, Frame, Payload, ReadReply,
    ReadRequest, Register,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    sync::{Mutex, mpsc},
};

use crate::{
    error::{ClusterError, ServerError},
    log::{DEFAULT_REPLAY_PAGE, LogError, MessageLog},
};

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// TCP address workers connect to
    pub bind_address: String,
    /// Upper bound on records returned per read request
    pub max_read: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self { bind_address: "127.0.0.1:4400".to_string(), max_read: DEFAULT_REPLAY_PAGE * 4 }
    }
}

struct Peer {
    worker_id: u32,
    outbound: mpsc::UnboundedSender<Frame>,
}

/// Serves log requests and relays broadcasts between registered workers.
///
/// Cheap to clone; clones share the peer table.
pub struct Coordinator<L: MessageLog + ?Sized> {
    log: Arc<L>,
    peers: Arc<Mutex<HashMap<u64, Peer>>>,
    next_connection: Arc<AtomicU64>,
    max_read: usize,
}

impl<L: MessageLog + ?Sized> Clone for Coordinator<L> {
    fn clone(&self) -> Self {
        Self {
            log: Arc::clone(&self.log),
            peers: Arc::clone(&self.peers),
            next_connection: Arc::clone(&self.next_connection),
            max_read: self.max_read,
        }
    }
}

impl<L: MessageLog + ?Sized> Coordinator<L> {
    /// Create a coordinator over `log`.
    pub fn new(log: Arc<L>, config: &CoordinatorConfig) -> Self {
        Self {
            log,
            peers: Arc::new(Mutex::new(HashMap::new())),
            next_connection: Arc::new(AtomicU64::new(1)),
            max_read: config.max_read.max(1),
        }
    }

    /// Number of registered workers.
    pub async fn worker_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    /// Accept workers until the listener fails.
    ///
    /// # Errors
    ///
    /// - `ServerError::Transport` if accepting fails
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(%peer_addr, error = %e, "failed to set TCP_NODELAY");
            }

            let coordinator = self.clone();
            tokio::spawn(async move {
                if let Err(e) = coordinator.serve_connection(stream).await {
                    tracing::warn!(%peer_addr, error = %e, "worker link failed");
                }
            });
        }
    }

    /// Serve one worker connection until it closes.
    ///
    /// Requests are answered concurrently; replies carry the request id.
    /// Broadcasts are forwarded inline so each worker's events reach every
    /// other worker in the order it published them.
    ///
    /// # Errors
    ///
    /// - `ClusterError::Transport` on I/O failure
    /// - `ClusterError::Protocol` on a frame a worker must not send
    pub async fn serve_connection<S>(&self, stream: S) -> Result<(), ClusterError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let connection_id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    tracing::debug!(error = %e, "worker writer stopped");
                    break;
                }
            }
        });

        let result = self.read_loop(connection_id, &mut reader, &outbound).await;

        if let Some(peer) = self.peers.lock().await.remove(&connection_id) {
            tracing::info!(worker_id = peer.worker_id, "worker disconnected");
        }
        drop(outbound);
        let _ = writer_task.await;

        result
    }

    async fn read_loop<R>(
        &self,
        connection_id: u64,
        reader: &mut R,
        outbound: &mpsc::UnboundedSender<Frame>,
    ) -> Result<(), ClusterError>
    where
        R: AsyncRead + Unpin + Send,
    {
        while let Some(frame) = read_frame(reader).await? {
            let request_id = frame.header.request_id();
            match Payload::from_frame(&frame)? {
                Payload::Register(Register { worker_id }) => {
                    tracing::info!(worker_id, "worker registered");
                    self.peers
                        .lock()
                        .await
                        .insert(connection_id, Peer { worker_id, outbound: outbound.clone() });
                },
                Payload::AppendRequest(request) => {
                    let log = Arc::clone(&self.log);
                    let outbound = outbound.clone();
                    tokio::spawn(async move {
                        let reply = append(&*log, request).await;
                        send_reply(&outbound, reply, request_id);
                    });
                },
                Payload::ReadRequest(ReadRequest { after, limit }) => {
                    let log = Arc::clone(&self.log);
                    let outbound = outbound.clone();
                    let limit = (limit as usize).min(self.max_read);
                    tokio::spawn(async move {
                        let reply = match log.read_after(after, limit).await {
                            Ok(messages) => ReadReply::Messages(messages),
                            Err(e) => ReadReply::Failed { reason: e.to_string() },
                        };
                        send_reply(&outbound, Payload::ReadReply(reply), request_id);
                    });
                },
                Payload::Broadcast(event) => self.forward(connection_id, event, &frame).await,
                other => {
                    return Err(ClusterError::Protocol(format!(
                        "unexpected opcode {:#06x} from worker",
                        other.opcode().to_u16()
                    )));
                },
            }
        }
        Ok(())
    }

    async fn forward(&self, connection_id: u64, event: BroadcastEvent, frame: &Frame) {
        let peers = self.peers.lock().await;
        for (id, peer) in peers.iter() {
            if *id == connection_id || peer.worker_id == event.origin {
                continue;
            }
            let _ = peer.outbound.send(frame.clone());
        }
        tracing::trace!(offset = event.offset, origin = event.origin, "broadcast relayed");
    }
}

async fn append<L: MessageLog + ?Sized>(log: &L, request: AppendRequest) -> Payload {
    let outcome = match log.append(request.content, request.dedup_token).await {
        Ok(offset) => AppendOutcome::Appended { offset },
        Err(LogError::Duplicate { offset, .. }) => AppendOutcome::Duplicate { offset },
        Err(LogError::Unavailable(reason)) => AppendOutcome::Failed { reason },
    };
    Payload::AppendReply(AppendReply { outcome })
}

fn send_reply(outbound: &mpsc::UnboundedSender<Frame>, reply: Payload, request_id: u32) {
    match reply.into_frame(request_id) {
        Ok(frame) => {
            let _ = outbound.send(frame);
        },
        Err(e) => tracing::error!(request_id, error = %e, "failed to encode reply"),
    }
}
