//! Worker side of the coordinator connection.

#![allow(clippy::disallowed_types, reason = "Pending-request table is only touched in short synchronous sections")]

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use skein_core::{read_frame, write_frame};
use skein_proto::{
    AppendOutcome, AppendReply, AppendRequest, BroadcastEvent, ChatMessage, Frame, Payload,
    ReadReply, ReadRequest, Register,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::{
    error::ClusterError,
    log::{LogError, MessageLog},
    relay::{Relay, RelayReceiver},
};

type PendingTable = Arc<Mutex<HashMap<u32, oneshot::Sender<Payload>>>>;

/// Resolves when the link to the coordinator is lost, with the cause.
pub type LinkClosed = JoinHandle<ClusterError>;

/// A worker's connection to the coordinator.
///
/// Implements [`MessageLog`] by request/reply over the link and [`Relay`] by
/// sending `Broadcast` frames. Inbound broadcasts from other workers come out
/// of the [`RelayReceiver`] returned at connect time.
pub struct CoordinatorLink {
    worker_id: u32,
    outbound: mpsc::UnboundedSender<Frame>,
    pending: PendingTable,
    next_request: AtomicU32,
    request_timeout: Duration,
}

impl CoordinatorLink {
    /// Connect over TCP and register as `worker_id`.
    ///
    /// # Errors
    ///
    /// - `ClusterError::Transport` if the coordinator is unreachable
    pub async fn connect(
        address: &str,
        worker_id: u32,
        request_timeout: Duration,
    ) -> Result<(Self, RelayReceiver, LinkClosed), ClusterError> {
        let stream = TcpStream::connect(address).await.map_err(|e| ClusterError::Transport(e.into()))?;
        stream.set_nodelay(true).map_err(|e| ClusterError::Transport(e.into()))?;
        Ok(Self::from_stream(stream, worker_id, request_timeout))
    }

    /// Run the link over an established stream and register as `worker_id`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn from_stream<S>(
        stream: S,
        worker_id: u32,
        request_timeout: Duration,
    ) -> (Self, RelayReceiver, LinkClosed)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));

        if let Ok(frame) = Payload::Register(Register { worker_id }).into_frame(0) {
            let _ = outbound.send(frame);
        }

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                write_frame(&mut writer, &frame).await?;
            }
            Ok::<(), ClusterError>(())
        });

        let reader_pending = Arc::clone(&pending);
        let closed = tokio::spawn(async move {
            let cause = loop {
                match read_frame(&mut reader).await {
                    Ok(Some(frame)) => {
                        if let Err(e) = dispatch(&frame, &reader_pending, &relay_tx) {
                            break e;
                        }
                    },
                    Ok(None) => break ClusterError::Closed,
                    Err(e) => break ClusterError::Transport(e),
                }
            };
            writer_task.abort();
            // Dropping the senders fails every waiting request.
            lock(&reader_pending).clear();
            cause
        });

        let link = Self { worker_id, outbound, pending, next_request: AtomicU32::new(1), request_timeout };
        (link, relay_rx, closed)
    }

    /// Worker id this link registered as.
    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    async fn request(&self, payload: Payload) -> Result<Payload, LogError> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let frame = payload.into_frame(request_id).map_err(|e| LogError::Unavailable(e.to_string()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&self.pending).insert(request_id, reply_tx);

        if self.outbound.send(frame).is_err() {
            lock(&self.pending).remove(&request_id);
            return Err(LogError::Unavailable(ClusterError::Closed.to_string()));
        }

        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(LogError::Unavailable(ClusterError::Closed.to_string())),
            Err(_) => {
                lock(&self.pending).remove(&request_id);
                Err(LogError::Unavailable(ClusterError::Timeout { request_id }.to_string()))
            },
        }
    }
}

#[async_trait]
impl MessageLog for CoordinatorLink {
    async fn append(&self, content: String, dedup_token: Option<String>) -> Result<u64, LogError> {
        let request = Payload::AppendRequest(AppendRequest { content, dedup_token: dedup_token.clone() });
        match self.request(request).await? {
            Payload::AppendReply(AppendReply { outcome }) => match outcome {
                AppendOutcome::Appended { offset } => Ok(offset),
                AppendOutcome::Duplicate { offset } => {
                    Err(LogError::Duplicate { token: dedup_token.unwrap_or_default(), offset })
                },
                AppendOutcome::Failed { reason } => Err(LogError::Unavailable(reason)),
            },
            other => Err(unexpected_reply(&other)),
        }
    }

    async fn read_after(&self, after: u64, limit: usize) -> Result<Vec<ChatMessage>, LogError> {
        let limit = u32::try_from(limit).unwrap_or(u32::MAX);
        match self.request(Payload::ReadRequest(ReadRequest { after, limit })).await? {
            Payload::ReadReply(ReadReply::Messages(messages)) => Ok(messages),
            Payload::ReadReply(ReadReply::Failed { reason }) => Err(LogError::Unavailable(reason)),
            other => Err(unexpected_reply(&other)),
        }
    }
}

impl Relay for CoordinatorLink {
    fn publish(&self, event: BroadcastEvent) -> Result<(), ClusterError> {
        let frame = Payload::Broadcast(event).into_frame(0)?;
        self.outbound.send(frame).map_err(|_| ClusterError::Closed)
    }
}

fn dispatch(
    frame: &Frame,
    pending: &PendingTable,
    relay: &mpsc::UnboundedSender<BroadcastEvent>,
) -> Result<(), ClusterError> {
    match Payload::from_frame(frame)? {
        Payload::Broadcast(event) => {
            let _ = relay.send(event);
        },
        reply @ (Payload::AppendReply(_) | Payload::ReadReply(_)) => {
            let request_id = frame.header.request_id();
            match lock(pending).remove(&request_id) {
                Some(waiter) => {
                    let _ = waiter.send(reply);
                },
                None => tracing::debug!(request_id, "late coordinator reply dropped"),
            }
        },
        other => {
            return Err(ClusterError::Protocol(format!(
                "unexpected opcode {:#06x} from coordinator",
                other.opcode().to_u16()
            )));
        },
    }
    Ok(())
}

fn unexpected_reply(payload: &Payload) -> LogError {
    LogError::Unavailable(format!("unexpected reply opcode {:#06x}", payload.opcode().to_u16()))
}

#[allow(clippy::expect_used)]
fn lock(pending: &PendingTable) -> std::sync::MutexGuard<'_, HashMap<u32, oneshot::Sender<Payload>>> {
    pending.lock().expect("invariant: pending table lock holders do not panic")
}
