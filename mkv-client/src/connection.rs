//! # Multiplexed Connection
//!
//! Purpose: Share one store connection between every invocation style, with
//! many commands in flight at once.
//!
//! ## Design Principles
//! 1. **Single Writer**: A dedicated I/O thread owns the socket; callers only
//!    enqueue encoded frames on an unbounded channel.
//! 2. **Minimal Critical Section**: Id allocation and enqueue are the only
//!    shared steps; encoding happens on the caller's thread.
//! 3. **FIFO Correlation**: RESP2 replies arrive in request order, so pending
//!    commands are completed from the front of a queue.
//! 4. **Write Coalescing**: Frames queued while the driver was busy are
//!    flushed in a single write.
//! 5. **Graceful Close**: `close()` stops intake, then waits for in-flight
//!    replies before the socket is shut down.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use mkv_common::{encode_command, ConnectionTarget, MkvError, MkvResult, RespDecoder, RespValue};

use crate::async_api::AsyncCommands;
use crate::command::Request;
use crate::config::ClientConfig;
use crate::pubsub::PubSubChannel;
use crate::reactive::ReactiveCommands;
use crate::sync_api::SyncCommands;
use crate::transport::{establish, join_io_thread, spawn_io_thread};

/// Receiver side of one dispatched command.
pub(crate) type ReplyReceiver = oneshot::Receiver<MkvResult<RespValue>>;

enum DriverMessage {
    Command {
        id: u64,
        frame: Bytes,
        reply: oneshot::Sender<MkvResult<RespValue>>,
    },
    Shutdown,
}

struct PendingCommand {
    id: u64,
    reply: oneshot::Sender<MkvResult<RespValue>>,
}

struct ConnectionInner {
    endpoint: String,
    config: ClientConfig,
    tx: mpsc::UnboundedSender<DriverMessage>,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to one multiplexed store connection.
///
/// Cloning is cheap; every clone and every view shares the same socket.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.inner.endpoint)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Connects to `target`, blocking until the handshake completes.
    pub fn connect(target: &ConnectionTarget, config: ClientConfig) -> MkvResult<Self> {
        let (conn, ready) = Self::spawn(target, config)?;
        futures::executor::block_on(conn.await_ready(ready))
    }

    /// Connects to `target` without blocking the calling task.
    pub async fn connect_async(target: &ConnectionTarget, config: ClientConfig) -> MkvResult<Self> {
        let (conn, ready) = Self::spawn(target, config)?;
        conn.await_ready(ready).await
    }

    fn spawn(
        target: &ConnectionTarget,
        config: ClientConfig,
    ) -> MkvResult<(Self, oneshot::Receiver<MkvResult<()>>)> {
        let endpoint = target.socket_addr();
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let closed = Arc::new(AtomicBool::new(false));

        let driver_endpoint = endpoint.clone();
        let driver_config = config.clone();
        let driver_closed = Arc::clone(&closed);
        let thread = spawn_io_thread("mkv-io", move || async move {
            let stream = match establish(&driver_endpoint, &driver_config).await {
                Ok(stream) => stream,
                Err(err) => {
                    driver_closed.store(true, Ordering::Release);
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            drive(stream, rx, driver_config.max_write_batch, &driver_endpoint).await;
            driver_closed.store(true, Ordering::Release);
        })?;

        let conn = Connection {
            inner: Arc::new(ConnectionInner {
                endpoint,
                config,
                tx,
                next_id: AtomicU64::new(1),
                closed,
                thread: Mutex::new(Some(thread)),
            }),
        };
        Ok((conn, ready_rx))
    }

    async fn await_ready(self, ready: oneshot::Receiver<MkvResult<()>>) -> MkvResult<Self> {
        let outcome = match ready.await {
            Ok(outcome) => outcome,
            Err(_) => Err(MkvError::Connection {
                addr: self.inner.endpoint.clone(),
                reason: "i/o thread exited before the handshake".to_string(),
            }),
        };
        match outcome {
            Ok(()) => {
                info!(addr = %self.inner.endpoint, "connected");
                Ok(self)
            }
            Err(err) => {
                let thread = self.inner.thread.lock().take();
                if let Some(thread) = thread {
                    join_io_thread(thread);
                }
                Err(err)
            }
        }
    }

    /// Blocking command view.
    pub fn sync(&self) -> SyncCommands {
        SyncCommands::new(self.clone())
    }

    /// Future-returning command view.
    pub fn asynchronous(&self) -> AsyncCommands {
        AsyncCommands::new(self.clone())
    }

    /// Lazily-subscribed reactive command view.
    pub fn reactive(&self) -> ReactiveCommands {
        ReactiveCommands::new(self.clone())
    }

    /// Publish/subscribe channel. The subscription connection is opened on the
    /// first `subscribe`.
    pub fn pubsub(&self) -> PubSubChannel {
        PubSubChannel::new(self.clone())
    }

    /// Socket endpoint (`host:port`) this connection was opened against.
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Closes the connection after in-flight replies have been received.
    ///
    /// Later commands fail with `ConnectionClosed`. Calling this again is a
    /// no-op.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.tx.send(DriverMessage::Shutdown);
        let thread = self.inner.thread.lock().take();
        if let Some(thread) = thread {
            join_io_thread(thread);
        }
        info!(addr = %self.inner.endpoint, "connection closed");
    }

    /// Enqueues one command and returns its id plus the reply receiver.
    ///
    /// Never waits on the network.
    pub(crate) fn dispatch(&self, name: &'static str, args: &[Bytes]) -> MkvResult<(u64, ReplyReceiver)> {
        if self.is_closed() {
            return Err(MkvError::ConnectionClosed);
        }

        let mut frame = BytesMut::new();
        encode_command(args, &mut frame);
        let (reply, receiver) = oneshot::channel();

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .tx
            .send(DriverMessage::Command {
                id,
                frame: frame.freeze(),
                reply,
            })
            .map_err(|_| MkvError::ConnectionClosed)?;
        trace!(command_id = id, command = name, "command dispatched");
        Ok((id, receiver))
    }

    /// Dispatches `request` and waits for its typed result.
    pub(crate) async fn execute<T>(&self, request: &Request<T>) -> MkvResult<T> {
        let (_, receiver) = self.dispatch(request.name(), request.args())?;
        request.complete(receive(receiver).await)
    }
}

/// Awaits a reply; a dropped sender means the driver is gone.
pub(crate) async fn receive(receiver: ReplyReceiver) -> MkvResult<RespValue> {
    receiver.await.unwrap_or(Err(MkvError::ConnectionClosed))
}

async fn drive(
    stream: TcpStream,
    mut rx: mpsc::UnboundedReceiver<DriverMessage>,
    max_write_batch: usize,
    endpoint: &str,
) {
    let (mut reader, mut writer) = stream.into_split();
    let decoder = RespDecoder::default();
    let mut read_buf = BytesMut::with_capacity(8 * 1024);
    let mut write_buf = BytesMut::with_capacity(8 * 1024);
    let mut pending: VecDeque<PendingCommand> = VecDeque::new();
    let mut draining = false;

    let outcome: MkvResult<()> = loop {
        if draining && pending.is_empty() {
            break Ok(());
        }

        tokio::select! {
            message = rx.recv(), if !draining => {
                let Some(message) = message else {
                    draining = true;
                    continue;
                };
                draining = enqueue(message, &mut pending, &mut write_buf);
                let mut batched = 1;
                while !draining && batched < max_write_batch {
                    match rx.try_recv() {
                        Ok(message) => {
                            draining = enqueue(message, &mut pending, &mut write_buf);
                            batched += 1;
                        }
                        Err(_) => break,
                    }
                }
                if let Err(err) = flush(&mut writer, &mut write_buf).await {
                    break Err(err.into());
                }
            }
            read = reader.read_buf(&mut read_buf) => match read {
                Ok(0) => {
                    break Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    )
                    .into());
                }
                Ok(_) => {
                    if let Err(err) = complete_replies(&decoder, &mut read_buf, &mut pending) {
                        break Err(err);
                    }
                }
                Err(err) => break Err(err.into()),
            },
        }
    };

    match outcome {
        Ok(()) => {
            let _ = writer.shutdown().await;
            debug!(addr = %endpoint, "driver stopped");
        }
        Err(err) => {
            warn!(addr = %endpoint, error = %err, in_flight = pending.len(), "transport failed");
            for command in pending.drain(..) {
                let _ = command.reply.send(Err(err.duplicate()));
            }
        }
    }
    // Commands still queued in `rx` are dropped here; their callers observe
    // `ConnectionClosed`.
}

/// Queues a message for the next write. Returns true on shutdown.
fn enqueue(message: DriverMessage, pending: &mut VecDeque<PendingCommand>, write_buf: &mut BytesMut) -> bool {
    match message {
        DriverMessage::Command { id, frame, reply } => {
            write_buf.extend_from_slice(&frame);
            pending.push_back(PendingCommand { id, reply });
            false
        }
        DriverMessage::Shutdown => true,
    }
}

async fn flush(writer: &mut OwnedWriteHalf, write_buf: &mut BytesMut) -> std::io::Result<()> {
    if write_buf.is_empty() {
        return Ok(());
    }
    writer.write_all(write_buf).await?;
    write_buf.clear();
    writer.flush().await
}

fn complete_replies(
    decoder: &RespDecoder,
    read_buf: &mut BytesMut,
    pending: &mut VecDeque<PendingCommand>,
) -> MkvResult<()> {
    while let Some(reply) = decoder.decode(read_buf)? {
        let Some(command) = pending.pop_front() else {
            return Err(MkvError::Protocol("reply without a pending command"));
        };
        trace!(command_id = command.id, kind = reply.kind(), "reply received");
        // The caller may have dropped its future; the reply is discarded.
        let _ = command.reply.send(Ok(reply));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_tracks_pending_in_order() {
        let mut pending = VecDeque::new();
        let mut write_buf = BytesMut::new();
        let (tx_a, _rx_a) = oneshot::channel();
        let (tx_b, _rx_b) = oneshot::channel();

        let shutdown = enqueue(
            DriverMessage::Command {
                id: 7,
                frame: Bytes::from_static(b"*1\r\n$4\r\nPING\r\n"),
                reply: tx_a,
            },
            &mut pending,
            &mut write_buf,
        );
        assert!(!shutdown);
        enqueue(
            DriverMessage::Command {
                id: 8,
                frame: Bytes::from_static(b"*1\r\n$4\r\nPING\r\n"),
                reply: tx_b,
            },
            &mut pending,
            &mut write_buf,
        );
        assert!(enqueue(DriverMessage::Shutdown, &mut pending, &mut write_buf));

        assert_eq!(pending.iter().map(|cmd| cmd.id).collect::<Vec<_>>(), vec![7, 8]);
        assert_eq!(write_buf.len(), 28);
    }

    #[test]
    fn replies_complete_fifo() {
        let mut pending = VecDeque::new();
        let (tx_a, mut rx_a) = oneshot::channel();
        let (tx_b, mut rx_b) = oneshot::channel();
        pending.push_back(PendingCommand { id: 1, reply: tx_a });
        pending.push_back(PendingCommand { id: 2, reply: tx_b });

        let mut read_buf = BytesMut::from(&b"+OK\r\n:3\r\n"[..]);
        complete_replies(&RespDecoder::default(), &mut read_buf, &mut pending).unwrap();

        assert!(pending.is_empty());
        assert_eq!(rx_a.try_recv().unwrap().unwrap(), RespValue::Simple("OK".to_string()));
        assert_eq!(rx_b.try_recv().unwrap().unwrap(), RespValue::Integer(3));
    }

    #[test]
    fn partial_reply_waits_for_more_bytes() {
        let mut pending = VecDeque::new();
        let (tx, mut rx) = oneshot::channel();
        pending.push_back(PendingCommand { id: 1, reply: tx });

        let mut read_buf = BytesMut::from(&b"$5\r\nhel"[..]);
        complete_replies(&RespDecoder::default(), &mut read_buf, &mut pending).unwrap();
        assert_eq!(pending.len(), 1);
        assert!(rx.try_recv().is_err());

        read_buf.extend_from_slice(b"lo\r\n");
        complete_replies(&RespDecoder::default(), &mut read_buf, &mut pending).unwrap();
        assert_eq!(rx.try_recv().unwrap().unwrap(), RespValue::bulk("hello"));
    }

    #[test]
    fn unsolicited_reply_is_a_protocol_error() {
        let mut pending = VecDeque::new();
        let mut read_buf = BytesMut::from(&b"+OK\r\n"[..]);
        let err = complete_replies(&RespDecoder::default(), &mut read_buf, &mut pending).unwrap_err();
        assert!(matches!(err, MkvError::Protocol(_)));
    }
}
