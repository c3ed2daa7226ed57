//! Socket establishment and I/O thread plumbing shared by the command
//! connection and the subscription connection.

use std::future::Future;
use std::thread::JoinHandle;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::warn;

use mkv_common::{encode_command, MkvError, MkvResult, RespDecoder, RespValue};

use crate::config::ClientConfig;

/// Opens a TCP stream to `endpoint` and verifies it with a `PING` handshake.
///
/// Bounded by `connect_timeout` when configured. Every failure is reported as
/// `MkvError::Connection` carrying the endpoint.
pub(crate) async fn establish(endpoint: &str, config: &ClientConfig) -> MkvResult<TcpStream> {
    let attempt = async {
        let mut stream = TcpStream::connect(endpoint).await?;
        stream.set_nodelay(true)?;
        handshake(&mut stream).await?;
        Ok::<_, MkvError>(stream)
    };

    let outcome = match config.connect_timeout {
        Some(limit) => match tokio::time::timeout(limit, attempt).await {
            Ok(outcome) => outcome,
            Err(_) => Err(MkvError::Connection {
                addr: endpoint.to_string(),
                reason: format!("timed out after {limit:?}"),
            }),
        },
        None => attempt.await,
    };

    outcome.map_err(|err| match err {
        MkvError::Connection { .. } => err,
        other => MkvError::Connection {
            addr: endpoint.to_string(),
            reason: other.to_string(),
        },
    })
}

async fn handshake(stream: &mut TcpStream) -> MkvResult<()> {
    let mut frame = BytesMut::with_capacity(16);
    encode_command(&[b"PING"], &mut frame);
    stream.write_all(&frame).await?;

    let decoder = RespDecoder::default();
    let mut buf = BytesMut::with_capacity(64);
    loop {
        if let Some(reply) = decoder.decode(&mut buf)? {
            return match reply {
                RespValue::Simple(text) if text.eq_ignore_ascii_case("PONG") => Ok(()),
                RespValue::Error(message) => Err(MkvError::Command(message)),
                _ => Err(MkvError::UnexpectedResponse { command: "PING" }),
            };
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed during handshake",
            )
            .into());
        }
    }
}

/// Runs `task` on a dedicated thread driving a current-thread runtime.
///
/// The runtime is built on the calling thread so setup failures surface as
/// errors instead of a silently dead thread.
pub(crate) fn spawn_io_thread<F, Fut>(name: &str, task: F) -> MkvResult<JoinHandle<()>>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let handle = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || runtime.block_on(task()))?;
    Ok(handle)
}

/// Joins an I/O thread unless called from that thread (e.g. by a message
/// handler), which would deadlock.
pub(crate) fn join_io_thread(handle: JoinHandle<()>) {
    if handle.thread().id() == std::thread::current().id() {
        return;
    }
    if handle.join().is_err() {
        warn!("i/o thread panicked");
    }
}
