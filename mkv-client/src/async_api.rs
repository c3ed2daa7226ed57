//! # Future-Based Commands
//!
//! Purpose: Issue commands eagerly and hand back a future for the reply, so
//! the issuing task is never suspended by the network.
//!
//! ## Design Principles
//! 1. **Eager Dispatch**: The command is queued before the future is returned.
//! 2. **Two Error Channels**: Argument errors are returned as `Err` right away;
//!    transport, store and closed-connection errors resolve the future.
//! 3. **Drop Is Not Cancel**: Dropping a `CommandFuture` discards the reply but
//!    the store still executes the command.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::ready;

use mkv_common::{MkvError, MkvResult, TtlStatus};

use crate::command::{self, complete, Decoder, Request};
use crate::connection::{Connection, ReplyReceiver};

/// Reply of one eagerly dispatched command.
///
/// Compose it with `futures::FutureExt` (`map`, `then`, ...) or `.await` it.
#[must_use = "the command is already sent; await the future to observe its result"]
pub struct CommandFuture<T> {
    command_id: Option<u64>,
    state: FutureState<T>,
}

enum FutureState<T> {
    Waiting {
        name: &'static str,
        receiver: ReplyReceiver,
        decode: Decoder<T>,
    },
    Failed(MkvError),
    Done,
}

impl<T> CommandFuture<T> {
    fn waiting(command_id: u64, request: &Request<T>, receiver: ReplyReceiver) -> Self {
        CommandFuture {
            command_id: Some(command_id),
            state: FutureState::Waiting {
                name: request.name(),
                receiver,
                decode: request.decoder(),
            },
        }
    }

    fn failed(err: MkvError) -> Self {
        CommandFuture {
            command_id: None,
            state: FutureState::Failed(err),
        }
    }

    /// In-flight id of the command, or `None` if it never reached the queue.
    pub fn command_id(&self) -> Option<u64> {
        self.command_id
    }
}

impl<T> Future for CommandFuture<T> {
    type Output = MkvResult<T>;

    /// Polling again after completion yields `ConnectionClosed`.
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let outcome = match &mut this.state {
            FutureState::Waiting { name, receiver, decode } => {
                let received = ready!(Pin::new(receiver).poll(cx));
                complete(*name, *decode, received.unwrap_or(Err(MkvError::ConnectionClosed)))
            }
            FutureState::Failed(err) => Err(std::mem::replace(err, MkvError::ConnectionClosed)),
            FutureState::Done => Err(MkvError::ConnectionClosed),
        };
        this.state = FutureState::Done;
        Poll::Ready(outcome)
    }
}

/// Future-returning view over a shared [`Connection`].
#[derive(Debug, Clone)]
pub struct AsyncCommands {
    conn: Connection,
}

impl AsyncCommands {
    pub(crate) fn new(conn: Connection) -> Self {
        AsyncCommands { conn }
    }

    fn issue<T>(&self, request: Request<T>) -> CommandFuture<T> {
        match self.conn.dispatch(request.name(), request.args()) {
            Ok((id, receiver)) => CommandFuture::waiting(id, &request, receiver),
            Err(err) => CommandFuture::failed(err),
        }
    }

    pub fn set(&self, key: &str, value: &str) -> MkvResult<CommandFuture<String>> {
        Ok(self.issue(command::set(key, value)?))
    }

    /// Resolves to `None` when the key is missing.
    pub fn get(&self, key: &str) -> MkvResult<CommandFuture<Option<String>>> {
        Ok(self.issue(command::get(key)?))
    }

    pub fn set_with_expiry(&self, key: &str, value: &str, ttl_secs: u64) -> MkvResult<CommandFuture<String>> {
        Ok(self.issue(command::set_with_expiry(key, value, ttl_secs)?))
    }

    pub fn ttl(&self, key: &str) -> MkvResult<CommandFuture<TtlStatus>> {
        Ok(self.issue(command::ttl(key)?))
    }

    pub fn set_hash_fields(&self, key: &str, fields: &HashMap<String, String>) -> MkvResult<CommandFuture<i64>> {
        Ok(self.issue(command::set_hash_fields(key, fields)?))
    }

    pub fn get_hash_fields(&self, key: &str) -> MkvResult<CommandFuture<HashMap<String, String>>> {
        Ok(self.issue(command::get_hash_fields(key)?))
    }

    pub fn exists(&self, key: &str) -> MkvResult<CommandFuture<bool>> {
        Ok(self.issue(command::exists(key)?))
    }

    pub fn ping(&self) -> CommandFuture<String> {
        self.issue(command::ping())
    }
}
