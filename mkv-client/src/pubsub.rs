//! # Publish/Subscribe Channel
//!
//! Purpose: Deliver channel messages to registered handlers over a dedicated
//! subscription-mode connection, while publishing on the regular one.
//!
//! ## Design Principles
//! 1. **Separate Connection**: A subscribed socket cannot run regular
//!    commands, so subscriptions get their own I/O thread and socket, opened
//!    on the first `subscribe`.
//! 2. **Explicit State Machine**: Each channel moves through
//!    `Unsubscribed → Subscribing → Subscribed → Unsubscribing`.
//! 3. **Driver Owns Acknowledgments**: The I/O driver matches acks to waiters,
//!    enforces the ack timeout and flips channel state before any message for
//!    that channel can be dispatched.
//! 4. **Ordered Delivery**: Handlers run inline on the subscription thread, in
//!    the order messages arrive.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, info, warn};

use mkv_common::{encode_command, validate_channel, MkvError, MkvResult, RespDecoder, RespValue};

use crate::command;
use crate::connection::Connection;
use crate::transport::{establish, join_io_thread, spawn_io_thread};

/// Callback invoked for every message on a subscribed channel.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, channel: &str, message: &str);
}

impl<F> MessageHandler for F
where
    F: Fn(&str, &str) + Send + Sync,
{
    fn on_message(&self, channel: &str, message: &str) {
        self(channel, message)
    }
}

/// Lifecycle of one channel subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Subscribed,
    Unsubscribing,
}

struct ChannelEntry {
    state: SubscriptionState,
    handlers: Vec<Arc<dyn MessageHandler>>,
}

type Registry = Arc<RwLock<HashMap<String, ChannelEntry>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckKind {
    Subscribe,
    Unsubscribe,
}

impl AckKind {
    fn command(self) -> &'static [u8] {
        match self {
            AckKind::Subscribe => b"SUBSCRIBE",
            AckKind::Unsubscribe => b"UNSUBSCRIBE",
        }
    }
}

enum LinkMessage {
    Request {
        kind: AckKind,
        channel: String,
        ack: oneshot::Sender<MkvResult<()>>,
    },
    Shutdown,
}

/// Running subscription connection.
struct SubscriptionLink {
    tx: mpsc::UnboundedSender<LinkMessage>,
    alive: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionLink {
    /// False once the driver has stopped, for whatever reason.
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    async fn request(&self, kind: AckKind, channel: &str) -> MkvResult<()> {
        let (ack, ack_rx) = oneshot::channel();
        self.tx
            .send(LinkMessage::Request {
                kind,
                channel: channel.to_string(),
                ack,
            })
            .map_err(|_| MkvError::ConnectionClosed)?;
        ack_rx.await.unwrap_or(Err(MkvError::ConnectionClosed))
    }

    fn shutdown(&self) {
        let _ = self.tx.send(LinkMessage::Shutdown);
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            join_io_thread(thread);
        }
    }
}

struct PubSubInner {
    parent: Connection,
    registry: Registry,
    link: Mutex<Option<Arc<SubscriptionLink>>>,
    opening: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

/// Publish/subscribe facade tied to a parent [`Connection`].
///
/// Cloning shares the same subscription connection and handler registry.
#[derive(Clone)]
pub struct PubSubChannel {
    inner: Arc<PubSubInner>,
}

impl fmt::Debug for PubSubChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubChannel")
            .field("endpoint", &self.inner.parent.endpoint())
            .field("channels", &self.subscribed_channels())
            .finish()
    }
}

impl PubSubChannel {
    pub(crate) fn new(parent: Connection) -> Self {
        PubSubChannel {
            inner: Arc::new(PubSubInner {
                parent,
                registry: Arc::new(RwLock::new(HashMap::new())),
                link: Mutex::new(None),
                opening: tokio::sync::Mutex::new(()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Registers `handler` for `channel`, subscribing on the wire if needed.
    ///
    /// Resolves once the store acknowledged the subscription. A missing or
    /// failed acknowledgment yields `Subscription`, and the handler is removed.
    pub async fn subscribe<H>(&self, channel: &str, handler: H) -> MkvResult<()>
    where
        H: MessageHandler + 'static,
    {
        validate_channel(channel)?;
        self.ensure_open()?;
        let handler: Arc<dyn MessageHandler> = Arc::new(handler);

        {
            let mut registry = self.inner.registry.write();
            let entry = registry.entry(channel.to_string()).or_insert_with(|| ChannelEntry {
                state: SubscriptionState::Unsubscribed,
                handlers: Vec::new(),
            });
            entry.handlers.push(Arc::clone(&handler));
            if entry.state == SubscriptionState::Subscribed {
                debug!(channel, handlers = entry.handlers.len(), "handler added");
                return Ok(());
            }
            entry.state = SubscriptionState::Subscribing;
        }
        debug!(channel, "subscribing");

        let outcome = match self.link().await {
            Ok(link) => link.request(AckKind::Subscribe, channel).await,
            Err(err) => Err(err),
        };

        match outcome {
            Ok(()) => {
                debug!(channel, "subscribed");
                Ok(())
            }
            Err(err) => {
                self.rollback(channel, &handler);
                warn!(channel, error = %err, "subscribe failed");
                Err(match err {
                    MkvError::Subscription(_) => err,
                    other => MkvError::Subscription(format!("subscribe to {channel} failed: {other}")),
                })
            }
        }
    }

    /// Drops every handler for `channel` and leaves it on the wire.
    ///
    /// No message is delivered for `channel` once this is called. Leaving a
    /// channel that is not subscribed is a no-op.
    pub async fn unsubscribe(&self, channel: &str) -> MkvResult<()> {
        validate_channel(channel)?;
        self.ensure_open()?;

        let active = {
            let mut registry = self.inner.registry.write();
            match registry.get_mut(channel) {
                Some(entry) => {
                    entry.handlers.clear();
                    entry.state = SubscriptionState::Unsubscribing;
                    true
                }
                None => false,
            }
        };
        if !active {
            return Ok(());
        }
        debug!(channel, "unsubscribing");

        let link = self.inner.link.lock().clone();
        let outcome = match link {
            Some(link) => link.request(AckKind::Unsubscribe, channel).await,
            None => Ok(()),
        };

        // The driver removes the entry when the ack arrives; clear it here for
        // the failure and no-link paths.
        {
            let mut registry = self.inner.registry.write();
            if registry
                .get(channel)
                .is_some_and(|entry| entry.state == SubscriptionState::Unsubscribing)
            {
                registry.remove(channel);
            }
        }

        outcome.map_err(|err| match err {
            MkvError::Subscription(_) => err,
            other => MkvError::Subscription(format!("unsubscribe from {channel} failed: {other}")),
        })
    }

    /// Publishes `message` on `channel` through the parent connection.
    ///
    /// Returns the number of subscribers that received it.
    pub async fn publish(&self, channel: &str, message: &str) -> MkvResult<i64> {
        let request = command::publish(channel, message)?;
        self.inner.parent.execute(&request).await
    }

    /// Current state of `channel`.
    pub fn state(&self, channel: &str) -> SubscriptionState {
        self.inner
            .registry
            .read()
            .get(channel)
            .map(|entry| entry.state)
            .unwrap_or(SubscriptionState::Unsubscribed)
    }

    /// Channels in the `Subscribed` state, sorted.
    pub fn subscribed_channels(&self) -> Vec<String> {
        let registry = self.inner.registry.read();
        let mut channels: Vec<String> = registry
            .iter()
            .filter(|(_, entry)| entry.state == SubscriptionState::Subscribed)
            .map(|(channel, _)| channel.clone())
            .collect();
        channels.sort();
        channels
    }

    /// Number of handlers registered for `channel`.
    pub fn handler_count(&self, channel: &str) -> usize {
        self.inner
            .registry
            .read()
            .get(channel)
            .map(|entry| entry.handlers.len())
            .unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Drops every handler and closes the subscription connection.
    ///
    /// The parent connection stays open. Calling this again is a no-op.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.registry.write().clear();
        let link = self.inner.link.lock().take();
        if let Some(link) = link {
            link.shutdown();
            info!(addr = %self.inner.parent.endpoint(), "subscription connection closed");
        }
    }

    fn ensure_open(&self) -> MkvResult<()> {
        if self.is_closed() {
            return Err(MkvError::ConnectionClosed);
        }
        Ok(())
    }

    fn rollback(&self, channel: &str, handler: &Arc<dyn MessageHandler>) {
        let mut registry = self.inner.registry.write();
        let Some(entry) = registry.get_mut(channel) else {
            return;
        };
        entry.handlers.retain(|existing| !Arc::ptr_eq(existing, handler));
        if entry.handlers.is_empty() {
            registry.remove(channel);
        } else if entry.state != SubscriptionState::Subscribed {
            entry.state = SubscriptionState::Unsubscribed;
        }
    }

    /// Returns the subscription connection, opening it on first use and
    /// reopening it after the previous one was lost.
    async fn link(&self) -> MkvResult<Arc<SubscriptionLink>> {
        if let Some(link) = self.live_link() {
            return Ok(link);
        }

        let _opening = self.inner.opening.lock().await;
        if let Some(link) = self.live_link() {
            return Ok(link);
        }

        let link = Arc::new(self.open().await?);
        if self.is_closed() {
            link.shutdown();
            return Err(MkvError::ConnectionClosed);
        }
        *self.inner.link.lock() = Some(Arc::clone(&link));
        Ok(link)
    }

    /// Current link if its driver is still running. A dead link is reaped.
    fn live_link(&self) -> Option<Arc<SubscriptionLink>> {
        let dead = {
            let mut slot = self.inner.link.lock();
            match slot.as_ref().map(|link| link.is_alive()) {
                Some(true) => return slot.clone(),
                Some(false) => slot.take(),
                None => return None,
            }
        };
        if let Some(dead) = dead {
            dead.shutdown();
            debug!(addr = %self.inner.parent.endpoint(), "reaped lost subscription connection");
        }
        None
    }

    async fn open(&self) -> MkvResult<SubscriptionLink> {
        let endpoint = self.inner.parent.endpoint().to_string();
        let config = self.inner.parent.config().clone();
        let registry = Arc::clone(&self.inner.registry);
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let alive = Arc::new(AtomicBool::new(true));

        let driver_endpoint = endpoint.clone();
        let driver_alive = Arc::clone(&alive);
        let thread = spawn_io_thread("mkv-pubsub", move || async move {
            let stream = match establish(&driver_endpoint, &config).await {
                Ok(stream) => stream,
                Err(err) => {
                    driver_alive.store(false, Ordering::Release);
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            let driver = SubscriptionDriver::new(registry, config.subscribe_timeout, driver_alive);
            driver.run(stream, rx, &driver_endpoint).await;
        })?;

        let ready = ready_rx.await.unwrap_or_else(|_| {
            Err(MkvError::Connection {
                addr: endpoint.clone(),
                reason: "i/o thread exited before the handshake".to_string(),
            })
        });
        if let Err(err) = ready {
            join_io_thread(thread);
            return Err(err);
        }

        info!(addr = %endpoint, "subscription connection opened");
        Ok(SubscriptionLink {
            tx,
            alive,
            thread: Mutex::new(Some(thread)),
        })
    }
}

struct AwaitingAck {
    kind: AckKind,
    channel: String,
    deadline: Instant,
    ack: oneshot::Sender<MkvResult<()>>,
}

/// Owns the subscription socket: sends SUBSCRIBE/UNSUBSCRIBE, resolves acks
/// and dispatches pushed messages to handlers.
struct SubscriptionDriver {
    registry: Registry,
    ack_timeout: Duration,
    alive: Arc<AtomicBool>,
    awaiting: VecDeque<AwaitingAck>,
    out: BytesMut,
}

impl SubscriptionDriver {
    fn new(registry: Registry, ack_timeout: Duration, alive: Arc<AtomicBool>) -> Self {
        SubscriptionDriver {
            registry,
            ack_timeout,
            alive,
            awaiting: VecDeque::new(),
            out: BytesMut::with_capacity(256),
        }
    }

    async fn run(mut self, stream: TcpStream, mut rx: mpsc::UnboundedReceiver<LinkMessage>, endpoint: &str) {
        let (mut reader, mut writer) = stream.into_split();
        let decoder = RespDecoder::default();
        let mut read_buf = BytesMut::with_capacity(4 * 1024);

        let outcome: MkvResult<()> = loop {
            let deadline = self.awaiting.iter().map(|waiting| waiting.deadline).min();

            tokio::select! {
                message = rx.recv() => match message {
                    Some(LinkMessage::Request { kind, channel, ack }) => {
                        self.request(kind, channel, ack);
                    }
                    Some(LinkMessage::Shutdown) | None => break Ok(()),
                },
                read = reader.read_buf(&mut read_buf) => match read {
                    Ok(0) => {
                        break Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "subscription connection closed by peer",
                        )
                        .into());
                    }
                    Ok(_) => {
                        if let Err(err) = self.drain_frames(&decoder, &mut read_buf) {
                            break Err(err);
                        }
                    }
                    Err(err) => break Err(err.into()),
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.expire(Instant::now());
                }
            }

            if let Err(err) = flush(&mut writer, &mut self.out).await {
                break Err(err.into());
            }
        };

        // Mark the link dead before any waiter can observe the failure.
        self.alive.store(false, Ordering::Release);
        match outcome {
            Ok(()) => {
                let _ = writer.shutdown().await;
                debug!(addr = %endpoint, "subscription driver stopped");
            }
            Err(err) => {
                warn!(addr = %endpoint, error = %err, "subscription transport failed");
                for waiting in self.awaiting.drain(..) {
                    let _ = waiting.ack.send(Err(err.duplicate()));
                }
                // Nothing will be delivered any more.
                self.registry.write().clear();
            }
        }
    }

    fn request(&mut self, kind: AckKind, channel: String, ack: oneshot::Sender<MkvResult<()>>) {
        encode_command(&[kind.command(), channel.as_bytes()], &mut self.out);
        self.awaiting.push_back(AwaitingAck {
            kind,
            channel,
            deadline: Instant::now() + self.ack_timeout,
            ack,
        });
    }

    fn drain_frames(&mut self, decoder: &RespDecoder, read_buf: &mut BytesMut) -> MkvResult<()> {
        while let Some(frame) = decoder.decode(read_buf)? {
            self.on_frame(frame);
        }
        Ok(())
    }

    fn on_frame(&mut self, frame: RespValue) {
        let items = match frame {
            RespValue::Array(Some(items)) => items,
            RespValue::Error(message) => {
                // An error reply answers the oldest outstanding request.
                if let Some(waiting) = self.awaiting.pop_front() {
                    let _ = waiting.ack.send(Err(MkvError::Subscription(message)));
                }
                return;
            }
            other => {
                debug!(kind = other.kind(), "ignoring unexpected frame");
                return;
            }
        };

        let kind = items.first().and_then(RespValue::as_bytes).unwrap_or_default();
        let channel = items
            .get(1)
            .and_then(RespValue::as_bytes)
            .map(|raw| String::from_utf8_lossy(raw).into_owned());

        if kind.eq_ignore_ascii_case(b"message") {
            if let (Some(channel), Some(payload)) = (channel, items.get(2).and_then(RespValue::as_bytes)) {
                self.deliver(&channel, &String::from_utf8_lossy(payload));
            }
        } else if kind.eq_ignore_ascii_case(b"subscribe") {
            if let Some(channel) = channel {
                self.on_ack(AckKind::Subscribe, channel);
            }
        } else if kind.eq_ignore_ascii_case(b"unsubscribe") {
            if let Some(channel) = channel {
                self.on_ack(AckKind::Unsubscribe, channel);
            }
        }
    }

    fn on_ack(&mut self, kind: AckKind, channel: String) {
        {
            let mut registry = self.registry.write();
            match kind {
                AckKind::Subscribe => match registry.get_mut(&channel) {
                    // A rolled-back sibling subscribe may have reset the state
                    // while this request was still in flight.
                    Some(entry) if !entry.handlers.is_empty() => {
                        entry.state = SubscriptionState::Subscribed;
                    }
                    Some(_) => {}
                    None => {
                        // Late ack for a subscribe that already failed locally.
                        debug!(channel = %channel, "leaving channel without handlers");
                        encode_command(&[AckKind::Unsubscribe.command(), channel.as_bytes()], &mut self.out);
                    }
                },
                AckKind::Unsubscribe => {
                    if registry
                        .get(&channel)
                        .is_some_and(|entry| entry.state == SubscriptionState::Unsubscribing)
                    {
                        registry.remove(&channel);
                    }
                }
            }
        }

        let position = self
            .awaiting
            .iter()
            .position(|waiting| waiting.kind == kind && waiting.channel == channel);
        if let Some(waiting) = position.and_then(|idx| self.awaiting.remove(idx)) {
            let _ = waiting.ack.send(Ok(()));
        }
    }

    fn deliver(&self, channel: &str, message: &str) {
        let handlers: Vec<Arc<dyn MessageHandler>> = match self.registry.read().get(channel) {
            Some(entry) => entry.handlers.clone(),
            None => return,
        };
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler.on_message(channel, message))).is_err() {
                warn!(channel, "message handler panicked");
            }
        }
    }

    fn expire(&mut self, now: Instant) {
        let ack_timeout = self.ack_timeout;
        let mut idx = 0;
        while idx < self.awaiting.len() {
            if self.awaiting[idx].deadline > now {
                idx += 1;
                continue;
            }
            if let Some(waiting) = self.awaiting.remove(idx) {
                let verb = match waiting.kind {
                    AckKind::Subscribe => "subscribe",
                    AckKind::Unsubscribe => "unsubscribe",
                };
                let _ = waiting.ack.send(Err(MkvError::Subscription(format!(
                    "no {verb} acknowledgment for {} within {ack_timeout:?}",
                    waiting.channel
                ))));
            }
        }
    }
}

async fn flush(writer: &mut OwnedWriteHalf, out: &mut BytesMut) -> std::io::Result<()> {
    if out.is_empty() {
        return Ok(());
    }
    writer.write_all(out).await?;
    out.clear();
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn registry_with(channel: &str, state: SubscriptionState, handler: Arc<dyn MessageHandler>) -> Registry {
        let mut map = HashMap::new();
        map.insert(
            channel.to_string(),
            ChannelEntry {
                state,
                handlers: vec![handler],
            },
        );
        Arc::new(RwLock::new(map))
    }

    fn alive() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(true))
    }

    fn push(kind: &'static str, channel: &'static str, payload: RespValue) -> RespValue {
        RespValue::array(vec![RespValue::bulk(kind), RespValue::bulk(channel), payload])
    }

    #[tokio::test]
    async fn subscribe_ack_marks_channel_subscribed() {
        let registry = registry_with("chat", SubscriptionState::Subscribing, Arc::new(|_: &str, _: &str| {}));
        let mut driver = SubscriptionDriver::new(Arc::clone(&registry), Duration::from_secs(1), alive());
        let (ack, ack_rx) = oneshot::channel();
        driver.request(AckKind::Subscribe, "chat".to_string(), ack);
        assert_eq!(&driver.out[..], b"*2\r\n$9\r\nSUBSCRIBE\r\n$4\r\nchat\r\n");

        driver.on_frame(push("subscribe", "chat", RespValue::Integer(1)));
        assert!(ack_rx.await.unwrap().is_ok());
        assert_eq!(registry.read()["chat"].state, SubscriptionState::Subscribed);
        assert!(driver.awaiting.is_empty());
    }

    #[test]
    fn messages_reach_every_handler_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&seen);
        let registry = registry_with(
            "chat",
            SubscriptionState::Subscribed,
            Arc::new(move |_: &str, message: &str| first.lock().push(format!("a:{message}"))),
        );
        let second = Arc::clone(&seen);
        registry
            .write()
            .get_mut("chat")
            .unwrap()
            .handlers
            .push(Arc::new(move |_: &str, message: &str| second.lock().push(format!("b:{message}"))));

        let mut driver = SubscriptionDriver::new(registry, Duration::from_secs(1), alive());
        driver.on_frame(push("message", "chat", RespValue::bulk("one")));
        driver.on_frame(push("message", "chat", RespValue::bulk("two")));
        driver.on_frame(push("message", "other", RespValue::bulk("skip")));

        assert_eq!(*seen.lock(), vec!["a:one", "b:one", "a:two", "b:two"]);
    }

    #[test]
    fn panicking_handler_does_not_stop_delivery() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let registry = registry_with("chat", SubscriptionState::Subscribed, Arc::new(|_: &str, _: &str| panic!("boom")));
        registry
            .write()
            .get_mut("chat")
            .unwrap()
            .handlers
            .push(Arc::new(move |_: &str, _: &str| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));

        let mut driver = SubscriptionDriver::new(registry, Duration::from_secs(1), alive());
        driver.on_frame(push("message", "chat", RespValue::bulk("hi")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_ack_times_out() {
        let registry: Registry = Arc::new(RwLock::new(HashMap::new()));
        let mut driver = SubscriptionDriver::new(registry, Duration::from_millis(10), alive());
        let (ack, ack_rx) = oneshot::channel();
        driver.request(AckKind::Subscribe, "chat".to_string(), ack);

        driver.expire(Instant::now() + Duration::from_millis(20));
        let err = ack_rx.await.unwrap().unwrap_err();
        assert!(matches!(err, MkvError::Subscription(_)));
        assert!(driver.awaiting.is_empty());
    }

    #[test]
    fn late_subscribe_ack_leaves_channel() {
        let registry: Registry = Arc::new(RwLock::new(HashMap::new()));
        let mut driver = SubscriptionDriver::new(registry, Duration::from_secs(1), alive());
        driver.on_frame(push("subscribe", "ghost", RespValue::Integer(1)));
        assert_eq!(&driver.out[..], b"*2\r\n$11\r\nUNSUBSCRIBE\r\n$5\r\nghost\r\n");
    }

    #[test]
    fn unsubscribe_ack_removes_entry() {
        let registry = registry_with("chat", SubscriptionState::Unsubscribing, Arc::new(|_: &str, _: &str| {}));
        let mut driver = SubscriptionDriver::new(Arc::clone(&registry), Duration::from_secs(1), alive());
        driver.on_frame(push("unsubscribe", "chat", RespValue::Integer(0)));
        assert!(registry.read().get("chat").is_none());
    }

    #[test]
    fn subscribe_ack_restores_state_reset_by_sibling_rollback() {
        let registry = registry_with("chat", SubscriptionState::Unsubscribed, Arc::new(|_: &str, _: &str| {}));
        let mut driver = SubscriptionDriver::new(Arc::clone(&registry), Duration::from_secs(1), alive());
        let (ack, _ack_rx) = oneshot::channel();
        driver.request(AckKind::Subscribe, "chat".to_string(), ack);

        driver.on_frame(push("subscribe", "chat", RespValue::Integer(1)));
        assert_eq!(registry.read()["chat"].state, SubscriptionState::Subscribed);
    }

    #[test]
    fn subscribe_ack_does_not_revive_unsubscribing_channel() {
        let registry = registry_with("chat", SubscriptionState::Unsubscribing, Arc::new(|_: &str, _: &str| {}));
        registry.write().get_mut("chat").unwrap().handlers.clear();
        let mut driver = SubscriptionDriver::new(Arc::clone(&registry), Duration::from_secs(1), alive());

        driver.on_frame(push("subscribe", "chat", RespValue::Integer(1)));
        assert_eq!(registry.read()["chat"].state, SubscriptionState::Unsubscribing);
    }
}
