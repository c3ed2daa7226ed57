//! # TCP Server
//!
//! Accept RESP2 connections, parse commands, and dispatch them to the
//! in-memory store and the pub/sub broker.
//!
//! A connection that holds at least one subscription is in subscription mode:
//! like Redis, it only accepts SUBSCRIBE, UNSUBSCRIBE, PING and QUIT until
//! every channel has been left.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use mkv_common::{RespDecoder, RespValue};

use crate::broker::{Broker, SubscriberId};
use crate::store::MemoryStore;

/// State shared by every client connection of one server instance.
#[derive(Debug, Default)]
pub struct ServerState {
    pub store: MemoryStore,
    pub broker: Broker,
}

impl ServerState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Per-connection session data.
struct Session {
    id: SubscriberId,
    channels: BTreeSet<Bytes>,
    push: mpsc::UnboundedSender<RespValue>,
}

impl Session {
    fn in_subscription_mode(&self) -> bool {
        !self.channels.is_empty()
    }
}

/// Handles a single TCP client connection.
pub async fn handle_connection(stream: TcpStream, state: Arc<ServerState>) -> std::io::Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();
    let (push_tx, push_rx) = mpsc::unbounded_channel();
    let mut session = Session {
        id: state.broker.register(),
        channels: BTreeSet::new(),
        push: push_tx,
    };
    debug!(?peer, session = session.id, "client connected");

    let result = run_session(reader, writer, push_rx, &state, &mut session).await;

    state.broker.unsubscribe_all(session.id);
    debug!(?peer, session = session.id, "client disconnected");
    result
}

async fn run_session(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    mut push_rx: mpsc::UnboundedReceiver<RespValue>,
    state: &ServerState,
    session: &mut Session,
) -> std::io::Result<()> {
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let mut out = BytesMut::with_capacity(1024);
    let decoder = RespDecoder::default();

    loop {
        tokio::select! {
            read = reader.read_buf(&mut buffer) => {
                if read? == 0 {
                    return Ok(());
                }

                loop {
                    let frame = match decoder.decode(&mut buffer) {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break,
                        Err(err) => {
                            warn!(session = session.id, error = %err, "dropping client after protocol error");
                            out.clear();
                            resp_error("ERR Protocol error").encode(&mut out);
                            writer.write_all(&out).await?;
                            return Ok(());
                        }
                    };

                    out.clear();
                    let args = match command_args(frame) {
                        Some(args) if !args.is_empty() => args,
                        _ => {
                            resp_error("ERR expected a non-empty array of bulk strings").encode(&mut out);
                            writer.write_all(&out).await?;
                            continue;
                        }
                    };

                    if eq_ignore_ascii_case(&args[0], b"QUIT") {
                        resp_simple("OK").encode(&mut out);
                        writer.write_all(&out).await?;
                        return Ok(());
                    }
                    for reply in dispatch_command(&args, state, session) {
                        reply.encode(&mut out);
                    }
                    writer.write_all(&out).await?;
                }
            }
            Some(push) = push_rx.recv() => {
                out.clear();
                push.encode(&mut out);
                writer.write_all(&out).await?;
            }
        }
    }
}

fn command_args(frame: RespValue) -> Option<Vec<Bytes>> {
    let RespValue::Array(Some(items)) = frame else {
        return None;
    };
    items
        .into_iter()
        .map(|item| match item {
            RespValue::Bulk(Some(data)) => Some(data),
            _ => None,
        })
        .collect()
}

fn dispatch_command(args: &[Bytes], state: &ServerState, session: &mut Session) -> Vec<RespValue> {
    let cmd = &args[0];

    if session.in_subscription_mode() {
        if eq_ignore_ascii_case(cmd, b"SUBSCRIBE") {
            return handle_subscribe(args, state, session);
        }
        if eq_ignore_ascii_case(cmd, b"UNSUBSCRIBE") {
            return handle_unsubscribe(args, state, session);
        }
        if eq_ignore_ascii_case(cmd, b"PING") {
            let payload = args.get(1).cloned().unwrap_or_default();
            return vec![RespValue::array(vec![RespValue::bulk("pong"), RespValue::bulk(payload)])];
        }
        return vec![resp_error(&format!(
            "ERR Can't execute '{}': only (P|S)SUBSCRIBE / (P|S)UNSUBSCRIBE / PING / QUIT / RESET are allowed in this context",
            String::from_utf8_lossy(cmd).to_ascii_lowercase()
        ))];
    }

    let reply = if eq_ignore_ascii_case(cmd, b"PING") {
        handle_ping(args)
    } else if eq_ignore_ascii_case(cmd, b"GET") {
        handle_get(args, &state.store)
    } else if eq_ignore_ascii_case(cmd, b"SET") {
        handle_set(args, &state.store)
    } else if eq_ignore_ascii_case(cmd, b"SETEX") {
        handle_setex(args, &state.store)
    } else if eq_ignore_ascii_case(cmd, b"TTL") {
        handle_ttl(args, &state.store)
    } else if eq_ignore_ascii_case(cmd, b"HSET") {
        handle_hset(args, &state.store)
    } else if eq_ignore_ascii_case(cmd, b"HGETALL") {
        handle_hgetall(args, &state.store)
    } else if eq_ignore_ascii_case(cmd, b"EXISTS") {
        handle_exists(args, &state.store)
    } else if eq_ignore_ascii_case(cmd, b"DEL") {
        handle_del(args, &state.store)
    } else if eq_ignore_ascii_case(cmd, b"PUBLISH") {
        handle_publish(args, &state.broker)
    } else if eq_ignore_ascii_case(cmd, b"SUBSCRIBE") {
        return handle_subscribe(args, state, session);
    } else if eq_ignore_ascii_case(cmd, b"UNSUBSCRIBE") {
        return handle_unsubscribe(args, state, session);
    } else if eq_ignore_ascii_case(cmd, b"INFO") {
        handle_info()
    } else {
        resp_error(&format!(
            "ERR unknown command '{}'",
            String::from_utf8_lossy(cmd)
        ))
    };
    vec![reply]
}

fn handle_ping(args: &[Bytes]) -> RespValue {
    match args.len() {
        1 => resp_simple("PONG"),
        2 => RespValue::bulk(args[1].clone()),
        _ => wrong_args("ping"),
    }
}

fn handle_get(args: &[Bytes], store: &MemoryStore) -> RespValue {
    if args.len() != 2 {
        return wrong_args("get");
    }
    match store.get(&args[1]) {
        Ok(Some(value)) => RespValue::bulk(value),
        Ok(None) => RespValue::Bulk(None),
        Err(err) => resp_error(&err.to_string()),
    }
}

fn handle_set(args: &[Bytes], store: &MemoryStore) -> RespValue {
    if args.len() == 3 {
        store.set(args[1].clone(), args[2].clone(), None);
        return resp_simple("OK");
    }

    if args.len() == 5 && eq_ignore_ascii_case(&args[3], b"EX") {
        let seconds = match parse_positive(&args[4], "set") {
            Ok(value) => value,
            Err(resp) => return resp,
        };
        store.set(args[1].clone(), args[2].clone(), Some(Duration::from_secs(seconds)));
        return resp_simple("OK");
    }

    if args.len() < 3 {
        return wrong_args("set");
    }
    resp_error("ERR syntax error")
}

fn handle_setex(args: &[Bytes], store: &MemoryStore) -> RespValue {
    if args.len() != 4 {
        return wrong_args("setex");
    }
    let seconds = match parse_positive(&args[2], "setex") {
        Ok(value) => value,
        Err(resp) => return resp,
    };
    store.set(args[1].clone(), args[3].clone(), Some(Duration::from_secs(seconds)));
    resp_simple("OK")
}

fn handle_ttl(args: &[Bytes], store: &MemoryStore) -> RespValue {
    if args.len() != 2 {
        return wrong_args("ttl");
    }
    RespValue::Integer(store.ttl(&args[1]).to_reply())
}

fn handle_hset(args: &[Bytes], store: &MemoryStore) -> RespValue {
    if args.len() < 4 || args.len() % 2 != 0 {
        return wrong_args("hset");
    }
    let fields = args[2..]
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect();
    match store.hset(args[1].clone(), fields) {
        Ok(created) => RespValue::Integer(created as i64),
        Err(err) => resp_error(&err.to_string()),
    }
}

fn handle_hgetall(args: &[Bytes], store: &MemoryStore) -> RespValue {
    if args.len() != 2 {
        return wrong_args("hgetall");
    }
    match store.hgetall(&args[1]) {
        Ok(fields) => RespValue::array(
            fields
                .into_iter()
                .flat_map(|(field, value)| [RespValue::bulk(field), RespValue::bulk(value)])
                .collect(),
        ),
        Err(err) => resp_error(&err.to_string()),
    }
}

fn handle_exists(args: &[Bytes], store: &MemoryStore) -> RespValue {
    if args.len() < 2 {
        return wrong_args("exists");
    }
    let count = args[1..].iter().filter(|key| store.exists(key)).count();
    RespValue::Integer(count as i64)
}

fn handle_del(args: &[Bytes], store: &MemoryStore) -> RespValue {
    if args.len() < 2 {
        return wrong_args("del");
    }
    let removed = args[1..].iter().filter(|key| store.delete(key)).count();
    RespValue::Integer(removed as i64)
}

fn handle_publish(args: &[Bytes], broker: &Broker) -> RespValue {
    if args.len() != 3 {
        return wrong_args("publish");
    }
    RespValue::Integer(broker.publish(&args[1], args[2].clone()) as i64)
}

fn handle_subscribe(args: &[Bytes], state: &ServerState, session: &mut Session) -> Vec<RespValue> {
    if args.len() < 2 {
        return vec![wrong_args("subscribe")];
    }
    args[1..]
        .iter()
        .map(|channel| {
            state
                .broker
                .subscribe(channel.clone(), session.id, session.push.clone());
            session.channels.insert(channel.clone());
            subscription_reply("subscribe", Some(channel.clone()), session.channels.len())
        })
        .collect()
}

fn handle_unsubscribe(args: &[Bytes], state: &ServerState, session: &mut Session) -> Vec<RespValue> {
    let channels: Vec<Bytes> = if args.len() > 1 {
        args[1..].to_vec()
    } else {
        session.channels.iter().cloned().collect()
    };

    if channels.is_empty() {
        return vec![subscription_reply("unsubscribe", None, 0)];
    }

    channels
        .into_iter()
        .map(|channel| {
            state.broker.unsubscribe(&channel, session.id);
            session.channels.remove(&channel);
            subscription_reply("unsubscribe", Some(channel), session.channels.len())
        })
        .collect()
}

fn handle_info() -> RespValue {
    RespValue::bulk(Bytes::from_static(b"role:master\r\nengine:modalkv-ephemeral\r\n"))
}

fn subscription_reply(kind: &'static str, channel: Option<Bytes>, count: usize) -> RespValue {
    RespValue::array(vec![
        RespValue::bulk(Bytes::from_static(kind.as_bytes())),
        RespValue::Bulk(channel),
        RespValue::Integer(count as i64),
    ])
}

fn resp_simple(message: &str) -> RespValue {
    RespValue::Simple(message.to_string())
}

fn resp_error(message: &str) -> RespValue {
    RespValue::Error(message.to_string())
}

fn wrong_args(command: &str) -> RespValue {
    resp_error(&format!("ERR wrong number of arguments for '{command}' command"))
}

fn eq_ignore_ascii_case(a: &[u8], b: &[u8]) -> bool {
    a.eq_ignore_ascii_case(b)
}

fn parse_positive(arg: &[u8], command: &str) -> Result<u64, RespValue> {
    let invalid = || resp_error("ERR value is not an integer or out of range");
    if arg.is_empty() {
        return Err(invalid());
    }
    let mut value: u64 = 0;
    for &b in arg {
        if !b.is_ascii_digit() {
            if b == b'-' {
                return Err(resp_error(&format!(
                    "ERR invalid expire time in '{command}' command"
                )));
            }
            return Err(invalid());
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as u64);
    }
    if value == 0 {
        return Err(resp_error(&format!(
            "ERR invalid expire time in '{command}' command"
        )));
    }
    Ok(value)
}
