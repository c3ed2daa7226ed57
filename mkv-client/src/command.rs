//! # Command Builders
//!
//! Purpose: Turn facade calls into RESP2 argument vectors plus a typed reply
//! decoder, validating arguments before anything reaches the wire.
//!
//! ## Design Principles
//! 1. **Validate First**: Every builder rejects bad input with
//!    `InvalidArgument` before a frame is encoded.
//! 2. **One Source of Truth**: Sync, async and reactive views share these
//!    builders, so the same operation always produces the same wire command.
//! 3. **Decoders Are Plain Functions**: `fn` pointers keep `Request` cheap to
//!    clone and re-issue for cold reactive subscriptions.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;

use mkv_common::{validate_channel, validate_key, validate_ttl, MkvError, MkvResult, RespValue, TtlStatus};

/// Maps a non-error reply onto the command's result type.
///
/// `None` means the reply had the wrong shape.
pub(crate) type Decoder<T> = fn(RespValue) -> Option<T>;

/// A validated command ready for dispatch.
pub(crate) struct Request<T> {
    name: &'static str,
    args: Vec<Bytes>,
    decode: Decoder<T>,
}

impl<T> Clone for Request<T> {
    fn clone(&self) -> Self {
        Request {
            name: self.name,
            args: self.args.clone(),
            decode: self.decode,
        }
    }
}

impl<T> fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("name", &self.name)
            .field("args", &self.args)
            .finish()
    }
}

impl<T> Request<T> {
    fn new(name: &'static str, args: Vec<Bytes>, decode: Decoder<T>) -> Self {
        Request { name, args, decode }
    }

    /// Wire command name, used for logging and error reporting.
    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    /// Full argument vector including the command name.
    pub(crate) fn args(&self) -> &[Bytes] {
        &self.args
    }

    pub(crate) fn decoder(&self) -> Decoder<T> {
        self.decode
    }

    /// Converts a raw reply into the typed result.
    pub(crate) fn complete(&self, reply: MkvResult<RespValue>) -> MkvResult<T> {
        complete(self.name, self.decode, reply)
    }
}

/// Shared reply handling: store errors become `Command`, shape mismatches
/// become `UnexpectedResponse`.
pub(crate) fn complete<T>(name: &'static str, decode: Decoder<T>, reply: MkvResult<RespValue>) -> MkvResult<T> {
    match reply? {
        RespValue::Error(message) => Err(MkvError::Command(message)),
        value => decode(value).ok_or(MkvError::UnexpectedResponse { command: name }),
    }
}

fn text(value: &str) -> Bytes {
    Bytes::copy_from_slice(value.as_bytes())
}

fn decode_status(value: RespValue) -> Option<String> {
    match value {
        RespValue::Simple(text) => Some(text),
        _ => None,
    }
}

fn decode_optional_text(value: RespValue) -> Option<Option<String>> {
    match value {
        RespValue::Bulk(None) => Some(None),
        RespValue::Bulk(Some(data)) => String::from_utf8(data.to_vec()).ok().map(Some),
        _ => None,
    }
}

fn decode_integer(value: RespValue) -> Option<i64> {
    match value {
        RespValue::Integer(n) => Some(n),
        _ => None,
    }
}

fn decode_flag(value: RespValue) -> Option<bool> {
    decode_integer(value).map(|n| n > 0)
}

fn decode_ttl(value: RespValue) -> Option<TtlStatus> {
    decode_integer(value).and_then(TtlStatus::from_reply)
}

fn decode_hash(value: RespValue) -> Option<HashMap<String, String>> {
    let items = match value {
        RespValue::Array(Some(items)) => items,
        RespValue::Array(None) => return Some(HashMap::new()),
        _ => return None,
    };
    if items.len() % 2 != 0 {
        return None;
    }

    let mut fields = HashMap::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
        let field = String::from_utf8(field.as_bytes()?.to_vec()).ok()?;
        let value = String::from_utf8(value.as_bytes()?.to_vec()).ok()?;
        fields.insert(field, value);
    }
    Some(fields)
}

fn decode_pong(value: RespValue) -> Option<String> {
    match value {
        RespValue::Simple(text) => Some(text),
        RespValue::Bulk(Some(data)) => String::from_utf8(data.to_vec()).ok(),
        _ => None,
    }
}

/// `SET key value`
pub(crate) fn set(key: &str, value: &str) -> MkvResult<Request<String>> {
    validate_key(key)?;
    Ok(Request::new(
        "SET",
        vec![Bytes::from_static(b"SET"), text(key), text(value)],
        decode_status,
    ))
}

/// `GET key`
pub(crate) fn get(key: &str) -> MkvResult<Request<Option<String>>> {
    validate_key(key)?;
    Ok(Request::new(
        "GET",
        vec![Bytes::from_static(b"GET"), text(key)],
        decode_optional_text,
    ))
}

/// `SETEX key ttl value`
pub(crate) fn set_with_expiry(key: &str, value: &str, ttl_secs: u64) -> MkvResult<Request<String>> {
    validate_key(key)?;
    validate_ttl(ttl_secs)?;
    Ok(Request::new(
        "SETEX",
        vec![
            Bytes::from_static(b"SETEX"),
            text(key),
            Bytes::from(ttl_secs.to_string()),
            text(value),
        ],
        decode_status,
    ))
}

/// `TTL key`
pub(crate) fn ttl(key: &str) -> MkvResult<Request<TtlStatus>> {
    validate_key(key)?;
    Ok(Request::new("TTL", vec![Bytes::from_static(b"TTL"), text(key)], decode_ttl))
}

/// `HSET key field value [field value ...]`
pub(crate) fn set_hash_fields(key: &str, fields: &HashMap<String, String>) -> MkvResult<Request<i64>> {
    validate_key(key)?;
    if fields.is_empty() {
        return Err(MkvError::invalid_argument("hash fields must not be empty"));
    }

    let mut args = Vec::with_capacity(2 + fields.len() * 2);
    args.push(Bytes::from_static(b"HSET"));
    args.push(text(key));
    for (field, value) in fields {
        args.push(text(field));
        args.push(text(value));
    }
    Ok(Request::new("HSET", args, decode_integer))
}

/// `HGETALL key`
pub(crate) fn get_hash_fields(key: &str) -> MkvResult<Request<HashMap<String, String>>> {
    validate_key(key)?;
    Ok(Request::new(
        "HGETALL",
        vec![Bytes::from_static(b"HGETALL"), text(key)],
        decode_hash,
    ))
}

/// `EXISTS key`
pub(crate) fn exists(key: &str) -> MkvResult<Request<bool>> {
    validate_key(key)?;
    Ok(Request::new("EXISTS", vec![Bytes::from_static(b"EXISTS"), text(key)], decode_flag))
}

/// `PUBLISH channel message`
pub(crate) fn publish(channel: &str, message: &str) -> MkvResult<Request<i64>> {
    validate_channel(channel)?;
    Ok(Request::new(
        "PUBLISH",
        vec![Bytes::from_static(b"PUBLISH"), text(channel), text(message)],
        decode_integer,
    ))
}

/// `PING`
pub(crate) fn ping() -> Request<String> {
    Request::new("PING", vec![Bytes::from_static(b"PING")], decode_pong)
}

/// Hash key holding the profile of `user_id`.
pub(crate) fn user_profile_key(user_id: &str) -> MkvResult<String> {
    if user_id.is_empty() {
        return Err(MkvError::invalid_argument("user id must not be empty"));
    }
    Ok(format!("user:{user_id}"))
}
