//! # Blocking Commands
//!
//! Purpose: Expose the command set as plain blocking calls for callers that
//! are not running inside an executor.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `SyncCommands` hides dispatch and reply decoding.
//! 2. **Borrow-Friendly API**: Keys and values are taken as `&str`.
//! 3. **Fail Fast**: Argument errors are returned before anything is sent.

use std::collections::HashMap;

use mkv_common::{MkvResult, TtlStatus};

use crate::command::{self, Request};
use crate::connection::Connection;

/// Blocking view over a shared [`Connection`].
///
/// Each call parks only the calling thread; other callers keep issuing
/// commands on the same connection.
#[derive(Debug, Clone)]
pub struct SyncCommands {
    conn: Connection,
}

impl SyncCommands {
    pub(crate) fn new(conn: Connection) -> Self {
        SyncCommands { conn }
    }

    fn run<T>(&self, request: Request<T>) -> MkvResult<T> {
        futures::executor::block_on(self.conn.execute(&request))
    }

    /// Stores `value` under `key`. Returns the store's acknowledgment.
    pub fn set(&self, key: &str, value: &str) -> MkvResult<String> {
        self.run(command::set(key, value)?)
    }

    /// Fetches a value by key.
    ///
    /// Returns `Ok(None)` when the key is missing.
    pub fn get(&self, key: &str) -> MkvResult<Option<String>> {
        self.run(command::get(key)?)
    }

    /// Stores `value` under `key` with an expiry of `ttl_secs` seconds.
    pub fn set_with_expiry(&self, key: &str, value: &str, ttl_secs: u64) -> MkvResult<String> {
        self.run(command::set_with_expiry(key, value, ttl_secs)?)
    }

    /// Returns the TTL status of a key.
    pub fn ttl(&self, key: &str) -> MkvResult<TtlStatus> {
        self.run(command::ttl(key)?)
    }

    /// Merges `fields` into the hash at `key`. Returns how many fields were
    /// newly created.
    pub fn set_hash_fields(&self, key: &str, fields: &HashMap<String, String>) -> MkvResult<i64> {
        self.run(command::set_hash_fields(key, fields)?)
    }

    /// Returns every field of the hash at `key`; empty when the key is missing.
    pub fn get_hash_fields(&self, key: &str) -> MkvResult<HashMap<String, String>> {
        self.run(command::get_hash_fields(key)?)
    }

    pub fn exists(&self, key: &str) -> MkvResult<bool> {
        self.run(command::exists(key)?)
    }

    pub fn ping(&self) -> MkvResult<String> {
        self.run(command::ping())
    }

    /// Stores profile fields in the hash `user:<user_id>`.
    pub fn set_user_profile(&self, user_id: &str, fields: &HashMap<String, String>) -> MkvResult<i64> {
        self.set_hash_fields(&command::user_profile_key(user_id)?, fields)
    }

    /// Reads the hash `user:<user_id>`.
    pub fn get_user_profile(&self, user_id: &str) -> MkvResult<HashMap<String, String>> {
        self.get_hash_fields(&command::user_profile_key(user_id)?)
    }
}
