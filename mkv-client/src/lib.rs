//! # ModalKV Client
//!
//! Purpose: Provide one Redis-compatible command set in three invocation
//! styles (blocking, future-based, reactive) over a single multiplexed
//! connection, plus channel-based publish/subscribe.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Connection` hides transport and protocol details;
//!    `sync()`, `asynchronous()` and `reactive()` are thin views over it.
//! 2. **One Dispatch Path**: Every view funnels into the same enqueue routine,
//!    so the wire behavior of an operation never depends on its style.
//! 3. **Pluggable Targets**: The store address comes from a `TargetResolver`
//!    chosen by the caller.
//! 4. **Protocol Clarity**: RESP2 is encoded and parsed explicitly.
//!
//! ```no_run
//! use mkv_client::{ClientConfig, Connection};
//! use mkv_common::{StaticResolver, TargetResolver};
//!
//! # fn main() -> mkv_common::MkvResult<()> {
//! let target = StaticResolver::localhost().resolve()?;
//! let conn = Connection::connect(&target, ClientConfig::default())?;
//! conn.sync().set("greeting", "hello")?;
//! assert_eq!(conn.sync().get("greeting")?, Some("hello".to_string()));
//! conn.close();
//! # Ok(())
//! # }
//! ```

mod async_api;
mod command;
mod config;
mod connection;
mod pubsub;
mod reactive;
mod sync_api;
mod transport;

pub use async_api::{AsyncCommands, CommandFuture};
pub use config::{ClientConfig, DEFAULT_MAX_WRITE_BATCH, DEFAULT_SUBSCRIBE_TIMEOUT};
pub use connection::Connection;
pub use pubsub::{MessageHandler, PubSubChannel, SubscriptionState};
pub use reactive::{Mono, ReactiveCommands};
pub use sync_api::SyncCommands;

pub use mkv_common::{ConnectionTarget, MkvError, MkvResult, TargetResolver, TtlStatus};
