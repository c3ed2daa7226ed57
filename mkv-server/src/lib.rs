//! # ModalKV Ephemeral Store
//!
//! Purpose: Provide a small Redis-compatible store that can be provisioned
//! in-process on a loopback port, so the client facade can be exercised
//! without an externally managed instance.
//!
//! ## Design Principles
//! 1. **Wire Compatibility**: Speak RESP2 and mirror Redis replies for the
//!    commands the facade issues, including subscription-mode rules.
//! 2. **Self-Contained Lifecycle**: Each instance owns its thread and runtime;
//!    `shutdown` tears everything down deterministically.
//! 3. **Resolver Seam**: `EphemeralResolver` plugs the instance into the
//!    client through `TargetResolver`, never through the facade itself.

pub mod broker;
pub mod ephemeral;
pub mod server;
pub mod store;

pub use broker::Broker;
pub use ephemeral::{EphemeralResolver, EphemeralServer, ServerConfig};
pub use server::{handle_connection, ServerState};
pub use store::{MemoryStore, StoreError};
