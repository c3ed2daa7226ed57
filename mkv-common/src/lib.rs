// mkv-common - Shared types and protocol definitions for ModalKV
//
// This crate defines the error taxonomy, the RESP2 codec and the target
// resolution seam shared by the client facade and the ephemeral server.

pub mod error;
pub mod resolver;
pub mod resp;
pub mod types;

// Re-export for convenience
pub use error::*;
pub use resolver::*;
pub use resp::{encode_command, RespDecoder, RespValue};
pub use types::*;
