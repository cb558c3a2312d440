//! bastion-core: Shared protocol library for the web SSH bastion.
//!
//! Provides the JSON control messages, codec and streaming output decoder,
//! host identity fingerprints, target types, and the common error type.

pub mod codec;
pub mod error;
pub mod identity;
pub mod messages;
pub mod target;

// Re-export commonly used items at crate root.
pub use codec::{decode_client, encode_server, Utf8Decoder};
pub use error::{BastionError, BastionResult};
pub use identity::{fingerprint, short_fingerprint};
pub use messages::{ClientMessage, ErrorCode, ErrorPayload, ServerMessage};
pub use target::{AuthHint, Target};
