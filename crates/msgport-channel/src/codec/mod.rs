//! Structured clone codec.
//!
//! [`serialize`] turns a value graph plus a transfer list into a [`Message`];
//! [`deserialize`] rebuilds it in another context. Encoding is transactional:
//! the transfer list and the value are validated in full before any buffer is
//! neutered or any port is detached.
//!
//! The byte layout is private to one build of this crate:
//!
//! ```text
//! ┌───────────┬───────────┬──────────────────────────┐
//! │ 0xFF      │ version   │ tagged value             │
//! └───────────┴───────────┴──────────────────────────┘
//! ```
//!
//! Objects, arrays and copied buffers get a back-reference id the first time
//! they are written, so shared sub-structure and cycles survive the trip.
//!
//! [`Message`]: crate::Message

mod deserializer;
mod serializer;
mod wire;

pub use deserializer::deserialize;
pub use serializer::serialize;

/// Default maximum encoded payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Default maximum nesting of objects and arrays.
pub const DEFAULT_MAX_DEPTH: usize = 1000;

/// Limits applied by the codec.
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Maximum encoded payload size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
    /// Maximum container nesting depth. Default: 1000.
    pub max_depth: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}
