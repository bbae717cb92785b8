//! Cross-thread message ports with structured cloning.
//!
//! # Crate Structure
//!
//! - [`event_loop`]: per-thread event loop and cross-thread wake handles
//! - [`channel`]: message ports, channels, workers and the clone codec

/// Re-export event loop types.
pub mod event_loop {
    pub use msgport_loop::*;
}

/// Re-export channel types.
pub mod channel {
    pub use msgport_channel::*;
}
