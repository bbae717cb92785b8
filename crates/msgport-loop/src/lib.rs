//! Per-thread cooperative event loop with cross-thread wake handles.
//!
//! This is the lowest layer of msgport. Every thread that owns message ports
//! runs one [`EventLoop`]; other threads reach it through:
//! - a [`Notifier`] (the thread-safe side of an [`AsyncHandle`]), which schedules
//!   the handle's callback on the loop thread, coalescing repeated wakes
//! - a [`LoopHandle`], which posts `Send` tasks or asks the loop to stop
//!
//! Loop-local work that must not run re-entrantly is queued with
//! [`EventLoop::defer`] and runs on the next turn.

pub mod error;
pub mod event_loop;
pub mod handle;

pub use error::{LoopError, Result};
pub use event_loop::{EventLoop, LoopHandle, RunOutcome};
pub use handle::{AsyncHandle, HandleId, Notifier};
