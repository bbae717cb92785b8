//! Entangled message ports with a transactional structured-clone codec.
//!
//! A [`MessageChannel`] is a pair of [`MessagePort`]s. Each port lives on one
//! thread and is driven by that thread's [`EventLoop`](msgport_loop::EventLoop);
//! the two ends may live on different threads. Values are copied structurally,
//! except for resources named in the transfer list:
//!
//! - an [`ArrayBuffer`] moves, leaving the sender's buffer detached
//! - a [`MessagePort`] moves, closing the sender's handle
//! - a [`SharedArrayBuffer`] is never listed; it is always aliased
//!
//! ```no_run
//! use msgport_channel::{create_channel, Context, Value};
//! use msgport_loop::EventLoop;
//!
//! let event_loop = EventLoop::new();
//! let context = Context::new(&event_loop);
//! let (a, b) = create_channel(&context)?;
//!
//! b.on_message(|event| {
//!     println!("got {:?}", event.data);
//!     Ok(())
//! });
//! b.start()?;
//! a.post_message(&Value::object([("n", Value::from(1))]), &[])?;
//! event_loop.run_until_idle();
//! # Ok::<(), msgport_channel::PortError>(())
//! ```

pub mod binding;
pub mod buffer;
pub mod channel;
pub mod codec;
pub mod context;
pub mod error;
pub mod mailbox;
pub mod message;
pub mod port;
pub mod value;
pub mod worker;

pub use binding::{invoke, PortMethod};
pub use buffer::{ArrayBuffer, SharedArrayBuffer, SharedMemory};
pub use channel::{create_channel, MessageChannel};
pub use codec::{deserialize, serialize, CodecConfig};
pub use context::{Context, ContextConfig};
pub use error::{CallbackError, PortError, Result};
pub use mailbox::Mailbox;
pub use message::{Message, MessageEvent};
pub use port::{ErrorCallback, MessageCallback, MessagePort, PortState};
pub use value::{Array, HostObject, Object, Value};
pub use worker::Worker;
