use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::{Arc, Weak};

use msgport_loop::EventLoop;
use tracing::debug;

use crate::buffer::{SharedArrayBuffer, SharedMemory};
use crate::codec::CodecConfig;

/// Configuration for a [`Context`].
#[derive(Debug, Clone, Default)]
pub struct ContextConfig {
    /// Limits applied when serializing and deserializing messages.
    pub codec: CodecConfig,
}

struct ContextInner {
    event_loop: EventLoop,
    config: ContextConfig,
    shared: RefCell<HashMap<u64, Weak<SharedMemory>>>,
    accepting: Cell<bool>,
}

/// The per-thread value space ports live in.
///
/// A context ties ports to the thread's [`EventLoop`] and tracks the shared
/// memory regions that have been attached to it. Cloning yields another
/// reference to the same context.
#[derive(Clone)]
pub struct Context {
    inner: Rc<ContextInner>,
}

impl Context {
    /// A context on `event_loop` with default limits.
    pub fn new(event_loop: &EventLoop) -> Self {
        Self::with_config(event_loop, ContextConfig::default())
    }

    /// A context on `event_loop` with explicit limits.
    pub fn with_config(event_loop: &EventLoop, config: ContextConfig) -> Self {
        debug!(event_loop = event_loop.id(), "created context");
        Self {
            inner: Rc::new(ContextInner {
                event_loop: event_loop.clone(),
                config,
                shared: RefCell::new(HashMap::new()),
                accepting: Cell::new(true),
            }),
        }
    }

    /// The loop that drives this context's ports.
    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    /// Configuration shared by ports created here.
    pub fn config(&self) -> &ContextConfig {
        &self.inner.config
    }

    /// Codec limits applied to every message.
    pub fn codec_config(&self) -> &CodecConfig {
        &self.inner.config.codec
    }

    /// Expose a shared memory region in this context.
    ///
    /// Every handle returned for the same region aliases the same memory.
    pub fn attach_shared(&self, memory: Arc<SharedMemory>) -> SharedArrayBuffer {
        let mut registry = self.inner.shared.borrow_mut();
        registry.retain(|_, region| region.strong_count() > 0);
        let memory = match registry.get(&memory.id()).and_then(Weak::upgrade) {
            Some(existing) => existing,
            None => {
                registry.insert(memory.id(), Arc::downgrade(&memory));
                memory
            }
        };
        SharedArrayBuffer::from_memory(memory)
    }

    /// Number of live shared regions attached to this context.
    pub fn attached_shared_count(&self) -> usize {
        self.inner
            .shared
            .borrow()
            .values()
            .filter(|region| region.strong_count() > 0)
            .count()
    }

    /// Stop accepting new ports and stop delivering messages.
    ///
    /// Ports that drain after this point discard their messages.
    pub fn shutdown(&self) {
        if self.inner.accepting.replace(false) {
            debug!(event_loop = self.inner.event_loop.id(), "context shutting down");
        }
    }

    /// True once [`shutdown`](Context::shutdown) was called.
    pub fn is_shutting_down(&self) -> bool {
        !self.inner.accepting.get()
    }

    /// True if both handles refer to the same context.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("event_loop", &self.inner.event_loop.id())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}
