use std::fmt;
use std::rc::Weak;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;

use crate::error::{LoopError, Result};
use crate::event_loop::{LoopEvent, LoopInner};

/// Identifier of an async handle, unique within its loop.
pub type HandleId = u64;

pub(crate) struct NotifyState {
    pub(crate) loop_id: u64,
    pub(crate) handle: HandleId,
    pub(crate) pending: AtomicBool,
    pub(crate) closed: AtomicBool,
    pub(crate) tx: Sender<LoopEvent>,
}

/// Thread-safe side of an [`AsyncHandle`].
///
/// Any number of [`notify`](Notifier::notify) calls made before the owning loop
/// turns collapse into one callback invocation on the loop thread.
#[derive(Clone)]
pub struct Notifier {
    state: Arc<NotifyState>,
}

impl Notifier {
    pub(crate) fn new(state: Arc<NotifyState>) -> Self {
        Self { state }
    }

    /// Schedule the handle's callback on its loop thread.
    pub fn notify(&self) -> Result<()> {
        let state = &self.state;
        if state.closed.load(Ordering::Acquire) {
            return Err(LoopError::HandleClosed(state.handle));
        }
        if state.pending.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        state
            .tx
            .send(LoopEvent::Wake(state.handle))
            .map_err(|_| LoopError::LoopGone(state.loop_id))
    }

    /// Handle this notifier wakes.
    pub fn handle_id(&self) -> HandleId {
        self.state.handle
    }

    /// True once the owning handle has been closed.
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> &Arc<NotifyState> {
        &self.state
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("loop_id", &self.state.loop_id)
            .field("handle", &self.state.handle)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Loop-thread side of a wake primitive.
///
/// The callback registered through [`EventLoop::new_async`](crate::EventLoop::new_async)
/// runs on the loop thread whenever the handle (or one of its notifiers) is
/// signalled. Dropping the handle closes it.
pub struct AsyncHandle {
    notifier: Notifier,
    owner: Weak<LoopInner>,
}

impl AsyncHandle {
    pub(crate) fn new(notifier: Notifier, owner: Weak<LoopInner>) -> Self {
        Self { notifier, owner }
    }

    /// Identifier of this handle within its loop.
    pub fn id(&self) -> HandleId {
        self.notifier.handle_id()
    }

    /// A thread-safe notifier for this handle.
    pub fn notifier(&self) -> Notifier {
        self.notifier.clone()
    }

    /// Schedule the callback from the loop thread itself.
    pub fn send(&self) -> Result<()> {
        self.notifier.notify()
    }

    /// True once [`close`](AsyncHandle::close) has been called.
    pub fn is_closing(&self) -> bool {
        self.notifier.is_closed()
    }

    /// Deregister the handle; pending and future wakes are ignored.
    pub fn close(&self) {
        if self.notifier.state().closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = self.owner.upgrade() {
            inner.remove_handle(self.id());
        }
    }

    /// Whether this handle keeps [`EventLoop::run`](crate::EventLoop::run) alive.
    pub fn set_ref(&self, referenced: bool) {
        if let Some(inner) = self.owner.upgrade() {
            inner.set_referenced(self.id(), referenced);
        }
    }

    /// True if the handle is open and referenced.
    pub fn has_ref(&self) -> bool {
        self.owner
            .upgrade()
            .is_some_and(|inner| inner.is_referenced(self.id()))
    }
}

impl Drop for AsyncHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for AsyncHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncHandle")
            .field("id", &self.id())
            .field("closing", &self.is_closing())
            .finish()
    }
}
