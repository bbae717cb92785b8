//! Thread-bound channel endpoints.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use msgport_loop::AsyncHandle;
use tracing::{debug, trace, warn};

use crate::codec;
use crate::context::Context;
use crate::error::{CallbackError, PortError, Result};
use crate::mailbox::Mailbox;
use crate::message::{Message, MessageEvent};
use crate::value::Value;

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

/// Consumer callback for delivered messages.
pub type MessageCallback = Rc<dyn Fn(MessageEvent) -> std::result::Result<(), CallbackError>>;

/// Callback for messages that could not be delivered.
pub type ErrorCallback = Rc<dyn Fn(&PortError)>;

/// Observable lifecycle state of a [`MessagePort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    /// Bound to a mailbox.
    Active { receiving: bool },
    /// No mailbox; may be reattached.
    Detached,
    /// Terminal.
    Closed,
}

struct PortInner {
    id: u64,
    context: Context,
    handle: AsyncHandle,
    data: RefCell<Option<Arc<Mailbox>>>,
    closed: Cell<bool>,
    stop_requested: Cell<bool>,
    on_message: RefCell<Option<MessageCallback>>,
    on_error: RefCell<Option<ErrorCallback>>,
}

impl Drop for PortInner {
    fn drop(&mut self) {
        if let Some(mailbox) = self.data.get_mut().take() {
            mailbox.clear_owner(self.id);
            mailbox.disentangle();
            trace!(port = self.id, "dropped attached port");
        }
    }
}

/// One end of a channel.
///
/// A port belongs to the thread that created it; clones are handles to the
/// same port. Messages arrive through the thread's event loop once the port
/// is [started](MessagePort::start). Dropping the last handle closes the port.
#[derive(Clone)]
pub struct MessagePort {
    inner: Rc<PortInner>,
}

impl MessagePort {
    /// A port with no mailbox, ready for [`reattach`](MessagePort::reattach).
    pub fn new(context: &Context) -> Result<Self> {
        if context.is_shutting_down() {
            return Err(PortError::ContextShutdown);
        }
        Ok(Self::build(context))
    }

    /// A port bound to `mailbox`.
    ///
    /// Messages already queued in the mailbox are picked up on the next loop
    /// turn once the port is started.
    pub fn with_mailbox(context: &Context, mailbox: Arc<Mailbox>) -> Result<Self> {
        let port = Self::new(context)?;
        mailbox.set_owner(port.id(), port.inner.handle.notifier());
        debug!(port = port.id(), mailbox = mailbox.id(), "attached port");
        *port.inner.data.borrow_mut() = Some(mailbox);
        Ok(port)
    }

    fn build(context: &Context) -> Self {
        let id = NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed);
        let inner = Rc::new_cyclic(|weak: &std::rc::Weak<PortInner>| {
            let weak = weak.clone();
            let handle = context.event_loop().new_async(move || {
                if let Some(inner) = weak.upgrade() {
                    MessagePort { inner }.on_wake();
                }
            });
            PortInner {
                id,
                context: context.clone(),
                handle,
                data: RefCell::new(None),
                closed: Cell::new(false),
                stop_requested: Cell::new(false),
                on_message: RefCell::new(None),
                on_error: RefCell::new(None),
            }
        });
        Self { inner }
    }

    /// Process-unique identifier, used in logs.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The context this port was created in.
    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    /// True if both handles refer to the same port.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn mailbox(&self) -> Option<Arc<Mailbox>> {
        self.inner.data.borrow().clone()
    }

    fn attached(&self) -> Result<Arc<Mailbox>> {
        self.mailbox().ok_or(PortError::PortClosed)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PortState {
        if self.inner.closed.get() {
            return PortState::Closed;
        }
        match self.inner.data.borrow().as_ref() {
            Some(mailbox) => PortState::Active {
                receiving: mailbox.is_receiving(),
            },
            None => PortState::Detached,
        }
    }

    /// True once closed, including after being transferred away.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Send `value` to the other end, moving the resources in `transfer`.
    ///
    /// If the other end is already closed the message is dropped silently.
    pub fn post_message(&self, value: &Value, transfer: &[Value]) -> Result<()> {
        let mailbox = self.attached()?;
        let message = codec::serialize(
            value,
            transfer,
            Some(&mailbox),
            self.inner.context.codec_config(),
        )?;
        let bytes = message.byte_size();
        if mailbox.send_to_sibling(message) {
            trace!(port = self.id(), bytes, "posted message");
        } else {
            trace!(port = self.id(), bytes, "sibling closed, message dropped");
        }
        Ok(())
    }

    /// Register the consumer for delivered messages, replacing any previous one.
    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(MessageEvent) -> std::result::Result<(), CallbackError> + 'static,
    {
        *self.inner.on_message.borrow_mut() = Some(Rc::new(callback));
    }

    /// Register the callback told about messages that failed to deliver.
    pub fn on_message_error<F>(&self, callback: F)
    where
        F: Fn(&PortError) + 'static,
    {
        *self.inner.on_error.borrow_mut() = Some(Rc::new(callback));
    }

    /// Begin delivering messages.
    pub fn start(&self) -> Result<()> {
        let mailbox = self.attached()?;
        if mailbox.set_receiving(true) {
            self.inner.handle.send()?;
        }
        trace!(port = self.id(), "started receiving");
        Ok(())
    }

    /// Pause delivery. Messages keep queueing.
    pub fn stop(&self) -> Result<()> {
        let mailbox = self.attached()?;
        mailbox.set_receiving(false);
        trace!(port = self.id(), "stopped receiving");
        Ok(())
    }

    /// Stop receiving and make the next drain stop this thread's event loop.
    pub fn stop_event_loop(&self) -> Result<()> {
        let mailbox = self.attached()?;
        self.inner.stop_requested.set(true);
        mailbox.set_receiving(false);
        self.inner.handle.send()?;
        debug!(port = self.id(), "event loop stop requested");
        Ok(())
    }

    /// Run one drain pass now instead of waiting for the event loop.
    pub fn drain(&self) -> Result<()> {
        if self.inner.closed.get() {
            return Err(PortError::PortClosed);
        }
        self.on_wake();
        Ok(())
    }

    /// Move the mailbox out of this port. The port stays open but inert until
    /// [`reattach`](MessagePort::reattach).
    pub fn detach(&self) -> Option<Arc<Mailbox>> {
        let mailbox = self.inner.data.borrow_mut().take()?;
        mailbox.clear_owner(self.id());
        debug!(port = self.id(), mailbox = mailbox.id(), "detached port");
        Some(mailbox)
    }

    /// Detach and close, leaving the mailbox to whoever received it.
    pub(crate) fn release_for_transfer(&self) {
        let _ = self.detach();
        self.close();
    }

    /// Bind a detached port to `mailbox`.
    pub fn reattach(&self, mailbox: Arc<Mailbox>) -> Result<()> {
        if self.inner.closed.get() {
            return Err(PortError::PortClosed);
        }
        if self.inner.data.borrow().is_some() {
            return Err(PortError::AlreadyAttached);
        }
        mailbox.set_owner(self.id(), self.inner.handle.notifier());
        debug!(port = self.id(), mailbox = mailbox.id(), "reattached port");
        *self.inner.data.borrow_mut() = Some(mailbox);
        Ok(())
    }

    /// Close the port and disentangle it from its peer. Idempotent.
    pub fn close(&self) {
        let inner = &self.inner;
        if inner.closed.replace(true) {
            return;
        }
        let mailbox = inner.data.borrow_mut().take();
        if let Some(mailbox) = mailbox {
            mailbox.clear_owner(inner.id);
            mailbox.disentangle();
        }
        inner.handle.close();
        inner.on_message.borrow_mut().take();
        inner.on_error.borrow_mut().take();
        debug!(port = inner.id, "closed port");
    }

    /// Close the port and run `callback` on the next loop turn.
    pub fn close_with<F>(&self, callback: F)
    where
        F: FnOnce() + 'static,
    {
        self.close();
        self.inner.context.event_loop().defer(callback);
    }

    /// True if the other end has been closed.
    pub fn is_sibling_closed(&self) -> Result<bool> {
        Ok(self.attached()?.is_sibling_closed())
    }

    /// Let this port keep the event loop alive (the default).
    pub fn ref_handle(&self) {
        self.inner.handle.set_ref(true);
    }

    /// Stop this port from keeping the event loop alive.
    pub fn unref_handle(&self) {
        self.inner.handle.set_ref(false);
    }

    /// True unless [`unref_handle`](MessagePort::unref_handle) was called.
    pub fn has_ref(&self) -> bool {
        self.inner.handle.has_ref()
    }

    /// Messages waiting in this port's queue.
    pub fn queued_messages(&self) -> usize {
        self.mailbox().map_or(0, |mailbox| mailbox.len())
    }

    /// Approximate memory held by the port, queued messages included.
    pub fn memory_size(&self) -> usize {
        std::mem::size_of::<PortInner>()
            + self.mailbox().map_or(0, |mailbox| {
                std::mem::size_of::<Mailbox>() + mailbox.queued_bytes()
            })
    }

    fn on_wake(&self) {
        loop {
            let Some(mailbox) = self.mailbox() else {
                return;
            };
            if self.inner.stop_requested.replace(false) {
                debug!(port = self.id(), "stopping event loop");
                self.inner.context.event_loop().stop();
                break;
            }
            let Some(message) = mailbox.next_message() else {
                break;
            };
            drop(mailbox);

            if self.inner.context.is_shutting_down() {
                trace!(port = self.id(), "context shutting down, discarding message");
                continue;
            }
            if let Err(err) = self.deliver(message) {
                warn!(port = self.id(), error = %err, "failed to deliver message");
                self.report_error(&err);
                if !self.inner.closed.get() {
                    if let Err(err) = self.inner.handle.send() {
                        trace!(port = self.id(), error = %err, "could not re-arm wake");
                    }
                }
                return;
            }
        }

        let Some(mailbox) = self.mailbox() else {
            return;
        };
        if mailbox.is_sibling_closed() && mailbox.is_empty() {
            drop(mailbox);
            debug!(port = self.id(), "sibling closed, closing port");
            self.close();
        }
    }

    fn deliver(&self, message: Message) -> Result<()> {
        let context = self.inner.context.clone();
        let event = codec::deserialize(message, &context, |mailbox| {
            MessagePort::with_mailbox(&context, mailbox)
        })?;
        let callback = self.inner.on_message.borrow().clone();
        match callback {
            Some(callback) => callback(event)?,
            None => trace!(port = self.id(), "no message callback, message dropped"),
        }
        Ok(())
    }

    fn report_error(&self, err: &PortError) {
        let callback = self.inner.on_error.borrow().clone();
        if let Some(callback) = callback {
            callback(err);
        }
    }
}

impl fmt::Debug for MessagePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePort")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use msgport_loop::{EventLoop, RunOutcome};

    use super::*;
    use crate::channel::create_channel;

    fn recorder(port: &MessagePort) -> Rc<RefCell<Vec<Value>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        port.on_message(move |event| {
            sink.borrow_mut().push(event.data);
            Ok(())
        });
        seen
    }

    #[test]
    fn delivers_after_start() {
        let event_loop = EventLoop::new();
        let context = Context::new(&event_loop);
        let (a, b) = create_channel(&context).unwrap();
        let seen = recorder(&b);

        a.post_message(&Value::from("queued"), &[]).unwrap();
        event_loop.run_until_idle();
        assert!(seen.borrow().is_empty(), "not started yet");
        assert_eq!(b.queued_messages(), 1);

        b.start().unwrap();
        event_loop.run_until_idle();
        assert_eq!(*seen.borrow(), vec![Value::from("queued")]);
    }

    #[test]
    fn stop_pauses_delivery() {
        let event_loop = EventLoop::new();
        let context = Context::new(&event_loop);
        let (a, b) = create_channel(&context).unwrap();
        let seen = recorder(&b);
        b.start().unwrap();
        b.stop().unwrap();

        a.post_message(&Value::from(1), &[]).unwrap();
        event_loop.run_until_idle();
        assert!(seen.borrow().is_empty());
        assert_eq!(b.state(), PortState::Active { receiving: false });
    }

    #[test]
    fn closed_port_rejects_operations() {
        let event_loop = EventLoop::new();
        let context = Context::new(&event_loop);
        let (a, _b) = create_channel(&context).unwrap();
        a.close();
        a.close();

        assert_eq!(a.state(), PortState::Closed);
        assert!(matches!(a.start(), Err(PortError::PortClosed)));
        assert!(matches!(a.stop(), Err(PortError::PortClosed)));
        assert!(matches!(
            a.post_message(&Value::Null, &[]),
            Err(PortError::PortClosed)
        ));
        assert!(matches!(a.drain(), Err(PortError::PortClosed)));
        assert!(matches!(a.is_sibling_closed(), Err(PortError::PortClosed)));
    }

    #[test]
    fn peer_self_closes_once_drained() {
        let event_loop = EventLoop::new();
        let context = Context::new(&event_loop);
        let (a, b) = create_channel(&context).unwrap();
        let seen = recorder(&b);
        b.start().unwrap();

        a.post_message(&Value::from("last"), &[]).unwrap();
        a.close();
        assert!(b.is_sibling_closed().unwrap());

        event_loop.run_until_idle();
        assert_eq!(seen.borrow().len(), 1, "queued message still delivered");
        assert_eq!(b.state(), PortState::Closed);
    }

    #[test]
    fn detach_and_reattach() {
        let event_loop = EventLoop::new();
        let context = Context::new(&event_loop);
        let (a, b) = create_channel(&context).unwrap();

        let mailbox = b.detach().expect("port should have a mailbox");
        assert_eq!(b.state(), PortState::Detached);
        assert!(matches!(b.start(), Err(PortError::PortClosed)));

        let fresh = MessagePort::new(&context).unwrap();
        fresh.reattach(mailbox).unwrap();
        let seen = recorder(&fresh);
        fresh.start().unwrap();
        a.post_message(&Value::from(2), &[]).unwrap();
        event_loop.run_until_idle();
        assert_eq!(*seen.borrow(), vec![Value::from(2)]);

        let other = Mailbox::new();
        assert!(matches!(
            fresh.reattach(other),
            Err(PortError::AlreadyAttached)
        ));
    }

    #[test]
    fn reattach_rejected_after_close() {
        let event_loop = EventLoop::new();
        let context = Context::new(&event_loop);
        let port = MessagePort::new(&context).unwrap();
        port.close();
        assert!(matches!(
            port.reattach(Mailbox::new()),
            Err(PortError::PortClosed)
        ));
    }

    #[test]
    fn close_with_runs_on_next_turn() {
        let event_loop = EventLoop::new();
        let context = Context::new(&event_loop);
        let (a, _b) = create_channel(&context).unwrap();
        let called = Rc::new(Cell::new(false));
        let flag = Rc::clone(&called);

        a.close_with(move || flag.set(true));
        assert!(!called.get());
        event_loop.run_until_idle();
        assert!(called.get());
    }

    #[test]
    fn unreferenced_ports_do_not_keep_loop_alive() {
        let event_loop = EventLoop::new();
        let context = Context::new(&event_loop);
        let (a, b) = create_channel(&context).unwrap();
        a.unref_handle();
        b.unref_handle();
        assert!(!a.has_ref());

        assert_eq!(
            event_loop.run_timeout(Duration::from_secs(5)),
            RunOutcome::Idle
        );
        a.ref_handle();
        assert!(a.has_ref());
    }

    #[test]
    fn stop_event_loop_stops_run() {
        let event_loop = EventLoop::new();
        let context = Context::new(&event_loop);
        let (a, b) = create_channel(&context).unwrap();
        let seen = recorder(&b);
        b.start().unwrap();
        a.post_message(&Value::from(1), &[]).unwrap();

        b.stop_event_loop().unwrap();
        assert_eq!(
            event_loop.run_timeout(Duration::from_secs(5)),
            RunOutcome::Stopped
        );
        assert!(seen.borrow().is_empty(), "stop flag is checked before popping");
        assert_eq!(b.state(), PortState::Active { receiving: false });
    }

    #[test]
    fn callback_failure_drops_message_and_continues() {
        let event_loop = EventLoop::new();
        let context = Context::new(&event_loop);
        let (a, b) = create_channel(&context).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let errors = Rc::new(Cell::new(0));

        let sink = Rc::clone(&seen);
        b.on_message(move |event| {
            if event.data == Value::from("bad") {
                return Err(CallbackError::new("rejected"));
            }
            sink.borrow_mut().push(event.data);
            Ok(())
        });
        let count = Rc::clone(&errors);
        b.on_message_error(move |err| {
            assert!(matches!(err, PortError::Callback(_)));
            count.set(count.get() + 1);
        });
        b.start().unwrap();

        a.post_message(&Value::from("bad"), &[]).unwrap();
        a.post_message(&Value::from("good"), &[]).unwrap();

        // First turn: the failing message is popped and dropped.
        b.drain().unwrap();
        assert_eq!(errors.get(), 1);
        assert!(seen.borrow().is_empty());
        assert_eq!(b.queued_messages(), 1);

        // The re-armed wake delivers the rest; the failed one is not retried.
        event_loop.run_until_idle();
        assert_eq!(*seen.borrow(), vec![Value::from("good")]);
        assert_eq!(errors.get(), 1);
    }

    #[test]
    fn shutdown_discards_messages() {
        let event_loop = EventLoop::new();
        let context = Context::new(&event_loop);
        let (a, b) = create_channel(&context).unwrap();
        let seen = recorder(&b);
        b.start().unwrap();
        a.post_message(&Value::from(1), &[]).unwrap();

        context.shutdown();
        event_loop.run_until_idle();
        assert!(seen.borrow().is_empty());
        assert_eq!(b.queued_messages(), 0);
        assert!(matches!(
            MessagePort::new(&context),
            Err(PortError::ContextShutdown)
        ));
    }

    #[test]
    fn memory_size_tracks_queue() {
        let event_loop = EventLoop::new();
        let context = Context::new(&event_loop);
        let (a, b) = create_channel(&context).unwrap();
        let empty = b.memory_size();

        a.post_message(&Value::from("payload"), &[]).unwrap();
        assert!(b.memory_size() > empty);
    }

    #[test]
    fn dropping_last_handle_closes_channel() {
        let event_loop = EventLoop::new();
        let context = Context::new(&event_loop);
        let (a, b) = create_channel(&context).unwrap();
        drop(a);
        assert!(b.is_sibling_closed().unwrap());
    }
}
