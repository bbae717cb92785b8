use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, trace};

use crate::error::{LoopError, Result};
use crate::handle::{AsyncHandle, HandleId, Notifier, NotifyState};

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) enum LoopEvent {
    Wake(HandleId),
    Task(Box<dyn FnOnce() + Send>),
    Stop,
}

/// Why [`EventLoop::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// No referenced handle is open and nothing is queued.
    Idle,
    /// A stop was requested.
    Stopped,
    /// The deadline passed while the loop was still alive.
    TimedOut,
}

struct HandleSlot {
    callback: Rc<dyn Fn()>,
    state: Arc<NotifyState>,
    referenced: bool,
}

pub(crate) struct LoopInner {
    id: u64,
    tx: Sender<LoopEvent>,
    rx: Receiver<LoopEvent>,
    handles: RefCell<HashMap<HandleId, HandleSlot>>,
    deferred: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    next_handle: Cell<HandleId>,
    stop_requested: Cell<bool>,
}

impl LoopInner {
    pub(crate) fn remove_handle(&self, id: HandleId) {
        let slot = self.handles.borrow_mut().remove(&id);
        if slot.is_some() {
            trace!(event_loop = self.id, handle = id, "closed async handle");
        }
    }

    pub(crate) fn set_referenced(&self, id: HandleId, referenced: bool) {
        if let Some(slot) = self.handles.borrow_mut().get_mut(&id) {
            slot.referenced = referenced;
        }
    }

    pub(crate) fn is_referenced(&self, id: HandleId) -> bool {
        self.handles
            .borrow()
            .get(&id)
            .is_some_and(|slot| slot.referenced)
    }
}

/// A single-threaded cooperative event loop.
///
/// Cloning yields another reference to the same loop. The loop is `!Send`:
/// it is driven only from the thread that created it.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

impl EventLoop {
    /// Create a new loop bound to the current thread.
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        let id = NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed);
        debug!(event_loop = id, "created event loop");
        Self {
            inner: Rc::new(LoopInner {
                id,
                tx,
                rx,
                handles: RefCell::new(HashMap::new()),
                deferred: RefCell::new(VecDeque::new()),
                next_handle: Cell::new(1),
                stop_requested: Cell::new(false),
            }),
        }
    }

    /// Process-unique loop identifier.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Register a wake handle whose callback runs on this loop.
    ///
    /// New handles are referenced.
    pub fn new_async<F>(&self, callback: F) -> AsyncHandle
    where
        F: Fn() + 'static,
    {
        let id = self.inner.next_handle.get();
        self.inner.next_handle.set(id + 1);

        let state = Arc::new(NotifyState {
            loop_id: self.inner.id,
            handle: id,
            pending: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            tx: self.inner.tx.clone(),
        });
        self.inner.handles.borrow_mut().insert(
            id,
            HandleSlot {
                callback: Rc::new(callback),
                state: Arc::clone(&state),
                referenced: true,
            },
        );
        trace!(event_loop = self.inner.id, handle = id, "opened async handle");

        AsyncHandle::new(Notifier::new(state), Rc::downgrade(&self.inner))
    }

    /// Run `task` on the next loop turn.
    pub fn defer<F>(&self, task: F)
    where
        F: FnOnce() + 'static,
    {
        self.inner.deferred.borrow_mut().push_back(Box::new(task));
    }

    /// A `Send` handle for posting work to this loop from other threads.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            loop_id: self.inner.id,
            tx: self.inner.tx.clone(),
        }
    }

    /// Ask the loop to return from [`run`](EventLoop::run) at the next turn.
    ///
    /// The request stays pending until a `run` call observes it.
    pub fn stop(&self) {
        self.inner.stop_requested.set(true);
    }

    /// Run until stopped or until nothing keeps the loop alive.
    pub fn run(&self) -> RunOutcome {
        self.run_inner(None)
    }

    /// Like [`run`](EventLoop::run), giving up after `timeout`.
    pub fn run_timeout(&self, timeout: Duration) -> RunOutcome {
        self.run_inner(Some(Instant::now() + timeout))
    }

    /// Process everything that is already queued without blocking.
    ///
    /// Returns the number of events and deferred tasks processed.
    pub fn run_until_idle(&self) -> usize {
        let mut processed = 0;
        while !self.inner.stop_requested.get() {
            let task = self.inner.deferred.borrow_mut().pop_front();
            if let Some(task) = task {
                task();
                processed += 1;
                continue;
            }
            match self.inner.rx.try_recv() {
                Ok(event) => {
                    self.dispatch(event);
                    processed += 1;
                }
                Err(_) => break,
            }
        }
        processed
    }

    /// True while a referenced handle is open or work is queued.
    pub fn is_alive(&self) -> bool {
        self.has_referenced_handles()
            || !self.inner.deferred.borrow().is_empty()
            || !self.inner.rx.is_empty()
    }

    /// Number of open handles, referenced or not.
    pub fn active_handles(&self) -> usize {
        self.inner.handles.borrow().len()
    }

    fn has_referenced_handles(&self) -> bool {
        self.inner
            .handles
            .borrow()
            .values()
            .any(|slot| slot.referenced)
    }

    fn run_inner(&self, deadline: Option<Instant>) -> RunOutcome {
        loop {
            self.run_until_idle();

            if self.inner.stop_requested.replace(false) {
                debug!(event_loop = self.inner.id, "event loop stopped");
                return RunOutcome::Stopped;
            }
            if !self.is_alive() {
                return RunOutcome::Idle;
            }

            let event = match deadline {
                None => match self.inner.rx.recv() {
                    Ok(event) => event,
                    Err(_) => return RunOutcome::Idle,
                },
                Some(deadline) => match self.inner.rx.recv_deadline(deadline) {
                    Ok(event) => event,
                    Err(RecvTimeoutError::Timeout) => return RunOutcome::TimedOut,
                    Err(RecvTimeoutError::Disconnected) => return RunOutcome::Idle,
                },
            };
            self.dispatch(event);
        }
    }

    fn dispatch(&self, event: LoopEvent) {
        match event {
            LoopEvent::Wake(id) => {
                let callback = {
                    let handles = self.inner.handles.borrow();
                    handles.get(&id).map(|slot| {
                        slot.state.pending.store(false, Ordering::Release);
                        Rc::clone(&slot.callback)
                    })
                };
                match callback {
                    Some(callback) => callback(),
                    None => trace!(
                        event_loop = self.inner.id,
                        handle = id,
                        "ignoring wake for closed handle"
                    ),
                }
            }
            LoopEvent::Task(task) => task(),
            LoopEvent::Stop => {
                debug!(event_loop = self.inner.id, "stop requested from another thread");
                self.inner.stop_requested.set(true);
            }
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("id", &self.inner.id)
            .field("handles", &self.active_handles())
            .finish()
    }
}

/// Thread-safe handle for posting work to an [`EventLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    loop_id: u64,
    tx: Sender<LoopEvent>,
}

impl LoopHandle {
    /// Run `task` on the loop thread.
    pub fn post<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx
            .send(LoopEvent::Task(Box::new(task)))
            .map_err(|_| LoopError::LoopGone(self.loop_id))
    }

    /// Ask the loop to return from `run`.
    pub fn stop(&self) -> Result<()> {
        self.tx
            .send(LoopEvent::Stop)
            .map_err(|_| LoopError::LoopGone(self.loop_id))
    }

    /// Identifier of the target loop.
    pub fn loop_id(&self) -> u64 {
        self.loop_id
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("loop_id", &self.loop_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::thread;

    use super::*;

    fn counter() -> (Rc<Cell<usize>>, impl Fn() + 'static) {
        let count = Rc::new(Cell::new(0));
        let seen = Rc::clone(&count);
        (count, move || seen.set(seen.get() + 1))
    }

    #[test]
    fn repeated_sends_coalesce_into_one_callback() {
        let event_loop = EventLoop::new();
        let (count, callback) = counter();
        let handle = event_loop.new_async(callback);

        handle.send().unwrap();
        handle.send().unwrap();
        handle.send().unwrap();
        event_loop.run_until_idle();

        assert_eq!(count.get(), 1);

        handle.send().unwrap();
        event_loop.run_until_idle();
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn notify_from_another_thread_wakes_run() {
        let event_loop = EventLoop::new();
        let stopper = event_loop.clone();
        let (count, callback) = counter();
        let handle = event_loop.new_async(move || {
            callback();
            stopper.stop();
        });

        let notifier = handle.notifier();
        let producer = thread::spawn(move || notifier.notify().unwrap());

        let outcome = event_loop.run_timeout(Duration::from_secs(5));
        producer.join().unwrap();

        assert_eq!(outcome, RunOutcome::Stopped);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn unreferenced_handle_does_not_keep_loop_alive() {
        let event_loop = EventLoop::new();
        let handle = event_loop.new_async(|| {});
        assert!(handle.has_ref());

        handle.set_ref(false);
        assert!(!handle.has_ref());
        assert!(!event_loop.is_alive());
        assert_eq!(event_loop.run(), RunOutcome::Idle);
        assert_eq!(event_loop.active_handles(), 1);
    }

    #[test]
    fn closed_handle_rejects_notify_and_ignores_pending_wake() {
        let event_loop = EventLoop::new();
        let (count, callback) = counter();
        let handle = event_loop.new_async(callback);

        handle.send().unwrap();
        handle.close();

        assert!(handle.is_closing());
        assert!(matches!(handle.send(), Err(LoopError::HandleClosed(_))));
        event_loop.run_until_idle();
        assert_eq!(count.get(), 0);
        assert_eq!(event_loop.active_handles(), 0);
    }

    #[test]
    fn dropping_handle_closes_it() {
        let event_loop = EventLoop::new();
        let handle = event_loop.new_async(|| {});
        let notifier = handle.notifier();
        drop(handle);

        assert!(notifier.is_closed());
        assert_eq!(event_loop.active_handles(), 0);
    }

    #[test]
    fn deferred_tasks_run_in_order() {
        let event_loop = EventLoop::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let order = Rc::clone(&order);
            event_loop.defer(move || order.borrow_mut().push(i));
        }
        assert!(event_loop.is_alive());

        assert_eq!(event_loop.run(), RunOutcome::Idle);
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn deferred_task_may_defer_more_work() {
        let event_loop = EventLoop::new();
        let ran = Rc::new(Cell::new(false));

        let inner_loop = event_loop.clone();
        let inner_ran = Rc::clone(&ran);
        event_loop.defer(move || {
            inner_loop.defer(move || inner_ran.set(true));
        });

        assert_eq!(event_loop.run_until_idle(), 2);
        assert!(ran.get());
    }

    #[test]
    fn loop_handle_posts_tasks_and_stops() {
        let event_loop = EventLoop::new();
        let _keepalive = event_loop.new_async(|| {});
        let handle = event_loop.handle();
        let seen = Arc::new(Mutex::new(None));

        let loop_thread = thread::current().id();
        let seen_in_task = Arc::clone(&seen);
        let poster = thread::spawn(move || {
            handle
                .post(move || {
                    *seen_in_task.lock().unwrap() = Some(thread::current().id());
                })
                .unwrap();
            handle.stop().unwrap();
        });

        let outcome = event_loop.run_timeout(Duration::from_secs(5));
        poster.join().unwrap();

        assert_eq!(outcome, RunOutcome::Stopped);
        assert_eq!(*seen.lock().unwrap(), Some(loop_thread));
    }

    #[test]
    fn run_timeout_reports_timeout_while_alive() {
        let event_loop = EventLoop::new();
        let _handle = event_loop.new_async(|| {});

        let outcome = event_loop.run_timeout(Duration::from_millis(20));
        assert_eq!(outcome, RunOutcome::TimedOut);
    }

    #[test]
    fn stop_request_is_consumed_by_run() {
        let event_loop = EventLoop::new();
        let _handle = event_loop.new_async(|| {});

        event_loop.stop();
        assert_eq!(event_loop.run(), RunOutcome::Stopped);
        assert_eq!(
            event_loop.run_timeout(Duration::from_millis(10)),
            RunOutcome::TimedOut
        );
    }

    #[test]
    fn notify_after_loop_dropped_reports_gone() {
        let event_loop = EventLoop::new();
        let handle = event_loop.new_async(|| {});
        let notifier = handle.notifier();
        let loop_handle = event_loop.handle();
        drop(event_loop);

        assert!(matches!(notifier.notify(), Err(LoopError::LoopGone(_))));
        assert!(matches!(loop_handle.stop(), Err(LoopError::LoopGone(_))));
        assert!(!handle.has_ref());
    }
}
