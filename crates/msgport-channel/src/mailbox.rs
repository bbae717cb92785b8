//! Thread-safe message queue shared by the two ends of a channel.
//!
//! Lock order is always: sibling link (`SiblingLink::ends`) first, then a
//! mailbox's state. [`Mailbox::push`] takes only the state lock.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use msgport_loop::Notifier;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::message::Message;

static NEXT_MAILBOX_ID: AtomicU64 = AtomicU64::new(1);

/// The port currently bound to a mailbox, identified but not referenced.
struct Owner {
    port: u64,
    notifier: Notifier,
}

struct MailboxState {
    queue: VecDeque<Message>,
    receiving: bool,
    owner: Option<Owner>,
}

/// Lock shared by two entangled mailboxes. After disentanglement each side
/// gets a private, empty link of its own.
struct SiblingLink {
    ends: Mutex<Option<(Weak<Mailbox>, Weak<Mailbox>)>>,
}

impl SiblingLink {
    fn detached() -> Arc<Self> {
        Arc::new(Self {
            ends: Mutex::new(None),
        })
    }
}

fn peer_of(ends: &(Weak<Mailbox>, Weak<Mailbox>), me: &Mailbox) -> Option<Arc<Mailbox>> {
    let me = me as *const Mailbox;
    if ends.0.as_ptr() == me {
        ends.1.upgrade()
    } else if ends.1.as_ptr() == me {
        ends.0.upgrade()
    } else {
        None
    }
}

/// Queue plus entanglement state underlying one [`MessagePort`](crate::MessagePort).
pub struct Mailbox {
    id: u64,
    state: Mutex<MailboxState>,
    link: Mutex<Arc<SiblingLink>>,
    entangled: AtomicBool,
    disentangled: AtomicBool,
}

impl Mailbox {
    /// A fresh mailbox with no sibling.
    pub fn new() -> Arc<Self> {
        let id = NEXT_MAILBOX_ID.fetch_add(1, Ordering::Relaxed);
        trace!(mailbox = id, "created mailbox");
        Arc::new(Self {
            id,
            state: Mutex::new(MailboxState {
                queue: VecDeque::new(),
                receiving: false,
                owner: None,
            }),
            link: Mutex::new(SiblingLink::detached()),
            entangled: AtomicBool::new(false),
            disentangled: AtomicBool::new(false),
        })
    }

    /// Two fresh mailboxes entangled with each other.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let a = Self::new();
        let b = Self::new();
        Self::entangle(&a, &b);
        (a, b)
    }

    /// Link two pristine mailboxes as the ends of one channel.
    ///
    /// # Panics
    ///
    /// Panics if `a` and `b` are the same mailbox, or if either has ever been
    /// entangled or disentangled.
    pub fn entangle(a: &Arc<Self>, b: &Arc<Self>) {
        assert!(!Arc::ptr_eq(a, b), "cannot entangle a mailbox with itself");
        for mailbox in [a, b] {
            assert!(
                !mailbox.entangled.swap(true, Ordering::AcqRel),
                "mailbox {} is already entangled",
                mailbox.id
            );
            assert!(
                !mailbox.disentangled.load(Ordering::Acquire),
                "mailbox {} was disentangled and cannot be reused",
                mailbox.id
            );
        }

        let link = Arc::new(SiblingLink {
            ends: Mutex::new(Some((Arc::downgrade(a), Arc::downgrade(b)))),
        });
        *a.link.lock() = Arc::clone(&link);
        *b.link.lock() = link;
        debug!(mailbox = a.id, sibling = b.id, "entangled mailboxes");
    }

    /// Process-unique identifier, used in logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    fn current_link(&self) -> Arc<SiblingLink> {
        Arc::clone(&self.link.lock())
    }

    /// Append a message and wake the owning port, if any.
    pub fn push(&self, message: Message) {
        let mut state = self.state.lock();
        state.queue.push_back(message);
        if let Some(owner) = &state.owner {
            if let Err(err) = owner.notifier.notify() {
                trace!(mailbox = self.id, port = owner.port, error = %err, "owner wake failed");
            }
        }
    }

    /// Push `message` into the sibling's queue.
    ///
    /// Returns false when there is no sibling any more; the message is then
    /// dropped.
    pub(crate) fn send_to_sibling(&self, message: Message) -> bool {
        let link = self.current_link();
        let (peer, rejected) = {
            let ends = link.ends.lock();
            match ends.as_ref().and_then(|ends| peer_of(ends, self)) {
                Some(peer) => {
                    peer.push(message);
                    (Some(peer), None)
                }
                None => (None, Some(message)),
            }
        };
        // Dropping either may run a mailbox destructor, which takes link locks.
        drop(peer);
        match rejected {
            Some(message) => {
                trace!(mailbox = self.id, "sibling closed, dropping message");
                drop(message);
                false
            }
            None => true,
        }
    }

    /// Break the link with the sibling, permanently, for both sides.
    ///
    /// Both owners are woken so they can notice. Calling this again is a no-op.
    pub fn disentangle(&self) {
        let link = self.current_link();
        let peer = {
            let mut ends = link.ends.lock();
            let peer = ends.take().and_then(|ends| peer_of(&ends, self));
            if let Some(peer) = &peer {
                *peer.link.lock() = SiblingLink::detached();
                peer.disentangled.store(true, Ordering::Release);
            }
            *self.link.lock() = SiblingLink::detached();
            peer
        };
        if self.disentangled.swap(true, Ordering::AcqRel) {
            return;
        }

        debug!(mailbox = self.id, "disentangled mailbox");
        self.signal_owner();
        if let Some(peer) = peer {
            peer.signal_owner();
        }
    }

    /// True when this mailbox no longer has a live sibling.
    pub fn is_sibling_closed(&self) -> bool {
        let link = self.current_link();
        let ends = link.ends.lock();
        match ends.as_ref() {
            Some((a, b)) => {
                let me = self as *const Mailbox;
                let peer = if a.as_ptr() == me { b } else { a };
                peer.strong_count() == 0
            }
            None => true,
        }
    }

    /// True if `other` is this mailbox's current sibling.
    pub fn is_entangled_with(&self, other: &Mailbox) -> bool {
        let link = self.current_link();
        let ends = link.ends.lock();
        match ends.as_ref() {
            Some((a, b)) => {
                let (me, other) = (self as *const Mailbox, other as *const Mailbox);
                (a.as_ptr() == me && b.as_ptr() == other)
                    || (b.as_ptr() == me && a.as_ptr() == other)
            }
            None => false,
        }
    }

    /// Messages waiting in the queue.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    /// True while the owning port is started.
    pub fn is_receiving(&self) -> bool {
        self.state.lock().receiving
    }

    /// Bytes held by queued messages.
    pub fn queued_bytes(&self) -> usize {
        self.state.lock().queue.iter().map(Message::byte_size).sum()
    }

    /// Bind the port identified by `port`, then wake it so it picks up any
    /// messages queued while the mailbox was ownerless.
    ///
    /// # Panics
    ///
    /// Panics if another port already owns this mailbox.
    pub(crate) fn set_owner(&self, port: u64, notifier: Notifier) {
        let mut state = self.state.lock();
        if let Some(current) = &state.owner {
            panic!(
                "mailbox {} is already owned by port {}",
                self.id, current.port
            );
        }
        if let Err(err) = notifier.notify() {
            trace!(mailbox = self.id, port, error = %err, "owner wake failed");
        }
        state.owner = Some(Owner { port, notifier });
        trace!(mailbox = self.id, port, "mailbox owner set");
    }

    /// Unbind `port` if it is the current owner.
    pub(crate) fn clear_owner(&self, port: u64) {
        let mut state = self.state.lock();
        if state.owner.as_ref().is_some_and(|owner| owner.port == port) {
            state.owner = None;
            trace!(mailbox = self.id, port, "mailbox owner cleared");
        }
    }

    /// Set the receiving flag; returns whether messages are pending.
    pub(crate) fn set_receiving(&self, receiving: bool) -> bool {
        let mut state = self.state.lock();
        state.receiving = receiving;
        !state.queue.is_empty()
    }

    /// Pop the next message, or `None` if empty or not receiving.
    pub(crate) fn next_message(&self) -> Option<Message> {
        let mut state = self.state.lock();
        if !state.receiving {
            return None;
        }
        state.queue.pop_front()
    }

    fn signal_owner(&self) {
        let state = self.state.lock();
        if let Some(owner) = &state.owner {
            if let Err(err) = owner.notifier.notify() {
                trace!(mailbox = self.id, port = owner.port, error = %err, "owner wake failed");
            }
        }
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.disentangle();
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Mailbox")
            .field("id", &self.id)
            .field("queued", &state.queue.len())
            .field("receiving", &state.receiving)
            .field("owner", &state.owner.as_ref().map(|owner| owner.port))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use bytes::Bytes;
    use msgport_loop::EventLoop;

    use super::*;

    fn message(tag: &'static [u8]) -> Message {
        Message::new(Bytes::from_static(tag), Vec::new(), Vec::new(), Vec::new())
    }

    #[test]
    fn pair_is_entangled_symmetrically() {
        let (a, b) = Mailbox::pair();
        assert!(!a.is_sibling_closed());
        assert!(!b.is_sibling_closed());
        assert!(a.is_entangled_with(&b));
        assert!(b.is_entangled_with(&a));
    }

    #[test]
    fn send_to_sibling_queues_in_order() {
        let (a, b) = Mailbox::pair();
        assert!(a.send_to_sibling(message(b"1")));
        assert!(a.send_to_sibling(message(b"2")));
        b.set_receiving(true);

        assert_eq!(b.len(), 2);
        assert_eq!(b.next_message().unwrap().payload().as_ref(), b"1");
        assert_eq!(b.next_message().unwrap().payload().as_ref(), b"2");
        assert!(a.is_empty());
    }

    #[test]
    fn next_message_requires_receiving() {
        let (a, b) = Mailbox::pair();
        a.send_to_sibling(message(b"x"));

        assert!(b.next_message().is_none());
        assert!(b.set_receiving(true), "message should be pending");
        assert!(b.next_message().is_some());
    }

    #[test]
    fn disentangle_is_symmetric_and_permanent() {
        let (a, b) = Mailbox::pair();
        a.disentangle();

        assert!(a.is_sibling_closed());
        assert!(b.is_sibling_closed());
        assert!(!a.is_entangled_with(&b));
        assert!(!b.send_to_sibling(message(b"lost")));
        assert!(a.is_empty());

        a.disentangle();
        b.disentangle();
    }

    #[test]
    fn dropping_one_end_closes_the_other() {
        let (a, b) = Mailbox::pair();
        drop(a);
        assert!(b.is_sibling_closed());
        assert!(!b.send_to_sibling(message(b"lost")));
    }

    #[test]
    #[should_panic(expected = "already entangled")]
    fn double_entangle_panics() {
        let (a, _b) = Mailbox::pair();
        let c = Mailbox::new();
        Mailbox::entangle(&a, &c);
    }

    #[test]
    #[should_panic(expected = "cannot be reused")]
    fn entangling_disentangled_mailbox_panics() {
        let a = Mailbox::new();
        a.disentangle();
        let b = Mailbox::new();
        Mailbox::entangle(&b, &a);
    }

    #[test]
    #[should_panic(expected = "already owned")]
    fn second_owner_panics() {
        let event_loop = EventLoop::new();
        let first = event_loop.new_async(|| {});
        let second = event_loop.new_async(|| {});
        let mailbox = Mailbox::new();

        mailbox.set_owner(1, first.notifier());
        mailbox.set_owner(2, second.notifier());
    }

    #[test]
    fn push_wakes_the_owner() {
        let event_loop = EventLoop::new();
        let woken = std::rc::Rc::new(std::cell::Cell::new(0));
        let seen = std::rc::Rc::clone(&woken);
        let handle = event_loop.new_async(move || seen.set(seen.get() + 1));
        let (a, b) = Mailbox::pair();

        b.set_owner(7, handle.notifier());
        event_loop.run_until_idle();
        assert_eq!(woken.get(), 1, "attaching should wake the owner");

        a.send_to_sibling(message(b"x"));
        event_loop.run_until_idle();
        assert_eq!(woken.get(), 2);

        b.clear_owner(7);
        a.send_to_sibling(message(b"y"));
        event_loop.run_until_idle();
        assert_eq!(woken.get(), 2, "ownerless mailbox should not wake anyone");
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn disentangle_wakes_both_owners() {
        let event_loop = EventLoop::new();
        let woken = std::rc::Rc::new(std::cell::Cell::new(0));
        let (seen_a, seen_b) = (std::rc::Rc::clone(&woken), std::rc::Rc::clone(&woken));
        let ha = event_loop.new_async(move || seen_a.set(seen_a.get() + 1));
        let hb = event_loop.new_async(move || seen_b.set(seen_b.get() + 1));
        let (a, b) = Mailbox::pair();
        a.set_owner(1, ha.notifier());
        b.set_owner(2, hb.notifier());
        event_loop.run_until_idle();
        woken.set(0);

        b.disentangle();
        event_loop.run_until_idle();
        assert_eq!(woken.get(), 2);
    }

    #[test]
    fn queued_bytes_sums_payloads() {
        let (a, b) = Mailbox::pair();
        a.send_to_sibling(message(b"abc"));
        a.send_to_sibling(message(b"de"));
        assert_eq!(b.queued_bytes(), 5);
    }

    #[test]
    fn concurrent_senders_and_disentangle() {
        for _ in 0..50 {
            let (a, b) = Mailbox::pair();
            let sender = {
                let a = Arc::clone(&a);
                thread::spawn(move || {
                    let mut queued = 0;
                    for _ in 0..100 {
                        if a.send_to_sibling(message(b"m")) {
                            queued += 1;
                        }
                    }
                    queued
                })
            };
            b.disentangle();
            let queued = sender.join().unwrap();

            assert!(b.len() <= queued);
            assert!(a.is_sibling_closed());
        }
    }
}
