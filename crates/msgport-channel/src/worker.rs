use std::fmt;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;
use msgport_loop::{EventLoop, LoopError, LoopHandle};
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::{PortError, Result};
use crate::mailbox::Mailbox;
use crate::port::MessagePort;

/// A thread running its own [`EventLoop`] and [`Context`], connected to the
/// spawning thread by one channel.
///
/// The worker's loop runs until nothing keeps it alive (typically after the
/// local [`port`](Worker::port) closes) or until [`terminate`](Worker::terminate).
pub struct Worker {
    name: String,
    port: MessagePort,
    loop_handle: LoopHandle,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn a worker thread.
    ///
    /// `setup` runs on the new thread with the worker's context and its end of
    /// the channel, before the worker's loop starts. The worker context copies
    /// the configuration of `context`.
    pub fn spawn<F>(context: &Context, name: impl Into<String>, setup: F) -> Result<Self>
    where
        F: FnOnce(&Context, &MessagePort) + Send + 'static,
    {
        let name = name.into();
        let (local, remote) = Mailbox::pair();
        let port = MessagePort::with_mailbox(context, local)?;
        let config = context.config().clone();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

        let thread_name = name.clone();
        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            let event_loop = EventLoop::new();
            let context = Context::with_config(&event_loop, config);
            let port = match MessagePort::with_mailbox(&context, remote) {
                Ok(port) => port,
                Err(err) => {
                    warn!(worker = %thread_name, error = %err, "worker port setup failed");
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            if ready_tx.send(Ok(event_loop.handle())).is_err() {
                return;
            }

            setup(&context, &port);
            let outcome = event_loop.run();
            debug!(worker = %thread_name, ?outcome, "worker event loop exited");

            context.shutdown();
            port.close();
        })?;

        let (loop_handle, thread) = await_ready(&name, &ready_rx, thread)?;
        debug!(worker = %name, loop_id = loop_handle.loop_id(), "spawned worker");

        Ok(Self {
            name,
            port,
            loop_handle,
            thread: Some(thread),
        })
    }

    /// Thread name given at spawn.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// This thread's end of the channel to the worker.
    pub fn port(&self) -> &MessagePort {
        &self.port
    }

    /// Ask the worker's loop to stop. A worker that already exited is fine.
    pub fn terminate(&self) -> Result<()> {
        match self.loop_handle.stop() {
            Ok(()) | Err(LoopError::LoopGone(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Wait for the worker thread to finish.
    ///
    /// Close [`port`](Worker::port) or call [`terminate`](Worker::terminate)
    /// first, or this blocks for as long as the worker stays alive.
    pub fn join(mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        thread
            .join()
            .map_err(|_| PortError::WorkerPanicked(self.name.clone()))
    }
}

/// Wait for the worker thread to report its loop. On failure the thread has
/// already given up, so it is joined before returning.
fn await_ready(
    name: &str,
    ready: &Receiver<Result<LoopHandle>>,
    thread: JoinHandle<()>,
) -> Result<(LoopHandle, JoinHandle<()>)> {
    let reason = match ready.recv() {
        Ok(Ok(handle)) => return Ok((handle, thread)),
        Ok(Err(err)) => err.to_string(),
        Err(_) => "worker exited before its event loop started".to_string(),
    };
    if thread.join().is_err() {
        return Err(PortError::WorkerPanicked(name.to_string()));
    }
    Err(PortError::WorkerSetup {
        name: name.to_string(),
        reason,
    })
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("port", &self.port)
            .field("loop_id", &self.loop_handle.loop_id())
            .finish()
    }
}
