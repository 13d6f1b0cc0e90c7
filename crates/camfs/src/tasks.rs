//! Background threads owned by an attached device.
//!
//! Two shapes: a periodic task that runs a closure on a fixed schedule, and an event worker
//! that drains a channel. Both are plain named `std::thread`s (all work here is blocking I/O)
//! stopped by a message on their channel and joined on shutdown.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};

/// Runs `tick` after `initial_delay`, then every `interval`, until shut down.
pub(crate) struct PeriodicTask {
    name: String,
    shutdown: mpsc::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub(crate) fn spawn(
        name: &str,
        initial_delay: Duration,
        interval: Duration,
        mut tick: impl FnMut() + Send + 'static,
    ) -> std::io::Result<Self> {
        let (shutdown, receiver) = mpsc::channel::<()>();
        let thread_name = name.to_string();
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            debug!("{thread_name}: started");
            let mut wait = initial_delay;
            loop {
                match receiver.recv_timeout(wait) {
                    Err(RecvTimeoutError::Timeout) => {
                        tick();
                        wait = interval;
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("{thread_name}: stopped");
        })?;

        Ok(Self {
            name: name.to_string(),
            shutdown,
            handle: Some(handle),
        })
    }

    /// Signals the thread and waits for it. Waits out a tick already in progress.
    pub(crate) fn shutdown(&mut self) {
        let _ = self.shutdown.send(());
        join(&self.name, self.handle.take());
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum WorkerMessage<T> {
    Item(T),
    /// Acknowledged once every earlier item has been handled.
    Flush(mpsc::Sender<()>),
    Shutdown,
}

/// Hands items to `handler` on a dedicated thread, in order.
pub(crate) struct EventWorker<T: Send + 'static> {
    name: String,
    sender: mpsc::Sender<WorkerMessage<T>>,
    handle: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> EventWorker<T> {
    pub(crate) fn spawn(name: &str, mut handler: impl FnMut(T) + Send + 'static) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<WorkerMessage<T>>();
        let thread_name = name.to_string();
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            debug!("{thread_name}: started");
            while let Ok(message) = receiver.recv() {
                match message {
                    WorkerMessage::Item(item) => handler(item),
                    WorkerMessage::Flush(ack) => {
                        let _ = ack.send(());
                    }
                    WorkerMessage::Shutdown => break,
                }
            }
            debug!("{thread_name}: stopped");
        })?;

        Ok(Self {
            name: name.to_string(),
            sender,
            handle: Some(handle),
        })
    }

    /// Queues an item without blocking. Returns false once the worker has stopped.
    pub(crate) fn send(&self, item: T) -> bool {
        self.sender.send(WorkerMessage::Item(item)).is_ok()
    }

    /// Waits until everything queued before this call has been handled.
    pub(crate) fn flush(&self, timeout: Duration) -> bool {
        let (ack, done) = mpsc::channel();
        if self.sender.send(WorkerMessage::Flush(ack)).is_err() {
            return false;
        }
        done.recv_timeout(timeout).is_ok()
    }

    /// Stops after the items already queued, then joins.
    pub(crate) fn shutdown(&mut self) {
        let _ = self.sender.send(WorkerMessage::Shutdown);
        join(&self.name, self.handle.take());
    }
}

impl<T: Send + 'static> Drop for EventWorker<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn join(name: &str, handle: Option<JoinHandle<()>>) {
    let Some(handle) = handle else {
        return;
    };
    // A task that tears down its own device would otherwise join itself.
    if handle.thread().id() == thread::current().id() {
        return;
    }
    if let Err(e) = handle.join() {
        warn!("{name} panicked on shutdown: {e:?}");
    }
}
