//! The dispatcher thread.
//!
//! All session and world state is mutated from tasks run here, one at a
//! time and in the order they were queued. I/O code never touches that
//! state directly, it packs the values it parsed into a closure and hands it
//! over with [`Dispatcher::add`].

use log::{debug, error};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A unit of work for the dispatcher thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct Queue {
    tasks: VecDeque<Task>,
    running: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    signal: Condvar,
}

pub struct Dispatcher {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawns the worker thread.
    pub fn new() -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                running: true,
            }),
            signal: Condvar::new(),
        });

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("dispatcher".to_string())
            .spawn(move || worker.run())?;

        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queues a task behind everything already queued.
    ///
    /// Returns false, dropping the task, once the dispatcher is stopping.
    pub fn add<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Box::new(task), false)
    }

    /// Queues a task ahead of everything already queued.
    pub fn add_front<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Box::new(task), true)
    }

    fn push(&self, task: Task, front: bool) -> bool {
        let mut queue = self.shared.queue.lock();
        if !queue.running {
            debug!("Dispatcher stopped, dropping task");
            return false;
        }
        let was_empty = queue.tasks.is_empty();
        if front {
            queue.tasks.push_front(task);
        } else {
            queue.tasks.push_back(task);
        }
        drop(queue);

        if was_empty {
            self.shared.signal.notify_one();
        }
        true
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().tasks.len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.queue.lock().running
    }

    /// Stops accepting tasks. Tasks already queued still run.
    pub fn stop(&self) {
        self.shared.queue.lock().running = false;
        self.shared.signal.notify_one();
    }

    /// Waits for the worker thread to finish. Call after [`stop`](Self::stop).
    pub fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("Dispatcher thread terminated abnormally");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

impl Shared {
    fn run(&self) {
        debug!("Dispatcher thread started");
        loop {
            let task = {
                let mut queue = self.queue.lock();
                loop {
                    if let Some(task) = queue.tasks.pop_front() {
                        break task;
                    }
                    if !queue.running {
                        debug!("Dispatcher thread finished");
                        return;
                    }
                    self.signal.wait(&mut queue);
                }
            };

            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                error!("Dispatcher task panicked: {}", panic_message(&*payload));
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
