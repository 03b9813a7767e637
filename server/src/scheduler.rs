//! The scheduler thread.
//!
//! Holds delayed tasks in a min-heap keyed by fire time and hands each one
//! to the [`Dispatcher`] when it is due. Cancelling only forgets the event
//! id; the heap entry is skipped when it reaches the top.

use crate::dispatcher::{Dispatcher, Task};
use log::{debug, error, trace};
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Handle for cancelling a scheduled task. Never 0.
pub type EventId = u32;

struct ScheduledTask {
    at: Instant,
    seq: u64,
    id: EventId,
    task: Task,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    // Reversed so the earliest deadline sits on top of the max-heap.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State {
    heap: BinaryHeap<ScheduledTask>,
    active: HashSet<EventId>,
    last_id: EventId,
    seq: u64,
    running: bool,
}

impl State {
    fn next_id(&mut self) -> EventId {
        loop {
            self.last_id = self.last_id.wrapping_add(1);
            if self.last_id != 0 && !self.active.contains(&self.last_id) {
                return self.last_id;
            }
        }
    }
}

struct Shared {
    state: Mutex<State>,
    signal: Condvar,
    dispatcher: Arc<Dispatcher>,
}

pub struct Scheduler {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawns the worker thread. Due tasks are queued on `dispatcher`.
    pub fn new(dispatcher: Arc<Dispatcher>) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                active: HashSet::new(),
                last_id: 0,
                seq: 0,
                running: true,
            }),
            signal: Condvar::new(),
            dispatcher,
        });

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("scheduler".to_string())
            .spawn(move || worker.run())?;

        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Runs `task` on the dispatcher after `delay`.
    ///
    /// Returns the event id, or `None` once the scheduler has stopped.
    pub fn add<F>(&self, delay: Duration, task: F) -> Option<EventId>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if !state.running {
            debug!("Scheduler stopped, dropping task");
            return None;
        }

        let id = state.next_id();
        state.seq += 1;
        let entry = ScheduledTask {
            at: Instant::now() + delay,
            seq: state.seq,
            id,
            task: Box::new(task),
        };
        let at = entry.at;
        state.active.insert(id);
        state.heap.push(entry);
        let is_next = state.heap.peek().map(|top| top.at == at).unwrap_or(false);
        drop(state);

        if is_next {
            self.shared.signal.notify_one();
        }
        trace!("Scheduled event {} in {:?}", id, delay);
        Some(id)
    }

    /// Cancels a pending event. Returns false if it already fired or never existed.
    pub fn stop_event(&self, id: EventId) -> bool {
        self.shared.state.lock().active.remove(&id)
    }

    /// Number of events that have neither fired nor been cancelled.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().active.len()
    }

    /// Stops the thread. Pending events are discarded.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        state.running = false;
        state.active.clear();
        state.heap.clear();
        drop(state);
        self.shared.signal.notify_one();
    }

    pub fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("Scheduler thread terminated abnormally");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

impl Shared {
    fn run(&self) {
        debug!("Scheduler thread started");
        loop {
            let task = {
                let mut state = self.state.lock();
                loop {
                    if !state.running {
                        debug!("Scheduler thread finished");
                        return;
                    }
                    let next_at = match state.heap.peek() {
                        Some(top) => top.at,
                        None => {
                            self.signal.wait(&mut state);
                            continue;
                        }
                    };
                    if next_at > Instant::now() {
                        self.signal.wait_until(&mut state, next_at);
                        continue;
                    }
                    let Some(entry) = state.heap.pop() else {
                        continue;
                    };
                    if state.active.remove(&entry.id) {
                        break entry.task;
                    }
                    trace!("Skipping cancelled event {}", entry.id);
                }
            };

            if !self.dispatcher.add(task) {
                debug!("Dispatcher rejected a scheduled task");
            }
        }
    }
}
