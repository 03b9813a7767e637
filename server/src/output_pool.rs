//! Batched flushing of buffered protocol output.
//!
//! Protocols that wrote into their auto-send buffer register here. A single
//! scheduled task flushes every registered protocol once per interval, so
//! the number of timers stays constant however many sessions are writing.

use crate::scheduler::Scheduler;
use log::trace;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Something holding output that the pool flushes on its behalf.
pub trait AutoSend: Send + Sync + 'static {
    fn flush_output(&self);
}

struct PoolState {
    protocols: Vec<Arc<dyn AutoSend>>,
    scheduled: bool,
}

pub struct OutputMessagePool {
    scheduler: Arc<Scheduler>,
    flush_interval: Duration,
    state: Mutex<PoolState>,
}

fn address(protocol: &dyn AutoSend) -> *const () {
    protocol as *const dyn AutoSend as *const ()
}

impl OutputMessagePool {
    pub fn new(scheduler: Arc<Scheduler>, flush_interval: Duration) -> Self {
        Self {
            scheduler,
            flush_interval,
            state: Mutex::new(PoolState {
                protocols: Vec::new(),
                scheduled: false,
            }),
        }
    }

    /// Registers `protocol` for the next flush. Registering twice is a no-op.
    pub fn add_to_auto_send(self: &Arc<Self>, protocol: Arc<dyn AutoSend>) {
        let mut state = self.state.lock();
        let target = address(&*protocol);
        if state.protocols.iter().any(|p| address(&**p) == target) {
            return;
        }
        state.protocols.push(protocol);
        if state.scheduled {
            return;
        }
        state.scheduled = true;
        drop(state);
        self.schedule_send_all();
    }

    /// Drops `protocol` from the registry without flushing it.
    pub fn remove_from_auto_send(&self, protocol: &dyn AutoSend) {
        let target = address(protocol);
        let mut state = self.state.lock();
        if let Some(index) = state.protocols.iter().position(|p| address(&**p) == target) {
            state.protocols.swap_remove(index);
        }
    }

    /// Flushes every registered protocol. Runs on the dispatcher thread.
    pub fn send_all(self: &Arc<Self>) {
        let protocols = std::mem::take(&mut self.state.lock().protocols);
        trace!("Flushing {} protocols", protocols.len());
        for protocol in &protocols {
            protocol.flush_output();
        }
        drop(protocols);

        let mut state = self.state.lock();
        if state.protocols.is_empty() {
            state.scheduled = false;
            return;
        }
        drop(state);
        self.schedule_send_all();
    }

    fn schedule_send_all(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let scheduled = self
            .scheduler
            .add(self.flush_interval, move || pool.send_all());
        if scheduled.is_none() {
            self.state.lock().scheduled = false;
        }
    }

    /// Number of protocols waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.state.lock().protocols.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[derive(Default)]
    struct Counter {
        flushes: AtomicUsize,
    }

    impl AutoSend for Counter {
        fn flush_output(&self) {
            self.flushes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool(interval: Duration) -> (Arc<Scheduler>, Arc<OutputMessagePool>) {
        let dispatcher = Arc::new(Dispatcher::new().unwrap());
        let scheduler = Arc::new(Scheduler::new(dispatcher).unwrap());
        let pool = Arc::new(OutputMessagePool::new(Arc::clone(&scheduler), interval));
        (scheduler, pool)
    }

    fn wait_for(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_registered_protocols_are_flushed_once() {
        let (scheduler, pool) = pool(Duration::from_millis(10));
        let a = Arc::new(Counter::default());
        let b = Arc::new(Counter::default());

        pool.add_to_auto_send(a.clone());
        pool.add_to_auto_send(a.clone());
        pool.add_to_auto_send(b.clone());
        assert_eq!(pool.pending(), 2);
        assert_eq!(scheduler.pending(), 1);

        wait_for(|| b.flushes.load(Ordering::SeqCst) == 1);
        assert_eq!(a.flushes.load(Ordering::SeqCst), 1);
        assert_eq!(pool.pending(), 0);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(a.flushes.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_one_timer_for_many_protocols() {
        let (scheduler, pool) = pool(Duration::from_millis(20));
        let counters: Vec<_> = (0..100).map(|_| Arc::new(Counter::default())).collect();
        for counter in &counters {
            pool.add_to_auto_send(counter.clone());
        }
        assert_eq!(scheduler.pending(), 1);

        wait_for(|| pool.pending() == 0);
        wait_for(|| {
            counters
                .iter()
                .all(|c| c.flushes.load(Ordering::SeqCst) == 1)
        });
    }

    #[test]
    fn test_removed_protocol_is_not_flushed() {
        let (_scheduler, pool) = pool(Duration::from_millis(10));
        let kept = Arc::new(Counter::default());
        let removed = Arc::new(Counter::default());

        pool.add_to_auto_send(removed.clone());
        pool.add_to_auto_send(kept.clone());
        pool.remove_from_auto_send(&*removed);
        assert_eq!(pool.pending(), 1);

        wait_for(|| kept.flushes.load(Ordering::SeqCst) == 1);
        assert_eq!(removed.flushes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_registration_after_flush_schedules_again() {
        let (_scheduler, pool) = pool(Duration::from_millis(5));
        let counter = Arc::new(Counter::default());

        pool.add_to_auto_send(counter.clone());
        wait_for(|| counter.flushes.load(Ordering::SeqCst) == 1);
        wait_for(|| !pool.state.lock().scheduled);

        pool.add_to_auto_send(counter.clone());
        wait_for(|| counter.flushes.load(Ordering::SeqCst) == 2);
    }
}
