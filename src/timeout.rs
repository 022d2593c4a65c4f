// Copyright The Outbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Shared timeout manager.
//!
//! One timer thread drives every deferred unit of work in the crate: async
//! long-poll deadlines, delayed queue flushes, and client idle timeouts.
//! Each kind is a [`TimerTask`] variant carrying only the data it needs;
//! the registry dispatches fired tasks through a single handler.
//!
//! Scheduling returns a [`TimerHandle`]; cancellation is idempotent and a
//! cancelled entry is skipped at fire time rather than removed from the heap.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::client::AsyncPollTask;
use crate::types::{ChannelId, ClientId};

/// A deferred unit of work scheduled on the shared timer.
#[derive(Debug)]
pub(crate) enum TimerTask {
    /// Fail an outstanding async long poll that saw no data in time.
    AsyncPollTimeout {
        /// The parked poll; gone if it already completed through another path.
        task: Weak<AsyncPollTask>,
    },
    /// Re-enter the direct-flush path for a queue attached to a push-capable
    /// session or push handler.
    ScheduledFlushForPush {
        client: ClientId,
        channel: ChannelId,
    },
    /// Flush a queue polled by a polling channel, buffering the result for
    /// the next poll (or completing a parked async poll).
    ScheduledFlushForPoll {
        client: ClientId,
        channel: ChannelId,
    },
    /// Re-evaluate a client's effective idle time and invalidate it if it
    /// has genuinely gone idle.
    ClientIdleTimeout { client: ClientId },
}

/// Cancellation handle for a scheduled [`TimerTask`].
///
/// Cancellation only marks the entry; the timer thread skips marked entries
/// when their deadline arrives. Cancelling more than once, or after the task
/// fired, is a no-op.
#[derive(Debug, Clone)]
pub(crate) struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::Relaxed);
    }
}

struct Entry {
    deadline: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    task: TimerTask,
}

// BinaryHeap is a max-heap; order entries so the earliest deadline (ties
// broken by scheduling order) surfaces first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

struct TimerState {
    entries: BinaryHeap<Entry>,
    next_seq: u64,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    wakeup: Condvar,
}

/// Deadline-heap timer with a single worker thread.
pub(crate) struct TimeoutManager {
    shared: Arc<TimerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TimeoutManager {
    /// Starts the timer thread. Fired tasks are dispatched through `handler`
    /// with no internal lock held, so the handler is free to re-enter the
    /// manager and schedule follow-up tasks.
    pub(crate) fn start<F>(name: &str, handler: F) -> Self
    where
        F: Fn(TimerTask) + Send + 'static,
    {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                entries: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || run_worker(&worker_shared, handler))
            .ok();
        if worker.is_none() {
            tracing::error!(thread = name, "failed to spawn timeout worker thread");
        }

        Self {
            shared,
            worker: Mutex::new(worker),
        }
    }

    /// Schedules `task` to fire after `delay`.
    pub(crate) fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let mut state = self.shared.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.entries.push(Entry {
                deadline: Instant::now() + delay,
                seq,
                cancelled: Arc::clone(&cancelled),
                task,
            });
        }
        self.shared.wakeup.notify_one();
        TimerHandle { cancelled }
    }

    /// Stops the worker thread and drops all pending entries.
    pub(crate) fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.entries.clear();
        }
        self.shared.wakeup.notify_all();
        if let Some(worker) = self.worker.lock().take() {
            // A fired task may hold the last reference to the owner and drop
            // us from the timer thread itself; the loop exits on its own in
            // that case, and joining would deadlock.
            if worker.thread().id() != std::thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

impl Drop for TimeoutManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker<F>(shared: &TimerShared, handler: F)
where
    F: Fn(TimerTask),
{
    loop {
        let due = {
            let mut state = shared.state.lock();
            loop {
                if state.shutdown {
                    return;
                }
                let now = Instant::now();
                let mut due = Vec::new();
                while state
                    .entries
                    .peek()
                    .is_some_and(|entry| entry.deadline <= now)
                {
                    if let Some(entry) = state.entries.pop() {
                        due.push(entry);
                    }
                }
                if !due.is_empty() {
                    break due;
                }
                match state.entries.peek().map(|entry| entry.deadline) {
                    Some(deadline) => {
                        let _ = shared.wakeup.wait_until(&mut state, deadline);
                    }
                    None => shared.wakeup.wait(&mut state),
                }
            }
        };

        // Dispatch outside the state lock; handlers may schedule new entries.
        for entry in due {
            if !entry.cancelled.load(AtomicOrdering::Relaxed) {
                handler(entry.task);
            }
        }
    }
}
