// This file is part of VELA.
//
// Copyright (C) 2023 The Vela Project.
//
// VELA is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// VELA is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with VELA. If not, see <https://www.gnu.org/licenses/>.

//! Deadline scheduler shared by all components.
//!
//! Callbacks run on one worker thread at or after their deadline; order
//! among equal deadlines is unspecified. There is no cancellation: actions
//! are idempotent and check their own stop conditions.

use crate::base::Mutex;
use parking_lot::Condvar;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

type Callback = Box<dyn FnOnce() + Send>;

struct Entry {
    deadline: Instant,
    /// Tie-breaker keeping the heap total-ordered.
    seq: u64,
    callback: Callback,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

struct State {
    queue: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
    stopped: bool,
}

struct Inner {
    state: Mutex<State>,
    condvar: Condvar,
}

/// Shared deadline dispatcher.
pub struct Alarm {
    inner: Arc<Inner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Alarm {
    pub fn new() -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                queue: BinaryHeap::new(),
                next_seq: 0,
                stopped: false,
            }),
            condvar: Condvar::new(),
        });
        let worker_inner = inner.clone();
        let handle = std::thread::spawn(move || Self::run(worker_inner));
        Alarm {
            inner,
            handle: Mutex::new(Some(handle)),
        }
    }

    fn run(inner: Arc<Inner>) {
        loop {
            let callback = {
                let mut state = inner.state.lock();
                loop {
                    if state.stopped {
                        return;
                    }
                    let now = Instant::now();
                    match state.queue.peek() {
                        Some(Reverse(entry)) if entry.deadline <= now => {
                            break state.queue.pop().expect("peeked").0.callback;
                        }
                        Some(Reverse(entry)) => {
                            let deadline = entry.deadline;
                            inner.condvar.wait_until(&mut state, deadline);
                        }
                        None => {
                            inner.condvar.wait(&mut state);
                        }
                    }
                }
            };
            // Deadline work runs without the queue lock held.
            callback();
        }
    }

    /// Schedule `callback` at-or-after `deadline`.
    pub fn add<F: FnOnce() + Send + 'static>(&self, deadline: Instant, callback: F) {
        let mut state = self.inner.state.lock();
        if state.stopped {
            return;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push(Reverse(Entry {
            deadline,
            seq,
            callback: Box::new(callback),
        }));
        drop(state);
        self.inner.condvar.notify_one();
    }

    /// Schedule `callback` after `delay` from now.
    pub fn add_after<F: FnOnce() + Send + 'static>(&self, delay: Duration, callback: F) {
        self.add(Instant::now() + delay, callback);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.state.lock().stopped
    }

    /// Stop the worker; pending callbacks never run.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            state.stopped = true;
        }
        self.inner.condvar.notify_all();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Default for Alarm {
    fn default() -> Self {
        Alarm::new()
    }
}

impl Drop for Alarm {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Re-arm `action` every `interval` until the alarm stops.
pub fn recurring<F>(alarm: &Arc<Alarm>, interval: Duration, action: F)
where
    F: Fn() + Send + Sync + 'static,
{
    let alarm_weak = Arc::downgrade(alarm);
    let action = Arc::new(action);
    schedule_recurring(alarm, interval, alarm_weak, action);
}

fn schedule_recurring<F>(
    alarm: &Arc<Alarm>,
    interval: Duration,
    alarm_weak: std::sync::Weak<Alarm>,
    action: Arc<F>,
) where
    F: Fn() + Send + Sync + 'static,
{
    alarm.add_after(interval, move || {
        action();
        if let Some(alarm) = alarm_weak.upgrade() {
            if !alarm.is_stopped() {
                let next_weak = alarm_weak.clone();
                schedule_recurring(&alarm, interval, next_weak, action);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_in_deadline_order() {
        let alarm = Alarm::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let now = Instant::now();

        for (label, offset_ms) in [(2_u8, 60_u64), (1, 30), (3, 90)] {
            let log = log.clone();
            alarm.add(now + Duration::from_millis(offset_ms), move || {
                log.lock().push(label);
            });
        }

        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(*log.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn immediate_deadline_fires() {
        let alarm = Alarm::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();

        alarm.add(Instant::now(), move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_discards_pending() {
        let alarm = Alarm::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();

        alarm.add_after(Duration::from_secs(60), move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        alarm.stop();

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        // Adding after stop is a no-op.
        alarm.add(Instant::now(), || panic!("must not run"));
        std::thread::sleep(Duration::from_millis(50));
    }

    #[test]
    fn recurring_reschedules() {
        let alarm = Arc::new(Alarm::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();

        recurring(&alarm, Duration::from_millis(20), move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(300));
        assert!(fired.load(Ordering::SeqCst) >= 3);
    }
}
