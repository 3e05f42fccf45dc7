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

//! Fixed-slot datagram buffer pool between the socket loop and the parse
//! workers.
//!
//! The receive loop allocates a slot, fills it and enqueues it; workers
//! dequeue, parse and release. When every slot is taken the pool recycles
//! the oldest unparsed datagram rather than blocking the socket: fresh
//! traffic beats stale traffic.

use crate::base::Mutex;
use parking_lot::Condvar;
use std::collections::VecDeque;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};

/// Datagram slot size in bytes.
pub const SLOT_SIZE: usize = 512;

/// One pool slot: a fixed-capacity byte buffer plus datagram metadata.
#[derive(Debug)]
pub struct Slot {
    pub data: Vec<u8>,
    /// Valid bytes in `data`.
    pub len: usize,
    /// Datagram origin.
    pub endpoint: SocketAddr,
}

impl Slot {
    fn new() -> Self {
        Slot {
            data: vec![0; SLOT_SIZE],
            len: 0,
            endpoint: SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

struct State {
    free: Vec<Slot>,
    queue: VecDeque<Slot>,
    stopped: bool,
}

/// Bounded pool of datagram slots.
pub struct UdpBuffers {
    state: Mutex<State>,
    condvar: Condvar,
    /// Datagrams dropped by LRU recycling.
    pub overflows: AtomicU64,
}

impl UdpBuffers {
    pub fn new(count: usize) -> Self {
        let free = (0..count.max(1)).map(|_| Slot::new()).collect();
        UdpBuffers {
            state: Mutex::new(State {
                free,
                queue: VecDeque::new(),
                stopped: false,
            }),
            condvar: Condvar::new(),
            overflows: AtomicU64::new(0),
        }
    }

    /// Take a slot for the next datagram. Recycles the oldest queued slot
    /// when the free list is empty; returns `None` once stopped.
    pub fn allocate(&self) -> Option<Slot> {
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                return None;
            }
            if let Some(slot) = state.free.pop() {
                return Some(slot);
            }
            if let Some(slot) = state.queue.pop_front() {
                self.overflows.fetch_add(1, Ordering::Relaxed);
                return Some(slot);
            }
            // Every slot is being parsed; wait for a release.
            self.condvar.wait(&mut state);
        }
    }

    /// Hand a filled slot to the parse workers.
    pub fn enqueue(&self, slot: Slot) {
        let mut state = self.state.lock();
        if state.stopped {
            return;
        }
        state.queue.push_back(slot);
        drop(state);
        self.condvar.notify_one();
    }

    /// Blocking dequeue for parse workers; `None` means the pool stopped.
    pub fn dequeue(&self) -> Option<Slot> {
        let mut state = self.state.lock();
        loop {
            if let Some(slot) = state.queue.pop_front() {
                return Some(slot);
            }
            if state.stopped {
                return None;
            }
            self.condvar.wait(&mut state);
        }
    }

    /// Return a parsed slot to the free list.
    pub fn release(&self, slot: Slot) {
        let mut state = self.state.lock();
        state.free.push(slot);
        drop(state);
        self.condvar.notify_one();
    }

    /// Wake all dequeuers with `None` and refuse further allocates.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        drop(state);
        self.condvar.notify_all();
    }
}
