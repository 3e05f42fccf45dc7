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

//! Proof-of-work primitive.
//!
//! A block's work nonce is valid when the 8-byte Blake2b digest of
//! `nonce || root`, read little-endian, clears the network threshold. The
//! root is the previous block hash, or the account for a chain's first block.

use crate::{
    channel::{simple_channel, Receiver},
    crypto::hash::blake2b_u64,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;

/// Evaluate the work digest for a (root, nonce) pair.
pub fn work_value(root: &[u8; 32], work: u64) -> u64 {
    blake2b_u64(&[&work.to_le_bytes(), root])
}

/// Check a nonce against the given threshold.
pub fn work_valid(root: &[u8; 32], work: u64, threshold: u64) -> bool {
    work_value(root, work) >= threshold
}

/// Threaded nonce generator.
///
/// Generation requests fan out over `threads` workers, each probing a
/// disjoint residue class of the nonce space. The first hit wins; the other
/// workers observe the shared flag and bail out.
pub struct WorkPool {
    threads: usize,
    stopped: Arc<AtomicBool>,
}

impl WorkPool {
    pub fn new(threads: usize) -> Self {
        WorkPool {
            threads: threads.max(1),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Asynchronously produce a nonce valid for `root` at `threshold`.
    /// The receiver yields exactly one value unless the pool is stopped.
    pub fn generate(&self, root: [u8; 32], threshold: u64) -> Receiver<u64> {
        let (tx, rx) = simple_channel::<u64>();
        let found = Arc::new(AtomicBool::new(false));

        for index in 0..self.threads {
            let tx = tx.clone();
            let found = found.clone();
            let stopped = self.stopped.clone();
            let step = self.threads as u64;
            thread::spawn(move || {
                let mut nonce = rand::random::<u64>()
                    .wrapping_sub(rand::random::<u64>() % step)
                    .wrapping_add(index as u64);
                loop {
                    if found.load(Ordering::Relaxed) || stopped.load(Ordering::Relaxed) {
                        return;
                    }
                    for _ in 0..1024 {
                        if work_valid(&root, nonce, threshold) {
                            if !found.swap(true, Ordering::Relaxed) {
                                let _ = tx.send_sync(nonce);
                            }
                            return;
                        }
                        nonce = nonce.wrapping_add(step);
                    }
                }
            });
        }
        rx
    }

    /// Stop all outstanding generation jobs.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Clears roughly one nonce out of 256.
    const EASY_THRESHOLD: u64 = 0xff00_0000_0000_0000;

    #[test]
    fn value_is_root_sensitive() {
        let a = work_value(&[1; 32], 42);
        let b = work_value(&[2; 32], 42);

        assert_ne!(a, b);
    }

    #[test]
    fn zero_threshold_accepts_anything() {
        assert!(work_valid(&[0; 32], 0, 0));
        assert!(work_valid(&[9; 32], u64::MAX, 0));
    }

    #[test]
    fn generated_nonce_validates() {
        let pool = WorkPool::new(2);

        let nonce = pool.generate([3; 32], EASY_THRESHOLD).recv_sync().unwrap();

        assert!(work_valid(&[3; 32], nonce, EASY_THRESHOLD));
    }

    #[test]
    fn stopped_pool_gives_up() {
        let pool = WorkPool::new(1);
        pool.stop();

        // Threshold is unreachable in practice; a stopped pool must not spin.
        let rx = pool.generate([3; 32], u64::MAX);

        assert!(rx
            .recv_timeout_sync(std::time::Duration::from_millis(500))
            .is_err());
    }
}
