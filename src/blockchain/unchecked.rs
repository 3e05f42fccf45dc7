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

//! Holding area for blocks whose dependency has not arrived yet.
//!
//! Entries live in the `unchecked` store table, keyed by the missing hash
//! (`previous` for ordinary blocks, the source for receives and opens). An
//! in-memory arrival index keeps the table bounded: beyond the cap the
//! oldest entries are evicted, never the newest.

use crate::{
    base::schema::UncheckedInfo,
    crypto::{Hash, Hashable},
    db::{Db, DbFork},
};
use std::collections::BTreeSet;

/// Bounded dependency index over the unchecked table.
pub struct Unchecked {
    cap: usize,
    /// (arrival, dependency, block hash), ordered oldest first.
    arrivals: BTreeSet<(u64, Hash, Hash)>,
}

impl Unchecked {
    pub fn new(cap: usize) -> Self {
        Unchecked {
            cap: cap.max(1),
            arrivals: BTreeSet::new(),
        }
    }

    /// Rebuild the in-memory index from the committed table; called once at
    /// node start.
    pub fn restore<D: Db>(&mut self, db: &D) {
        for (dependency, hash, arrival) in db.unchecked_index() {
            self.arrivals.insert((arrival, dependency, hash));
        }
        if !self.arrivals.is_empty() {
            debug!("restored {} unchecked entries", self.arrivals.len());
        }
    }

    pub fn len(&self) -> usize {
        self.arrivals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrivals.is_empty()
    }

    /// Queue a block under its missing dependency, evicting the oldest
    /// entries when the cap is exceeded. Returns the number of evictions.
    pub fn insert<F: DbFork>(&mut self, fork: &mut F, dependency: Hash, info: UncheckedInfo) -> usize {
        let hash = info.block.hash();
        if !self.arrivals.insert((info.arrival, dependency, hash)) {
            return 0;
        }
        fork.store_unchecked(&dependency, &info);

        let mut evicted = 0;
        while self.arrivals.len() > self.cap {
            let oldest = match self.arrivals.iter().next() {
                Some(entry) => *entry,
                None => break,
            };
            self.arrivals.remove(&oldest);
            let (_, dep, hash) = oldest;
            fork.remove_unchecked(&dep, &hash);
            evicted += 1;
        }
        if evicted > 0 {
            debug!("unchecked overflow, evicted {} oldest entries", evicted);
        }
        evicted
    }

    /// Remove and return every block waiting on `dependency`.
    pub fn drain_for<F: DbFork>(&mut self, fork: &mut F, dependency: &Hash) -> Vec<UncheckedInfo> {
        let waiters = fork.unchecked_for(dependency);
        for info in &waiters {
            let hash = info.block.hash();
            fork.remove_unchecked(dependency, &hash);
            self.arrivals.remove(&(info.arrival, *dependency, hash));
        }
        waiters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::schema::{tests::create_test_send, SignatureState};
    use crate::crypto::KeyPair;
    use crate::db::{rocks::Store, Db};

    fn info(block: crate::base::schema::Block, arrival: u64) -> UncheckedInfo {
        UncheckedInfo {
            block,
            arrival,
            verified: SignatureState::Unknown,
        }
    }

    #[test]
    fn insert_and_drain() {
        let mut store = Store::temporary();
        let mut unchecked = Unchecked::new(16);
        let keypair = KeyPair::from_random();
        let dep = Hash::new([1; 32]);
        let block = create_test_send(&keypair, dep, 10);

        let mut fork = store.fork_create();
        unchecked.insert(&mut fork, dep, info(block.clone(), 1));
        store.fork_merge(fork).unwrap();
        assert_eq!(unchecked.len(), 1);

        let mut fork = store.fork_create();
        let drained = unchecked.drain_for(&mut fork, &dep);
        store.fork_merge(fork).unwrap();

        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].block, block);
        assert!(unchecked.is_empty());
        assert!(store.unchecked_for(&dep).is_empty());
    }

    #[test]
    fn capacity_drops_oldest_not_newest() {
        let mut store = Store::temporary();
        let mut unchecked = Unchecked::new(2);
        let keypair = KeyPair::from_random();

        let mut fork = store.fork_create();
        for (tag, arrival) in [(1_u8, 10_u64), (2, 20), (3, 30)] {
            let dep = Hash::new([tag; 32]);
            let block = create_test_send(&keypair, dep, tag as u128);
            unchecked.insert(&mut fork, dep, info(block, arrival));
        }
        store.fork_merge(fork).unwrap();

        assert_eq!(unchecked.len(), 2);
        // Oldest (arrival 10) went; the two newest remain.
        assert!(store.unchecked_for(&Hash::new([1; 32])).is_empty());
        assert_eq!(store.unchecked_for(&Hash::new([2; 32])).len(), 1);
        assert_eq!(store.unchecked_for(&Hash::new([3; 32])).len(), 1);
    }

    #[test]
    fn restore_from_store() {
        let mut store = Store::temporary();
        let keypair = KeyPair::from_random();
        let dep = Hash::new([1; 32]);
        let block = create_test_send(&keypair, dep, 10);

        {
            let mut unchecked = Unchecked::new(16);
            let mut fork = store.fork_create();
            unchecked.insert(&mut fork, dep, info(block, 7));
            store.fork_merge(fork).unwrap();
        }

        let mut fresh = Unchecked::new(16);
        fresh.restore(&store);

        assert_eq!(fresh.len(), 1);
    }

    #[test]
    fn duplicate_insert_is_ignored() {
        let mut store = Store::temporary();
        let mut unchecked = Unchecked::new(16);
        let keypair = KeyPair::from_random();
        let dep = Hash::new([1; 32]);
        let block = create_test_send(&keypair, dep, 10);

        let mut fork = store.fork_create();
        unchecked.insert(&mut fork, dep, info(block.clone(), 5));
        unchecked.insert(&mut fork, dep, info(block, 5));
        store.fork_merge(fork).unwrap();

        assert_eq!(unchecked.len(), 1);
    }
}
