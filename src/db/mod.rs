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

//! Durable ledger state behind read snapshots and write forks.
//!
//! A fork is an uncommitted batch of table mutations; merging it publishes
//! every change atomically and refreshes the snapshot readers observe.
//! Exactly one component (the block processor) creates forks; everything
//! else reads.

use crate::base::schema::{
    Account, AccountInfo, Amount, PendingInfo, PendingKey, StoredBlock, UncheckedInfo, VoteInfo,
};
use crate::crypto::Hash;
use crate::error::*;
#[cfg(test)]
use mockall::automock;

#[cfg(feature = "with-rocksdb")]
pub mod rocks;
#[cfg(feature = "with-rocksdb")]
pub use rocks::{RocksDb, Store, StoreFork};

/// Current persistent schema version; opening a store written by any other
/// version is refused.
pub const SCHEMA_VERSION: u32 = 1;

/// Meta table keys.
pub const META_SCHEMA_VERSION: &str = "schema_version";
pub const META_NODE_SEED: &str = "node_seed";

/// Trait providing read access to the committed database state.
#[cfg_attr(test, automock(type DbForkType = MockDbFork;))]
pub trait Db: Send + Sync + 'static {
    /// Type representing a database fork.
    type DbForkType: DbFork;

    /// Load the head record of an account.
    fn account_info(&self, account: &Account) -> Option<AccountInfo>;

    /// Number of opened accounts.
    fn account_count(&self) -> u64;

    /// Load a block with its sideband.
    fn block(&self, hash: &Hash) -> Option<StoredBlock>;

    /// Check block presence without deserializing.
    fn contains_block(&self, hash: &Hash) -> bool;

    /// Load a pending (unreceived send) entry.
    fn pending(&self, key: &PendingKey) -> Option<PendingInfo>;

    /// Pending entries with key >= `start`, up to `max`, in key order.
    fn pending_range(&self, start: &PendingKey, max: usize) -> Vec<(PendingKey, PendingInfo)>;

    /// Account records with account >= `start`, up to `max`, in account order.
    fn frontier_range(&self, start: &Account, max: usize) -> Vec<(Account, AccountInfo)>;

    /// Voting weight delegated to a representative.
    fn weight(&self, representative: &Account) -> Amount;

    /// Representatives with non-zero delegated weight, up to `max`.
    fn representation(&self, max: usize) -> Vec<(Account, Amount)>;

    /// All blocks waiting on `dependency`.
    fn unchecked_for(&self, dependency: &Hash) -> Vec<UncheckedInfo>;

    /// Full (dependency, block hash, arrival) index of the unchecked table.
    fn unchecked_index(&self) -> Vec<(Hash, Hash, u64)>;

    /// Latest observed vote of a representative.
    fn vote(&self, representative: &Account) -> Option<VoteInfo>;

    /// Online weight samples, oldest first.
    fn online_weight_samples(&self) -> Vec<(u64, Amount)>;

    /// Read a meta entry.
    fn meta_get(&self, key: &str) -> Option<Vec<u8>>;

    /// Create a database fork: a set of uncommitted modifications.
    fn fork_create(&mut self) -> Self::DbForkType;

    /// Commit the modifications contained in a fork.
    fn fork_merge(&mut self, fork: Self::DbForkType) -> Result<()>;
}

/// Database fork trait.
/// Used to atomically apply a batch of ledger mutations.
/// Instances cannot be safely shared between threads.
#[cfg_attr(test, automock)]
pub trait DbFork: 'static {
    fn account_info(&self, account: &Account) -> Option<AccountInfo>;
    fn store_account_info(&mut self, account: &Account, info: &AccountInfo);
    fn remove_account_info(&mut self, account: &Account);

    fn block(&self, hash: &Hash) -> Option<StoredBlock>;
    fn contains_block(&self, hash: &Hash) -> bool;
    fn store_block(&mut self, hash: &Hash, stored: &StoredBlock);
    fn remove_block(&mut self, hash: &Hash);

    /// Patch the successor field of an existing block's sideband.
    fn set_successor(&mut self, hash: &Hash, successor: Hash) {
        if let Some(mut stored) = self.block(hash) {
            stored.sideband.successor = successor;
            self.store_block(hash, &stored);
        }
    }

    fn pending(&self, key: &PendingKey) -> Option<PendingInfo>;
    fn store_pending(&mut self, key: &PendingKey, info: &PendingInfo);
    fn remove_pending(&mut self, key: &PendingKey);

    fn weight(&self, representative: &Account) -> Amount;
    /// Store a representative weight; zero clears the row.
    fn set_weight(&mut self, representative: &Account, weight: Amount);

    fn unchecked_for(&self, dependency: &Hash) -> Vec<UncheckedInfo>;
    fn store_unchecked(&mut self, dependency: &Hash, info: &UncheckedInfo);
    fn remove_unchecked(&mut self, dependency: &Hash, hash: &Hash);

    fn vote(&self, representative: &Account) -> Option<VoteInfo>;
    fn store_vote(&mut self, representative: &Account, info: &VoteInfo);

    fn store_online_weight(&mut self, timestamp: u64, weight: Amount);
    /// Drop the oldest samples until at most `keep` remain.
    fn prune_online_weight(&mut self, keep: usize);

    fn meta_get(&self, key: &str) -> Option<Vec<u8>>;
    fn meta_put(&mut self, key: &str, value: &[u8]);
}
