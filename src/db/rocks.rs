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

//! Ledger store on merkledb with the RocksDB backend.
//!
//! Logical tables are `MapIndex` maps; keys are fixed-width so iteration
//! order is the natural account / (account, hash) order the streaming
//! servers rely on.

use std::path::Path;

use crate::{
    base::{
        schema::{
            Account, AccountInfo, Amount, PendingInfo, PendingKey, StoredBlock, UncheckedInfo,
            VoteInfo,
        },
        serialize::{rmp_deserialize, rmp_serialize},
    },
    crypto::Hash,
    db::{Db, DbFork, META_SCHEMA_VERSION, SCHEMA_VERSION},
    Error, ErrorKind, Result,
};
use merkledb::{
    access::CopyAccessExt, BinaryKey, BinaryValue, Database, DbOptions, Fork, MapIndex, RocksDB,
    Snapshot, TemporaryDB, _reexports::Error as MerkleDbError,
};
use std::borrow::Cow;

const FRONTIERS: &str = "frontiers";
const BLOCKS: &str = "blocks";
const PENDING: &str = "pending";
const REPRESENTATION: &str = "representation";
const UNCHECKED: &str = "unchecked";
const VOTE: &str = "vote";
const ONLINE_WEIGHT: &str = "online_weight";
const META: &str = "meta";

impl BinaryKey for Hash {
    fn size(&self) -> usize {
        32
    }

    fn write(&self, buffer: &mut [u8]) -> usize {
        buffer.copy_from_slice(self.as_ref());
        self.size()
    }

    fn read(buffer: &[u8]) -> Self::Owned {
        Hash::from_bytes(buffer).expect("key width is fixed")
    }
}

impl BinaryKey for Account {
    fn size(&self) -> usize {
        32
    }

    fn write(&self, buffer: &mut [u8]) -> usize {
        buffer.copy_from_slice(self.as_bytes());
        self.size()
    }

    fn read(buffer: &[u8]) -> Self::Owned {
        Account::from_bytes(buffer).expect("key width is fixed")
    }
}

impl BinaryKey for PendingKey {
    fn size(&self) -> usize {
        64
    }

    fn write(&self, buffer: &mut [u8]) -> usize {
        buffer[..32].copy_from_slice(self.account.as_bytes());
        buffer[32..64].copy_from_slice(self.hash.as_ref());
        self.size()
    }

    fn read(buffer: &[u8]) -> Self::Owned {
        PendingKey {
            account: Account::from_bytes(&buffer[..32]).expect("key width is fixed"),
            hash: Hash::from_bytes(&buffer[32..64]).expect("key width is fixed"),
        }
    }
}

/// Unchecked table key: blocks waiting on the same dependency are adjacent.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) struct UncheckedKey {
    pub dependency: Hash,
    pub hash: Hash,
}

impl BinaryKey for UncheckedKey {
    fn size(&self) -> usize {
        64
    }

    fn write(&self, buffer: &mut [u8]) -> usize {
        buffer[..32].copy_from_slice(self.dependency.as_ref());
        buffer[32..64].copy_from_slice(self.hash.as_ref());
        self.size()
    }

    fn read(buffer: &[u8]) -> Self::Owned {
        UncheckedKey {
            dependency: Hash::from_bytes(&buffer[..32]).expect("key width is fixed"),
            hash: Hash::from_bytes(&buffer[32..64]).expect("key width is fixed"),
        }
    }
}

macro_rules! rmp_binary_value {
    ($type:ty) => {
        impl BinaryValue for $type {
            fn to_bytes(&self) -> Vec<u8> {
                rmp_serialize(self).unwrap()
            }

            fn from_bytes(bytes: Cow<'_, [u8]>) -> std::result::Result<Self, MerkleDbError> {
                rmp_deserialize(bytes.as_ref()).map_err(|err| err.into())
            }
        }
    };
}

rmp_binary_value!(AccountInfo);
rmp_binary_value!(StoredBlock);
rmp_binary_value!(PendingInfo);
rmp_binary_value!(UncheckedInfo);
rmp_binary_value!(VoteInfo);
rmp_binary_value!(Amount);

/// Ledger store over any merkledb backend.
pub struct Store<B: Database> {
    /// Backend implementing the merkledb `Database` trait.
    backend: B,
    /// Read-only snapshot of the last committed state.
    snap: Box<dyn Snapshot>,
}

/// Database writeable fork.
/// Obtained via `fork_create`; a batch of changes becomes visible only when
/// merged back with `fork_merge`.
pub struct StoreFork(Fork);

/// Store on the filesystem-backed RocksDB engine.
pub type RocksDb = Store<RocksDB>;

impl RocksDb {
    /// Create/Open a database from the filesystem.
    /// Refuses stores written by an unknown schema version.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options = DbOptions::default();
        let backend = RocksDB::open(path, &options)
            .map_err(|err| Error::new_ext(ErrorKind::StoreFault, err.to_string()))?;
        let snap = backend.snapshot();
        let mut store = Store { backend, snap };
        store.ensure_schema()?;
        Ok(store)
    }
}

impl Store<TemporaryDB> {
    /// Throwaway in-memory-ish store. Used by tests and tooling.
    pub fn temporary() -> Self {
        let backend = TemporaryDB::new();
        let snap = backend.snapshot();
        let mut store = Store { backend, snap };
        store.ensure_schema().expect("fresh store");
        store
    }
}

impl<B: Database> Store<B> {
    fn ensure_schema(&mut self) -> Result<()> {
        match self.meta_get(META_SCHEMA_VERSION) {
            Some(raw) => {
                let version = raw
                    .try_into()
                    .map(u32::from_le_bytes)
                    .map_err(|_| Error::new(ErrorKind::StoreFault))?;
                if version != SCHEMA_VERSION {
                    return Err(Error::new_ext(
                        ErrorKind::SchemaMismatch,
                        format!("store version {} wanted {}", version, SCHEMA_VERSION),
                    ));
                }
                Ok(())
            }
            None => {
                let mut fork = self.fork_create();
                fork.meta_put(META_SCHEMA_VERSION, &SCHEMA_VERSION.to_le_bytes());
                self.fork_merge(fork)
            }
        }
    }
}

impl<B: Database> Db for Store<B> {
    type DbForkType = StoreFork;

    fn account_info(&self, account: &Account) -> Option<AccountInfo> {
        let map: MapIndex<_, Account, AccountInfo> = self.snap.get_map(FRONTIERS);
        map.get(account)
    }

    fn account_count(&self) -> u64 {
        let map: MapIndex<_, Account, AccountInfo> = self.snap.get_map(FRONTIERS);
        map.iter().count() as u64
    }

    fn block(&self, hash: &Hash) -> Option<StoredBlock> {
        let map: MapIndex<_, Hash, StoredBlock> = self.snap.get_map(BLOCKS);
        map.get(hash)
    }

    fn contains_block(&self, hash: &Hash) -> bool {
        let map: MapIndex<_, Hash, StoredBlock> = self.snap.get_map(BLOCKS);
        map.contains(hash)
    }

    fn pending(&self, key: &PendingKey) -> Option<PendingInfo> {
        let map: MapIndex<_, PendingKey, PendingInfo> = self.snap.get_map(PENDING);
        map.get(key)
    }

    fn pending_range(&self, start: &PendingKey, max: usize) -> Vec<(PendingKey, PendingInfo)> {
        let map: MapIndex<_, PendingKey, PendingInfo> = self.snap.get_map(PENDING);
        map.iter_from(start).take(max).collect()
    }

    fn frontier_range(&self, start: &Account, max: usize) -> Vec<(Account, AccountInfo)> {
        let map: MapIndex<_, Account, AccountInfo> = self.snap.get_map(FRONTIERS);
        map.iter_from(start).take(max).collect()
    }

    fn weight(&self, representative: &Account) -> Amount {
        let map: MapIndex<_, Account, Amount> = self.snap.get_map(REPRESENTATION);
        map.get(representative).unwrap_or_default()
    }

    fn representation(&self, max: usize) -> Vec<(Account, Amount)> {
        let map: MapIndex<_, Account, Amount> = self.snap.get_map(REPRESENTATION);
        map.iter()
            .filter(|(_, weight)| !weight.is_zero())
            .take(max)
            .collect()
    }

    fn unchecked_for(&self, dependency: &Hash) -> Vec<UncheckedInfo> {
        let map: MapIndex<_, UncheckedKey, UncheckedInfo> = self.snap.get_map(UNCHECKED);
        let start = UncheckedKey {
            dependency: *dependency,
            hash: Hash::zero(),
        };
        map.iter_from(&start)
            .take_while(|(key, _)| key.dependency == *dependency)
            .map(|(_, info)| info)
            .collect()
    }

    fn unchecked_index(&self) -> Vec<(Hash, Hash, u64)> {
        let map: MapIndex<_, UncheckedKey, UncheckedInfo> = self.snap.get_map(UNCHECKED);
        map.iter()
            .map(|(key, info)| (key.dependency, key.hash, info.arrival))
            .collect()
    }

    fn vote(&self, representative: &Account) -> Option<VoteInfo> {
        let map: MapIndex<_, Account, VoteInfo> = self.snap.get_map(VOTE);
        map.get(representative)
    }

    fn online_weight_samples(&self) -> Vec<(u64, Amount)> {
        let map: MapIndex<_, u64, Amount> = self.snap.get_map(ONLINE_WEIGHT);
        map.iter().collect()
    }

    fn meta_get(&self, key: &str) -> Option<Vec<u8>> {
        let map: MapIndex<_, str, Vec<u8>> = self.snap.get_map(META);
        map.get(key)
    }

    fn fork_create(&mut self) -> StoreFork {
        StoreFork(self.backend.fork())
    }

    fn fork_merge(&mut self, fork: StoreFork) -> Result<()> {
        self.backend
            .merge(fork.0.into_patch())
            .map_err(|err| Error::new_ext(ErrorKind::StoreFault, err.to_string()))?;
        self.snap = self.backend.snapshot();
        Ok(())
    }
}

impl DbFork for StoreFork {
    fn account_info(&self, account: &Account) -> Option<AccountInfo> {
        let map: MapIndex<_, Account, AccountInfo> = self.0.get_map(FRONTIERS);
        map.get(account)
    }

    fn store_account_info(&mut self, account: &Account, info: &AccountInfo) {
        let mut map: MapIndex<_, Account, AccountInfo> = self.0.get_map(FRONTIERS);
        map.put(account, info.clone());
    }

    fn remove_account_info(&mut self, account: &Account) {
        let mut map: MapIndex<_, Account, AccountInfo> = self.0.get_map(FRONTIERS);
        map.remove(account);
    }

    fn block(&self, hash: &Hash) -> Option<StoredBlock> {
        let map: MapIndex<_, Hash, StoredBlock> = self.0.get_map(BLOCKS);
        map.get(hash)
    }

    fn contains_block(&self, hash: &Hash) -> bool {
        let map: MapIndex<_, Hash, StoredBlock> = self.0.get_map(BLOCKS);
        map.contains(hash)
    }

    fn store_block(&mut self, hash: &Hash, stored: &StoredBlock) {
        let mut map: MapIndex<_, Hash, StoredBlock> = self.0.get_map(BLOCKS);
        map.put(hash, stored.clone());
    }

    fn remove_block(&mut self, hash: &Hash) {
        let mut map: MapIndex<_, Hash, StoredBlock> = self.0.get_map(BLOCKS);
        map.remove(hash);
    }

    fn pending(&self, key: &PendingKey) -> Option<PendingInfo> {
        let map: MapIndex<_, PendingKey, PendingInfo> = self.0.get_map(PENDING);
        map.get(key)
    }

    fn store_pending(&mut self, key: &PendingKey, info: &PendingInfo) {
        let mut map: MapIndex<_, PendingKey, PendingInfo> = self.0.get_map(PENDING);
        map.put(key, info.clone());
    }

    fn remove_pending(&mut self, key: &PendingKey) {
        let mut map: MapIndex<_, PendingKey, PendingInfo> = self.0.get_map(PENDING);
        map.remove(key);
    }

    fn weight(&self, representative: &Account) -> Amount {
        let map: MapIndex<_, Account, Amount> = self.0.get_map(REPRESENTATION);
        map.get(representative).unwrap_or_default()
    }

    fn set_weight(&mut self, representative: &Account, weight: Amount) {
        let mut map: MapIndex<_, Account, Amount> = self.0.get_map(REPRESENTATION);
        if weight.is_zero() {
            map.remove(representative);
        } else {
            map.put(representative, weight);
        }
    }

    fn unchecked_for(&self, dependency: &Hash) -> Vec<UncheckedInfo> {
        let map: MapIndex<_, UncheckedKey, UncheckedInfo> = self.0.get_map(UNCHECKED);
        let start = UncheckedKey {
            dependency: *dependency,
            hash: Hash::zero(),
        };
        map.iter_from(&start)
            .take_while(|(key, _)| key.dependency == *dependency)
            .map(|(_, info)| info)
            .collect()
    }

    fn store_unchecked(&mut self, dependency: &Hash, info: &UncheckedInfo) {
        use crate::crypto::Hashable;
        let key = UncheckedKey {
            dependency: *dependency,
            hash: info.block.hash(),
        };
        let mut map: MapIndex<_, UncheckedKey, UncheckedInfo> = self.0.get_map(UNCHECKED);
        map.put(&key, info.clone());
    }

    fn remove_unchecked(&mut self, dependency: &Hash, hash: &Hash) {
        let key = UncheckedKey {
            dependency: *dependency,
            hash: *hash,
        };
        let mut map: MapIndex<_, UncheckedKey, UncheckedInfo> = self.0.get_map(UNCHECKED);
        map.remove(&key);
    }

    fn vote(&self, representative: &Account) -> Option<VoteInfo> {
        let map: MapIndex<_, Account, VoteInfo> = self.0.get_map(VOTE);
        map.get(representative)
    }

    fn store_vote(&mut self, representative: &Account, info: &VoteInfo) {
        let mut map: MapIndex<_, Account, VoteInfo> = self.0.get_map(VOTE);
        map.put(representative, info.clone());
    }

    fn store_online_weight(&mut self, timestamp: u64, weight: Amount) {
        let mut map: MapIndex<_, u64, Amount> = self.0.get_map(ONLINE_WEIGHT);
        map.put(&timestamp, weight);
    }

    fn prune_online_weight(&mut self, keep: usize) {
        let mut map: MapIndex<_, u64, Amount> = self.0.get_map(ONLINE_WEIGHT);
        let timestamps: Vec<u64> = map.iter().map(|(ts, _)| ts).collect();
        if timestamps.len() > keep {
            for ts in &timestamps[..timestamps.len() - keep] {
                map.remove(ts);
            }
        }
    }

    fn meta_get(&self, key: &str) -> Option<Vec<u8>> {
        let map: MapIndex<_, str, Vec<u8>> = self.0.get_map(META);
        map.get(key)
    }

    fn meta_put(&mut self, key: &str, value: &[u8]) {
        let mut map: MapIndex<_, str, Vec<u8>> = self.0.get_map(META);
        map.put(key, value.to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::schema::{tests::create_test_send, Block, Sideband, SignatureState};
    use crate::crypto::{Hashable, KeyPair};

    fn test_store() -> Store<TemporaryDB> {
        Store::temporary()
    }

    fn stored(block: &Block, account: Account, height: u64) -> StoredBlock {
        StoredBlock {
            block: block.clone(),
            sideband: Sideband {
                account,
                height,
                timestamp: 1,
                successor: Hash::zero(),
                balance: Amount(100),
            },
        }
    }

    #[test]
    fn fresh_store_carries_schema_version() {
        let store = test_store();

        let raw = store.meta_get(META_SCHEMA_VERSION).unwrap();

        assert_eq!(u32::from_le_bytes(raw.try_into().unwrap()), SCHEMA_VERSION);
    }

    #[test]
    fn schema_mismatch_is_fatal() {
        let mut store = test_store();
        let mut fork = store.fork_create();
        fork.meta_put(META_SCHEMA_VERSION, &99_u32.to_le_bytes());
        store.fork_merge(fork).unwrap();

        let err = store.ensure_schema().unwrap_err();

        assert_eq!(err.kind, ErrorKind::SchemaMismatch);
        assert!(err.is_fatal());
    }

    #[test]
    fn block_put_get_across_commit() {
        let mut store = test_store();
        let keypair = KeyPair::from_random();
        let block = create_test_send(&keypair, Hash::new([1; 32]), 50);
        let hash = block.hash();
        let record = stored(&block, Account::from(keypair.public_key()), 3);

        let mut fork = store.fork_create();
        fork.store_block(&hash, &record);
        // Not yet visible to readers.
        assert!(store.block(&hash).is_none());
        store.fork_merge(fork).unwrap();

        assert_eq!(store.block(&hash).unwrap(), record);
        assert!(store.contains_block(&hash));
    }

    #[test]
    fn successor_patch() {
        let mut store = test_store();
        let keypair = KeyPair::from_random();
        let block = create_test_send(&keypair, Hash::new([1; 32]), 50);
        let hash = block.hash();
        let record = stored(&block, Account::from(keypair.public_key()), 3);

        let mut fork = store.fork_create();
        fork.store_block(&hash, &record);
        fork.set_successor(&hash, Hash::new([9; 32]));
        store.fork_merge(fork).unwrap();

        assert_eq!(store.block(&hash).unwrap().sideband.successor, Hash::new([9; 32]));
    }

    #[test]
    fn frontier_range_is_account_ordered() {
        let mut store = test_store();
        let info = AccountInfo {
            head: Hash::new([1; 32]),
            open_block: Hash::new([1; 32]),
            representative_block: Hash::new([1; 32]),
            balance: Amount(1),
            modified: 0,
            block_count: 1,
            epoch: 0,
        };

        let mut fork = store.fork_create();
        for tag in [5_u8, 1, 9, 3] {
            fork.store_account_info(&Account::new([tag; 32]), &info);
        }
        store.fork_merge(fork).unwrap();

        let all = store.frontier_range(&Account::zero(), 10);
        let accounts: Vec<u8> = all.iter().map(|(a, _)| a.as_bytes()[0]).collect();
        assert_eq!(accounts, vec![1, 3, 5, 9]);

        let tail = store.frontier_range(&Account::new([4; 32]), 10);
        assert_eq!(tail.len(), 2);
        assert_eq!(store.account_count(), 4);
    }

    #[test]
    fn pending_range_groups_by_account() {
        let mut store = test_store();
        let info = PendingInfo {
            source: Account::new([7; 32]),
            amount: Amount(10),
            epoch: 0,
        };

        let mut fork = store.fork_create();
        fork.store_pending(&PendingKey::new(Account::new([1; 32]), Hash::new([2; 32])), &info);
        fork.store_pending(&PendingKey::new(Account::new([1; 32]), Hash::new([1; 32])), &info);
        fork.store_pending(&PendingKey::new(Account::new([2; 32]), Hash::new([0; 32])), &info);
        store.fork_merge(fork).unwrap();

        let start = PendingKey::new(Account::new([1; 32]), Hash::zero());
        let entries = store.pending_range(&start, 10);

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].0.hash, Hash::new([1; 32]));
        assert_eq!(entries[1].0.hash, Hash::new([2; 32]));
        assert_eq!(entries[2].0.account, Account::new([2; 32]));
    }

    #[test]
    fn unchecked_waiters_share_dependency() {
        let mut store = test_store();
        let keypair = KeyPair::from_random();
        let dep = Hash::new([3; 32]);
        let a = create_test_send(&keypair, dep, 10);
        let b = create_test_send(&keypair, dep, 20);

        let mut fork = store.fork_create();
        for block in [&a, &b] {
            fork.store_unchecked(
                &dep,
                &UncheckedInfo {
                    block: (*block).clone(),
                    arrival: 1,
                    verified: SignatureState::Unknown,
                },
            );
        }
        store.fork_merge(fork).unwrap();

        assert_eq!(store.unchecked_for(&dep).len(), 2);
        assert_eq!(store.unchecked_for(&Hash::new([4; 32])).len(), 0);
        assert_eq!(store.unchecked_index().len(), 2);

        let mut fork = store.fork_create();
        fork.remove_unchecked(&dep, &a.hash());
        store.fork_merge(fork).unwrap();

        assert_eq!(store.unchecked_for(&dep).len(), 1);
    }

    #[test]
    fn weight_zero_clears_row() {
        let mut store = test_store();
        let rep = Account::new([5; 32]);

        let mut fork = store.fork_create();
        fork.set_weight(&rep, Amount(100));
        store.fork_merge(fork).unwrap();
        assert_eq!(store.weight(&rep), Amount(100));
        assert_eq!(store.representation(10).len(), 1);

        let mut fork = store.fork_create();
        fork.set_weight(&rep, Amount::zero());
        store.fork_merge(fork).unwrap();

        assert_eq!(store.weight(&rep), Amount::zero());
        assert!(store.representation(10).is_empty());
    }

    #[test]
    fn online_weight_prune_keeps_newest() {
        let mut store = test_store();

        let mut fork = store.fork_create();
        for ts in 1..=10_u64 {
            fork.store_online_weight(ts, Amount(ts as u128));
        }
        fork.prune_online_weight(3);
        store.fork_merge(fork).unwrap();

        let samples = store.online_weight_samples();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].0, 8);
        assert_eq!(samples[2].0, 10);
    }
}
