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

//! Ledger rules: decide the outcome of a block against the current state and
//! apply or invert the described mutation.
//!
//! `process` is deterministic for a given fork state and idempotent:
//! re-applying a stored block yields `Old`. `rollback` exactly inverts
//! application, recursing into dependent receives when a rolled-back send
//! has already been consumed by another chain.

use crate::{
    base::{
        schema::{
            Account, AccountInfo, Amount, Block, PendingInfo, PendingKey, Sideband,
            SignatureState, StoredBlock,
        },
        unix_time,
    },
    config::Network,
    crypto::{work_valid, Hash, Hashable},
    db::DbFork,
    Error, ErrorKind, Result,
};
use std::sync::Arc;

/// Outcome of feeding one block to the ledger.
#[derive(Copy, Clone, Eq, PartialEq, Debug, serde::Serialize, serde::Deserialize)]
pub enum ProcessResult {
    /// Applied and persisted in the current fork.
    Progress,
    /// Hash already present.
    Old,
    /// `previous` is unknown; hold in unchecked.
    GapPrevious,
    /// Source send is unknown; hold in unchecked.
    GapSource,
    BadSignature,
    /// Send must strictly decrease the balance.
    NegativeSpend,
    /// Stated balance disagrees with the implied delta.
    BalanceMismatch,
    /// Source exists but no matching pending entry for this account.
    Unreceivable,
    /// Legacy block appended after a state block, or a repeated epoch bump.
    BlockPosition,
    /// `previous` is not the account frontier.
    Fork,
    WorkLow,
    Other,
}

impl ProcessResult {
    /// Gaps are recoverable by the unchecked queue, never failures.
    pub fn is_gap(&self) -> bool {
        matches!(self, ProcessResult::GapPrevious | ProcessResult::GapSource)
    }
}

/// Stateless validator; all state lives in the fork it is handed.
pub struct Ledger {
    network: Arc<Network>,
}

impl Ledger {
    pub fn new(network: Arc<Network>) -> Self {
        Ledger { network }
    }

    pub fn network(&self) -> &Arc<Network> {
        &self.network
    }

    /// Seed an empty store with the network's genesis block. The genesis is
    /// axiomatic: it is written directly, not routed through `process`.
    pub fn seed_genesis<F: DbFork>(&self, fork: &mut F) {
        let genesis = &self.network.genesis;
        let hash = genesis.hash();
        if fork.contains_block(&hash) {
            return;
        }
        let account = self.network.genesis_account;
        let amount = self.network.genesis_amount();
        let now = unix_time();
        fork.store_block(
            &hash,
            &StoredBlock {
                block: genesis.clone(),
                sideband: Sideband {
                    account,
                    height: 1,
                    timestamp: now,
                    successor: Hash::zero(),
                    balance: amount,
                },
            },
        );
        fork.store_account_info(
            &account,
            &AccountInfo {
                head: hash,
                open_block: hash,
                representative_block: hash,
                balance: amount,
                modified: now,
                block_count: 1,
                epoch: 0,
            },
        );
        fork.set_weight(&account, amount);
        info!("ledger seeded with genesis {}", hash);
    }

    /// Representative currently in charge of `info`'s account.
    pub fn representative_of<F: DbFork>(&self, fork: &F, info: &AccountInfo) -> Account {
        match fork.block(&info.representative_block).map(|s| s.block) {
            Some(Block::Open(b)) => b.representative,
            Some(Block::Change(b)) => b.representative,
            Some(Block::State(b)) => b.representative,
            // Send/receive blocks never assume the role; a missing block
            // would mean the store lost a row the frontier references.
            _ => self.network.genesis_account,
        }
    }

    /// Walk back from `hash` to the closest block carrying a representative.
    fn representative_at<F: DbFork>(&self, fork: &F, mut hash: Hash) -> Account {
        while let Some(stored) = fork.block(&hash) {
            match stored.block {
                Block::Open(b) => return b.representative,
                Block::Change(b) => return b.representative,
                Block::State(b) => return b.representative,
                other => hash = other.previous(),
            }
        }
        self.network.genesis_account
    }

    fn add_weight<F: DbFork>(fork: &mut F, representative: &Account, amount: Amount) {
        let weight = fork
            .weight(representative)
            .checked_add(amount)
            .unwrap_or(Amount::MAX);
        fork.set_weight(representative, weight);
    }

    fn sub_weight<F: DbFork>(fork: &mut F, representative: &Account, amount: Amount) {
        let weight = fork
            .weight(representative)
            .checked_sub(amount)
            .unwrap_or(Amount::zero());
        fork.set_weight(representative, weight);
    }

    /// Validate and apply one block. `verified` is the pre-verification hint
    /// from the signature checker; `Unknown` triggers inline verification.
    pub fn process<F: DbFork>(
        &self,
        fork: &mut F,
        block: &Block,
        verified: SignatureState,
    ) -> ProcessResult {
        let hash = block.hash();
        if fork.contains_block(&hash) {
            return ProcessResult::Old;
        }
        if verified == SignatureState::Invalid {
            return ProcessResult::BadSignature;
        }
        if !work_valid(&block.work_root(), block.work(), self.network.work_threshold) {
            return ProcessResult::WorkLow;
        }
        match block {
            Block::Send(_) | Block::Receive(_) | Block::Change(_) => {
                self.process_legacy(fork, block, &hash, verified)
            }
            Block::Open(_) => self.process_open(fork, block, &hash, verified),
            Block::State(_) => self.process_state(fork, block, &hash, verified),
        }
    }

    fn process_legacy<F: DbFork>(
        &self,
        fork: &mut F,
        block: &Block,
        hash: &Hash,
        verified: SignatureState,
    ) -> ProcessResult {
        let previous = block.previous();
        let prev_stored = match fork.block(&previous) {
            Some(stored) => stored,
            None => return ProcessResult::GapPrevious,
        };
        let account = prev_stored.sideband.account;
        if verified != SignatureState::Valid && !block.verify_signature(&account) {
            return ProcessResult::BadSignature;
        }
        let info = match fork.account_info(&account) {
            Some(info) => info,
            None => return ProcessResult::GapPrevious,
        };
        if info.head != previous {
            return ProcessResult::Fork;
        }
        // Chains never step back from state representation.
        if matches!(prev_stored.block, Block::State(_)) {
            return ProcessResult::BlockPosition;
        }

        let representative = self.representative_of(fork, &info);
        let now = unix_time();
        let mut new_info = info.clone();

        let new_balance = match block {
            Block::Send(b) => {
                if b.balance >= info.balance {
                    return ProcessResult::NegativeSpend;
                }
                let amount = info.balance.checked_sub(b.balance).expect("checked above");
                fork.store_pending(
                    &PendingKey::new(b.destination, *hash),
                    &PendingInfo {
                        source: account,
                        amount,
                        epoch: info.epoch,
                    },
                );
                Self::sub_weight(fork, &representative, amount);
                b.balance
            }
            Block::Receive(b) => {
                if !fork.contains_block(&b.source) {
                    return ProcessResult::GapSource;
                }
                let key = PendingKey::new(account, b.source);
                let pending = match fork.pending(&key) {
                    Some(pending) => pending,
                    None => return ProcessResult::Unreceivable,
                };
                if pending.epoch > info.epoch {
                    return ProcessResult::Unreceivable;
                }
                fork.remove_pending(&key);
                let balance = match info.balance.checked_add(pending.amount) {
                    Some(balance) => balance,
                    None => return ProcessResult::Other,
                };
                Self::add_weight(fork, &representative, pending.amount);
                balance
            }
            Block::Change(b) => {
                Self::sub_weight(fork, &representative, info.balance);
                Self::add_weight(fork, &b.representative, info.balance);
                new_info.representative_block = *hash;
                info.balance
            }
            _ => unreachable!("legacy dispatch"),
        };

        fork.store_block(
            hash,
            &StoredBlock {
                block: block.clone(),
                sideband: Sideband {
                    account,
                    height: info.block_count + 1,
                    timestamp: now,
                    successor: Hash::zero(),
                    balance: new_balance,
                },
            },
        );
        fork.set_successor(&previous, *hash);
        new_info.head = *hash;
        new_info.balance = new_balance;
        new_info.modified = now;
        new_info.block_count = info.block_count + 1;
        fork.store_account_info(&account, &new_info);
        ProcessResult::Progress
    }

    fn process_open<F: DbFork>(
        &self,
        fork: &mut F,
        block: &Block,
        hash: &Hash,
        verified: SignatureState,
    ) -> ProcessResult {
        let b = match block {
            Block::Open(b) => b,
            _ => unreachable!("open dispatch"),
        };
        if verified != SignatureState::Valid && !block.verify_signature(&b.account) {
            return ProcessResult::BadSignature;
        }
        if fork.account_info(&b.account).is_some() {
            return ProcessResult::Fork;
        }
        if !fork.contains_block(&b.source) {
            return ProcessResult::GapSource;
        }
        let key = PendingKey::new(b.account, b.source);
        let pending = match fork.pending(&key) {
            Some(pending) => pending,
            None => return ProcessResult::Unreceivable,
        };
        if pending.epoch > 0 {
            // Post-upgrade sends may only be received by state blocks.
            return ProcessResult::Unreceivable;
        }
        fork.remove_pending(&key);
        let now = unix_time();
        fork.store_block(
            hash,
            &StoredBlock {
                block: block.clone(),
                sideband: Sideband {
                    account: b.account,
                    height: 1,
                    timestamp: now,
                    successor: Hash::zero(),
                    balance: pending.amount,
                },
            },
        );
        fork.store_account_info(
            &b.account,
            &AccountInfo {
                head: *hash,
                open_block: *hash,
                representative_block: *hash,
                balance: pending.amount,
                modified: now,
                block_count: 1,
                epoch: 0,
            },
        );
        Self::add_weight(fork, &b.representative, pending.amount);
        ProcessResult::Progress
    }

    fn process_state<F: DbFork>(
        &self,
        fork: &mut F,
        block: &Block,
        hash: &Hash,
        verified: SignatureState,
    ) -> ProcessResult {
        let b = match block {
            Block::State(b) => b,
            _ => unreachable!("state dispatch"),
        };
        let is_epoch_link = b.link.as_hash() == self.network.epoch_link.as_hash();
        let signature_ok = verified == SignatureState::Valid
            || block.verify_signature(&b.account)
            || (is_epoch_link && block.verify_signature(&self.network.epoch_signer));
        if !signature_ok {
            return ProcessResult::BadSignature;
        }

        let info = fork.account_info(&b.account);
        let now = unix_time();

        if b.previous.is_zero() {
            // Subtype: open (by receive or by epoch).
            if info.is_some() {
                return ProcessResult::Fork;
            }
            let (balance, epoch) = if is_epoch_link {
                if !b.balance.is_zero() {
                    return ProcessResult::BalanceMismatch;
                }
                (Amount::zero(), 1)
            } else {
                if b.link.is_zero() || b.balance.is_zero() {
                    return ProcessResult::BalanceMismatch;
                }
                let source = b.link.as_hash();
                if !fork.contains_block(&source) {
                    return ProcessResult::GapSource;
                }
                let key = PendingKey::new(b.account, source);
                let pending = match fork.pending(&key) {
                    Some(pending) => pending,
                    None => return ProcessResult::Unreceivable,
                };
                if b.balance != pending.amount {
                    return ProcessResult::BalanceMismatch;
                }
                fork.remove_pending(&key);
                (pending.amount, pending.epoch)
            };
            fork.store_block(
                hash,
                &StoredBlock {
                    block: block.clone(),
                    sideband: Sideband {
                        account: b.account,
                        height: 1,
                        timestamp: now,
                        successor: Hash::zero(),
                        balance,
                    },
                },
            );
            fork.store_account_info(
                &b.account,
                &AccountInfo {
                    head: *hash,
                    open_block: *hash,
                    representative_block: *hash,
                    balance,
                    modified: now,
                    block_count: 1,
                    epoch,
                },
            );
            Self::add_weight(fork, &b.representative, balance);
            return ProcessResult::Progress;
        }

        // Subtype: send, receive, change or epoch on an existing chain.
        let info = match info {
            Some(info) => info,
            None => return ProcessResult::GapPrevious,
        };
        if !fork.contains_block(&b.previous) {
            return ProcessResult::GapPrevious;
        }
        if info.head != b.previous {
            return ProcessResult::Fork;
        }
        let old_representative = self.representative_of(fork, &info);
        let mut epoch = info.epoch;

        if is_epoch_link {
            if b.balance != info.balance {
                return ProcessResult::BalanceMismatch;
            }
            if b.representative != old_representative {
                return ProcessResult::Other;
            }
            if info.epoch >= 1 {
                return ProcessResult::BlockPosition;
            }
            epoch = info.epoch + 1;
        } else if b.balance < info.balance {
            // Send subtype.
            let amount = info.balance.checked_sub(b.balance).expect("checked above");
            fork.store_pending(
                &PendingKey::new(b.link.as_account(), *hash),
                &PendingInfo {
                    source: b.account,
                    amount,
                    epoch,
                },
            );
        } else if b.balance > info.balance {
            // Receive subtype.
            if b.link.is_zero() {
                return ProcessResult::BalanceMismatch;
            }
            let source = b.link.as_hash();
            if !fork.contains_block(&source) {
                return ProcessResult::GapSource;
            }
            let key = PendingKey::new(b.account, source);
            let pending = match fork.pending(&key) {
                Some(pending) => pending,
                None => return ProcessResult::Unreceivable,
            };
            let amount = b.balance.checked_sub(info.balance).expect("checked above");
            if amount != pending.amount {
                return ProcessResult::BalanceMismatch;
            }
            if pending.epoch > epoch {
                return ProcessResult::Unreceivable;
            }
            fork.remove_pending(&key);
        } else {
            // Change subtype: a no-delta block must not carry a link.
            if !b.link.is_zero() {
                return ProcessResult::BalanceMismatch;
            }
        }

        // Representation moves wholesale: the old representative loses the
        // old balance, the stated one gains the new balance.
        Self::sub_weight(fork, &old_representative, info.balance);
        Self::add_weight(fork, &b.representative, b.balance);

        fork.store_block(
            hash,
            &StoredBlock {
                block: block.clone(),
                sideband: Sideband {
                    account: b.account,
                    height: info.block_count + 1,
                    timestamp: now,
                    successor: Hash::zero(),
                    balance: b.balance,
                },
            },
        );
        fork.set_successor(&b.previous, *hash);
        let representative_block = if b.representative != old_representative {
            *hash
        } else {
            info.representative_block
        };
        fork.store_account_info(
            &b.account,
            &AccountInfo {
                head: *hash,
                open_block: info.open_block,
                representative_block,
                balance: b.balance,
                modified: now,
                block_count: info.block_count + 1,
                epoch,
            },
        );
        ProcessResult::Progress
    }

    /// Roll back `hash` and everything above it on its account chain.
    /// Dependent receives on other chains are rolled back first. Returns the
    /// removed blocks, newest first.
    pub fn rollback<F: DbFork>(
        &self,
        fork: &mut F,
        hash: &Hash,
        max_depth: u64,
    ) -> Result<Vec<Block>> {
        let mut rolled = Vec::new();
        let mut budget = max_depth;
        self.rollback_to(fork, hash, &mut budget, &mut rolled)?;
        Ok(rolled)
    }

    fn rollback_to<F: DbFork>(
        &self,
        fork: &mut F,
        hash: &Hash,
        budget: &mut u64,
        rolled: &mut Vec<Block>,
    ) -> Result<()> {
        let account = match fork.block(hash) {
            Some(stored) => stored.sideband.account,
            None => return Err(Error::new(ErrorKind::ResourceNotFound)),
        };
        loop {
            let info = match fork.account_info(&account) {
                Some(info) => info,
                None => return Ok(()), // chain fully unwound by recursion
            };
            let head = info.head;
            self.rollback_one(fork, &head, &info, budget, rolled)?;
            if head == *hash {
                return Ok(());
            }
        }
    }

    fn rollback_one<F: DbFork>(
        &self,
        fork: &mut F,
        hash: &Hash,
        info: &AccountInfo,
        budget: &mut u64,
        rolled: &mut Vec<Block>,
    ) -> Result<()> {
        if *budget == 0 {
            return Err(Error::new_ext(
                ErrorKind::CapacityReached,
                "rollback depth limit",
            ));
        }
        *budget -= 1;

        let stored = fork
            .block(hash)
            .ok_or_else(|| Error::new(ErrorKind::ResourceNotFound))?;
        let account = stored.sideband.account;
        let previous = stored.block.previous();
        let prev_balance = if previous.is_zero() {
            Amount::zero()
        } else {
            fork.block(&previous)
                .map(|s| s.sideband.balance)
                .ok_or_else(|| Error::new(ErrorKind::StoreFault))?
        };

        match &stored.block {
            Block::Send(b) => {
                let amount = prev_balance
                    .checked_sub(b.balance)
                    .ok_or_else(|| Error::new(ErrorKind::StoreFault))?;
                self.undo_send(fork, hash, &b.destination, budget, rolled)?;
                let representative = self.representative_at(fork, previous);
                Self::add_weight(fork, &representative, amount);
            }
            Block::Receive(b) => {
                let amount = stored
                    .sideband
                    .balance
                    .checked_sub(prev_balance)
                    .ok_or_else(|| Error::new(ErrorKind::StoreFault))?;
                let representative = self.representative_at(fork, previous);
                Self::sub_weight(fork, &representative, amount);
                self.restore_pending(fork, &account, &b.source, amount);
            }
            Block::Open(b) => {
                let representative = b.representative;
                Self::sub_weight(fork, &representative, stored.sideband.balance);
                self.restore_pending(fork, &account, &b.source, stored.sideband.balance);
            }
            Block::Change(b) => {
                Self::sub_weight(fork, &b.representative, info.balance);
                let restored = self.representative_at(fork, previous);
                Self::add_weight(fork, &restored, info.balance);
            }
            Block::State(b) => {
                if b.balance < prev_balance {
                    // Send subtype: the pending entry (or its receiver) goes.
                    self.undo_send(fork, hash, &b.link.as_account(), budget, rolled)?;
                }
                if b.balance > prev_balance {
                    let amount = b.balance.checked_sub(prev_balance).expect("ordered");
                    if b.link.as_hash() != self.network.epoch_link.as_hash()
                        && !b.link.is_zero()
                    {
                        self.restore_pending(fork, &account, &b.link.as_hash(), amount);
                    }
                }
                Self::sub_weight(fork, &b.representative, b.balance);
                if !previous.is_zero() {
                    let restored = self.representative_at(fork, previous);
                    Self::add_weight(fork, &restored, prev_balance);
                }
            }
        }

        // Drop the block and retarget the account head.
        fork.remove_block(hash);
        if previous.is_zero() {
            fork.remove_account_info(&account);
        } else {
            fork.set_successor(&previous, Hash::zero());
            let epoch = match &stored.block {
                Block::State(b)
                    if b.link.as_hash() == self.network.epoch_link.as_hash()
                        && info.epoch > 0 =>
                {
                    info.epoch - 1
                }
                _ => info.epoch,
            };
            fork.store_account_info(
                &account,
                &AccountInfo {
                    head: previous,
                    open_block: info.open_block,
                    representative_block: self.rep_block_at(fork, previous),
                    balance: prev_balance,
                    modified: unix_time(),
                    block_count: info.block_count.saturating_sub(1),
                    epoch,
                },
            );
        }
        rolled.push(stored.block);
        Ok(())
    }

    /// Undo the pending entry of a send, rolling back its receiver first
    /// when the entry has already been consumed.
    fn undo_send<F: DbFork>(
        &self,
        fork: &mut F,
        send_hash: &Hash,
        destination: &Account,
        budget: &mut u64,
        rolled: &mut Vec<Block>,
    ) -> Result<()> {
        let key = PendingKey::new(*destination, *send_hash);
        if fork.pending(&key).is_some() {
            fork.remove_pending(&key);
            return Ok(());
        }
        let receiver = self
            .find_receiver(fork, destination, send_hash)
            .ok_or_else(|| Error::new(ErrorKind::StoreFault))?;
        self.rollback_to(fork, &receiver, budget, rolled)?;
        let still = PendingKey::new(*destination, *send_hash);
        fork.remove_pending(&still);
        Ok(())
    }

    /// Locate the block on `destination`'s chain that consumed `send_hash`.
    fn find_receiver<F: DbFork>(
        &self,
        fork: &F,
        destination: &Account,
        send_hash: &Hash,
    ) -> Option<Hash> {
        let info = fork.account_info(destination)?;
        let mut cursor = info.head;
        while !cursor.is_zero() {
            let stored = fork.block(&cursor)?;
            let consumed = match &stored.block {
                Block::Receive(b) => b.source == *send_hash,
                Block::Open(b) => b.source == *send_hash,
                Block::State(b) => b.link.as_hash() == *send_hash,
                _ => false,
            };
            if consumed {
                return Some(cursor);
            }
            cursor = stored.block.previous();
        }
        None
    }

    fn rep_block_at<F: DbFork>(&self, fork: &F, mut hash: Hash) -> Hash {
        while let Some(stored) = fork.block(&hash) {
            match stored.block {
                Block::Open(_) | Block::Change(_) | Block::State(_) => return hash,
                other => hash = other.previous(),
            }
        }
        hash
    }

    fn restore_pending<F: DbFork>(
        &self,
        fork: &mut F,
        account: &Account,
        source: &Hash,
        amount: Amount,
    ) {
        let source_account = fork
            .block(source)
            .map(|s| s.sideband.account)
            .unwrap_or_default();
        let epoch = fork
            .account_info(&source_account)
            .map(|i| i.epoch)
            .unwrap_or_default();
        fork.store_pending(
            &PendingKey::new(*account, *source),
            &PendingInfo {
                source: source_account,
                amount,
                epoch,
            },
        );
    }

    /// Balance carried at `hash`, straight from the sideband.
    pub fn balance_of<F: DbFork>(&self, fork: &F, hash: &Hash) -> Option<Amount> {
        fork.block(hash).map(|stored| stored.sideband.balance)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::base::schema::{
        ChangeBlock, Link, OpenBlock, ReceiveBlock, SendBlock, StateBlock,
    };
    use crate::crypto::{KeyPair, Signature};
    use crate::db::{rocks::Store, Db};
    use merkledb::TemporaryDB;

    pub struct Ctx {
        pub network: Arc<Network>,
        pub ledger: Ledger,
        pub store: Store<TemporaryDB>,
        pub genesis_key: KeyPair,
    }

    /// Test network genesis keypair; mirrors `Network::test`.
    pub fn genesis_keypair() -> KeyPair {
        KeyPair::from_seed(&[0x42; 32])
    }

    pub fn make_ctx() -> Ctx {
        let network = Network::test();
        let ledger = Ledger::new(network.clone());
        let mut store = Store::temporary();
        let mut fork = store.fork_create();
        ledger.seed_genesis(&mut fork);
        store.fork_merge(fork).unwrap();
        Ctx {
            network,
            ledger,
            store,
            genesis_key: genesis_keypair(),
        }
    }

    pub fn solve_work(network: &Network, block: &mut Block) {
        let root = block.work_root();
        let mut nonce = 0;
        while !work_valid(&root, nonce, network.work_threshold) {
            nonce += 1;
        }
        block.set_work(nonce);
    }

    pub fn send_block(
        ctx: &Ctx,
        keypair: &KeyPair,
        previous: Hash,
        balance: u128,
        destination: Account,
    ) -> Block {
        let mut block = Block::Send(SendBlock {
            previous,
            destination,
            balance: Amount(balance),
            signature: Signature::zero(),
            work: 0,
        });
        block.sign(keypair);
        solve_work(&ctx.network, &mut block);
        block
    }

    pub fn open_block(ctx: &Ctx, keypair: &KeyPair, source: Hash, representative: Account) -> Block {
        let mut block = Block::Open(OpenBlock {
            source,
            representative,
            account: Account::from(keypair.public_key()),
            signature: Signature::zero(),
            work: 0,
        });
        block.sign(keypair);
        solve_work(&ctx.network, &mut block);
        block
    }

    pub fn receive_block(ctx: &Ctx, keypair: &KeyPair, previous: Hash, source: Hash) -> Block {
        let mut block = Block::Receive(ReceiveBlock {
            previous,
            source,
            signature: Signature::zero(),
            work: 0,
        });
        block.sign(keypair);
        solve_work(&ctx.network, &mut block);
        block
    }

    pub fn change_block(ctx: &Ctx, keypair: &KeyPair, previous: Hash, representative: Account) -> Block {
        let mut block = Block::Change(ChangeBlock {
            previous,
            representative,
            signature: Signature::zero(),
            work: 0,
        });
        block.sign(keypair);
        solve_work(&ctx.network, &mut block);
        block
    }

    #[allow(clippy::too_many_arguments)]
    pub fn state_block(
        ctx: &Ctx,
        keypair: &KeyPair,
        previous: Hash,
        representative: Account,
        balance: u128,
        link: Link,
    ) -> Block {
        let mut block = Block::State(StateBlock {
            account: Account::from(keypair.public_key()),
            previous,
            representative,
            balance: Amount(balance),
            link,
            signature: Signature::zero(),
            work: 0,
        });
        block.sign(keypair);
        solve_work(&ctx.network, &mut block);
        block
    }

    pub fn apply(ctx: &mut Ctx, block: &Block) -> ProcessResult {
        let mut fork = ctx.store.fork_create();
        let result = ctx
            .ledger
            .process(&mut fork, block, SignatureState::Unknown);
        ctx.store.fork_merge(fork).unwrap();
        result
    }

    fn genesis_account(ctx: &Ctx) -> Account {
        ctx.network.genesis_account
    }

    /// Conservation invariant: balances plus pendings equal total issuance,
    /// and representation matches the balance distribution.
    fn assert_conservation(ctx: &Ctx) {
        let accounts = ctx.store.frontier_range(&Account::zero(), usize::MAX);
        let balances: u128 = accounts.iter().map(|(_, i)| i.balance.0).sum();
        let start = PendingKey::new(Account::zero(), Hash::zero());
        let pendings: u128 = ctx
            .store
            .pending_range(&start, usize::MAX)
            .iter()
            .map(|(_, p)| p.amount.0)
            .sum();
        assert_eq!(balances + pendings, ctx.network.genesis_amount().0);

        let representation: u128 = ctx
            .store
            .representation(usize::MAX)
            .iter()
            .map(|(_, w)| w.0)
            .sum();
        assert_eq!(representation, balances);
    }

    #[test]
    fn genesis_seeding() {
        let ctx = make_ctx();
        let account = genesis_account(&ctx);

        let info = ctx.store.account_info(&account).unwrap();
        assert_eq!(info.head, ctx.network.genesis_hash());
        assert_eq!(info.balance, Amount::MAX);
        assert_eq!(info.block_count, 1);
        assert_eq!(ctx.store.weight(&account), Amount::MAX);
        assert_conservation(&ctx);
    }

    #[test]
    fn send_and_receive() {
        let mut ctx = make_ctx();
        let genesis = genesis_account(&ctx);
        let key2 = KeyPair::from_seed(&[2; 32]);
        let dest = Account::from(key2.public_key());

        // Scenario: genesis sends 50, the new account opens with it.
        let send = send_block(
            &ctx,
            &genesis_keypair(),
            ctx.network.genesis_hash(),
            u128::MAX - 50,
            dest,
        );
        assert_eq!(apply(&mut ctx, &send), ProcessResult::Progress);

        let info = ctx.store.account_info(&genesis).unwrap();
        assert_eq!(info.balance, Amount(u128::MAX - 50));
        assert_eq!(info.head, send.hash());
        let pending = ctx
            .store
            .pending(&PendingKey::new(dest, send.hash()))
            .unwrap();
        assert_eq!(pending.amount, Amount(50));
        assert_conservation(&ctx);

        let open = open_block(&ctx, &key2, send.hash(), dest);
        assert_eq!(apply(&mut ctx, &open), ProcessResult::Progress);

        let info = ctx.store.account_info(&dest).unwrap();
        assert_eq!(info.balance, Amount(50));
        assert_eq!(info.block_count, 1);
        assert!(ctx.store.pending(&PendingKey::new(dest, send.hash())).is_none());
        assert_eq!(ctx.store.weight(&dest), Amount(50));
        assert_conservation(&ctx);
    }

    #[test]
    fn idempotent_application() {
        let mut ctx = make_ctx();
        let dest = Account::from(KeyPair::from_seed(&[2; 32]).public_key());
        let send = send_block(
            &ctx,
            &genesis_keypair(),
            ctx.network.genesis_hash(),
            u128::MAX - 1,
            dest,
        );

        assert_eq!(apply(&mut ctx, &send), ProcessResult::Progress);
        assert_eq!(apply(&mut ctx, &send), ProcessResult::Old);
    }

    #[test]
    fn successor_chain_links() {
        let mut ctx = make_ctx();
        let dest = Account::from(KeyPair::from_seed(&[2; 32]).public_key());
        let send = send_block(
            &ctx,
            &genesis_keypair(),
            ctx.network.genesis_hash(),
            u128::MAX - 1,
            dest,
        );
        apply(&mut ctx, &send);

        let genesis_stored = ctx.store.block(&ctx.network.genesis_hash()).unwrap();
        assert_eq!(genesis_stored.sideband.successor, send.hash());
        let send_stored = ctx.store.block(&send.hash()).unwrap();
        assert_eq!(send_stored.sideband.successor, Hash::zero());
        assert_eq!(send_stored.sideband.height, 2);
    }

    #[test]
    fn gap_previous() {
        let mut ctx = make_ctx();
        let dest = Account::from(KeyPair::from_seed(&[2; 32]).public_key());
        let send = send_block(
            &ctx,
            &genesis_keypair(),
            Hash::new([0xaa; 32]),
            u128::MAX - 1,
            dest,
        );

        assert_eq!(apply(&mut ctx, &send), ProcessResult::GapPrevious);
    }

    #[test]
    fn gap_source_then_unreceivable() {
        let mut ctx = make_ctx();
        let key2 = KeyPair::from_seed(&[2; 32]);

        // Open names a source we do not hold.
        let open = open_block(&ctx, &key2, Hash::new([0xbb; 32]), Account::zero());
        assert_eq!(apply(&mut ctx, &open), ProcessResult::GapSource);

        // Source exists but is not destined to this account.
        let other = Account::from(KeyPair::from_seed(&[3; 32]).public_key());
        let send = send_block(
            &ctx,
            &genesis_keypair(),
            ctx.network.genesis_hash(),
            u128::MAX - 9,
            other,
        );
        apply(&mut ctx, &send);
        let open = open_block(&ctx, &key2, send.hash(), Account::zero());
        assert_eq!(apply(&mut ctx, &open), ProcessResult::Unreceivable);
    }

    #[test]
    fn bad_signature() {
        let mut ctx = make_ctx();
        let dest = Account::from(KeyPair::from_seed(&[2; 32]).public_key());
        let mut send = send_block(
            &ctx,
            &genesis_keypair(),
            ctx.network.genesis_hash(),
            u128::MAX - 1,
            dest,
        );
        send.set_signature(Signature::from_bytes(&[1; 64]).unwrap());
        solve_work(&ctx.network, &mut send);

        assert_eq!(apply(&mut ctx, &send), ProcessResult::BadSignature);
    }

    #[test]
    fn work_low() {
        let mut ctx = make_ctx();
        let dest = Account::from(KeyPair::from_seed(&[2; 32]).public_key());
        let mut send = send_block(
            &ctx,
            &genesis_keypair(),
            ctx.network.genesis_hash(),
            u128::MAX - 1,
            dest,
        );
        // Find a nonce that fails the threshold.
        let root = send.work_root();
        let mut nonce = 0;
        while work_valid(&root, nonce, ctx.network.work_threshold) {
            nonce += 1;
        }
        send.set_work(nonce);

        assert_eq!(apply(&mut ctx, &send), ProcessResult::WorkLow);
    }

    #[test]
    fn negative_spend() {
        let mut ctx = make_ctx();
        let dest = Account::from(KeyPair::from_seed(&[2; 32]).public_key());
        let send = send_block(
            &ctx,
            &genesis_keypair(),
            ctx.network.genesis_hash(),
            u128::MAX, // no decrease
            dest,
        );

        assert_eq!(apply(&mut ctx, &send), ProcessResult::NegativeSpend);
    }

    #[test]
    fn fork_detection() {
        let mut ctx = make_ctx();
        let dest1 = Account::from(KeyPair::from_seed(&[2; 32]).public_key());
        let dest2 = Account::from(KeyPair::from_seed(&[3; 32]).public_key());
        let b1 = send_block(
            &ctx,
            &genesis_keypair(),
            ctx.network.genesis_hash(),
            u128::MAX - 1,
            dest1,
        );
        let b2 = send_block(
            &ctx,
            &genesis_keypair(),
            ctx.network.genesis_hash(),
            u128::MAX - 2,
            dest2,
        );

        assert_eq!(apply(&mut ctx, &b1), ProcessResult::Progress);
        assert_eq!(apply(&mut ctx, &b2), ProcessResult::Fork);
    }

    #[test]
    fn change_moves_weight() {
        let mut ctx = make_ctx();
        let genesis = genesis_account(&ctx);
        let rep = Account::from(KeyPair::from_seed(&[7; 32]).public_key());

        let change = change_block(&ctx, &genesis_keypair(), ctx.network.genesis_hash(), rep);
        assert_eq!(apply(&mut ctx, &change), ProcessResult::Progress);

        assert_eq!(ctx.store.weight(&genesis), Amount::zero());
        assert_eq!(ctx.store.weight(&rep), Amount::MAX);
        let info = ctx.store.account_info(&genesis).unwrap();
        assert_eq!(info.representative_block, change.hash());
        assert_eq!(info.balance, Amount::MAX);
        assert_conservation(&ctx);
    }

    #[test]
    fn state_chain_full_cycle() {
        let mut ctx = make_ctx();
        let genesis = genesis_account(&ctx);
        let key2 = KeyPair::from_seed(&[2; 32]);
        let dest = Account::from(key2.public_key());

        // State send from genesis.
        let send = state_block(
            &ctx,
            &genesis_keypair(),
            ctx.network.genesis_hash(),
            genesis,
            u128::MAX - 100,
            Link::from(dest),
        );
        assert_eq!(apply(&mut ctx, &send), ProcessResult::Progress);
        assert_conservation(&ctx);

        // State open on the destination.
        let open = state_block(&ctx, &key2, Hash::zero(), dest, 100, Link::from(send.hash()));
        assert_eq!(apply(&mut ctx, &open), ProcessResult::Progress);
        assert_eq!(ctx.store.account_info(&dest).unwrap().balance, Amount(100));
        assert_eq!(ctx.store.weight(&dest), Amount(100));
        assert_conservation(&ctx);

        // State send back, state receive on genesis.
        let send_back = state_block(&ctx, &key2, open.hash(), dest, 60, Link::from(genesis));
        assert_eq!(apply(&mut ctx, &send_back), ProcessResult::Progress);
        let receive = state_block(
            &ctx,
            &genesis_keypair(),
            send.hash(),
            genesis,
            u128::MAX - 60,
            Link::from(send_back.hash()),
        );
        assert_eq!(apply(&mut ctx, &receive), ProcessResult::Progress);
        assert_conservation(&ctx);

        // State change on the destination.
        let rep = Account::from(KeyPair::from_seed(&[9; 32]).public_key());
        let change = state_block(&ctx, &key2, send_back.hash(), rep, 60, Link::zero());
        assert_eq!(apply(&mut ctx, &change), ProcessResult::Progress);
        assert_eq!(ctx.store.weight(&rep), Amount(60));
        assert_eq!(ctx.store.weight(&dest), Amount::zero());
        assert_conservation(&ctx);
    }

    #[test]
    fn state_receive_balance_mismatch() {
        let mut ctx = make_ctx();
        let genesis = genesis_account(&ctx);
        let key2 = KeyPair::from_seed(&[2; 32]);
        let dest = Account::from(key2.public_key());
        let send = state_block(
            &ctx,
            &genesis_keypair(),
            ctx.network.genesis_hash(),
            genesis,
            u128::MAX - 100,
            Link::from(dest),
        );
        apply(&mut ctx, &send);

        // Open claiming the wrong amount.
        let open = state_block(&ctx, &key2, Hash::zero(), dest, 99, Link::from(send.hash()));

        assert_eq!(apply(&mut ctx, &open), ProcessResult::BalanceMismatch);
    }

    #[test]
    fn epoch_upgrade() {
        let mut ctx = make_ctx();
        let genesis = genesis_account(&ctx);
        let epoch_link = ctx.network.epoch_link;

        let epoch = state_block(
            &ctx,
            &genesis_keypair(),
            ctx.network.genesis_hash(),
            genesis,
            u128::MAX,
            epoch_link,
        );
        assert_eq!(apply(&mut ctx, &epoch), ProcessResult::Progress);

        let info = ctx.store.account_info(&genesis).unwrap();
        assert_eq!(info.epoch, 1);
        assert_eq!(info.balance, Amount::MAX);
        assert_conservation(&ctx);

        // A second bump is refused.
        let again = state_block(&ctx, &genesis_keypair(), epoch.hash(), genesis, u128::MAX, epoch_link);
        assert_eq!(apply(&mut ctx, &again), ProcessResult::BlockPosition);
    }

    #[test]
    fn epoch_upgrade_must_not_move_value() {
        let mut ctx = make_ctx();
        let genesis = genesis_account(&ctx);

        let epoch = state_block(
            &ctx,
            &genesis_keypair(),
            ctx.network.genesis_hash(),
            genesis,
            u128::MAX - 5,
            ctx.network.epoch_link,
        );

        assert_eq!(apply(&mut ctx, &epoch), ProcessResult::BalanceMismatch);
    }

    #[test]
    fn legacy_after_state_is_position_error() {
        let mut ctx = make_ctx();
        let genesis = genesis_account(&ctx);
        let dest = Account::from(KeyPair::from_seed(&[2; 32]).public_key());
        let state = state_block(
            &ctx,
            &genesis_keypair(),
            ctx.network.genesis_hash(),
            genesis,
            u128::MAX - 1,
            Link::from(dest),
        );
        apply(&mut ctx, &state);

        let legacy = send_block(&ctx, &genesis_keypair(), state.hash(), u128::MAX - 2, dest);

        assert_eq!(apply(&mut ctx, &legacy), ProcessResult::BlockPosition);
    }

    #[test]
    fn rollback_send_restores_balance_and_pending() {
        let mut ctx = make_ctx();
        let genesis = genesis_account(&ctx);
        let dest = Account::from(KeyPair::from_seed(&[2; 32]).public_key());
        let send = send_block(
            &ctx,
            &genesis_keypair(),
            ctx.network.genesis_hash(),
            u128::MAX - 50,
            dest,
        );
        apply(&mut ctx, &send);

        let mut fork = ctx.store.fork_create();
        let rolled = ctx.ledger.rollback(&mut fork, &send.hash(), 128).unwrap();
        ctx.store.fork_merge(fork).unwrap();

        assert_eq!(rolled.len(), 1);
        let info = ctx.store.account_info(&genesis).unwrap();
        assert_eq!(info.balance, Amount::MAX);
        assert_eq!(info.head, ctx.network.genesis_hash());
        assert_eq!(info.block_count, 1);
        assert!(ctx.store.pending(&PendingKey::new(dest, send.hash())).is_none());
        assert!(!ctx.store.contains_block(&send.hash()));
        assert_eq!(ctx.store.weight(&genesis), Amount::MAX);
        assert_conservation(&ctx);
    }

    #[test]
    fn rollback_recurses_into_receiver() {
        let mut ctx = make_ctx();
        let genesis = genesis_account(&ctx);
        let key2 = KeyPair::from_seed(&[2; 32]);
        let dest = Account::from(key2.public_key());
        let send = send_block(
            &ctx,
            &genesis_keypair(),
            ctx.network.genesis_hash(),
            u128::MAX - 50,
            dest,
        );
        apply(&mut ctx, &send);
        let open = open_block(&ctx, &key2, send.hash(), dest);
        apply(&mut ctx, &open);

        // Rolling back the send must unwind the destination's open first.
        let mut fork = ctx.store.fork_create();
        let rolled = ctx.ledger.rollback(&mut fork, &send.hash(), 128).unwrap();
        ctx.store.fork_merge(fork).unwrap();

        assert_eq!(rolled.len(), 2);
        assert!(ctx.store.account_info(&dest).is_none());
        assert!(!ctx.store.contains_block(&open.hash()));
        assert!(!ctx.store.contains_block(&send.hash()));
        assert_eq!(ctx.store.account_info(&genesis).unwrap().balance, Amount::MAX);
        assert_eq!(ctx.store.weight(&dest), Amount::zero());
        assert_conservation(&ctx);
    }

    #[test]
    fn rollback_depth_cap() {
        let mut ctx = make_ctx();
        let dest = Account::from(KeyPair::from_seed(&[2; 32]).public_key());
        let mut previous = ctx.network.genesis_hash();
        let mut balance = u128::MAX;
        let mut first = None;
        for _ in 0..4 {
            balance -= 1;
            let send = send_block(&ctx, &genesis_keypair(), previous, balance, dest);
            apply(&mut ctx, &send);
            previous = send.hash();
            first.get_or_insert(send.hash());
        }

        let mut fork = ctx.store.fork_create();
        let err = ctx
            .ledger
            .rollback(&mut fork, &first.unwrap(), 2)
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::CapacityReached);
    }

    #[test]
    fn rollback_fork_switch() {
        // Scenario: two conflicting sends; the loser is rolled back and the
        // winner applied.
        let mut ctx = make_ctx();
        let genesis = genesis_account(&ctx);
        let dest1 = Account::from(KeyPair::from_seed(&[2; 32]).public_key());
        let dest2 = Account::from(KeyPair::from_seed(&[3; 32]).public_key());
        let b1 = send_block(
            &ctx,
            &genesis_keypair(),
            ctx.network.genesis_hash(),
            u128::MAX - 10,
            dest1,
        );
        let b2 = send_block(
            &ctx,
            &genesis_keypair(),
            ctx.network.genesis_hash(),
            u128::MAX - 20,
            dest2,
        );
        assert_eq!(apply(&mut ctx, &b1), ProcessResult::Progress);
        assert_eq!(apply(&mut ctx, &b2), ProcessResult::Fork);

        let mut fork = ctx.store.fork_create();
        ctx.ledger.rollback(&mut fork, &b1.hash(), 128).unwrap();
        let result = ctx.ledger.process(&mut fork, &b2, SignatureState::Unknown);
        ctx.store.fork_merge(fork).unwrap();

        assert_eq!(result, ProcessResult::Progress);
        assert_eq!(ctx.store.account_info(&genesis).unwrap().head, b2.hash());
        assert_conservation(&ctx);
    }
}
