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

//! Lazy bootstrap: walk the causal past of a tip hash, pulling each
//! missing dependency as it is discovered.

use super::{client::read_block, connect, BootstrapContext};
use crate::{
    base::{
        queue_set::QueueSet,
        schema::{Amount, Block},
    },
    crypto::{Hash, Hashable},
    db::Db,
    net::message::WireMessage,
    Result,
};
use futures::io::AsyncWriteExt;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

/// Walk state for one lazy attempt.
pub struct LazyWalk {
    /// Hashes waiting to be pulled.
    pending: QueueSet<Hash>,
    /// Hashes already seen this walk.
    known: HashSet<Hash>,
    /// Hashes already pulled; never requeued, even when an ancestor keeps
    /// naming them (open sources are account values, not blocks).
    requested: HashSet<Hash>,
    /// Balances of seen state blocks, to tell send links from source links.
    balances: HashMap<Hash, Amount>,
    /// Pulls that returned nothing.
    exhausted: usize,
    epoch_link: Hash,
}

impl LazyWalk {
    pub fn new(epoch_link: Hash) -> Self {
        LazyWalk {
            pending: QueueSet::new(),
            known: HashSet::new(),
            requested: HashSet::new(),
            balances: HashMap::new(),
            exhausted: 0,
            epoch_link,
        }
    }

    pub fn seed(&mut self, hash: Hash) {
        if !hash.is_zero() && !self.known.contains(&hash) && !self.requested.contains(&hash) {
            self.pending.push(hash);
        }
    }

    pub fn next(&mut self) -> Option<Hash> {
        let hash = self.pending.pop()?;
        self.requested.insert(hash);
        Some(hash)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Record one pulled block and queue the dependencies we lack.
    /// `have` answers "is this hash already in the ledger or this walk".
    pub fn observe<F: Fn(&Hash) -> bool>(&mut self, block: &Block, have: F) {
        let hash = block.hash();
        self.known.insert(hash);

        let mut deps: Vec<Hash> = Vec::with_capacity(2);
        let previous = block.previous();
        if !previous.is_zero() {
            deps.push(previous);
        }
        match block {
            Block::Receive(b) => deps.push(b.source),
            Block::Open(b) => deps.push(b.source),
            Block::State(b) => {
                self.balances.insert(hash, b.balance);
                let link = b.link.as_hash();
                if !link.is_zero() && link != self.epoch_link {
                    // A link below the previous balance is a destination
                    // account, not a block; skip it when we can tell.
                    let is_send = self
                        .balances
                        .get(&b.previous)
                        .map(|prev| b.balance < *prev)
                        .unwrap_or(false);
                    if !is_send {
                        deps.push(link);
                    }
                }
            }
            _ => {}
        }
        for dep in deps {
            if !self.known.contains(&dep) && !have(&dep) {
                self.seed(dep);
            }
        }
    }

    /// Count a pull that yielded no blocks; true once the walk should stop.
    pub fn mark_exhausted(&mut self, cap: usize) -> bool {
        self.exhausted += 1;
        self.exhausted > cap
    }
}

/// Run a lazy attempt rooted at `tip` against `peer`.
pub(crate) async fn run_lazy<D: Db>(
    ctx: &BootstrapContext<D>,
    peer: SocketAddr,
    tip: Hash,
) -> Result<u64> {
    let mut walk = LazyWalk::new(ctx.network.epoch_link.as_hash());
    walk.seed(tip);
    run_walk(ctx, peer, walk).await
}

/// Wallet variant: seed with the wallet accounts' frontiers and any
/// pending sends already known to be destined to them.
pub(crate) async fn run_wallet<D: Db>(
    ctx: &BootstrapContext<D>,
    peer: SocketAddr,
    accounts: Vec<crate::base::schema::Account>,
) -> Result<u64> {
    let mut walk = LazyWalk::new(ctx.network.epoch_link.as_hash());
    {
        let db = ctx.db.read();
        for account in accounts {
            if let Some(info) = db.account_info(&account) {
                walk.seed(info.head);
            }
            let start = crate::base::schema::PendingKey::new(account, Hash::zero());
            for (key, _) in db
                .pending_range(&start, 1024)
                .into_iter()
                .take_while(|(key, _)| key.account == account)
            {
                walk.seed(key.hash);
            }
        }
    }
    run_walk(ctx, peer, walk).await
}

async fn run_walk<D: Db>(
    ctx: &BootstrapContext<D>,
    peer: SocketAddr,
    mut walk: LazyWalk,
) -> Result<u64> {
    let timeout = ctx.config.tcp_io_timeout;
    let mut stream = connect(peer, timeout).await?;
    let mut total = 0_u64;

    while let Some(hash) = walk.next() {
        if ctx.db.read().contains_block(&hash) {
            continue;
        }
        let req = WireMessage::BulkPull {
            start: hash,
            end: Hash::zero(),
            count: Some(ctx.config.lazy_max_pull_count),
        };
        stream.write_all(&req.encode(&ctx.network)).await?;

        let mut pulled_here = 0_u64;
        while let Some(block) = read_block(&mut stream, timeout).await? {
            {
                let db = ctx.db.clone();
                walk.observe(&block, |dep| db.read().contains_block(dep));
            }
            super::client::enqueue_block(ctx, block).await?;
            pulled_here += 1;
            total += 1;
        }
        if pulled_here == 0 && walk.mark_exhausted(ctx.config.lazy_stopped_cap) {
            info!("lazy walk stopped after {} empty pulls", walk.exhausted);
            break;
        }
    }

    if let Ok(rx) = ctx.block_tx.send(crate::blockchain::Message::Flush).await {
        let _ = rx.recv().await;
    }
    debug!("lazy walk pulled {} blocks", total);
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::schema::{
        tests::test_keypair, Account, Link, OpenBlock, ReceiveBlock, SendBlock, StateBlock,
    };
    use crate::crypto::Signature;

    fn epoch_link() -> Hash {
        Hash::new([0xee; 32])
    }

    #[test]
    fn seed_and_dedup() {
        let mut walk = LazyWalk::new(epoch_link());

        walk.seed(Hash::new([1; 32]));
        walk.seed(Hash::new([1; 32]));
        walk.seed(Hash::zero());

        assert_eq!(walk.pending_len(), 1);
    }

    #[test]
    fn observe_expands_previous_and_source() {
        let mut walk = LazyWalk::new(epoch_link());
        let receive = Block::Receive(ReceiveBlock {
            previous: Hash::new([1; 32]),
            source: Hash::new([2; 32]),
            signature: Signature::zero(),
            work: 0,
        });

        walk.observe(&receive, |_| false);

        assert_eq!(walk.pending_len(), 2);
        assert!(walk.pending.contains(&Hash::new([1; 32])));
        assert!(walk.pending.contains(&Hash::new([2; 32])));
    }

    #[test]
    fn observe_skips_held_dependencies() {
        let mut walk = LazyWalk::new(epoch_link());
        let open = Block::Open(OpenBlock {
            source: Hash::new([2; 32]),
            representative: Account::zero(),
            account: Account::new([7; 32]),
            signature: Signature::zero(),
            work: 0,
        });

        // The ledger already holds the source.
        walk.observe(&open, |dep| *dep == Hash::new([2; 32]));

        assert_eq!(walk.pending_len(), 0);
    }

    #[test]
    fn state_send_link_not_followed() {
        let keypair = test_keypair(1);
        let account = Account::from(keypair.public_key());
        let mut walk = LazyWalk::new(epoch_link());

        // First block: balance 100.
        let first = Block::State(StateBlock {
            account,
            previous: Hash::new([1; 32]),
            representative: account,
            balance: Amount(100),
            link: Link::zero(),
            signature: Signature::zero(),
            work: 0,
        });
        walk.observe(&first, |_| true);

        // Second block: balance 40 < 100, so the link is a destination
        // account and must not be queued as a block.
        let second = Block::State(StateBlock {
            account,
            previous: first.hash(),
            representative: account,
            balance: Amount(40),
            link: Link(Hash::new([9; 32])),
            signature: Signature::zero(),
            work: 0,
        });
        walk.observe(&second, |dep| *dep == first.hash());

        assert!(!walk.pending.contains(&Hash::new([9; 32])));

        // Without balance context the link is followed conservatively.
        let third = Block::State(StateBlock {
            account,
            previous: Hash::new([5; 32]),
            representative: account,
            balance: Amount(90),
            link: Link(Hash::new([8; 32])),
            signature: Signature::zero(),
            work: 0,
        });
        walk.observe(&third, |dep| *dep == Hash::new([5; 32]));
        assert!(walk.pending.contains(&Hash::new([8; 32])));
    }

    #[test]
    fn epoch_link_never_followed() {
        let keypair = test_keypair(1);
        let account = Account::from(keypair.public_key());
        let mut walk = LazyWalk::new(epoch_link());
        let epoch = Block::State(StateBlock {
            account,
            previous: Hash::new([1; 32]),
            representative: account,
            balance: Amount(100),
            link: Link(epoch_link()),
            signature: Signature::zero(),
            work: 0,
        });

        walk.observe(&epoch, |dep| *dep == Hash::new([1; 32]));

        assert_eq!(walk.pending_len(), 0);
    }

    #[test]
    fn legacy_send_creates_no_link_dependency() {
        let mut walk = LazyWalk::new(epoch_link());
        let send = Block::Send(SendBlock {
            previous: Hash::new([1; 32]),
            destination: Account::new([9; 32]),
            balance: Amount(5),
            signature: Signature::zero(),
            work: 0,
        });

        walk.observe(&send, |_| false);

        assert_eq!(walk.pending_len(), 1);
        assert!(walk.pending.contains(&Hash::new([1; 32])));
    }

    #[test]
    fn exhaustion_threshold() {
        let mut walk = LazyWalk::new(epoch_link());

        assert!(!walk.mark_exhausted(2));
        assert!(!walk.mark_exhausted(2));
        assert!(walk.mark_exhausted(2));
    }
}
