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

//! The block processor: the node's single ledger writer.
//!
//! Inbound blocks queue up and drain in batches, each batch under one write
//! fork. Gap results land in the unchecked table; applying a block requeues
//! its unchecked dependents; fork results open elections. `Flush` gives
//! callers a happens-before edge over everything enqueued earlier.

use super::{
    dispatcher::Dispatcher,
    election::ActiveElections,
    ledger::{Ledger, ProcessResult},
    message::*,
    pubsub::{Event, PubSub},
    unchecked::Unchecked,
};
use crate::{
    base::{
        schema::{Account, Block, Root, SignatureState, UncheckedInfo, VoteInfo},
        unix_time, Mutex, RwLock,
    },
    config::NodeConfig,
    crypto::{Hash, Hashable},
    db::{Db, DbFork},
};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Blocks applied per write fork.
const BATCH_MAX: usize = 256;

/// Seconds between online-weight samples.
const ONLINE_SAMPLE_INTERVAL: u64 = 300;

struct QueueEntry {
    block: Block,
    hash: Hash,
    arrival: u64,
    verified: SignatureState,
}

/// Worker state. Owns the write side of the store for its whole lifetime.
pub struct BlockWorker<D: Db> {
    config: Arc<NodeConfig>,
    db: Arc<RwLock<D>>,
    ledger: Arc<Ledger>,
    unchecked: Unchecked,
    elections: Arc<Mutex<ActiveElections>>,
    online: Arc<Mutex<super::online_reps::OnlineReps>>,
    pubsub: Arc<Mutex<PubSub>>,
    dispatcher: Dispatcher<D>,
    rx_chan: BlockRequestReceiver,
    queue: VecDeque<QueueEntry>,
    queued_hashes: HashSet<Hash>,
    /// False while shedding load above the high-water mark.
    accepting: bool,
    flush_waiters: Vec<BlockResponseSender>,
    last_sample: u64,
    /// Entries shed by back-pressure.
    pub dropped: u64,
}

impl<D: Db> BlockWorker<D> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<NodeConfig>,
        db: Arc<RwLock<D>>,
        ledger: Arc<Ledger>,
        elections: Arc<Mutex<ActiveElections>>,
        online: Arc<Mutex<super::online_reps::OnlineReps>>,
        pubsub: Arc<Mutex<PubSub>>,
        dispatcher: Dispatcher<D>,
        rx_chan: BlockRequestReceiver,
    ) -> Self {
        let mut unchecked = Unchecked::new(config.unchecked_cap);
        unchecked.restore(&*db.read());
        BlockWorker {
            config,
            db,
            ledger,
            unchecked,
            elections,
            online,
            pubsub,
            dispatcher,
            rx_chan,
            queue: VecDeque::new(),
            queued_hashes: HashSet::new(),
            accepting: true,
            flush_waiters: Vec::new(),
            last_sample: unix_time(),
            dropped: 0,
        }
    }

    /// Worker task body. Stops on the `Stop` message or channel teardown.
    pub async fn run(&mut self) {
        loop {
            // Block for the first message only while idle.
            if self.queue.is_empty() {
                match self
                    .rx_chan
                    .recv_timeout(Duration::from_millis(250))
                    .await
                {
                    Ok((msg, res)) => {
                        if !self.handle_message(msg, res) {
                            break;
                        }
                    }
                    Err(crate::channel::ChannelError::RecvTimeout) => {}
                    Err(_) => break,
                }
            }
            // Drain whatever else is already buffered.
            let mut open = true;
            while let Ok((msg, res)) = self.rx_chan.try_recv() {
                if !self.handle_message(msg, res) {
                    open = false;
                    break;
                }
            }
            if !open {
                break;
            }

            if !self.queue.is_empty() {
                self.process_batch();
            }
            if self.queue.is_empty() {
                for waiter in self.flush_waiters.drain(..) {
                    let _ = waiter.send_sync(Message::Ack);
                }
            }
            self.maybe_sample_online();
        }
        debug!("block worker stopped");
    }

    /// Synchronous wrapper used by the service thread.
    pub fn run_sync(&mut self) {
        async_std::task::block_on(self.run());
    }

    fn handle_message(&mut self, msg: Message, res_chan: BlockResponseSender) -> bool {
        match msg {
            Message::Stop => {
                let _ = res_chan.send_sync(Message::Ack);
                return false;
            }
            Message::ProcessBlock {
                block,
                arrival,
                verified,
            } => {
                self.enqueue(block, arrival, verified);
                let _ = res_chan.send_sync(Message::Ack);
            }
            Message::Flush => {
                if self.queue.is_empty() {
                    let _ = res_chan.send_sync(Message::Ack);
                } else {
                    self.flush_waiters.push(res_chan);
                }
            }
            Message::Process { block, subtype } => {
                let reply = self.process_now(block, subtype);
                let _ = res_chan.send_sync(reply);
            }
            Message::ForkResolve { winner } => {
                self.resolve_fork(winner);
                let _ = res_chan.send_sync(Message::Ack);
            }
            Message::VoteObserved { vote } => {
                self.persist_vote(&vote);
                let _ = res_chan.send_sync(Message::Ack);
            }
            Message::Subscribe { id, events } => {
                self.pubsub.lock().subscribe(id, events, res_chan);
            }
            Message::Unsubscribe { id, events } => {
                self.pubsub.lock().unsubscribe(id, events);
                let _ = res_chan.send_sync(Message::Ack);
            }
            other => {
                // Read-only verbs run off the write path.
                let dispatcher = self.dispatcher.clone();
                async_std::task::spawn(async move {
                    let res = dispatcher.message_handler(other);
                    if let Err(_err) = res_chan.send(res).await {
                        debug!("blockchain response send error");
                    }
                });
            }
        }
        true
    }

    /// Queue admission with high/low-water back-pressure.
    fn enqueue(&mut self, block: Block, arrival: u64, verified: SignatureState) {
        if self.queue.len() >= self.config.queue_high_water {
            self.accepting = false;
        } else if self.queue.len() < self.config.queue_low_water {
            self.accepting = true;
        }
        if !self.accepting {
            self.dropped += 1;
            return;
        }
        let hash = block.hash();
        if !self.queued_hashes.insert(hash) {
            return;
        }
        let verified = match verified {
            // Blocks that state their account verify before the ledger
            // sees them; the rest resolve their account inside the ledger.
            SignatureState::Unknown => match block.account_field() {
                Some(account) => {
                    if block.verify_signature(&account) {
                        SignatureState::Valid
                    } else {
                        SignatureState::Invalid
                    }
                }
                None => SignatureState::Unknown,
            },
            state => state,
        };
        if verified == SignatureState::Invalid {
            self.queued_hashes.remove(&hash);
            debug!("dropping block {} with bad signature", hash);
            return;
        }
        self.queue.push_back(QueueEntry {
            block,
            hash,
            arrival,
            verified,
        });
    }

    /// Apply one synchronous `Process` request, bypassing the queue but not
    /// the single-writer discipline (we are the writer).
    fn process_now(&mut self, block: Block, subtype: Option<BlockSubtype>) -> Message {
        if let Some(err) = self.subtype_violation(&block, subtype) {
            return err;
        }
        let hash = block.hash();
        let mut applied = Vec::new();
        let mut forks = Vec::new();
        let result = {
            let db_arc = self.db.clone();
            let mut db = db_arc.write();
            let mut fork = db.fork_create();
            let result = self.apply_one(
                &mut fork,
                QueueEntry {
                    block,
                    hash,
                    arrival: unix_time(),
                    verified: SignatureState::Unknown,
                },
                &mut applied,
                &mut forks,
            );
            self.requeue_dependents(&mut fork, &applied);
            if let Err(err) = db.fork_merge(fork) {
                return Message::Exception(err);
            }
            result
        };
        self.after_batch(applied, forks);
        Message::ProcessResponse { hash, result }
    }

    fn subtype_violation(&self, block: &Block, subtype: Option<BlockSubtype>) -> Option<Message> {
        let subtype = subtype?;
        let db = self.db.read();
        let matches = match (subtype, block) {
            (BlockSubtype::Send, Block::Send(_)) => true,
            (BlockSubtype::Receive, Block::Receive(_)) => true,
            (BlockSubtype::Open, Block::Open(_)) => true,
            (BlockSubtype::Change, Block::Change(_)) => true,
            (BlockSubtype::Epoch, Block::State(b)) => {
                b.link.as_hash() == self.ledger.network().epoch_link.as_hash()
            }
            (sub, Block::State(b)) => {
                // Resolve the state subtype against the previous balance.
                let previous_balance = db
                    .block(&b.previous)
                    .map(|stored| stored.sideband.balance);
                match (sub, previous_balance) {
                    (BlockSubtype::Open, None) => b.previous.is_zero(),
                    (BlockSubtype::Send, Some(prev)) => b.balance < prev,
                    (BlockSubtype::Receive, Some(prev)) => b.balance > prev,
                    (BlockSubtype::Change, Some(prev)) => b.balance == prev,
                    _ => false,
                }
            }
            _ => false,
        };
        if matches {
            None
        } else {
            Some(Message::Exception(crate::Error::new_ext(
                crate::ErrorKind::MalformedData,
                "block subtype mismatch",
            )))
        }
    }

    /// Drain up to `BATCH_MAX` queued blocks into one write fork.
    fn process_batch(&mut self) {
        let mut applied = Vec::new();
        let mut forks = Vec::new();
        {
            let db_arc = self.db.clone();
            let mut db = db_arc.write();
            let mut fork = db.fork_create();
            for _ in 0..BATCH_MAX {
                let entry = match self.queue.pop_front() {
                    Some(entry) => entry,
                    None => break,
                };
                self.queued_hashes.remove(&entry.hash);
                self.apply_one(&mut fork, entry, &mut applied, &mut forks);
            }
            self.requeue_dependents(&mut fork, &applied);
            if let Err(err) = db.fork_merge(fork) {
                error!("batch commit failed: {}", err.to_string_full());
                return;
            }
        }
        self.after_batch(applied, forks);
    }

    fn apply_one<F: DbFork>(
        &mut self,
        fork: &mut F,
        entry: QueueEntry,
        applied: &mut Vec<(Hash, Block, Account, bool)>,
        forks: &mut Vec<Block>,
    ) -> ProcessResult {
        let QueueEntry {
            block,
            hash,
            arrival,
            verified,
        } = entry;
        let result = self.ledger.process(fork, &block, verified);
        match result {
            ProcessResult::Progress => {
                let account = fork
                    .block(&hash)
                    .map(|stored| stored.sideband.account)
                    .unwrap_or_default();
                let is_send = matches!(&block, Block::Send(_))
                    || matches!(&block, Block::State(_) if Self::state_is_send(fork, &block));
                trace!("applied {}", hash);
                applied.push((hash, block, account, is_send));
            }
            ProcessResult::GapPrevious => {
                let dependency = block.previous();
                self.unchecked.insert(
                    fork,
                    dependency,
                    UncheckedInfo {
                        block,
                        arrival,
                        verified,
                    },
                );
            }
            ProcessResult::GapSource => {
                let dependency = Self::source_dependency(&block).unwrap_or_default();
                self.unchecked.insert(
                    fork,
                    dependency,
                    UncheckedInfo {
                        block,
                        arrival,
                        verified,
                    },
                );
            }
            ProcessResult::Fork => {
                debug!("fork observed at {}", hash);
                forks.push(block);
            }
            ProcessResult::Old => {
                trace!("old block {}", hash);
            }
            other => {
                debug!("block {} rejected: {:?}", hash, other);
            }
        }
        result
    }

    fn state_is_send<F: DbFork>(fork: &F, block: &Block) -> bool {
        match block {
            Block::State(b) => fork
                .block(&b.previous)
                .map(|stored| b.balance < stored.sideband.balance)
                .unwrap_or(false),
            _ => false,
        }
    }

    fn source_dependency(block: &Block) -> Option<Hash> {
        match block {
            Block::Receive(b) => Some(b.source),
            Block::Open(b) => Some(b.source),
            Block::State(b) => Some(b.link.as_hash()),
            _ => None,
        }
    }

    /// Step 4 of the batch: unchecked dependents of applied hashes go back
    /// into the inbound queue.
    fn requeue_dependents<F: DbFork>(&mut self, fork: &mut F, applied: &[(Hash, Block, Account, bool)]) {
        for (hash, _, _, _) in applied {
            for info in self.unchecked.drain_for(fork, hash) {
                trace!("requeueing dependent of {}", hash);
                self.enqueue(info.block, info.arrival, info.verified);
            }
        }
    }

    /// Post-commit notifications: elections and observers run without the
    /// write lock held.
    fn after_batch(&mut self, applied: Vec<(Hash, Block, Account, bool)>, forks: Vec<Block>) {
        if !applied.is_empty() {
            let mut elections = self.elections.lock();
            for (_, block, account, _) in &applied {
                elections.start(block.clone(), *account);
            }
        }
        for block in forks {
            let account = self.account_of(&block);
            let root_hash = block.previous();
            let started = self.elections.lock().start(block.clone(), account);
            if started {
                let mut pubsub = self.pubsub.lock();
                if pubsub.has_subscribers(Event::FORK) {
                    pubsub.publish(Event::FORK, Message::ForkObserved { root_hash, block });
                }
            }
        }
        let mut pubsub = self.pubsub.lock();
        if pubsub.has_subscribers(Event::BLOCK) {
            for (hash, block, account, is_send) in applied {
                pubsub.publish(
                    Event::BLOCK,
                    Message::BlockApplied {
                        hash,
                        account,
                        block,
                        is_send,
                    },
                );
            }
        }
    }

    /// Account a block belongs to, resolving legacy blocks through the
    /// previous block's sideband.
    fn account_of(&self, block: &Block) -> Account {
        if let Some(account) = block.account_field() {
            return account;
        }
        self.db
            .read()
            .block(&block.previous())
            .map(|stored| stored.sideband.account)
            .unwrap_or_default()
    }

    /// Election outcome: make `winner` the tip of its root, rolling back a
    /// conflicting chain if one is in place.
    fn resolve_fork(&mut self, winner: Block) {
        let hash = winner.hash();
        let account = self.account_of(&winner);
        let root = Root::new(account, winner.previous());

        // We are the only writer, so a committed read stays accurate until
        // our own write below. Locks stay unnested: db first, elections
        // only while no db guard is held.
        let current = {
            let db = self.db.read();
            if winner.previous().is_zero() {
                db.account_info(&account).map(|info| info.open_block)
            } else {
                db.block(&winner.previous())
                    .map(|stored| stored.sideband.successor)
                    .filter(|successor| !successor.is_zero())
            }
        };
        if let Some(current) = current {
            if current != hash && self.elections.lock().was_confirmed(&current) {
                warn!("refusing to roll back confirmed block {}", current);
                return;
            }
        }

        let mut applied = Vec::new();
        let mut forks = Vec::new();
        let mut stop_root = false;
        {
            let db_arc = self.db.clone();
            let mut db = db_arc.write();
            let mut fork = db.fork_create();
            match current {
                Some(current) if current == hash => {
                    // Winner already in place.
                }
                Some(current) => {
                    match self
                        .ledger
                        .rollback(&mut fork, &current, self.config.max_rollback_depth)
                    {
                        Ok(rolled) => {
                            debug!(
                                "rolled back {} blocks for root {}",
                                rolled.len(),
                                root.previous
                            );
                            self.apply_one(
                                &mut fork,
                                QueueEntry {
                                    block: winner.clone(),
                                    hash,
                                    arrival: unix_time(),
                                    verified: SignatureState::Unknown,
                                },
                                &mut applied,
                                &mut forks,
                            );
                        }
                        Err(err) => {
                            warn!(
                                "fork rollback failed for {}: {}",
                                current,
                                err.to_string_full()
                            );
                            stop_root = true;
                        }
                    }
                }
                None => {
                    // Nothing at this root yet; apply the winner normally.
                    self.apply_one(
                        &mut fork,
                        QueueEntry {
                            block: winner.clone(),
                            hash,
                            arrival: unix_time(),
                            verified: SignatureState::Unknown,
                        },
                        &mut applied,
                        &mut forks,
                    );
                    self.requeue_dependents(&mut fork, &applied);
                }
            }
            if stop_root {
                drop(fork);
            } else if let Err(err) = db.fork_merge(fork) {
                error!("fork resolution commit failed: {}", err.to_string_full());
                return;
            }
        }
        if stop_root {
            self.elections.lock().stop(&root);
            return;
        }
        self.after_batch(applied, forks);

        let mut pubsub = self.pubsub.lock();
        if pubsub.has_subscribers(Event::CONFIRM) {
            pubsub.publish(Event::CONFIRM, Message::BlockConfirmed { hash, account });
        }
    }

    /// Keep the latest vote per representative in the vote table.
    fn persist_vote(&mut self, vote: &crate::base::schema::Vote) {
        let db_arc = self.db.clone();
        let mut db = db_arc.write();
        let stale = db
            .vote(&vote.account)
            .map(|existing| vote.sequence <= existing.sequence)
            .unwrap_or(false);
        if stale {
            return;
        }
        let mut fork = db.fork_create();
        fork.store_vote(
            &vote.account,
            &VoteInfo {
                sequence: vote.sequence,
                hashes: vote.hashes.clone(),
            },
        );
        if let Err(err) = db.fork_merge(fork) {
            error!("vote persist failed: {}", err.to_string_full());
        }
    }

    /// Periodic online-weight sample, persisted through our write lock.
    fn maybe_sample_online(&mut self) {
        let now = unix_time();
        if now.saturating_sub(self.last_sample) < ONLINE_SAMPLE_INTERVAL {
            return;
        }
        self.last_sample = now;
        let db_arc = self.db.clone();
        let mut db = db_arc.write();
        let sample = {
            let weights = &*db;
            self.online
                .lock()
                .sample(now, |rep| weights.weight(rep))
        };
        let mut fork = db.fork_create();
        fork.store_online_weight(now, sample);
        fork.prune_online_weight(super::online_reps::WEIGHT_SAMPLES_MAX);
        if let Err(err) = db.fork_merge(fork) {
            error!("online weight persist failed: {}", err.to_string_full());
        }
    }
}
