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

//! Handlers for the read-side verbs of the service surface. Everything here
//! runs off the write path, against the committed snapshot.

use crate::{
    base::{
        schema::{
            Account, AccountInfo, Amount, Block, PendingKey, StateBlock, StoredBlock,
        },
        unix_time, Mutex, RwLock,
    },
    blockchain::{
        election::ActiveElections,
        message::*,
        online_reps::OnlineReps,
    },
    bootstrap::BootstrapCommand,
    channel,
    config::{Network, NodeConfig},
    crypto::{work_valid, work_value, Hash, Hashable, KeyPair, Signature, WorkPool},
    db::Db,
    net::{parse_endpoint, NetCommand},
    Error, ErrorKind,
};
use std::sync::Arc;

/// Bound on full-table walks triggered by request verbs.
const SCAN_MAX: usize = 16384;

/// Dispatcher context data.
pub(crate) struct Dispatcher<D: Db> {
    config: Arc<NodeConfig>,
    network: Arc<Network>,
    db: Arc<RwLock<D>>,
    elections: Arc<Mutex<ActiveElections>>,
    online: Arc<Mutex<OnlineReps>>,
    work: Arc<WorkPool>,
    net_tx: Option<channel::Sender<NetCommand>>,
    bootstrap_tx: Option<channel::Sender<BootstrapCommand>>,
}

impl<D: Db> Clone for Dispatcher<D> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            network: self.network.clone(),
            db: self.db.clone(),
            elections: self.elections.clone(),
            online: self.online.clone(),
            work: self.work.clone(),
            net_tx: self.net_tx.clone(),
            bootstrap_tx: self.bootstrap_tx.clone(),
        }
    }
}

impl<D: Db> Dispatcher<D> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<NodeConfig>,
        network: Arc<Network>,
        db: Arc<RwLock<D>>,
        elections: Arc<Mutex<ActiveElections>>,
        online: Arc<Mutex<OnlineReps>>,
        work: Arc<WorkPool>,
        net_tx: Option<channel::Sender<NetCommand>>,
        bootstrap_tx: Option<channel::Sender<BootstrapCommand>>,
    ) -> Self {
        Dispatcher {
            config,
            network,
            db,
            elections,
            online,
            work,
            net_tx,
            bootstrap_tx,
        }
    }

    /// Handle one request; the returned message is the response.
    pub fn message_handler(&self, msg: Message) -> Message {
        match msg {
            Message::AccountBalance { account } => self.account_balance(account),
            Message::AccountInfo { account } => self.account_info(account),
            Message::AccountsPending {
                accounts,
                count,
                threshold,
            } => self.accounts_pending(accounts, count, threshold),
            Message::GetBlock { hash } => self.get_block(hash),
            Message::BlocksInfo { hashes } => self.blocks_info(hashes),
            Message::BlockConfirm { hash } => self.block_confirm(hash),
            Message::BlockCreate {
                key,
                previous,
                representative,
                balance,
                link,
                work,
            } => self.block_create(key, previous, representative, balance, link, work),
            Message::BlockHash { block } => Message::BlockHashResponse { hash: block.hash() },
            Message::Chain {
                block,
                count,
                successors,
            } => self.chain(block, count, successors),
            Message::ConfirmationHistory => Message::ConfirmationHistoryResponse {
                confirmations: self.elections.lock().history(),
            },
            Message::Delegators { account } => self.delegators(account),
            Message::Frontiers { start, count } => self.frontiers(start, count),
            Message::LedgerAccounts { start, count } => self.ledger_accounts(start, count),
            Message::Pending {
                account,
                count,
                threshold,
            } => self.pending(account, count, threshold),
            Message::PendingExists { hash } => self.pending_exists(hash),
            Message::Representatives { count } => self.representatives(count),
            Message::RepresentativesOnline => Message::RepresentativesOnlineResponse {
                representatives: self.online.lock().online(unix_time()),
            },
            Message::Republish { hash, count } => self.republish(hash, count),
            Message::SearchPending { accounts } => self.search_pending(accounts),
            Message::Bootstrap { peer } => self.bootstrap(peer),
            Message::BootstrapLazy { hash } => self.bootstrap_lazy(hash),
            Message::Keepalive { endpoint } => self.keepalive(endpoint),
            Message::WorkValidate { root, work } => Message::WorkValidateResponse {
                valid: work_valid(root.as_bytes(), work, self.network.work_threshold),
                value: work_value(root.as_bytes(), work),
            },
            _ => Message::Exception(Error::new_ext(ErrorKind::Other, "unhandled request")),
        }
    }

    /// Side-effecting verbs are refused while control is disabled.
    fn control_guard(&self) -> Option<Message> {
        if self.config.enable_control {
            None
        } else {
            Some(Message::Exception(Error::new(ErrorKind::ControlDisabled)))
        }
    }

    /// Resolve the representative recorded by an account's rep block.
    fn representative_of(&self, info: &AccountInfo) -> Account {
        match self
            .db
            .read()
            .block(&info.representative_block)
            .map(|stored| stored.block)
        {
            Some(Block::Open(b)) => b.representative,
            Some(Block::Change(b)) => b.representative,
            Some(Block::State(b)) => b.representative,
            _ => self.network.genesis_account,
        }
    }

    fn pending_records(&self, account: &Account, count: usize, threshold: Amount) -> Vec<PendingRecord> {
        let start = PendingKey::new(*account, Hash::zero());
        self.db
            .read()
            .pending_range(&start, count.min(SCAN_MAX))
            .into_iter()
            .take_while(|(key, _)| key.account == *account)
            .filter(|(_, info)| info.amount >= threshold)
            .map(|(key, info)| PendingRecord {
                hash: key.hash,
                amount: info.amount,
                source: info.source,
            })
            .collect()
    }

    fn account_balance(&self, account: Account) -> Message {
        let balance = self
            .db
            .read()
            .account_info(&account)
            .map(|info| info.balance)
            .unwrap_or_default();
        let pending = self
            .pending_records(&account, SCAN_MAX, Amount::zero())
            .iter()
            .fold(Amount::zero(), |acc, record| {
                acc.checked_add(record.amount).unwrap_or(Amount::MAX)
            });
        Message::AccountBalanceResponse { balance, pending }
    }

    fn account_info(&self, account: Account) -> Message {
        match self.db.read().account_info(&account) {
            Some(info) => {
                let representative = self.representative_of(&info);
                Message::AccountInfoResponse {
                    info,
                    representative,
                }
            }
            None => Message::Exception(Error::new(ErrorKind::ResourceNotFound)),
        }
    }

    fn accounts_pending(&self, accounts: Vec<Account>, count: u64, threshold: Amount) -> Message {
        let pending = accounts
            .into_iter()
            .map(|account| {
                let records = self.pending_records(&account, count as usize, threshold);
                (account, records)
            })
            .collect();
        Message::AccountsPendingResponse { pending }
    }

    fn get_block(&self, hash: Hash) -> Message {
        match self.db.read().block(&hash) {
            Some(stored) => Message::GetBlockResponse {
                block: stored.block,
            },
            None => Message::Exception(Error::new(ErrorKind::ResourceNotFound)),
        }
    }

    fn blocks_info(&self, hashes: Vec<Hash>) -> Message {
        let found: Vec<(Hash, StoredBlock)> = {
            let db = self.db.read();
            hashes
                .into_iter()
                .filter_map(|hash| db.block(&hash).map(|stored| (hash, stored)))
                .collect()
        };
        let elections = self.elections.lock();
        let blocks = found
            .into_iter()
            .map(|(hash, StoredBlock { block, sideband })| BlockRecord {
                hash,
                block,
                account: sideband.account,
                height: sideband.height,
                balance: sideband.balance,
                confirmed: elections.was_confirmed(&hash),
            })
            .collect();
        Message::BlocksInfoResponse { blocks }
    }

    fn block_confirm(&self, hash: Hash) -> Message {
        let stored = self.db.read().block(&hash);
        match stored {
            Some(stored) => {
                self.elections
                    .lock()
                    .start(stored.block, stored.sideband.account);
                Message::Ack
            }
            None => Message::Exception(Error::new(ErrorKind::ResourceNotFound)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn block_create(
        &self,
        key: Vec<u8>,
        previous: Hash,
        representative: Account,
        balance: Amount,
        link: Hash,
        work: Option<u64>,
    ) -> Message {
        if let Some(refused) = self.control_guard() {
            return refused;
        }
        let seed: [u8; 32] = match key.as_slice().try_into() {
            Ok(seed) => seed,
            Err(_) => return Message::Exception(Error::new(ErrorKind::MalformedData)),
        };
        let keypair = KeyPair::from_seed(&seed);
        let mut block = Block::State(StateBlock {
            account: Account::from(keypair.public_key()),
            previous,
            representative,
            balance,
            link: crate::base::schema::Link(link),
            signature: Signature::zero(),
            work: 0,
        });
        block.sign(&keypair);
        let work = match work {
            Some(work) => work,
            None => {
                let root = block.work_root();
                match self
                    .work
                    .generate(root, self.network.work_threshold)
                    .recv_sync()
                {
                    Ok(work) => work,
                    Err(_) => return Message::Exception(Error::new(ErrorKind::Stopped)),
                }
            }
        };
        block.set_work(work);
        Message::BlockCreateResponse {
            hash: block.hash(),
            block,
        }
    }

    fn chain(&self, block: Hash, count: u64, successors: bool) -> Message {
        let db = self.db.read();
        let mut cursor = block;
        let mut blocks = Vec::new();
        while !cursor.is_zero() && (blocks.len() as u64) < count.min(SCAN_MAX as u64) {
            let stored = match db.block(&cursor) {
                Some(stored) => stored,
                None => break,
            };
            blocks.push(cursor);
            cursor = if successors {
                stored.sideband.successor
            } else {
                stored.block.previous()
            };
        }
        Message::ChainResponse { blocks }
    }

    fn delegators(&self, account: Account) -> Message {
        let db = self.db.read();
        let delegators = db
            .frontier_range(&Account::zero(), SCAN_MAX)
            .into_iter()
            .filter(|(_, info)| {
                let representative = match db
                    .block(&info.representative_block)
                    .map(|stored| stored.block)
                {
                    Some(Block::Open(b)) => b.representative,
                    Some(Block::Change(b)) => b.representative,
                    Some(Block::State(b)) => b.representative,
                    _ => self.network.genesis_account,
                };
                representative == account
            })
            .map(|(delegator, info)| (delegator, info.balance))
            .collect();
        Message::DelegatorsResponse { delegators }
    }

    fn frontiers(&self, start: Account, count: u64) -> Message {
        let frontiers = self
            .db
            .read()
            .frontier_range(&start, count.min(SCAN_MAX as u64) as usize)
            .into_iter()
            .map(|(account, info)| (account, info.head))
            .collect();
        Message::FrontiersResponse { frontiers }
    }

    fn ledger_accounts(&self, start: Account, count: u64) -> Message {
        let accounts = self
            .db
            .read()
            .frontier_range(&start, count.min(SCAN_MAX as u64) as usize);
        Message::LedgerAccountsResponse { accounts }
    }

    fn pending(&self, account: Account, count: u64, threshold: Amount) -> Message {
        Message::PendingResponse {
            entries: self.pending_records(&account, count as usize, threshold),
        }
    }

    fn pending_exists(&self, hash: Hash) -> Message {
        let db = self.db.read();
        let destination = match db.block(&hash).map(|stored| stored.block) {
            Some(Block::Send(b)) => Some(b.destination),
            Some(Block::State(b)) => Some(b.link.as_account()),
            _ => None,
        };
        let exists = destination
            .map(|destination| db.pending(&PendingKey::new(destination, hash)).is_some())
            .unwrap_or(false);
        Message::PendingExistsResponse { exists }
    }

    fn representatives(&self, count: u64) -> Message {
        Message::RepresentativesResponse {
            representatives: self
                .db
                .read()
                .representation(count.min(SCAN_MAX as u64) as usize),
        }
    }

    fn republish(&self, hash: Hash, count: u64) -> Message {
        if let Some(refused) = self.control_guard() {
            return refused;
        }
        let net_tx = match &self.net_tx {
            Some(net_tx) => net_tx.clone(),
            None => return Message::Exception(Error::new(ErrorKind::Stopped)),
        };
        let db = self.db.read();
        let mut cursor = hash;
        let mut published = 0;
        while !cursor.is_zero() && published < count.min(SCAN_MAX as u64) {
            let stored = match db.block(&cursor) {
                Some(stored) => stored,
                None => break,
            };
            let _ = net_tx.send_sync(NetCommand::Publish(stored.block.clone()));
            published += 1;
            cursor = stored.sideband.successor;
        }
        Message::Ack
    }

    fn search_pending(&self, accounts: Vec<Account>) -> Message {
        if let Some(refused) = self.control_guard() {
            return refused;
        }
        let mut entries = Vec::new();
        for account in accounts {
            for record in self.pending_records(&account, SCAN_MAX, self.config.receive_minimum) {
                entries.push((account, record));
            }
        }
        Message::SearchPendingResponse { entries }
    }

    fn bootstrap(&self, peer: Option<String>) -> Message {
        if let Some(refused) = self.control_guard() {
            return refused;
        }
        let peer = match peer {
            Some(raw) => match parse_endpoint(&raw) {
                Ok(endpoint) => Some(endpoint),
                Err(err) => return Message::Exception(err),
            },
            None => None,
        };
        match &self.bootstrap_tx {
            Some(tx) => {
                let _ = tx.send_sync(BootstrapCommand::Legacy { peer });
                Message::Ack
            }
            None => Message::Exception(Error::new(ErrorKind::Stopped)),
        }
    }

    fn bootstrap_lazy(&self, hash: Hash) -> Message {
        if let Some(refused) = self.control_guard() {
            return refused;
        }
        match &self.bootstrap_tx {
            Some(tx) => {
                let _ = tx.send_sync(BootstrapCommand::Lazy { hash });
                Message::Ack
            }
            None => Message::Exception(Error::new(ErrorKind::Stopped)),
        }
    }

    fn keepalive(&self, endpoint: String) -> Message {
        if let Some(refused) = self.control_guard() {
            return refused;
        }
        let endpoint = match parse_endpoint(&endpoint) {
            Ok(endpoint) => endpoint,
            Err(err) => return Message::Exception(err),
        };
        match &self.net_tx {
            Some(net_tx) => {
                let _ = net_tx.send_sync(NetCommand::Keepalive(endpoint));
                Message::Ack
            }
            None => Message::Exception(Error::new(ErrorKind::Stopped)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::election::tests::StaticWeights;
    use crate::blockchain::ledger::tests::{
        apply, genesis_keypair, make_ctx, send_block, Ctx,
    };
    use crate::crypto::KeyPair;
    use crate::db::rocks::Store;
    use merkledb::TemporaryDB;

    struct Fixture {
        dispatcher: Dispatcher<Store<TemporaryDB>>,
        network: Arc<Network>,
        genesis_account: Account,
    }

    fn fixture_from_ctx(ctx: Ctx, enable_control: bool) -> Fixture {
        let mut config = NodeConfig::test();
        config.enable_control = enable_control;
        let config = Arc::new(config);
        let network = ctx.network.clone();
        let db = Arc::new(RwLock::new(ctx.store));
        let online = Arc::new(Mutex::new(OnlineReps::new(Amount::zero())));
        let elections = Arc::new(Mutex::new(ActiveElections::new(
            config.clone(),
            Arc::new(StaticWeights(Default::default())),
            online.clone(),
        )));
        let genesis_account = network.genesis_account;
        Fixture {
            dispatcher: Dispatcher::new(
                config,
                network.clone(),
                db,
                elections,
                online,
                Arc::new(WorkPool::new(2)),
                None,
                None,
            ),
            network,
            genesis_account,
        }
    }

    #[test]
    fn account_balance_and_pending() {
        let mut ctx = make_ctx();
        let dest = Account::from(KeyPair::from_seed(&[2; 32]).public_key());
        let send = send_block(
            &ctx,
            &genesis_keypair(),
            ctx.network.genesis_hash(),
            u128::MAX - 50,
            dest,
        );
        apply(&mut ctx, &send);
        let fx = fixture_from_ctx(ctx, true);

        match fx.dispatcher.message_handler(Message::AccountBalance {
            account: fx.genesis_account,
        }) {
            Message::AccountBalanceResponse { balance, pending } => {
                assert_eq!(balance, Amount(u128::MAX - 50));
                assert_eq!(pending, Amount::zero());
            }
            other => panic!("unexpected: {:?}", other),
        }

        match fx
            .dispatcher
            .message_handler(Message::AccountBalance { account: dest })
        {
            Message::AccountBalanceResponse { balance, pending } => {
                assert_eq!(balance, Amount::zero());
                assert_eq!(pending, Amount(50));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn account_info_resolves_representative() {
        let ctx = make_ctx();
        let fx = fixture_from_ctx(ctx, true);

        match fx.dispatcher.message_handler(Message::AccountInfo {
            account: fx.genesis_account,
        }) {
            Message::AccountInfoResponse {
                info,
                representative,
            } => {
                assert_eq!(info.block_count, 1);
                assert_eq!(representative, fx.genesis_account);
            }
            other => panic!("unexpected: {:?}", other),
        }

        match fx.dispatcher.message_handler(Message::AccountInfo {
            account: Account::new([9; 32]),
        }) {
            Message::Exception(err) => assert_eq!(err.kind, ErrorKind::ResourceNotFound),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn chain_walks_both_directions() {
        let mut ctx = make_ctx();
        let dest = Account::from(KeyPair::from_seed(&[2; 32]).public_key());
        let send = send_block(
            &ctx,
            &genesis_keypair(),
            ctx.network.genesis_hash(),
            u128::MAX - 50,
            dest,
        );
        apply(&mut ctx, &send);
        let genesis_hash = ctx.network.genesis_hash();
        let fx = fixture_from_ctx(ctx, true);

        match fx.dispatcher.message_handler(Message::Chain {
            block: send.hash(),
            count: 10,
            successors: false,
        }) {
            Message::ChainResponse { blocks } => {
                assert_eq!(blocks, vec![send.hash(), genesis_hash]);
            }
            other => panic!("unexpected: {:?}", other),
        }

        match fx.dispatcher.message_handler(Message::Chain {
            block: genesis_hash,
            count: 10,
            successors: true,
        }) {
            Message::ChainResponse { blocks } => {
                assert_eq!(blocks, vec![genesis_hash, send.hash()]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn frontiers_and_ledger() {
        let ctx = make_ctx();
        let genesis_hash = ctx.network.genesis_hash();
        let fx = fixture_from_ctx(ctx, true);

        match fx.dispatcher.message_handler(Message::Frontiers {
            start: Account::zero(),
            count: 10,
        }) {
            Message::FrontiersResponse { frontiers } => {
                assert_eq!(frontiers, vec![(fx.genesis_account, genesis_hash)]);
            }
            other => panic!("unexpected: {:?}", other),
        }

        match fx.dispatcher.message_handler(Message::LedgerAccounts {
            start: Account::zero(),
            count: 10,
        }) {
            Message::LedgerAccountsResponse { accounts } => {
                assert_eq!(accounts.len(), 1);
                assert_eq!(accounts[0].1.balance, Amount::MAX);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn representatives_listing() {
        let ctx = make_ctx();
        let fx = fixture_from_ctx(ctx, true);

        match fx
            .dispatcher
            .message_handler(Message::Representatives { count: 10 })
        {
            Message::RepresentativesResponse { representatives } => {
                assert_eq!(representatives, vec![(fx.genesis_account, Amount::MAX)]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn work_validate() {
        let ctx = make_ctx();
        let genesis_work = ctx.network.genesis.work();
        let root = Hash::new(*ctx.network.genesis_account.as_bytes());
        let fx = fixture_from_ctx(ctx, true);

        match fx.dispatcher.message_handler(Message::WorkValidate {
            root,
            work: genesis_work,
        }) {
            Message::WorkValidateResponse { valid, value } => {
                assert!(valid);
                assert!(value >= fx.network.work_threshold);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn block_create_signs_and_works() {
        let ctx = make_ctx();
        let genesis_hash = ctx.network.genesis_hash();
        let fx = fixture_from_ctx(ctx, true);

        let response = fx.dispatcher.message_handler(Message::BlockCreate {
            key: vec![0x42; 32],
            previous: genesis_hash,
            representative: fx.genesis_account,
            balance: Amount(u128::MAX - 9),
            link: Hash::new([7; 32]),
            work: None,
        });
        match response {
            Message::BlockCreateResponse { hash, block } => {
                assert_eq!(hash, block.hash());
                assert!(block.verify_signature(&fx.genesis_account));
                assert!(work_valid(
                    &block.work_root(),
                    block.work(),
                    fx.network.work_threshold
                ));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn control_gating() {
        let ctx = make_ctx();
        let fx = fixture_from_ctx(ctx, false);

        for msg in [
            Message::Bootstrap { peer: None },
            Message::BootstrapLazy {
                hash: Hash::new([1; 32]),
            },
            Message::Keepalive {
                endpoint: "::1:7075".to_owned(),
            },
            Message::SearchPending { accounts: vec![] },
            Message::Republish {
                hash: Hash::new([1; 32]),
                count: 1,
            },
        ] {
            match fx.dispatcher.message_handler(msg) {
                Message::Exception(err) => assert_eq!(err.kind, ErrorKind::ControlDisabled),
                other => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[test]
    fn block_confirm_starts_election() {
        let ctx = make_ctx();
        let genesis_hash = ctx.network.genesis_hash();
        let fx = fixture_from_ctx(ctx, true);

        match fx
            .dispatcher
            .message_handler(Message::BlockConfirm { hash: genesis_hash })
        {
            Message::Ack => {}
            other => panic!("unexpected: {:?}", other),
        }
        assert!(fx
            .dispatcher
            .elections
            .lock()
            .contains_candidate(&genesis_hash));
    }
}
