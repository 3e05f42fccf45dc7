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

//! Blockchain service: owns the worker thread running the block processor
//! and exposes its request channel.

use super::{
    dispatcher::Dispatcher,
    election::{ActiveElections, LedgerWeights},
    ledger::Ledger,
    message::{BlockRequestSender, Message},
    online_reps::OnlineReps,
    processor::BlockWorker,
    pubsub::PubSub,
};
use crate::{
    base::{Mutex, RwLock},
    bootstrap::BootstrapCommand,
    channel::{self, confirmed_channel},
    config::{Network, NodeConfig},
    crypto::WorkPool,
    db::Db,
    net::NetCommand,
};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Block service data.
pub struct BlockService<D: Db> {
    /// Worker object, parked here while the service is stopped.
    worker: Option<BlockWorker<D>>,
    /// Worker thread handle.
    handler: Option<JoinHandle<BlockWorker<D>>>,
    /// To send messages to the worker.
    tx_chan: BlockRequestSender,
    /// Database shared reference.
    db: Arc<RwLock<D>>,
    elections: Arc<Mutex<ActiveElections>>,
    online: Arc<Mutex<OnlineReps>>,
    /// To check if the worker thread is still alive.
    canary: Arc<()>,
}

impl<D: Db> BlockService<D> {
    /// Create a new blockchain service instance; seeds the genesis block
    /// into an empty store.
    pub fn new(
        config: Arc<NodeConfig>,
        network: Arc<Network>,
        mut db: D,
        work: Arc<WorkPool>,
        net_tx: Option<channel::Sender<NetCommand>>,
        bootstrap_tx: Option<channel::Sender<BootstrapCommand>>,
    ) -> Self {
        let ledger = Arc::new(Ledger::new(network.clone()));
        {
            let mut fork = db.fork_create();
            ledger.seed_genesis(&mut fork);
            if let Err(err) = db.fork_merge(fork) {
                // Without a genesis nothing else can work.
                panic!("genesis seeding failed: {}", err.to_string_full());
            }
        }

        let mut online = OnlineReps::new(config.online_weight_minimum);
        online.restore(
            db.online_weight_samples()
                .into_iter()
                .map(|(_, weight)| weight),
        );
        let online = Arc::new(Mutex::new(online));

        let db = Arc::new(RwLock::new(db));
        let elections = Arc::new(Mutex::new(ActiveElections::new(
            config.clone(),
            Arc::new(LedgerWeights(db.clone())),
            online.clone(),
        )));
        let pubsub = Arc::new(Mutex::new(PubSub::new()));
        let dispatcher = Dispatcher::new(
            config.clone(),
            network,
            db.clone(),
            elections.clone(),
            online.clone(),
            work,
            net_tx,
            bootstrap_tx,
        );

        let (tx_chan, rx_chan) = confirmed_channel::<Message, Message>();
        let worker = BlockWorker::new(
            config,
            db.clone(),
            ledger,
            elections.clone(),
            online.clone(),
            pubsub,
            dispatcher,
            rx_chan,
        );

        BlockService {
            worker: Some(worker),
            handler: None,
            tx_chan,
            db,
            elections,
            online,
            canary: Arc::new(()),
        }
    }

    /// Start the blockchain service.
    pub fn start(&mut self) {
        debug!("starting blockchain service");
        let mut worker = match self.worker.take() {
            Some(worker) => worker,
            None => {
                warn!("service was already running");
                return;
            }
        };

        let mut canary = Arc::clone(&self.canary);
        let handle = thread::spawn(move || {
            let _ = Arc::get_mut(&mut canary);
            worker.run_sync();
            worker
        });
        self.handler = Some(handle);
    }

    /// Stop the blockchain service.
    pub fn stop(&mut self) {
        debug!("stopping blockchain service");
        match self.handler.take() {
            Some(handle) => {
                if let Err(err) = self.tx_chan.send_sync(Message::Stop) {
                    error!("error stopping blockchain service: {:?}", err);
                }
                if let Ok(worker) = handle.join() {
                    self.worker = Some(worker);
                }
            }
            None => {
                debug!("service was not running");
            }
        };
    }

    /// Check if the service is running.
    pub fn is_running(&self) -> bool {
        // Hack to intercept crashed subthreads.
        Arc::strong_count(&self.canary) == 2 && self.worker.is_none()
    }

    /// Get a clone of the service input channel.
    pub fn request_channel(&self) -> BlockRequestSender {
        self.tx_chan.clone()
    }

    /// Get a shared reference to the database.
    pub fn db_arc(&self) -> Arc<RwLock<D>> {
        self.db.clone()
    }

    pub fn elections_arc(&self) -> Arc<Mutex<ActiveElections>> {
        self.elections.clone()
    }

    pub fn online_arc(&self) -> Arc<Mutex<OnlineReps>> {
        self.online.clone()
    }
}
