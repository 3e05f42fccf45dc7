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

//! Node assembly: constructs the component graph and owns its lifecycle.
//!
//! Inbound datagrams are routed by type: blocks to the processor, votes
//! through the pipeline into elections, keepalives and handshakes to the
//! peer table. Outbound traffic funnels through the command channel; the
//! alarm drives keepalive fan-out, election announcements and rep crawling.

use crate::{
    alarm::{recurring, Alarm},
    base::{
        schema::{Account, Amount, Block, SignatureState, Vote},
        unix_time, Mutex, RwLock,
    },
    blockchain::{
        BlockRequestSender, BlockService, Event, Message, VoteCode, VotePipeline,
    },
    bootstrap::{BootstrapListener, BootstrapService},
    channel,
    config::{Network, NodeConfig, PROTOCOL_VERSION},
    crypto::{KeyPair, WorkPool},
    db::{Db, META_NODE_SEED},
    net::{
        map_endpoint_v6,
        message::{ConfirmReqPayload, WireMessage, KEEPALIVE_PEERS},
        parse_endpoint, NetCommand, Outbound, PeerTable, UdpChannel,
    },
    Error, ErrorKind, Result,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::thread::JoinHandle;

pub use crate::bootstrap::BootstrapCommand;

/// A running node; construction wires the components, `start` spins them.
pub struct Node<D: Db> {
    config: Arc<NodeConfig>,
    network: Arc<Network>,
    block_svc: BlockService<D>,
    bootstrap_svc: BootstrapService,
    listener: BootstrapListener,
    udp: Arc<UdpChannel>,
    peers: Arc<Mutex<PeerTable>>,
    pipeline: Arc<VotePipeline>,
    alarm: Arc<Alarm>,
    net_tx: channel::Sender<NetCommand>,
    net_rx: Option<channel::Receiver<NetCommand>>,
    node_id: Arc<KeyPair>,
    helpers: Vec<JoinHandle<()>>,
    started: bool,
}

impl<D: Db> Node<D> {
    pub fn new(config: NodeConfig, network: Arc<Network>, db: D) -> Result<Node<D>> {
        let config = Arc::new(config);
        let work = Arc::new(WorkPool::new(config.work_threads));
        let udp = Arc::new(UdpChannel::bind(
            network.clone(),
            config.listen_port,
            config.receive_buffer_count,
        )?);
        let peers = Arc::new(Mutex::new(PeerTable::new(
            config.allow_local_peers,
            config.keepalive_cutoff,
        )));

        let (net_tx, net_rx) = channel::simple_channel::<NetCommand>();
        let (bootstrap_tx, bootstrap_rx) = channel::simple_channel();

        let block_svc = BlockService::new(
            config.clone(),
            network.clone(),
            db,
            work,
            Some(net_tx.clone()),
            Some(bootstrap_tx.clone()),
        );
        let node_id = Arc::new(restore_node_id(&block_svc.db_arc())?);
        let bootstrap_svc = BootstrapService::new(
            config.clone(),
            network.clone(),
            block_svc.db_arc(),
            block_svc.request_channel(),
            peers.clone(),
            bootstrap_tx,
            bootstrap_rx,
        );
        // The bulk channel listens on the same port number as the datagram
        // socket.
        let listener = BootstrapListener::start(
            config.clone(),
            network.clone(),
            block_svc.db_arc(),
            block_svc.request_channel(),
            udp.local_endpoint().port(),
        )?;

        Ok(Node {
            config,
            network,
            block_svc,
            bootstrap_svc,
            listener,
            udp,
            peers,
            pipeline: Arc::new(VotePipeline::new()),
            alarm: Arc::new(Alarm::new()),
            net_tx,
            net_rx: Some(net_rx),
            node_id,
            helpers: Vec::new(),
            started: false,
        })
    }

    /// Bring every service up and arm the periodic work.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        self.block_svc.start();

        let inbound = Arc::new(Inbound {
            config: self.config.clone(),
            network: self.network.clone(),
            db: self.block_svc.db_arc(),
            peers: self.peers.clone(),
            pipeline: self.pipeline.clone(),
            elections: self.block_svc.elections_arc(),
            online: self.block_svc.online_arc(),
            block_tx: self.block_svc.request_channel(),
            udp: self.udp.clone(),
            node_id: self.node_id.clone(),
        });
        self.udp.start(inbound, self.config.io_threads);

        self.spawn_net_worker();
        self.spawn_flood_worker();
        self.arm_timers();

        // Reach out to the configured seed peers.
        for raw in &self.config.peers {
            match parse_endpoint(raw) {
                Ok(endpoint) => {
                    let _ = self.net_tx.send_sync(NetCommand::Keepalive(endpoint));
                }
                Err(_) => warn!("ignoring malformed seed peer '{}'", raw),
            }
        }
        info!("node up on {}", self.udp.local_endpoint());
    }

    /// Outbound command consumer.
    fn spawn_net_worker(&mut self) {
        let net_rx = match self.net_rx.take() {
            Some(net_rx) => net_rx,
            None => return,
        };
        let udp = self.udp.clone();
        let peers = self.peers.clone();
        let handle = std::thread::spawn(move || {
            while let Ok(command) = net_rx.recv_sync() {
                match command {
                    NetCommand::Publish(block) => {
                        flood(&udp, &peers, &block);
                    }
                    NetCommand::ConfirmReq(block) => {
                        let now = unix_time();
                        let targets = {
                            let peers = peers.lock();
                            let mut targets = peers.representative_peers(8);
                            targets.extend(peers.list(8, now));
                            targets
                        };
                        let message = WireMessage::ConfirmReq {
                            payload: ConfirmReqPayload::Block(block),
                        };
                        for target in dedup(targets) {
                            udp.send(target, &message);
                        }
                    }
                    NetCommand::Keepalive(endpoint) => {
                        let now = unix_time();
                        let advertised = {
                            let mut peers = peers.lock();
                            peers.insert(endpoint, PROTOCOL_VERSION, now);
                            peers.list(KEEPALIVE_PEERS, now)
                        };
                        udp.send(endpoint, &keepalive_message(&advertised));
                    }
                }
            }
        });
        self.helpers.push(handle);
    }

    /// Applied-block observer: every block the processor lands is flooded.
    fn spawn_flood_worker(&mut self) {
        let block_tx = self.block_svc.request_channel();
        let udp = self.udp.clone();
        let peers = self.peers.clone();
        let handle = std::thread::spawn(move || {
            let events = match block_tx.send_sync(Message::Subscribe {
                id: "net".to_owned(),
                events: Event::BLOCK,
            }) {
                Ok(events) => events,
                Err(_) => return,
            };
            while let Ok(msg) = events.recv_sync() {
                if let Message::BlockApplied { block, .. } = msg {
                    flood(&udp, &peers, &block);
                }
            }
        });
        self.helpers.push(handle);
    }

    fn arm_timers(&self) {
        // Keepalive fan-out and peer table hygiene.
        {
            let peers = self.peers.clone();
            let udp = self.udp.clone();
            recurring(&self.alarm, self.config.keepalive_interval, move || {
                let now = unix_time();
                let (targets, advertised) = {
                    let mut peers = peers.lock();
                    peers.purge(now);
                    (peers.keepalive_targets(now), peers.list(KEEPALIVE_PEERS, now))
                };
                let message = keepalive_message(&advertised);
                for target in targets {
                    udp.send(target, &message);
                }
            });
        }

        // Election announcement rounds.
        {
            let elections = self.block_svc.elections_arc();
            let net_tx = self.net_tx.clone();
            recurring(&self.alarm, self.config.announcement_interval, move || {
                let outcome = elections.lock().tick();
                for winner in outcome.rebroadcast {
                    let _ = net_tx.send_sync(NetCommand::ConfirmReq(winner));
                }
            });
        }

        // Rep crawl: probe handshaked peers with a known confirmed block.
        {
            let elections = self.block_svc.elections_arc();
            let peers = self.peers.clone();
            let db = self.block_svc.db_arc();
            let udp = self.udp.clone();
            let genesis_hash = self.network.genesis_hash();
            recurring(&self.alarm, self.config.keepalive_interval, move || {
                let probe_hash = elections
                    .lock()
                    .latest_confirmed()
                    .unwrap_or(genesis_hash);
                let block = match db.read().block(&probe_hash) {
                    Some(stored) => stored.block,
                    None => return,
                };
                let targets = peers.lock().rep_crawl_targets(unix_time(), 8);
                let message = WireMessage::ConfirmReq {
                    payload: ConfirmReqPayload::Block(block),
                };
                for target in targets {
                    udp.send(target, &message);
                }
            });
        }
    }

    /// Orderly shutdown: timers first, then acceptors, then the write path,
    /// finally the sockets and helpers.
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        self.alarm.stop();
        self.listener.stop();
        self.bootstrap_svc.stop();
        let _ = self.flush();
        // Detach the flood observer so its event channel closes.
        if let Ok(rx) = self.block_svc.request_channel().send_sync(Message::Unsubscribe {
            id: "net".to_owned(),
            events: Event::BLOCK,
        }) {
            let _ = rx.recv_sync();
        }
        self.block_svc.stop();
        self.udp.stop();
        self.net_tx.close();
        for handle in self.helpers.drain(..) {
            let _ = handle.join();
        }
        info!("node stopped");
    }

    /// Service request surface for the translator and tests.
    pub fn request_channel(&self) -> BlockRequestSender {
        self.block_svc.request_channel()
    }

    /// Direct bootstrap command surface; the wallet uses it to seed lazy
    /// walks from its accounts.
    pub fn bootstrap_channel(&self) -> channel::Sender<BootstrapCommand> {
        self.bootstrap_svc.request_channel()
    }

    /// Datagram endpoint of this node.
    pub fn endpoint(&self) -> SocketAddr {
        self.udp.local_endpoint()
    }

    /// Live peers known to this node.
    pub fn peer_list(&self) -> Vec<SocketAddr> {
        self.peers.lock().list(usize::MAX, unix_time())
    }

    /// Wait until every block queued so far is handled.
    pub fn flush(&self) -> Result<()> {
        let rx = self
            .block_svc
            .request_channel()
            .send_sync(Message::Flush)
            .map_err(|_| Error::new(ErrorKind::Stopped))?;
        rx.recv_sync().map_err(|_| Error::new(ErrorKind::Stopped))?;
        Ok(())
    }

    /// Committed balance of an account.
    pub fn balance(&self, account: &Account) -> Amount {
        self.block_svc
            .db_arc()
            .read()
            .account_info(account)
            .map(|info| info.balance)
            .unwrap_or_default()
    }
}

impl<D: Db> Drop for Node<D> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Restore the node identity key from the meta table, minting one on first
/// start.
fn restore_node_id<D: Db>(db: &Arc<RwLock<D>>) -> Result<KeyPair> {
    let existing = db.read().meta_get(META_NODE_SEED);
    if let Some(raw) = existing {
        let seed: [u8; 32] = raw
            .try_into()
            .map_err(|_| Error::new(ErrorKind::StoreFault))?;
        return Ok(KeyPair::from_seed(&seed));
    }
    let seed: [u8; 32] = rand::random();
    {
        use crate::db::DbFork;
        let mut db = db.write();
        let mut fork = db.fork_create();
        fork.meta_put(META_NODE_SEED, &seed);
        db.fork_merge(fork)?;
    }
    Ok(KeyPair::from_seed(&seed))
}

fn keepalive_message(advertised: &[SocketAddr]) -> WireMessage {
    WireMessage::Keepalive {
        peers: advertised.iter().map(|e| map_endpoint_v6(*e)).collect(),
    }
}

/// Square-root fan-out of a block to live peers.
fn flood(udp: &Arc<UdpChannel>, peers: &Arc<Mutex<PeerTable>>, block: &Block) {
    let now = unix_time();
    let targets = {
        let peers = peers.lock();
        let count = ((peers.len() as f64).sqrt() as usize).max(2);
        peers.list(count, now)
    };
    let message = WireMessage::Publish {
        block: block.clone(),
    };
    for target in targets {
        udp.send(target, &message);
    }
}

fn dedup(targets: Vec<SocketAddr>) -> Vec<SocketAddr> {
    let mut seen = std::collections::HashSet::new();
    targets
        .into_iter()
        .filter(|target| seen.insert(*target))
        .collect()
}

/// Endpoint equality modulo the v4/v6-mapped representation split.
fn is_same_node(a: &SocketAddr, b: &SocketAddr) -> bool {
    map_endpoint_v6(*a) == map_endpoint_v6(*b)
}

/// Inbound datagram router.
struct Inbound<D: Db> {
    config: Arc<NodeConfig>,
    network: Arc<Network>,
    db: Arc<RwLock<D>>,
    peers: Arc<Mutex<PeerTable>>,
    pipeline: Arc<VotePipeline>,
    elections: Arc<Mutex<crate::blockchain::ActiveElections>>,
    online: Arc<Mutex<crate::blockchain::OnlineReps>>,
    block_tx: BlockRequestSender,
    udp: Arc<UdpChannel>,
    node_id: Arc<KeyPair>,
}

impl<D: Db> Inbound<D> {
    fn enqueue_block(&self, block: Block) {
        let _ = self.block_tx.send_sync(Message::ProcessBlock {
            block,
            arrival: unix_time(),
            verified: SignatureState::Unknown,
        });
    }

    fn handle_keepalive(&self, from: SocketAddr, advertised: Vec<(std::net::Ipv6Addr, u16)>) {
        let now = unix_time();
        let (first_contact, cookie, reply_peers, contact_targets) = {
            let mut peers = self.peers.lock();
            let first_contact = !peers.contains(&from);
            if !peers.insert(from, PROTOCOL_VERSION, now) {
                return;
            }
            let cookie = if first_contact {
                peers.begin_handshake(&from)
            } else {
                None
            };
            let reply_peers = peers.list(KEEPALIVE_PEERS, now);
            // Try a couple of the advertised endpoints we do not know yet.
            let local = self.udp.local_endpoint();
            let contact_targets: Vec<SocketAddr> = advertised
                .iter()
                .map(|(addr, port)| SocketAddr::new(IpAddr::V6(*addr), *port))
                .filter(|endpoint| !peers.contains(endpoint) && !is_same_node(endpoint, &local))
                .take(2)
                .collect();
            (first_contact, cookie, reply_peers, contact_targets)
        };

        if let Some(cookie) = cookie {
            self.udp.send(
                from,
                &WireMessage::NodeIdHandshake {
                    query: Some(cookie),
                    response: None,
                },
            );
        }
        if first_contact {
            self.udp.send(from, &keepalive_message(&reply_peers));
        }
        for target in contact_targets {
            if !crate::net::reserved_address(&target, self.config.allow_local_peers) {
                self.udp.send(target, &keepalive_message(&reply_peers));
            }
        }
    }

    fn handle_handshake(
        &self,
        from: SocketAddr,
        query: Option<[u8; 32]>,
        response: Option<(Account, crate::crypto::Signature)>,
    ) {
        let now = unix_time();
        let our_query = {
            let mut peers = self.peers.lock();
            peers.insert(from, PROTOCOL_VERSION, now);
            if let Some((node_id, signature)) = response {
                peers.handshake_response(&from, node_id, &signature);
            }
            if query.is_some() && !peers.handshaked(&from) && !peers.handshake_sent(&from) {
                peers.begin_handshake(&from)
            } else {
                None
            }
        };
        if let Some(cookie) = query {
            let signature = self.node_id.sign(&cookie);
            self.udp.send(
                from,
                &WireMessage::NodeIdHandshake {
                    query: our_query,
                    response: Some((Account::from(self.node_id.public_key()), signature)),
                },
            );
        } else if let Some(cookie) = our_query {
            self.udp.send(
                from,
                &WireMessage::NodeIdHandshake {
                    query: Some(cookie),
                    response: None,
                },
            );
        }
    }

    fn handle_vote(&self, from: SocketAddr, vote: Vote) {
        let (code, vote) = self.pipeline.process(vote);
        let vote = match (code, vote) {
            (VoteCode::Vote, Some(vote)) => vote,
            _ => {
                trace!("vote from {} dropped: {:?}", from, code);
                return;
            }
        };
        let now = unix_time();
        self.online.lock().observe(vote.account, now);
        let weight = self.db.read().weight(&vote.account);
        {
            let mut peers = self.peers.lock();
            peers.insert(from, PROTOCOL_VERSION, now);
            peers.set_probable_rep(&from, vote.account, weight);
        }

        // Blocks named by the vote that sit in the ledger without an
        // election may get one.
        let mut startable: Vec<(Block, Account)> = Vec::new();
        if self.config.start_elections_for_votes {
            let db = self.db.read();
            for hash in &vote.hashes {
                if let Some(stored) = db.block(hash) {
                    startable.push((stored.block, stored.sideband.account));
                }
            }
        }
        let confirmed = {
            let mut elections = self.elections.lock();
            for (block, account) in startable {
                elections.start(block, account);
            }
            elections.vote(&vote)
        };

        let _ = self.block_tx.send_sync(Message::VoteObserved {
            vote: (*vote).clone(),
        });
        for winner in confirmed {
            let _ = self.block_tx.send_sync(Message::ForkResolve { winner });
        }
    }
}

impl<D: Db> crate::net::udp::InboundHandler for Inbound<D> {
    fn handle(&self, from: SocketAddr, message: WireMessage) {
        // Never talk to ourselves: loops would pollute the peer table.
        if is_same_node(&from, &self.udp.local_endpoint()) {
            return;
        }
        match message {
            WireMessage::Keepalive { peers } => self.handle_keepalive(from, peers),
            WireMessage::Publish { block } => {
                self.peers.lock().insert(from, PROTOCOL_VERSION, unix_time());
                self.enqueue_block(block);
            }
            WireMessage::ConfirmReq { payload } => {
                self.peers.lock().insert(from, PROTOCOL_VERSION, unix_time());
                match payload {
                    ConfirmReqPayload::Block(block) => self.enqueue_block(block),
                    ConfirmReqPayload::Root { previous, .. } => {
                        trace!("confirm_req for root {} from {}", previous, from);
                    }
                }
            }
            WireMessage::ConfirmAck { vote } => self.handle_vote(from, vote),
            WireMessage::NodeIdHandshake { query, response } => {
                self.handle_handshake(from, query, response)
            }
            // Bulk traffic belongs on the TCP channel.
            other => {
                trace!(
                    "ignoring {:?} datagram from {}",
                    other.message_type(),
                    from
                );
            }
        }
    }
}
