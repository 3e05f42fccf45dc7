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

//! Bootstrap engine: the TCP client driving legacy and lazy pulls, and the
//! TCP server answering them.
//!
//! Bootstrap runs outside the hot path. Attempts are serialized on a
//! worker thread; failures rotate to another peer up to the configured
//! retry budget.

pub mod client;
pub mod lazy;
pub mod server;

use crate::{
    base::{schema::Account, unix_time, Mutex, RwLock},
    blockchain::{BlockRequestSender, Message},
    config::{Network, NodeConfig},
    crypto::Hash,
    db::Db,
    net::{
        message::{Header, MessageType, WireMessage, HEADER_LEN},
        PeerTable,
    },
    Error, ErrorKind, Result,
};
use async_std::net::{TcpListener, TcpStream};
use async_std::task;
use futures::io::AsyncReadExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Commands accepted by the bootstrap worker.
#[derive(Debug, Clone)]
pub enum BootstrapCommand {
    /// Frontier scan + pulls + pushes, optionally against a fixed peer.
    Legacy { peer: Option<SocketAddr> },
    /// Hash-rooted lazy walk.
    Lazy { hash: Hash },
    /// Lazy walk seeded from wallet accounts.
    Wallet { accounts: Vec<Account> },
    Stop,
}

/// Everything an attempt needs, bundled.
pub(crate) struct BootstrapContext<D: Db> {
    pub config: Arc<NodeConfig>,
    pub network: Arc<Network>,
    pub db: Arc<RwLock<D>>,
    pub block_tx: BlockRequestSender,
    pub peers: Arc<Mutex<PeerTable>>,
}

impl<D: Db> Clone for BootstrapContext<D> {
    fn clone(&self) -> Self {
        BootstrapContext {
            config: self.config.clone(),
            network: self.network.clone(),
            db: self.db.clone(),
            block_tx: self.block_tx.clone(),
            peers: self.peers.clone(),
        }
    }
}

/// Open a bootstrap connection under the configured deadline.
pub(crate) async fn connect(peer: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    async_std::future::timeout(timeout, TcpStream::connect(peer))
        .await
        .map_err(|_| Error::new(ErrorKind::PeerTimeout))?
        .map_err(Error::from)
}

/// Client-side service: one worker thread draining bootstrap commands.
pub struct BootstrapService {
    tx_chan: crate::channel::Sender<BootstrapCommand>,
    handle: Option<JoinHandle<()>>,
}

impl BootstrapService {
    /// Spawn the worker around an externally created command channel, so
    /// other services can hold the sender before this one exists.
    pub fn new<D: Db>(
        config: Arc<NodeConfig>,
        network: Arc<Network>,
        db: Arc<RwLock<D>>,
        block_tx: BlockRequestSender,
        peers: Arc<Mutex<PeerTable>>,
        tx_chan: crate::channel::Sender<BootstrapCommand>,
        rx_chan: crate::channel::Receiver<BootstrapCommand>,
    ) -> Self {
        let ctx = BootstrapContext {
            config,
            network,
            db,
            block_tx,
            peers,
        };
        let handle = std::thread::spawn(move || {
            while let Ok(command) = rx_chan.recv_sync() {
                match command {
                    BootstrapCommand::Stop => break,
                    command => run_attempt(&ctx, command),
                }
            }
            debug!("bootstrap worker stopped");
        });
        BootstrapService {
            tx_chan,
            handle: Some(handle),
        }
    }

    pub fn request_channel(&self) -> crate::channel::Sender<BootstrapCommand> {
        self.tx_chan.clone()
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.tx_chan.send_sync(BootstrapCommand::Stop);
            self.tx_chan.close();
            let _ = handle.join();
        }
    }
}

impl Drop for BootstrapService {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run one command, rotating over candidate peers up to the retry budget.
fn run_attempt<D: Db>(ctx: &BootstrapContext<D>, command: BootstrapCommand) {
    let fixed_peer = match &command {
        BootstrapCommand::Legacy { peer } => *peer,
        _ => None,
    };
    let candidates: Vec<SocketAddr> = match fixed_peer {
        Some(peer) => vec![peer],
        None => ctx
            .peers
            .lock()
            .list(ctx.config.bootstrap_retries, unix_time()),
    };
    if candidates.is_empty() {
        warn!("bootstrap attempt without candidate peers");
        return;
    }
    for peer in candidates {
        let result = task::block_on(async {
            match &command {
                BootstrapCommand::Legacy { .. } => client::run_legacy(ctx, peer)
                    .await
                    .map(|outcome| outcome.pulled),
                BootstrapCommand::Lazy { hash } => lazy::run_lazy(ctx, peer, *hash).await,
                BootstrapCommand::Wallet { accounts } => {
                    lazy::run_wallet(ctx, peer, accounts.clone()).await
                }
                BootstrapCommand::Stop => Ok(0),
            }
        });
        match result {
            Ok(pulled) => {
                info!("bootstrap attempt against {} pulled {} blocks", peer, pulled);
                return;
            }
            Err(err) => {
                warn!(
                    "bootstrap attempt against {} failed: {}",
                    peer,
                    err.to_string_full()
                );
            }
        }
    }
}

/// Server-side service: accept loop answering frontier and pull requests.
pub struct BootstrapListener {
    local: SocketAddr,
    stopped: Arc<std::sync::atomic::AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl BootstrapListener {
    /// Bind the TCP side on `port` (zero picks an ephemeral port) and start
    /// serving.
    pub fn start<D: Db>(
        config: Arc<NodeConfig>,
        network: Arc<Network>,
        db: Arc<RwLock<D>>,
        block_tx: BlockRequestSender,
        port: u16,
    ) -> Result<Self> {
        let listener = task::block_on(TcpListener::bind(("127.0.0.1", port)))
            .map_err(|err| Error::new_ext(ErrorKind::Other, err))?;
        let local = listener
            .local_addr()
            .map_err(|err| Error::new_ext(ErrorKind::Other, err))?;
        let stopped = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let accept_stopped = stopped.clone();
        let handle = std::thread::spawn(move || {
            task::block_on(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, peer)) => {
                            if accept_stopped.load(std::sync::atomic::Ordering::Relaxed) {
                                break;
                            }
                            trace!("bootstrap connection from {}", peer);
                            let config = config.clone();
                            let network = network.clone();
                            let db = db.clone();
                            let block_tx = block_tx.clone();
                            task::spawn(async move {
                                if let Err(err) =
                                    serve_connection(config, network, db, block_tx, stream).await
                                {
                                    trace!("bootstrap serve error: {}", err.to_string_full());
                                }
                            });
                        }
                        Err(err) => {
                            if accept_stopped.load(std::sync::atomic::Ordering::Relaxed) {
                                break;
                            }
                            debug!("bootstrap accept error: {}", err);
                        }
                    }
                }
            });
        });
        Ok(BootstrapListener {
            local,
            stopped,
            handle: Some(handle),
        })
    }

    pub fn local_endpoint(&self) -> SocketAddr {
        self.local
    }

    pub fn stop(&mut self) {
        self.stopped
            .store(true, std::sync::atomic::Ordering::Relaxed);
        // Unblock the acceptor with a throwaway connection.
        let local = self.local;
        let _ = task::block_on(async move {
            let _ = TcpStream::connect(local).await;
        });
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BootstrapListener {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Serve one client connection; multiple requests may arrive in sequence.
async fn serve_connection<D: Db>(
    config: Arc<NodeConfig>,
    network: Arc<Network>,
    db: Arc<RwLock<D>>,
    block_tx: BlockRequestSender,
    mut stream: TcpStream,
) -> Result<()> {
    let timeout = config.tcp_io_timeout;
    loop {
        let mut header_buf = [0_u8; HEADER_LEN];
        match async_std::future::timeout(timeout, stream.read_exact(&mut header_buf)).await {
            Ok(Ok(())) => {}
            // EOF or deadline: the client is done with us.
            _ => return Ok(()),
        }
        let header = Header::decode(&network, &header_buf)?;
        match header.message_type {
            MessageType::FrontierReq => {
                let mut payload = [0_u8; 40];
                read_payload(&mut stream, &mut payload, timeout).await?;
                let message = WireMessage::decode_payload(&header, &payload)?;
                if let WireMessage::FrontierReq { start, age, count } = message {
                    let mut out = stream.clone();
                    server::frontier_req(&db, start, age, count, unix_time(), &mut out).await?;
                }
            }
            MessageType::BulkPull => {
                let wanted = if header.extensions & 1 != 0 { 68 } else { 64 };
                let mut payload = vec![0_u8; wanted];
                read_payload(&mut stream, &mut payload, timeout).await?;
                let message = WireMessage::decode_payload(&header, &payload)?;
                if let WireMessage::BulkPull { start, end, count } = message {
                    let mut out = stream.clone();
                    server::bulk_pull(&db, start, end, count, &mut out).await?;
                }
            }
            MessageType::BulkPullAccount => {
                let mut payload = [0_u8; 49];
                read_payload(&mut stream, &mut payload, timeout).await?;
                let message = WireMessage::decode_payload(&header, &payload)?;
                if let WireMessage::BulkPullAccount {
                    account,
                    minimum,
                    flags,
                } = message
                {
                    let mut out = stream.clone();
                    server::bulk_pull_account(&db, account, minimum, flags, &mut out).await?;
                }
            }
            MessageType::BulkPush => {
                // The peer streams blocks at us until the sentinel.
                while let Some(block) = client::read_block(&mut stream, timeout).await? {
                    let rx = block_tx
                        .send(Message::ProcessBlock {
                            block,
                            arrival: unix_time(),
                            verified: crate::base::schema::SignatureState::Unknown,
                        })
                        .await
                        .map_err(|_| Error::new(ErrorKind::Stopped))?;
                    let _ = rx.recv().await;
                }
            }
            _ => {
                // Datagram-only message over the bulk channel.
                return Err(Error::new(ErrorKind::MalformedData));
            }
        }
    }
}

async fn read_payload(
    stream: &mut TcpStream,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<()> {
    async_std::future::timeout(timeout, stream.read_exact(buf))
        .await
        .map_err(|_| Error::new(ErrorKind::PeerTimeout))?
        .map_err(Error::from)
}
