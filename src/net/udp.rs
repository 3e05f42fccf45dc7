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

//! Datagram channel: one receive loop feeding the buffer pool, a configured
//! number of parse workers draining it, and a shared outbound path.

use super::{
    buffer::{Slot, UdpBuffers, SLOT_SIZE},
    message::WireMessage,
    Outbound,
};
use crate::{config::Network, Error, ErrorKind, Result};
use async_std::{net::UdpSocket, task};
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::JoinHandle;

/// Consumer of decoded inbound traffic.
pub trait InboundHandler: Send + Sync + 'static {
    fn handle(&self, from: SocketAddr, message: WireMessage);
}

/// UDP socket plus the buffer pool between its receive loop and the parse
/// workers.
pub struct UdpChannel {
    socket: Arc<UdpSocket>,
    network: Arc<Network>,
    buffers: Arc<UdpBuffers>,
    stopped: Arc<AtomicBool>,
    local: SocketAddr,
    /// Undecodable or off-network datagrams.
    pub bad_datagrams: Arc<AtomicU64>,
    workers: crate::base::Mutex<Vec<JoinHandle<()>>>,
}

impl UdpChannel {
    /// Bind the node socket. Port zero picks an ephemeral port.
    pub fn bind(network: Arc<Network>, port: u16, buffer_count: usize) -> Result<Self> {
        let socket = task::block_on(UdpSocket::bind(("127.0.0.1", port)))
            .map_err(|err| Error::new_ext(ErrorKind::Other, err))?;
        let local = socket
            .local_addr()
            .map_err(|err| Error::new_ext(ErrorKind::Other, err))?;
        Ok(UdpChannel {
            socket: Arc::new(socket),
            network,
            buffers: Arc::new(UdpBuffers::new(buffer_count)),
            stopped: Arc::new(AtomicBool::new(false)),
            local,
            bad_datagrams: Arc::new(AtomicU64::new(0)),
            workers: crate::base::Mutex::new(Vec::new()),
        })
    }

    pub fn local_endpoint(&self) -> SocketAddr {
        self.local
    }

    /// Spawn the receive loop and `worker_count` parse workers feeding
    /// `handler`.
    pub fn start<H: InboundHandler>(&self, handler: Arc<H>, worker_count: usize) {
        let socket = self.socket.clone();
        let buffers = self.buffers.clone();
        let stopped = self.stopped.clone();
        let receiver = std::thread::spawn(move || {
            task::block_on(async move {
                loop {
                    let mut slot = match buffers.allocate() {
                        Some(slot) => slot,
                        None => break,
                    };
                    match socket.recv_from(&mut slot.data).await {
                        Ok((len, endpoint)) => {
                            if stopped.load(Ordering::Relaxed) {
                                break;
                            }
                            if len == 0 || len > SLOT_SIZE {
                                buffers.release(slot);
                                continue;
                            }
                            slot.len = len;
                            slot.endpoint = endpoint;
                            buffers.enqueue(slot);
                        }
                        Err(err) => {
                            if stopped.load(Ordering::Relaxed) {
                                break;
                            }
                            debug!("udp receive error: {}", err);
                            buffers.release(slot);
                        }
                    }
                }
            });
        });
        let mut workers = self.workers.lock();
        workers.push(receiver);

        for _ in 0..worker_count.max(1) {
            let buffers = self.buffers.clone();
            let network = self.network.clone();
            let handler = handler.clone();
            let bad = self.bad_datagrams.clone();
            let worker = std::thread::spawn(move || {
                while let Some(slot) = buffers.dequeue() {
                    Self::parse_one(&network, &handler, &slot, &bad);
                    buffers.release(slot);
                }
            });
            workers.push(worker);
        }
    }

    fn parse_one<H: InboundHandler>(
        network: &Network,
        handler: &Arc<H>,
        slot: &Slot,
        bad: &AtomicU64,
    ) {
        match WireMessage::decode(network, slot.payload()) {
            Ok(message) => handler.handle(slot.endpoint, message),
            Err(err) => {
                bad.fetch_add(1, Ordering::Relaxed);
                trace!("bad datagram from {}: {}", slot.endpoint, err);
            }
        }
    }

    /// Stop the channel: refuse new buffers, wake every worker and unblock
    /// the receive loop with a datagram to self.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        self.buffers.stop();
        let socket = self.socket.clone();
        let local = self.local;
        task::block_on(async move {
            let _ = socket.send_to(&[0], local).await;
        });
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
    }

    pub fn overflows(&self) -> u64 {
        self.buffers.overflows.load(Ordering::Relaxed)
    }
}

impl Outbound for UdpChannel {
    fn send(&self, endpoint: SocketAddr, message: &WireMessage) {
        if self.stopped.load(Ordering::Relaxed) {
            return;
        }
        let buf = message.encode(&self.network);
        if buf.len() > SLOT_SIZE {
            warn!("refusing oversize datagram ({} bytes)", buf.len());
            return;
        }
        let socket = self.socket.clone();
        task::spawn(async move {
            if let Err(err) = socket.send_to(&buf, endpoint).await {
                trace!("udp send to {} failed: {}", endpoint, err);
            }
        });
    }
}
