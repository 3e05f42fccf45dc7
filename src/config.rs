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

//! Node configuration and per-network constants.
//!
//! Everything the protocol fixes globally (magic bytes, genesis, work
//! threshold, epoch sentinel) lives in a `Network` value handed to
//! constructors, so tests can run a throwaway network with the same code
//! paths as the public ones.

use crate::{
    base::schema::{Account, Amount, Block, Link, OpenBlock},
    crypto::{Hash, Hashable, KeyPair, Signature},
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Network identifier carried in the second magic byte.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum NetworkId {
    Test,
    Beta,
    Live,
}

impl NetworkId {
    pub fn magic(&self) -> [u8; 2] {
        let id = match self {
            NetworkId::Test => b'A',
            NetworkId::Beta => b'B',
            NetworkId::Live => b'C',
        };
        [b'V', id]
    }
}

/// Highest protocol version this build speaks.
pub const PROTOCOL_VERSION: u8 = 7;
/// Oldest protocol version still accepted (first with node-id handshake).
pub const PROTOCOL_VERSION_MIN: u8 = 4;

/// Per-network protocol constants.
pub struct Network {
    pub id: NetworkId,
    /// Proof-of-work acceptance threshold.
    pub work_threshold: u64,
    /// The axiomatic first block of the distribution account.
    pub genesis: Block,
    pub genesis_account: Account,
    /// State block link value flagging an epoch upgrade.
    pub epoch_link: Link,
    /// Only this key may sign epoch upgrade blocks.
    pub epoch_signer: Account,
}

/// Epoch sentinel: ASCII "epoch v1 block" left-aligned in 32 bytes.
fn epoch_link_sentinel() -> Link {
    let mut bytes = [0_u8; 32];
    let tag = b"epoch v1 block";
    bytes[..tag.len()].copy_from_slice(tag);
    Link(Hash::new(bytes))
}

impl Network {
    /// Ephemeral network for unit and integration tests: deterministic
    /// genesis key, near-trivial work.
    pub fn test() -> Arc<Network> {
        Self::with_genesis_keypair(NetworkId::Test, &KeyPair::from_seed(&[0x42; 32]), 0xff00_0000_0000_0000)
    }

    /// Public beta network.
    pub fn beta() -> Arc<Network> {
        Self::from_genesis_record(NetworkId::Beta, BETA_GENESIS, 0xfffffc00_0000_0000)
    }

    /// Public live network.
    pub fn live() -> Arc<Network> {
        Self::from_genesis_record(NetworkId::Live, LIVE_GENESIS, 0xffffffc0_0000_0000)
    }

    fn with_genesis_keypair(id: NetworkId, keypair: &KeyPair, work_threshold: u64) -> Arc<Network> {
        let account = Account::from(keypair.public_key());
        let mut genesis = Block::Open(OpenBlock {
            source: account.as_root(),
            representative: account,
            account,
            signature: Signature::zero(),
            work: 0,
        });
        genesis.sign(keypair);
        // Genesis work is bound to the account; solve it once here.
        let mut nonce = 0_u64;
        while !crate::crypto::work_valid(account.as_bytes(), nonce, work_threshold) {
            nonce += 1;
        }
        genesis.set_work(nonce);
        Arc::new(Network {
            id,
            work_threshold,
            genesis,
            genesis_account: account,
            epoch_link: epoch_link_sentinel(),
            epoch_signer: account,
        })
    }

    fn from_genesis_record(id: NetworkId, record: GenesisRecord, work_threshold: u64) -> Arc<Network> {
        let account = Account::from_bytes(&hex::decode(record.account).expect("genesis constant"))
            .expect("genesis constant");
        let genesis = Block::Open(OpenBlock {
            source: account.as_root(),
            representative: account,
            account,
            signature: Signature::from_bytes(&hex::decode(record.signature).expect("genesis constant"))
                .expect("genesis constant"),
            work: record.work,
        });
        Arc::new(Network {
            id,
            work_threshold,
            genesis,
            genesis_account: account,
            epoch_link: epoch_link_sentinel(),
            epoch_signer: account,
        })
    }

    pub fn genesis_hash(&self) -> Hash {
        self.genesis.hash()
    }

    /// Total issuance: the whole supply sits on the genesis account.
    pub fn genesis_amount(&self) -> Amount {
        Amount::MAX
    }
}

/// Published genesis constants for the non-ephemeral networks.
struct GenesisRecord {
    account: &'static str,
    signature: &'static str,
    work: u64,
}

const LIVE_GENESIS: GenesisRecord = GenesisRecord {
    account: "991cf190094c00f0b68e2e5f75f6bee95a2e0bd93ceaa4a6734db9f19b728948",
    signature: "9f0c933c8ade004d808ea1985fa746a7e95ba2a38f867640f53ec8f180bdfe9e2c1268dead7c2664f356e37aba362bc58e46dba03e523a7b5a19e4b6eb12bb02",
    work: 0x62f05417dd3fb691,
};

const BETA_GENESIS: GenesisRecord = GenesisRecord {
    account: "a59a47cc4f593e75ae9ad653fda9358e2f7898d9acc8c60e80d0495ce20fba9f",
    signature: "a726490e3325e4fa59c1c900d5b6eebb15fe13d99f49d475b93f0aacc5635929a0614cf3892764a04d1c6732a0d716ffeb254d4154c6f544d11e6630f201450b",
    work: 0xa870b0e9331cf477,
};

/// Runtime configuration accepted by the node constructor.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub data_path: PathBuf,
    pub listen_port: u16,
    /// Seed peers, `address:port`.
    pub peers: Vec<String>,
    /// Representatives this node preferentially crawls and republishes to.
    pub representatives: Vec<Account>,
    /// Quorum percent of the online stake.
    pub online_weight_quorum: u8,
    /// Floor for the online stake estimate.
    pub online_weight_minimum: Amount,
    pub io_threads: usize,
    pub work_threads: usize,
    /// Sends below this amount are ignored by wallet-facing scans.
    pub receive_minimum: Amount,
    pub bootstrap_connections: usize,
    /// Per-request block cap of the lazy bootstrap walker.
    pub lazy_max_pull_count: u32,
    /// Distinct exhausted walks after which a lazy attempt gives up.
    pub lazy_stopped_cap: usize,
    pub bootstrap_retries: usize,
    /// Allow side-effecting verbs on the request surface.
    pub enable_control: bool,
    /// Allow signing of caller-provided raw hashes in block_create.
    pub enable_sign_hash: bool,
    /// Admit loopback peers; only sensible for tests.
    pub allow_local_peers: bool,
    pub keepalive_interval: Duration,
    /// Peers silent for longer are dropped from the table.
    pub keepalive_cutoff: Duration,
    pub announcement_interval: Duration,
    /// Announcement rounds before an unconfirmed election is pruned.
    pub announcement_cutoff: u32,
    pub max_rollback_depth: u64,
    pub unchecked_cap: usize,
    pub queue_high_water: usize,
    pub queue_low_water: usize,
    /// Datagram pool slots.
    pub receive_buffer_count: usize,
    /// Read deadline for bootstrap sockets.
    pub tcp_io_timeout: Duration,
    /// Open an election when a vote names a block we hold unconfirmed.
    pub start_elections_for_votes: bool,
    /// Depth hint forwarded to the request translator.
    pub max_json_depth: u8,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            data_path: PathBuf::from("data"),
            listen_port: 7075,
            peers: Vec::new(),
            representatives: Vec::new(),
            online_weight_quorum: 50,
            online_weight_minimum: Amount(60_000 * 1_000_000_000_000_000_000_000_000_000_000),
            io_threads: 4,
            work_threads: num_threads(),
            receive_minimum: Amount(1_000_000_000_000_000_000_000_000),
            bootstrap_connections: 4,
            lazy_max_pull_count: 512,
            lazy_stopped_cap: 1024,
            bootstrap_retries: 16,
            enable_control: false,
            enable_sign_hash: false,
            allow_local_peers: false,
            keepalive_interval: Duration::from_secs(60),
            keepalive_cutoff: Duration::from_secs(300),
            announcement_interval: Duration::from_millis(500),
            announcement_cutoff: 20,
            max_rollback_depth: 128,
            unchecked_cap: 65_536,
            queue_high_water: 8_192,
            queue_low_water: 4_096,
            receive_buffer_count: 512,
            tcp_io_timeout: Duration::from_secs(10),
            start_elections_for_votes: true,
            max_json_depth: 20,
        }
    }
}

fn num_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl NodeConfig {
    /// Configuration tuned for in-process test nodes: ephemeral port,
    /// loopback peers allowed, short timers.
    pub fn test() -> Self {
        NodeConfig {
            listen_port: 0,
            enable_control: true,
            enable_sign_hash: true,
            allow_local_peers: true,
            online_weight_minimum: Amount::zero(),
            receive_minimum: Amount(1),
            keepalive_interval: Duration::from_millis(200),
            keepalive_cutoff: Duration::from_secs(5),
            announcement_interval: Duration::from_millis(16),
            tcp_io_timeout: Duration::from_secs(1),
            ..Default::default()
        }
    }
}
