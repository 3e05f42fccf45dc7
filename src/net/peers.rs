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

//! Known peers with contact bookkeeping, node-identity handshake state and
//! probable-representative hints gathered by the rep crawler.

use super::reserved_address;
use crate::{
    base::schema::{Account, Amount},
    crypto::Signature,
};
use rand::{seq::SliceRandom, Rng};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Hard cap on tracked peers.
const MAX_PEERS: usize = 4096;

/// Seconds between rep-crawl probes to the same peer.
const REP_REQUEST_INTERVAL: u64 = 60;

/// Node-identity handshake progress for one peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    /// Known, not yet challenged.
    None,
    /// We sent `cookie` and wait for the signed response.
    Sent { cookie: [u8; 32] },
    /// Peer proved its node identity.
    Done { node_id: Account },
}

#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub endpoint: SocketAddr,
    pub network_version: u8,
    /// Unix seconds of the last datagram from this peer.
    pub last_contact: u64,
    /// Unix seconds of our last rep-crawl probe.
    pub last_rep_request: u64,
    pub probable_rep: Option<Account>,
    pub rep_weight: Amount,
    pub handshake: HandshakeState,
}

/// Bounded endpoint -> peer map.
pub struct PeerTable {
    peers: HashMap<SocketAddr, PeerInfo>,
    allow_local: bool,
    cutoff: Duration,
}

impl PeerTable {
    pub fn new(allow_local: bool, cutoff: Duration) -> Self {
        PeerTable {
            peers: HashMap::new(),
            allow_local,
            cutoff,
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, endpoint: &SocketAddr) -> bool {
        self.peers.contains_key(endpoint)
    }

    pub fn get(&self, endpoint: &SocketAddr) -> Option<&PeerInfo> {
        self.peers.get(endpoint)
    }

    /// Admit or refresh a peer. Reserved addresses and table overflow are
    /// refused.
    pub fn insert(&mut self, endpoint: SocketAddr, network_version: u8, now: u64) -> bool {
        if reserved_address(&endpoint, self.allow_local) {
            return false;
        }
        if let Some(info) = self.peers.get_mut(&endpoint) {
            info.last_contact = now;
            info.network_version = network_version;
            return true;
        }
        if self.peers.len() >= MAX_PEERS {
            return false;
        }
        self.peers.insert(
            endpoint,
            PeerInfo {
                endpoint,
                network_version,
                last_contact: now,
                last_rep_request: 0,
                probable_rep: None,
                rep_weight: Amount::zero(),
                handshake: HandshakeState::None,
            },
        );
        debug!("peer {} admitted", endpoint);
        true
    }

    /// Drop a peer after a protocol violation.
    pub fn punish(&mut self, endpoint: &SocketAddr) {
        if self.peers.remove(endpoint).is_some() {
            debug!("peer {} evicted for misbehavior", endpoint);
        }
    }

    /// Drop peers silent past the keepalive window.
    pub fn purge(&mut self, now: u64) {
        let cutoff = self.cutoff.as_secs();
        self.peers
            .retain(|_, info| now.saturating_sub(info.last_contact) <= cutoff);
    }

    /// Up to `n` randomly selected live peers.
    pub fn list(&self, n: usize, now: u64) -> Vec<SocketAddr> {
        let cutoff = self.cutoff.as_secs();
        let mut live: Vec<SocketAddr> = self
            .peers
            .values()
            .filter(|info| now.saturating_sub(info.last_contact) <= cutoff)
            .map(|info| info.endpoint)
            .collect();
        live.shuffle(&mut rand::thread_rng());
        live.truncate(n);
        live
    }

    /// Random fan-out for the periodic keepalive: square root of the table
    /// size, at least two.
    pub fn keepalive_targets(&self, now: u64) -> Vec<SocketAddr> {
        let count = ((self.peers.len() as f64).sqrt() as usize).max(2);
        self.list(count, now)
    }

    /// Start a handshake round: remember and return the cookie to send.
    pub fn begin_handshake(&mut self, endpoint: &SocketAddr) -> Option<[u8; 32]> {
        let info = self.peers.get_mut(endpoint)?;
        let cookie: [u8; 32] = rand::thread_rng().gen();
        info.handshake = HandshakeState::Sent { cookie };
        Some(cookie)
    }

    /// Complete a handshake: the response must carry a valid signature of
    /// the cookie we sent. Fails the peer on a bad proof.
    pub fn handshake_response(
        &mut self,
        endpoint: &SocketAddr,
        node_id: Account,
        signature: &Signature,
    ) -> bool {
        let info = match self.peers.get_mut(endpoint) {
            Some(info) => info,
            None => return false,
        };
        let cookie = match info.handshake {
            HandshakeState::Sent { cookie } => cookie,
            _ => return false,
        };
        let valid = node_id
            .public_key()
            .map(|key| key.verify(&cookie, signature))
            .unwrap_or(false);
        if valid {
            info.handshake = HandshakeState::Done { node_id };
            debug!("peer {} handshake complete", endpoint);
            true
        } else {
            self.punish(endpoint);
            false
        }
    }

    /// True while a cookie is outstanding for the peer.
    pub fn handshake_sent(&self, endpoint: &SocketAddr) -> bool {
        matches!(
            self.peers.get(endpoint).map(|info| &info.handshake),
            Some(HandshakeState::Sent { .. })
        )
    }

    /// True once the peer proved its node identity; only such peers are
    /// queried by the rep crawler.
    pub fn handshaked(&self, endpoint: &SocketAddr) -> bool {
        matches!(
            self.peers.get(endpoint).map(|info| &info.handshake),
            Some(HandshakeState::Done { .. })
        )
    }

    /// Record the representative a peer answered a crawl probe with.
    pub fn set_probable_rep(&mut self, endpoint: &SocketAddr, rep: Account, weight: Amount) {
        if let Some(info) = self.peers.get_mut(endpoint) {
            info.probable_rep = Some(rep);
            info.rep_weight = weight;
        }
    }

    /// Handshaked peers due for a rep-crawl probe; marks them probed.
    pub fn rep_crawl_targets(&mut self, now: u64, max: usize) -> Vec<SocketAddr> {
        let mut due: Vec<SocketAddr> = self
            .peers
            .values()
            .filter(|info| {
                matches!(info.handshake, HandshakeState::Done { .. })
                    && now.saturating_sub(info.last_rep_request) >= REP_REQUEST_INTERVAL
            })
            .map(|info| info.endpoint)
            .collect();
        due.shuffle(&mut rand::thread_rng());
        due.truncate(max);
        for endpoint in &due {
            if let Some(info) = self.peers.get_mut(endpoint) {
                info.last_rep_request = now;
            }
        }
        due
    }

    /// Peers currently believed to represent voting stake, heaviest known
    /// first. Used to aim confirm requests.
    pub fn representative_peers(&self, max: usize) -> Vec<SocketAddr> {
        let mut reps: Vec<&PeerInfo> = self
            .peers
            .values()
            .filter(|info| info.probable_rep.is_some())
            .collect();
        reps.sort_by(|a, b| b.rep_weight.cmp(&a.rep_weight));
        reps.iter().take(max).map(|info| info.endpoint).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::net::parse_endpoint;

    fn table() -> PeerTable {
        PeerTable::new(true, Duration::from_secs(300))
    }

    fn peer(tag: u8) -> SocketAddr {
        parse_endpoint(&format!("10.0.0.{}:7075", tag)).unwrap()
    }

    #[test]
    fn insert_and_refresh() {
        let mut peers = table();

        assert!(peers.insert(peer(1), 7, 100));
        assert!(peers.insert(peer(1), 7, 200));

        assert_eq!(peers.len(), 1);
        assert_eq!(peers.get(&peer(1)).unwrap().last_contact, 200);
    }

    #[test]
    fn reserved_addresses_refused() {
        let mut strict = PeerTable::new(false, Duration::from_secs(300));

        assert!(!strict.insert(parse_endpoint("127.0.0.1:7075").unwrap(), 7, 100));
        assert!(!strict.insert(parse_endpoint("224.0.0.1:7075").unwrap(), 7, 100));
        assert!(strict.insert(peer(1), 7, 100));
    }

    #[test]
    fn purge_drops_silent_peers() {
        let mut peers = table();
        peers.insert(peer(1), 7, 100);
        peers.insert(peer(2), 7, 350);

        peers.purge(500);

        assert!(!peers.contains(&peer(1)));
        assert!(peers.contains(&peer(2)));
    }

    #[test]
    fn list_respects_liveness_and_bound() {
        let mut peers = table();
        for tag in 1..=10 {
            peers.insert(peer(tag), 7, 100);
        }
        peers.insert(peer(11), 7, 500);

        let live = peers.list(5, 500);
        assert_eq!(live.len(), 5);

        // Far in the future only the freshest peer is live.
        let live = peers.list(5, 100 + 301);
        assert_eq!(live, vec![peer(11)]);
    }

    #[test]
    fn handshake_good_proof() {
        let mut peers = table();
        let node_key = KeyPair::from_random();
        peers.insert(peer(1), 7, 100);

        let cookie = peers.begin_handshake(&peer(1)).unwrap();
        assert!(!peers.handshaked(&peer(1)));

        let signature = node_key.sign(&cookie);
        let accepted =
            peers.handshake_response(&peer(1), Account::from(node_key.public_key()), &signature);

        assert!(accepted);
        assert!(peers.handshaked(&peer(1)));
    }

    #[test]
    fn handshake_bad_proof_evicts() {
        let mut peers = table();
        let node_key = KeyPair::from_random();
        peers.insert(peer(1), 7, 100);

        let _cookie = peers.begin_handshake(&peer(1)).unwrap();
        let forged = node_key.sign(b"something else");
        let accepted =
            peers.handshake_response(&peer(1), Account::from(node_key.public_key()), &forged);

        assert!(!accepted);
        assert!(!peers.contains(&peer(1)));
    }

    #[test]
    fn unsolicited_handshake_response_ignored() {
        let mut peers = table();
        let node_key = KeyPair::from_random();
        peers.insert(peer(1), 7, 100);

        let signature = node_key.sign(&[0; 32]);
        let accepted =
            peers.handshake_response(&peer(1), Account::from(node_key.public_key()), &signature);

        assert!(!accepted);
        assert!(peers.contains(&peer(1)));
    }

    #[test]
    fn rep_crawl_cycle() {
        let mut peers = table();
        let node_key = KeyPair::from_random();
        peers.insert(peer(1), 7, 100);
        let cookie = peers.begin_handshake(&peer(1)).unwrap();
        peers.handshake_response(
            &peer(1),
            Account::from(node_key.public_key()),
            &node_key.sign(&cookie),
        );
        // A second, un-handshaked peer is not crawled.
        peers.insert(peer(2), 7, 100);

        let due = peers.rep_crawl_targets(1000, 8);
        assert_eq!(due, vec![peer(1)]);

        // Probe recorded; not due again within the interval.
        assert!(peers.rep_crawl_targets(1001, 8).is_empty());

        let rep = Account::new([5; 32]);
        peers.set_probable_rep(&peer(1), rep, Amount(70));
        assert_eq!(peers.representative_peers(8), vec![peer(1)]);
        assert_eq!(peers.get(&peer(1)).unwrap().probable_rep, Some(rep));
    }
}
