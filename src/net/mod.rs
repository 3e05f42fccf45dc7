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

//! Node-to-node networking: wire codec, datagram channel, peer table.

pub mod buffer;
pub mod message;
pub mod peers;
pub mod udp;

pub use message::{Header, MessageType, WireMessage};
pub use peers::PeerTable;
pub use udp::UdpChannel;

use crate::base::schema::Block;
use crate::{Error, ErrorKind, Result};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// Commands other components push to the network service.
#[derive(Debug, Clone)]
pub enum NetCommand {
    /// Flood a block to a fan-out of live peers.
    Publish(Block),
    /// Solicit votes for a block from a sample of peers.
    ConfirmReq(Block),
    /// Send a keepalive to one endpoint (and admit it to the table).
    Keepalive(SocketAddr),
}

/// Seam for components that emit wire messages, so they can be tested with
/// a recording stub instead of a socket.
pub trait Outbound: Send + Sync {
    fn send(&self, endpoint: SocketAddr, message: &WireMessage);
}

/// Parse `address:port` where the address is an unbracketed IPv6 (or
/// dotted IPv4) literal. The port is whatever follows the last colon.
pub fn parse_endpoint(input: &str) -> Result<SocketAddr> {
    let (addr, port) = input
        .rsplit_once(':')
        .ok_or_else(|| Error::new(ErrorKind::MalformedData))?;
    if addr.is_empty() || port.is_empty() {
        return Err(Error::new(ErrorKind::MalformedData));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| Error::new(ErrorKind::MalformedData))?;
    if let Ok(v6) = addr.parse::<Ipv6Addr>() {
        return Ok(SocketAddr::new(IpAddr::V6(v6), port));
    }
    if let Ok(v4) = addr.parse::<std::net::Ipv4Addr>() {
        return Ok(SocketAddr::new(IpAddr::V4(v4), port));
    }
    Err(Error::new(ErrorKind::MalformedData))
}

/// Map any endpoint to its IPv6 form, the only representation that travels
/// in keepalives.
pub fn map_endpoint_v6(endpoint: SocketAddr) -> (Ipv6Addr, u16) {
    match endpoint {
        SocketAddr::V4(v4) => (v4.ip().to_ipv6_mapped(), v4.port()),
        SocketAddr::V6(v6) => (*v6.ip(), v6.port()),
    }
}

/// Endpoints a peer table refuses to learn: unroutable or reserved ranges,
/// and loopback unless explicitly allowed (test nodes talk over loopback).
pub fn reserved_address(endpoint: &SocketAddr, allow_local: bool) -> bool {
    if endpoint.port() == 0 {
        return true;
    }
    match endpoint.ip() {
        IpAddr::V4(v4) => {
            if v4.is_unspecified() || v4.is_broadcast() || v4.is_multicast() {
                return true;
            }
            if v4.is_documentation() {
                return true;
            }
            if v4.is_loopback() && !allow_local {
                return true;
            }
            false
        }
        IpAddr::V6(v6) => {
            if v6.is_unspecified() || v6.is_multicast() {
                return true;
            }
            // 2001:db8::/32 documentation range.
            let segments = v6.segments();
            if segments[0] == 0x2001 && segments[1] == 0xdb8 {
                return true;
            }
            if v6.is_loopback() && !allow_local {
                return true;
            }
            // Check the embedded address of v4-mapped endpoints too.
            if let Some(v4) = v6.to_ipv4() {
                if segments[0..5] == [0, 0, 0, 0, 0] && segments[5] == 0xffff {
                    let mapped = SocketAddr::new(IpAddr::V4(v4), endpoint.port());
                    return reserved_address(&mapped, allow_local);
                }
            }
            false
        }
    }
}
