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

//! Node-to-node wire format.
//!
//! Every message starts with the fixed eight-byte header: magic (2),
//! version max/using/min (1 each), message type (1) and little-endian
//! extensions (2). Extensions carry the block type for block-bearing
//! messages and presence flags for the optional payload parts.

use crate::{
    base::schema::{Account, Amount, Block, BlockType, Vote},
    config::{Network, PROTOCOL_VERSION, PROTOCOL_VERSION_MIN},
    crypto::{Hash, Signature},
    Error, ErrorKind, Result,
};
use std::net::Ipv6Addr;

/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 8;

/// Endpoints carried by one keepalive.
pub const KEEPALIVE_PEERS: usize = 8;

/// Block type occupies extension bits 8..12.
const EXT_BLOCK_TYPE_SHIFT: u16 = 8;
const EXT_BLOCK_TYPE_MASK: u16 = 0x0f00;
/// Bulk pull carries an explicit count.
const EXT_COUNT_PRESENT: u16 = 1 << 0;
/// Handshake parts.
const EXT_QUERY_PRESENT: u16 = 1 << 1;
const EXT_RESPONSE_PRESENT: u16 = 1 << 2;

/// Wire message tags.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum MessageType {
    Keepalive = 2,
    Publish = 3,
    ConfirmReq = 4,
    ConfirmAck = 5,
    BulkPull = 6,
    BulkPush = 7,
    FrontierReq = 8,
    NodeIdHandshake = 10,
    BulkPullAccount = 11,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<MessageType> {
        match value {
            2 => Some(MessageType::Keepalive),
            3 => Some(MessageType::Publish),
            4 => Some(MessageType::ConfirmReq),
            5 => Some(MessageType::ConfirmAck),
            6 => Some(MessageType::BulkPull),
            7 => Some(MessageType::BulkPush),
            8 => Some(MessageType::FrontierReq),
            10 => Some(MessageType::NodeIdHandshake),
            11 => Some(MessageType::BulkPullAccount),
            _ => None,
        }
    }
}

/// Parsed message header.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Header {
    pub message_type: MessageType,
    pub version_max: u8,
    pub version_using: u8,
    pub version_min: u8,
    pub extensions: u16,
}

impl Header {
    pub fn new(message_type: MessageType, extensions: u16) -> Self {
        Header {
            message_type,
            version_max: PROTOCOL_VERSION,
            version_using: PROTOCOL_VERSION,
            version_min: PROTOCOL_VERSION_MIN,
            extensions,
        }
    }

    pub fn block_type(&self) -> Option<BlockType> {
        BlockType::from_u8(((self.extensions & EXT_BLOCK_TYPE_MASK) >> EXT_BLOCK_TYPE_SHIFT) as u8)
    }

    fn with_block_type(message_type: MessageType, block_type: BlockType) -> Self {
        Header::new(
            message_type,
            (block_type as u16) << EXT_BLOCK_TYPE_SHIFT,
        )
    }

    pub fn encode(&self, network: &Network, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&network.id.magic());
        buf.push(self.version_max);
        buf.push(self.version_using);
        buf.push(self.version_min);
        buf.push(self.message_type as u8);
        buf.extend_from_slice(&self.extensions.to_le_bytes());
    }

    /// Parse and validate a header against our network.
    pub fn decode(network: &Network, buf: &[u8]) -> Result<Header> {
        if buf.len() < HEADER_LEN {
            return Err(Error::new(ErrorKind::MalformedData));
        }
        if buf[0..2] != network.id.magic() {
            return Err(Error::new(ErrorKind::BadNetwork));
        }
        let version_max = buf[2];
        let version_using = buf[3];
        let version_min = buf[4];
        if version_using < PROTOCOL_VERSION_MIN || version_min > PROTOCOL_VERSION {
            return Err(Error::new(ErrorKind::BadNetwork));
        }
        let message_type =
            MessageType::from_u8(buf[5]).ok_or_else(|| Error::new(ErrorKind::MalformedData))?;
        let extensions = u16::from_le_bytes([buf[6], buf[7]]);
        Ok(Header {
            message_type,
            version_max,
            version_using,
            version_min,
            extensions,
        })
    }
}

/// The confirm_req query: a full block, or just its root pair.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum ConfirmReqPayload {
    Block(Block),
    Root { account: Account, previous: Hash },
}

/// A decoded wire message.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum WireMessage {
    /// Eight peer endpoints, zero-padded.
    Keepalive { peers: Vec<(Ipv6Addr, u16)> },
    Publish { block: Block },
    ConfirmReq { payload: ConfirmReqPayload },
    ConfirmAck { vote: Vote },
    NodeIdHandshake {
        query: Option<[u8; 32]>,
        response: Option<(Account, Signature)>,
    },
    BulkPull {
        start: Hash,
        end: Hash,
        count: Option<u32>,
    },
    BulkPush,
    FrontierReq {
        start: Account,
        age: u32,
        count: u32,
    },
    BulkPullAccount {
        account: Account,
        minimum: Amount,
        flags: u8,
    },
}

impl WireMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            WireMessage::Keepalive { .. } => MessageType::Keepalive,
            WireMessage::Publish { .. } => MessageType::Publish,
            WireMessage::ConfirmReq { .. } => MessageType::ConfirmReq,
            WireMessage::ConfirmAck { .. } => MessageType::ConfirmAck,
            WireMessage::NodeIdHandshake { .. } => MessageType::NodeIdHandshake,
            WireMessage::BulkPull { .. } => MessageType::BulkPull,
            WireMessage::BulkPush => MessageType::BulkPush,
            WireMessage::FrontierReq { .. } => MessageType::FrontierReq,
            WireMessage::BulkPullAccount { .. } => MessageType::BulkPullAccount,
        }
    }

    /// Serialize header plus payload.
    pub fn encode(&self, network: &Network) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);
        match self {
            WireMessage::Keepalive { peers } => {
                Header::new(MessageType::Keepalive, 0).encode(network, &mut buf);
                for i in 0..KEEPALIVE_PEERS {
                    let (addr, port) = peers
                        .get(i)
                        .copied()
                        .unwrap_or((Ipv6Addr::UNSPECIFIED, 0));
                    buf.extend_from_slice(&addr.octets());
                    buf.extend_from_slice(&port.to_le_bytes());
                }
            }
            WireMessage::Publish { block } => {
                Header::with_block_type(MessageType::Publish, block.block_type())
                    .encode(network, &mut buf);
                buf.extend_from_slice(&block.to_wire());
            }
            WireMessage::ConfirmReq { payload } => match payload {
                ConfirmReqPayload::Block(block) => {
                    Header::with_block_type(MessageType::ConfirmReq, block.block_type())
                        .encode(network, &mut buf);
                    buf.extend_from_slice(&block.to_wire());
                }
                ConfirmReqPayload::Root { account, previous } => {
                    Header::with_block_type(MessageType::ConfirmReq, BlockType::NotABlock)
                        .encode(network, &mut buf);
                    buf.extend_from_slice(account.as_bytes());
                    buf.extend_from_slice(previous.as_ref());
                }
            },
            WireMessage::ConfirmAck { vote } => {
                Header::with_block_type(MessageType::ConfirmAck, BlockType::NotABlock)
                    .encode(network, &mut buf);
                buf.extend_from_slice(vote.account.as_bytes());
                buf.extend_from_slice(vote.signature.as_bytes());
                buf.extend_from_slice(&vote.sequence.to_le_bytes());
                for hash in &vote.hashes {
                    buf.extend_from_slice(hash.as_ref());
                }
            }
            WireMessage::NodeIdHandshake { query, response } => {
                let mut extensions = 0;
                if query.is_some() {
                    extensions |= EXT_QUERY_PRESENT;
                }
                if response.is_some() {
                    extensions |= EXT_RESPONSE_PRESENT;
                }
                Header::new(MessageType::NodeIdHandshake, extensions).encode(network, &mut buf);
                if let Some(cookie) = query {
                    buf.extend_from_slice(cookie);
                }
                if let Some((account, signature)) = response {
                    buf.extend_from_slice(account.as_bytes());
                    buf.extend_from_slice(signature.as_bytes());
                }
            }
            WireMessage::BulkPull { start, end, count } => {
                let extensions = if count.is_some() { EXT_COUNT_PRESENT } else { 0 };
                Header::new(MessageType::BulkPull, extensions).encode(network, &mut buf);
                buf.extend_from_slice(start.as_ref());
                buf.extend_from_slice(end.as_ref());
                if let Some(count) = count {
                    buf.extend_from_slice(&count.to_le_bytes());
                }
            }
            WireMessage::BulkPush => {
                Header::new(MessageType::BulkPush, 0).encode(network, &mut buf);
            }
            WireMessage::FrontierReq { start, age, count } => {
                Header::new(MessageType::FrontierReq, 0).encode(network, &mut buf);
                buf.extend_from_slice(start.as_bytes());
                buf.extend_from_slice(&age.to_le_bytes());
                buf.extend_from_slice(&count.to_le_bytes());
            }
            WireMessage::BulkPullAccount {
                account,
                minimum,
                flags,
            } => {
                Header::new(MessageType::BulkPullAccount, 0).encode(network, &mut buf);
                buf.extend_from_slice(account.as_bytes());
                buf.extend_from_slice(&minimum.to_be_bytes());
                buf.push(*flags);
            }
        }
        buf
    }

    /// Decode a whole datagram (header + payload).
    pub fn decode(network: &Network, buf: &[u8]) -> Result<WireMessage> {
        let header = Header::decode(network, buf)?;
        Self::decode_payload(&header, &buf[HEADER_LEN..])
    }

    /// Decode the payload following an already-parsed header.
    pub fn decode_payload(header: &Header, buf: &[u8]) -> Result<WireMessage> {
        match header.message_type {
            MessageType::Keepalive => {
                if buf.len() != KEEPALIVE_PEERS * 18 {
                    return Err(Error::new(ErrorKind::MalformedData));
                }
                let mut peers = Vec::with_capacity(KEEPALIVE_PEERS);
                for chunk in buf.chunks(18) {
                    let mut octets = [0_u8; 16];
                    octets.copy_from_slice(&chunk[..16]);
                    let port = u16::from_le_bytes([chunk[16], chunk[17]]);
                    let addr = Ipv6Addr::from(octets);
                    if port != 0 && !addr.is_unspecified() {
                        peers.push((addr, port));
                    }
                }
                Ok(WireMessage::Keepalive { peers })
            }
            MessageType::Publish => {
                let block_type = header
                    .block_type()
                    .ok_or_else(|| Error::new(ErrorKind::MalformedData))?;
                let block = Block::from_wire(block_type, buf)?;
                Ok(WireMessage::Publish { block })
            }
            MessageType::ConfirmReq => {
                let block_type = header
                    .block_type()
                    .ok_or_else(|| Error::new(ErrorKind::MalformedData))?;
                if block_type == BlockType::NotABlock {
                    if buf.len() != 64 {
                        return Err(Error::new(ErrorKind::MalformedData));
                    }
                    Ok(WireMessage::ConfirmReq {
                        payload: ConfirmReqPayload::Root {
                            account: Account::from_bytes(&buf[..32])?,
                            previous: Hash::from_bytes(&buf[32..64])?,
                        },
                    })
                } else {
                    let block = Block::from_wire(block_type, buf)?;
                    Ok(WireMessage::ConfirmReq {
                        payload: ConfirmReqPayload::Block(block),
                    })
                }
            }
            MessageType::ConfirmAck => {
                if buf.len() < 32 + 64 + 8 {
                    return Err(Error::new(ErrorKind::MalformedData));
                }
                let account = Account::from_bytes(&buf[..32])?;
                let signature = Signature::from_bytes(&buf[32..96])?;
                let sequence = u64::from_le_bytes(buf[96..104].try_into().expect("bounds checked"));
                let rest = &buf[104..];
                if rest.is_empty() || rest.len() % 32 != 0 {
                    return Err(Error::new(ErrorKind::MalformedData));
                }
                let count = rest.len() / 32;
                if count > crate::base::schema::VOTE_MAX_HASHES {
                    return Err(Error::new(ErrorKind::MalformedData));
                }
                let mut hashes = Vec::with_capacity(count);
                for chunk in rest.chunks(32) {
                    hashes.push(Hash::from_bytes(chunk)?);
                }
                Ok(WireMessage::ConfirmAck {
                    vote: Vote {
                        account,
                        signature,
                        sequence,
                        hashes,
                    },
                })
            }
            MessageType::NodeIdHandshake => {
                let mut pos = 0;
                let query = if header.extensions & EXT_QUERY_PRESENT != 0 {
                    if buf.len() < pos + 32 {
                        return Err(Error::new(ErrorKind::MalformedData));
                    }
                    let mut cookie = [0_u8; 32];
                    cookie.copy_from_slice(&buf[pos..pos + 32]);
                    pos += 32;
                    Some(cookie)
                } else {
                    None
                };
                let response = if header.extensions & EXT_RESPONSE_PRESENT != 0 {
                    if buf.len() < pos + 96 {
                        return Err(Error::new(ErrorKind::MalformedData));
                    }
                    let account = Account::from_bytes(&buf[pos..pos + 32])?;
                    let signature = Signature::from_bytes(&buf[pos + 32..pos + 96])?;
                    pos += 96;
                    Some((account, signature))
                } else {
                    None
                };
                if pos != buf.len() || (query.is_none() && response.is_none()) {
                    return Err(Error::new(ErrorKind::MalformedData));
                }
                Ok(WireMessage::NodeIdHandshake { query, response })
            }
            MessageType::BulkPull => {
                let with_count = header.extensions & EXT_COUNT_PRESENT != 0;
                let wanted = if with_count { 68 } else { 64 };
                if buf.len() != wanted {
                    return Err(Error::new(ErrorKind::MalformedData));
                }
                let start = Hash::from_bytes(&buf[..32])?;
                let end = Hash::from_bytes(&buf[32..64])?;
                let count = if with_count {
                    Some(u32::from_le_bytes(
                        buf[64..68].try_into().expect("bounds checked"),
                    ))
                } else {
                    None
                };
                Ok(WireMessage::BulkPull { start, end, count })
            }
            MessageType::BulkPush => {
                if !buf.is_empty() {
                    return Err(Error::new(ErrorKind::MalformedData));
                }
                Ok(WireMessage::BulkPush)
            }
            MessageType::FrontierReq => {
                if buf.len() != 40 {
                    return Err(Error::new(ErrorKind::MalformedData));
                }
                Ok(WireMessage::FrontierReq {
                    start: Account::from_bytes(&buf[..32])?,
                    age: u32::from_le_bytes(buf[32..36].try_into().expect("bounds checked")),
                    count: u32::from_le_bytes(buf[36..40].try_into().expect("bounds checked")),
                })
            }
            MessageType::BulkPullAccount => {
                if buf.len() != 49 {
                    return Err(Error::new(ErrorKind::MalformedData));
                }
                Ok(WireMessage::BulkPullAccount {
                    account: Account::from_bytes(&buf[..32])?,
                    minimum: Amount::from_be_bytes(
                        buf[32..48].try_into().expect("bounds checked"),
                    ),
                    flags: buf[48],
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::schema::tests::{create_test_send, test_keypair};

    fn network() -> std::sync::Arc<Network> {
        Network::test()
    }

    fn roundtrip(msg: WireMessage) {
        let network = network();
        let buf = msg.encode(&network);
        let back = WireMessage::decode(&network, &buf).unwrap();
        assert_eq!(back, msg);
        // Encoding is stable.
        assert_eq!(back.encode(&network), buf);
    }

    #[test]
    fn keepalive_roundtrip() {
        roundtrip(WireMessage::Keepalive {
            peers: vec![
                (Ipv6Addr::LOCALHOST, 24000),
                (Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 9), 24001),
            ],
        });
    }

    #[test]
    fn keepalive_is_fixed_size() {
        let network = network();
        let buf = WireMessage::Keepalive { peers: vec![] }.encode(&network);
        assert_eq!(buf.len(), HEADER_LEN + KEEPALIVE_PEERS * 18);
    }

    #[test]
    fn publish_roundtrip() {
        let block = create_test_send(&test_keypair(1), Hash::new([3; 32]), 77);
        roundtrip(WireMessage::Publish { block });
    }

    #[test]
    fn confirm_req_block_and_root() {
        let block = create_test_send(&test_keypair(1), Hash::new([3; 32]), 77);
        roundtrip(WireMessage::ConfirmReq {
            payload: ConfirmReqPayload::Block(block),
        });
        roundtrip(WireMessage::ConfirmReq {
            payload: ConfirmReqPayload::Root {
                account: Account::new([5; 32]),
                previous: Hash::new([6; 32]),
            },
        });
    }

    #[test]
    fn confirm_ack_roundtrip() {
        let vote = Vote::new(
            &test_keypair(4),
            9,
            vec![Hash::new([1; 32]), Hash::new([2; 32])],
        );
        roundtrip(WireMessage::ConfirmAck { vote });
    }

    #[test]
    fn handshake_roundtrips() {
        let keypair = test_keypair(5);
        roundtrip(WireMessage::NodeIdHandshake {
            query: Some([7; 32]),
            response: None,
        });
        roundtrip(WireMessage::NodeIdHandshake {
            query: None,
            response: Some((
                Account::from(keypair.public_key()),
                keypair.sign(&[7; 32]),
            )),
        });
        roundtrip(WireMessage::NodeIdHandshake {
            query: Some([8; 32]),
            response: Some((
                Account::from(keypair.public_key()),
                keypair.sign(&[8; 32]),
            )),
        });
    }

    #[test]
    fn bulk_pull_roundtrips() {
        roundtrip(WireMessage::BulkPull {
            start: Hash::new([1; 32]),
            end: Hash::zero(),
            count: None,
        });
        roundtrip(WireMessage::BulkPull {
            start: Hash::new([1; 32]),
            end: Hash::zero(),
            count: Some(512),
        });
    }

    #[test]
    fn frontier_req_roundtrip() {
        roundtrip(WireMessage::FrontierReq {
            start: Account::zero(),
            age: u32::MAX,
            count: 1000,
        });
    }

    #[test]
    fn bulk_pull_account_roundtrip() {
        roundtrip(WireMessage::BulkPullAccount {
            account: Account::new([9; 32]),
            minimum: Amount(1_000_000),
            flags: 2,
        });
    }

    #[test]
    fn wrong_magic_rejected() {
        let network = network();
        let mut buf = WireMessage::BulkPush.encode(&network);
        buf[0] = b'X';

        let err = WireMessage::decode(&network, &buf).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadNetwork);
    }

    #[test]
    fn malformed_payloads_fail_without_panic() {
        let network = network();

        // Truncated keepalive.
        let mut buf = WireMessage::Keepalive { peers: vec![] }.encode(&network);
        buf.truncate(buf.len() - 1);
        assert!(WireMessage::decode(&network, &buf).is_err());

        // Vote with a hash count that does not divide evenly.
        let vote = Vote::new(&test_keypair(4), 9, vec![Hash::new([1; 32])]);
        let mut buf = WireMessage::ConfirmAck { vote }.encode(&network);
        buf.push(0);
        assert!(WireMessage::decode(&network, &buf).is_err());

        // Unknown message type byte.
        let mut buf = WireMessage::BulkPush.encode(&network);
        buf[5] = 99;
        assert!(WireMessage::decode(&network, &buf).is_err());

        // Empty datagram.
        assert!(WireMessage::decode(&network, &[]).is_err());
    }

    #[test]
    fn handshake_empty_is_malformed() {
        let network = network();
        let mut buf = Vec::new();
        Header::new(MessageType::NodeIdHandshake, 0).encode(&network, &mut buf);

        assert!(WireMessage::decode(&network, &buf).is_err());
    }
}
