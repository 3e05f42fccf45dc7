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

//! Ledger data model: accounts, amounts, the five block variants, votes and
//! the store-resident records derived from them.
//!
//! A block's identity is the Blake2b digest of its variant-specific hashable
//! fields; the signature covers exactly that digest. Balances travel big
//! endian on the wire and inside signed material.

use crate::crypto::{
    hash::{blake2b, Hash, Hashable, HASH_LEN},
    KeyPair, PublicKey, Signature,
};
use crate::{Error, ErrorKind, Result};
use serde::{de::Visitor, Deserialize, Deserializer, Serialize, Serializer};

/// Hash preamble distinguishing state block digests from legacy ones.
const STATE_HASH_PREAMBLE: [u8; HASH_LEN] = {
    let mut buf = [0; HASH_LEN];
    buf[HASH_LEN - 1] = 6;
    buf
};

/// 128-bit balance/amount in raw units.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default, Debug)]
pub struct Amount(pub u128);

impl Amount {
    pub const MAX: Amount = Amount(u128::MAX);

    pub const fn zero() -> Self {
        Amount(0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    pub fn to_be_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; 16]) -> Self {
        Amount(u128::from_be_bytes(bytes))
    }
}

impl std::fmt::Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// MessagePack has no native 128-bit integer; amounts are stored as their
// 16-byte big-endian representation.
impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.to_be_bytes())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct AmountVisitor;

        impl<'de> Visitor<'de> for AmountVisitor {
            type Value = Amount;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("16 bytes")
            }

            fn visit_bytes<E: serde::de::Error>(
                self,
                value: &[u8],
            ) -> std::result::Result<Amount, E> {
                let buf: [u8; 16] = value
                    .try_into()
                    .map_err(|_| E::invalid_length(value.len(), &self))?;
                Ok(Amount::from_be_bytes(buf))
            }
        }

        deserializer.deserialize_bytes(AmountVisitor)
    }
}

/// Account identifier: an Ed25519 public key.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct Account([u8; HASH_LEN]);

impl Account {
    pub const fn zero() -> Self {
        Account([0; HASH_LEN])
    }

    pub const fn new(bytes: [u8; HASH_LEN]) -> Self {
        Account(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HASH_LEN {
            return Err(Error::new(ErrorKind::MalformedData));
        }
        let mut buf = [0; HASH_LEN];
        buf.copy_from_slice(bytes);
        Ok(Account(buf))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; HASH_LEN]
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// View the account bytes as a hash value; election roots for opening
    /// blocks use the account in hash position.
    pub fn as_root(&self) -> Hash {
        Hash::new(self.0)
    }

    /// Decode into a verifying key. Fails for points off the curve.
    pub fn public_key(&self) -> Result<PublicKey> {
        PublicKey::from_bytes(&self.0)
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    pub fn from_base58(s: &str) -> Result<Self> {
        let buf = bs58::decode(s)
            .into_vec()
            .map_err(|err| Error::new_ext(ErrorKind::MalformedData, err))?;
        Account::from_bytes(&buf)
    }
}

impl From<PublicKey> for Account {
    fn from(key: PublicKey) -> Self {
        Account(key.to_bytes())
    }
}

impl std::fmt::Display for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Account({})", self.to_base58())
    }
}

impl Serialize for Account {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Account {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct AccountVisitor;

        impl<'de> Visitor<'de> for AccountVisitor {
            type Value = Account;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("32 bytes")
            }

            fn visit_bytes<E: serde::de::Error>(
                self,
                value: &[u8],
            ) -> std::result::Result<Account, E> {
                Account::from_bytes(value).map_err(|_| E::invalid_length(value.len(), &self))
            }
        }

        deserializer.deserialize_bytes(AccountVisitor)
    }
}

/// State block link field. Context decides whether it reads as a source
/// hash, a destination account, the epoch sentinel, or nothing.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default, Debug, Serialize, Deserialize)]
pub struct Link(pub Hash);

impl Link {
    pub const fn zero() -> Self {
        Link(Hash::zero())
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn as_hash(&self) -> Hash {
        self.0
    }

    pub fn as_account(&self) -> Account {
        Account(self.0.to_bytes())
    }
}

impl From<Hash> for Link {
    fn from(hash: Hash) -> Self {
        Link(hash)
    }
}

impl From<Account> for Link {
    fn from(account: Account) -> Self {
        Link(Hash::new(account.0))
    }
}

/// Wire tags for the block variants. `NotABlock` terminates block streams.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlockType {
    Invalid = 0,
    NotABlock = 1,
    Send = 2,
    Receive = 3,
    Open = 4,
    Change = 5,
    State = 6,
}

impl BlockType {
    pub fn from_u8(value: u8) -> Option<BlockType> {
        match value {
            0 => Some(BlockType::Invalid),
            1 => Some(BlockType::NotABlock),
            2 => Some(BlockType::Send),
            3 => Some(BlockType::Receive),
            4 => Some(BlockType::Open),
            5 => Some(BlockType::Change),
            6 => Some(BlockType::State),
            _ => None,
        }
    }

    /// Size of the on-wire body for this block type, signature and work
    /// included. Zero for non-block tags.
    pub fn wire_len(&self) -> usize {
        match self {
            BlockType::Send => 32 + 32 + 16 + 64 + 8,
            BlockType::Receive => 32 + 32 + 64 + 8,
            BlockType::Open => 32 + 32 + 32 + 64 + 8,
            BlockType::Change => 32 + 32 + 64 + 8,
            BlockType::State => 32 + 32 + 32 + 16 + 32 + 64 + 8,
            BlockType::Invalid | BlockType::NotABlock => 0,
        }
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct SendBlock {
    pub previous: Hash,
    pub destination: Account,
    /// Balance remaining on the sender account after this block.
    pub balance: Amount,
    pub signature: Signature,
    pub work: u64,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ReceiveBlock {
    pub previous: Hash,
    /// Hash of the matching send block.
    pub source: Hash,
    pub signature: Signature,
    pub work: u64,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct OpenBlock {
    /// Hash of the send block funding the account.
    pub source: Hash,
    pub representative: Account,
    pub account: Account,
    pub signature: Signature,
    pub work: u64,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ChangeBlock {
    pub previous: Hash,
    pub representative: Account,
    pub signature: Signature,
    pub work: u64,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct StateBlock {
    pub account: Account,
    /// Zero when this block opens the account.
    pub previous: Hash,
    pub representative: Account,
    pub balance: Amount,
    pub link: Link,
    pub signature: Signature,
    pub work: u64,
}

/// A block of any variant.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[allow(clippy::large_enum_variant)]
pub enum Block {
    Send(SendBlock),
    Receive(ReceiveBlock),
    Open(OpenBlock),
    Change(ChangeBlock),
    State(StateBlock),
}

impl Hashable for Block {
    fn hash(&self) -> Hash {
        match self {
            Block::Send(b) => blake2b(&[
                b.previous.as_ref(),
                b.destination.as_bytes(),
                &b.balance.to_be_bytes(),
            ]),
            Block::Receive(b) => blake2b(&[b.previous.as_ref(), b.source.as_ref()]),
            Block::Open(b) => blake2b(&[
                b.source.as_ref(),
                b.representative.as_bytes(),
                b.account.as_bytes(),
            ]),
            Block::Change(b) => blake2b(&[b.previous.as_ref(), b.representative.as_bytes()]),
            Block::State(b) => blake2b(&[
                &STATE_HASH_PREAMBLE,
                b.account.as_bytes(),
                b.previous.as_ref(),
                b.representative.as_bytes(),
                &b.balance.to_be_bytes(),
                b.link.as_hash().as_ref(),
            ]),
        }
    }
}

impl Block {
    pub fn block_type(&self) -> BlockType {
        match self {
            Block::Send(_) => BlockType::Send,
            Block::Receive(_) => BlockType::Receive,
            Block::Open(_) => BlockType::Open,
            Block::Change(_) => BlockType::Change,
            Block::State(_) => BlockType::State,
        }
    }

    /// Hash of the preceding block in the account chain; zero for blocks
    /// that open an account.
    pub fn previous(&self) -> Hash {
        match self {
            Block::Send(b) => b.previous,
            Block::Receive(b) => b.previous,
            Block::Open(_) => Hash::zero(),
            Block::Change(b) => b.previous,
            Block::State(b) => b.previous,
        }
    }

    /// True when this block starts a chain.
    pub fn is_open(&self) -> bool {
        self.previous().is_zero()
    }

    /// The value the proof-of-work nonce is bound to: the previous block, or
    /// the account for chain-opening blocks.
    pub fn work_root(&self) -> [u8; HASH_LEN] {
        match self {
            Block::Open(b) => *b.account.as_bytes(),
            Block::State(b) if b.previous.is_zero() => *b.account.as_bytes(),
            _ => self.previous().to_bytes(),
        }
    }

    /// Account stated inside the block itself. Legacy send/receive/change
    /// blocks leave this implicit; the ledger derives it from `previous`.
    pub fn account_field(&self) -> Option<Account> {
        match self {
            Block::Open(b) => Some(b.account),
            Block::State(b) => Some(b.account),
            _ => None,
        }
    }

    /// Source hash for blocks that consume a pending send.
    /// State receives are resolved by the ledger since the link meaning
    /// depends on the balance delta.
    pub fn source(&self) -> Option<Hash> {
        match self {
            Block::Receive(b) => Some(b.source),
            Block::Open(b) => Some(b.source),
            _ => None,
        }
    }

    pub fn work(&self) -> u64 {
        match self {
            Block::Send(b) => b.work,
            Block::Receive(b) => b.work,
            Block::Open(b) => b.work,
            Block::Change(b) => b.work,
            Block::State(b) => b.work,
        }
    }

    pub fn signature(&self) -> &Signature {
        match self {
            Block::Send(b) => &b.signature,
            Block::Receive(b) => &b.signature,
            Block::Open(b) => &b.signature,
            Block::Change(b) => &b.signature,
            Block::State(b) => &b.signature,
        }
    }

    pub fn set_signature(&mut self, signature: Signature) {
        match self {
            Block::Send(b) => b.signature = signature,
            Block::Receive(b) => b.signature = signature,
            Block::Open(b) => b.signature = signature,
            Block::Change(b) => b.signature = signature,
            Block::State(b) => b.signature = signature,
        }
    }

    pub fn set_work(&mut self, work: u64) {
        match self {
            Block::Send(b) => b.work = work,
            Block::Receive(b) => b.work = work,
            Block::Open(b) => b.work = work,
            Block::Change(b) => b.work = work,
            Block::State(b) => b.work = work,
        }
    }

    /// Sign the block hash with `keypair` and store the signature.
    pub fn sign(&mut self, keypair: &KeyPair) {
        let hash = self.hash();
        self.set_signature(keypair.sign(hash.as_ref()));
    }

    /// Verify the signature against the given account key.
    pub fn verify_signature(&self, account: &Account) -> bool {
        let hash = self.hash();
        match account.public_key() {
            Ok(key) => key.verify(hash.as_ref(), self.signature()),
            Err(_) => false,
        }
    }

    /// Serialize the block body in its on-wire layout (§ wire format):
    /// fixed fields, big-endian balance, signature, then the 8-byte work.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.block_type().wire_len());
        match self {
            Block::Send(b) => {
                buf.extend_from_slice(b.previous.as_ref());
                buf.extend_from_slice(b.destination.as_bytes());
                buf.extend_from_slice(&b.balance.to_be_bytes());
                buf.extend_from_slice(b.signature.as_bytes());
                buf.extend_from_slice(&b.work.to_be_bytes());
            }
            Block::Receive(b) => {
                buf.extend_from_slice(b.previous.as_ref());
                buf.extend_from_slice(b.source.as_ref());
                buf.extend_from_slice(b.signature.as_bytes());
                buf.extend_from_slice(&b.work.to_be_bytes());
            }
            Block::Open(b) => {
                buf.extend_from_slice(b.source.as_ref());
                buf.extend_from_slice(b.representative.as_bytes());
                buf.extend_from_slice(b.account.as_bytes());
                buf.extend_from_slice(b.signature.as_bytes());
                buf.extend_from_slice(&b.work.to_be_bytes());
            }
            Block::Change(b) => {
                buf.extend_from_slice(b.previous.as_ref());
                buf.extend_from_slice(b.representative.as_bytes());
                buf.extend_from_slice(b.signature.as_bytes());
                buf.extend_from_slice(&b.work.to_be_bytes());
            }
            Block::State(b) => {
                buf.extend_from_slice(b.account.as_bytes());
                buf.extend_from_slice(b.previous.as_ref());
                buf.extend_from_slice(b.representative.as_bytes());
                buf.extend_from_slice(&b.balance.to_be_bytes());
                buf.extend_from_slice(b.link.as_hash().as_ref());
                buf.extend_from_slice(b.signature.as_bytes());
                buf.extend_from_slice(&b.work.to_be_bytes());
            }
        }
        buf
    }

    /// Decode a block body of the given type from its on-wire layout.
    pub fn from_wire(block_type: BlockType, buf: &[u8]) -> Result<Block> {
        if buf.len() != block_type.wire_len() || block_type.wire_len() == 0 {
            return Err(Error::new(ErrorKind::MalformedData));
        }
        let mut pos = 0;
        let mut take = |len: usize| {
            let chunk = &buf[pos..pos + len];
            pos += len;
            chunk
        };
        let block = match block_type {
            BlockType::Send => Block::Send(SendBlock {
                previous: Hash::from_bytes(take(32))?,
                destination: Account::from_bytes(take(32))?,
                balance: Amount::from_be_bytes(take(16).try_into().expect("length checked")),
                signature: Signature::from_bytes(take(64))?,
                work: u64::from_be_bytes(take(8).try_into().expect("length checked")),
            }),
            BlockType::Receive => Block::Receive(ReceiveBlock {
                previous: Hash::from_bytes(take(32))?,
                source: Hash::from_bytes(take(32))?,
                signature: Signature::from_bytes(take(64))?,
                work: u64::from_be_bytes(take(8).try_into().expect("length checked")),
            }),
            BlockType::Open => Block::Open(OpenBlock {
                source: Hash::from_bytes(take(32))?,
                representative: Account::from_bytes(take(32))?,
                account: Account::from_bytes(take(32))?,
                signature: Signature::from_bytes(take(64))?,
                work: u64::from_be_bytes(take(8).try_into().expect("length checked")),
            }),
            BlockType::Change => Block::Change(ChangeBlock {
                previous: Hash::from_bytes(take(32))?,
                representative: Account::from_bytes(take(32))?,
                signature: Signature::from_bytes(take(64))?,
                work: u64::from_be_bytes(take(8).try_into().expect("length checked")),
            }),
            BlockType::State => Block::State(StateBlock {
                account: Account::from_bytes(take(32))?,
                previous: Hash::from_bytes(take(32))?,
                representative: Account::from_bytes(take(32))?,
                balance: Amount::from_be_bytes(take(16).try_into().expect("length checked")),
                link: Link(Hash::from_bytes(take(32))?),
                signature: Signature::from_bytes(take(64))?,
                work: u64::from_be_bytes(take(8).try_into().expect("length checked")),
            }),
            BlockType::Invalid | BlockType::NotABlock => {
                return Err(Error::new(ErrorKind::MalformedData))
            }
        };
        Ok(block)
    }
}

/// Election slot identity: the account plus the hash the candidates attach
/// to. Opening blocks use the account in the hash position.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct Root {
    pub account: Account,
    pub previous: Hash,
}

impl Root {
    pub fn new(account: Account, previous: Hash) -> Self {
        let previous = if previous.is_zero() {
            account.as_root()
        } else {
            previous
        };
        Root { account, previous }
    }
}

/// Signature verification progress for queued blocks.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum SignatureState {
    Unknown,
    Valid,
    Invalid,
}

/// Per-account ledger head record.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct AccountInfo {
    /// Latest block of the chain.
    pub head: Hash,
    /// First block of the chain.
    pub open_block: Hash,
    /// Most recent block that assigned the representative.
    pub representative_block: Hash,
    pub balance: Amount,
    /// Unix seconds of the last chain modification.
    pub modified: u64,
    pub block_count: u64,
    /// Protocol epoch this account has been upgraded to.
    pub epoch: u8,
}

/// Store metadata kept next to each block, never transmitted on the wire.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Sideband {
    pub account: Account,
    /// 1-based position in the account chain.
    pub height: u64,
    /// Unix seconds at local application time.
    pub timestamp: u64,
    /// Next block of the chain; zero at the frontier.
    pub successor: Hash,
    /// Account balance after this block.
    pub balance: Amount,
}

/// A block together with its sideband, as persisted.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct StoredBlock {
    pub block: Block,
    pub sideband: Sideband,
}

/// Pending table key. Ordering groups all entries of one destination
/// account together, which the range scans rely on.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct PendingKey {
    /// Destination account of the send.
    pub account: Account,
    /// Hash of the send block.
    pub hash: Hash,
}

impl PendingKey {
    pub fn new(account: Account, hash: Hash) -> Self {
        PendingKey { account, hash }
    }
}

/// Pending table value: an unreceived send.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct PendingInfo {
    pub source: Account,
    pub amount: Amount,
    pub epoch: u8,
}

/// A representative's statement about one or more blocks.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Vote {
    pub account: Account,
    pub signature: Signature,
    /// Strictly increasing per representative; stale sequences are ignored.
    pub sequence: u64,
    pub hashes: Vec<Hash>,
}

/// Votes carry at most this many hashes.
pub const VOTE_MAX_HASHES: usize = 12;

impl Vote {
    pub fn new(keypair: &KeyPair, sequence: u64, hashes: Vec<Hash>) -> Vote {
        let mut vote = Vote {
            account: Account::from(keypair.public_key()),
            signature: Signature::zero(),
            sequence,
            hashes,
        };
        vote.signature = keypair.sign(vote.digest().as_ref());
        vote
    }

    /// Digest covered by the vote signature: sequence (little endian)
    /// followed by the candidate hashes.
    pub fn digest(&self) -> Hash {
        let mut parts: Vec<&[u8]> = Vec::with_capacity(1 + self.hashes.len());
        let seq = self.sequence.to_le_bytes();
        parts.push(&seq);
        for hash in &self.hashes {
            parts.push(hash.as_ref());
        }
        blake2b(&parts)
    }

    pub fn verify(&self) -> bool {
        if self.hashes.is_empty() || self.hashes.len() > VOTE_MAX_HASHES {
            return false;
        }
        match self.account.public_key() {
            Ok(key) => key.verify(self.digest().as_ref(), &self.signature),
            Err(_) => false,
        }
    }
}

/// Latest observed vote per representative, as persisted.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct VoteInfo {
    pub sequence: u64,
    pub hashes: Vec<Hash>,
}

/// A block queued for dependency arrival.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct UncheckedInfo {
    pub block: Block,
    pub arrival: u64,
    pub verified: SignatureState,
}
