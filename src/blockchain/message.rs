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

//! Requests accepted by the blockchain service.
//!
//! The HTTP/JSON translator, the wallet, the network dispatcher and the
//! bootstrap engine all talk to the service through this one message set.
//! Responses reuse the same enum; errors travel as `Exception`.

use super::ledger::ProcessResult;
use crate::{
    base::schema::{Account, AccountInfo, Amount, Block, SignatureState, Vote},
    channel,
    crypto::Hash,
    Error,
};

/// Block subtype assertion accepted by the `Process` verb.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub enum BlockSubtype {
    Send,
    Receive,
    Open,
    Change,
    Epoch,
}

/// One block record of a `BlocksInfo` response.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct BlockRecord {
    pub hash: Hash,
    pub block: Block,
    pub account: Account,
    pub height: u64,
    pub balance: Amount,
    pub confirmed: bool,
}

/// One entry of a confirmation history response.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ConfirmationRecord {
    pub hash: Hash,
    pub tally: Amount,
    pub duration_ms: u64,
}

/// A pending entry projected for request surfaces.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct PendingRecord {
    pub hash: Hash,
    pub amount: Amount,
    pub source: Account,
}

/// Message types enumeration.
///
/// Enum variants are internally tagged as strings.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[allow(clippy::large_enum_variant)]
pub enum Message {
    /// Exception response used for the full set of messages.
    #[serde(rename = "0")]
    Exception(Error),
    /// Generic affirmative response for side-effecting verbs.
    #[serde(rename = "1")]
    Ack,
    /// Subscribe to a set of service events.
    #[serde(rename = "2")]
    Subscribe { id: String, events: super::pubsub::Event },
    /// Unsubscribe from a set of service events.
    #[serde(rename = "3")]
    Unsubscribe { id: String, events: super::pubsub::Event },

    /// Feed one block into the processor queue.
    #[serde(rename = "4")]
    ProcessBlock {
        block: Block,
        arrival: u64,
        verified: SignatureState,
    },
    /// Resolve when every block queued before the call has been handled.
    #[serde(rename = "5")]
    Flush,
    /// Election outcome: make `winner` the chain tip of its root.
    #[serde(rename = "6")]
    ForkResolve { winner: Block },

    /// Block applied to the ledger (event).
    #[serde(rename = "7")]
    BlockApplied {
        hash: Hash,
        account: Account,
        block: Block,
        is_send: bool,
    },
    /// Block reached quorum (event).
    #[serde(rename = "8")]
    BlockConfirmed { hash: Hash, account: Account },
    /// Conflicting block observed for an active root (event).
    #[serde(rename = "9")]
    ForkObserved { root_hash: Hash, block: Block },

    #[serde(rename = "10")]
    AccountBalance { account: Account },
    #[serde(rename = "11")]
    AccountBalanceResponse { balance: Amount, pending: Amount },
    #[serde(rename = "12")]
    AccountInfo { account: Account },
    #[serde(rename = "13")]
    AccountInfoResponse {
        info: AccountInfo,
        representative: Account,
    },
    #[serde(rename = "14")]
    AccountsPending {
        accounts: Vec<Account>,
        count: u64,
        threshold: Amount,
    },
    #[serde(rename = "15")]
    AccountsPendingResponse {
        pending: Vec<(Account, Vec<PendingRecord>)>,
    },

    #[serde(rename = "16")]
    GetBlock { hash: Hash },
    #[serde(rename = "17")]
    GetBlockResponse { block: Block },
    #[serde(rename = "18")]
    BlocksInfo { hashes: Vec<Hash> },
    #[serde(rename = "19")]
    BlocksInfoResponse { blocks: Vec<BlockRecord> },
    /// Force an election on a stored block.
    #[serde(rename = "20")]
    BlockConfirm { hash: Hash },
    #[serde(rename = "21")]
    BlockCreate {
        /// 32-byte signing seed of the account key.
        #[serde(with = "serde_bytes")]
        key: Vec<u8>,
        previous: Hash,
        representative: Account,
        balance: Amount,
        link: Hash,
        work: Option<u64>,
    },
    #[serde(rename = "22")]
    BlockCreateResponse { hash: Hash, block: Block },
    #[serde(rename = "23")]
    BlockHash { block: Block },
    #[serde(rename = "24")]
    BlockHashResponse { hash: Hash },

    /// Walk a chain backwards (or forwards via successors) from `block`.
    #[serde(rename = "25")]
    Chain {
        block: Hash,
        count: u64,
        successors: bool,
    },
    #[serde(rename = "26")]
    ChainResponse { blocks: Vec<Hash> },
    #[serde(rename = "27")]
    ConfirmationHistory,
    #[serde(rename = "28")]
    ConfirmationHistoryResponse { confirmations: Vec<ConfirmationRecord> },
    #[serde(rename = "29")]
    Delegators { account: Account },
    #[serde(rename = "30")]
    DelegatorsResponse { delegators: Vec<(Account, Amount)> },
    #[serde(rename = "31")]
    Frontiers { start: Account, count: u64 },
    #[serde(rename = "32")]
    FrontiersResponse { frontiers: Vec<(Account, Hash)> },
    #[serde(rename = "33")]
    LedgerAccounts { start: Account, count: u64 },
    #[serde(rename = "34")]
    LedgerAccountsResponse { accounts: Vec<(Account, AccountInfo)> },

    #[serde(rename = "35")]
    Pending {
        account: Account,
        count: u64,
        threshold: Amount,
    },
    #[serde(rename = "36")]
    PendingResponse { entries: Vec<PendingRecord> },
    #[serde(rename = "37")]
    PendingExists { hash: Hash },
    #[serde(rename = "38")]
    PendingExistsResponse { exists: bool },

    #[serde(rename = "39")]
    Process {
        block: Block,
        subtype: Option<BlockSubtype>,
    },
    #[serde(rename = "40")]
    ProcessResponse { hash: Hash, result: ProcessResult },

    #[serde(rename = "41")]
    Representatives { count: u64 },
    #[serde(rename = "42")]
    RepresentativesResponse { representatives: Vec<(Account, Amount)> },
    #[serde(rename = "43")]
    RepresentativesOnline,
    #[serde(rename = "44")]
    RepresentativesOnlineResponse { representatives: Vec<Account> },

    /// Rebroadcast a stored block (and optionally successors) to peers.
    #[serde(rename = "45")]
    Republish { hash: Hash, count: u64 },
    /// Scan pending entries destined to the given (wallet) accounts.
    #[serde(rename = "46")]
    SearchPending { accounts: Vec<Account> },
    #[serde(rename = "47")]
    SearchPendingResponse { entries: Vec<(Account, PendingRecord)> },

    /// Trigger a legacy bootstrap attempt, optionally to a specific peer.
    #[serde(rename = "48")]
    Bootstrap { peer: Option<String> },
    /// Trigger a lazy bootstrap walk rooted at `hash`.
    #[serde(rename = "49")]
    BootstrapLazy { hash: Hash },
    /// Inject a peer endpoint and send it a keepalive.
    #[serde(rename = "50")]
    Keepalive { endpoint: String },

    #[serde(rename = "51")]
    WorkValidate { root: Hash, work: u64 },
    #[serde(rename = "52")]
    WorkValidateResponse { valid: bool, value: u64 },

    /// A verified vote routed into the election set (event).
    #[serde(rename = "53")]
    VoteObserved { vote: Vote },

    /// Stop the blockchain service.
    #[serde(rename = "254")]
    Stop,
    /// Packed message serialized using MessagePack.
    #[serde(rename = "255")]
    Packed {
        #[serde(with = "serde_bytes")]
        buf: Vec<u8>,
    },
}

/// Helper structure to transparently deserialize both single and vector of
/// messages, used when unpacking `Packed` payloads.
#[derive(Serialize, Deserialize, Debug)]
#[serde(untagged)]
#[allow(clippy::large_enum_variant)]
pub enum MultiMessage {
    Simple(Message),
    Sequence(Vec<Message>),
}

/// Blockchain request sender alias.
pub type BlockRequestSender = channel::RequestSender<Message, Message>;

/// Blockchain request receiver alias.
pub type BlockRequestReceiver = channel::RequestReceiver<Message, Message>;

/// Blockchain response sender alias.
pub type BlockResponseSender = channel::Sender<Message>;

/// Blockchain response receiver alias.
pub type BlockResponseReceiver = channel::Receiver<Message>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::serialize::{rmp_deserialize, rmp_serialize};
    use crate::ErrorKind;

    fn roundtrip(msg: Message) {
        let buf = rmp_serialize(&msg).unwrap();
        let back: Message = rmp_deserialize(&buf).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn exception_roundtrip() {
        roundtrip(Message::Exception(Error::new_ext(
            ErrorKind::BadNetwork,
            "error source",
        )));
    }

    #[test]
    fn stop_roundtrip() {
        roundtrip(Message::Stop);
    }

    #[test]
    fn account_balance_roundtrip() {
        roundtrip(Message::AccountBalance {
            account: Account::new([7; 32]),
        });
        roundtrip(Message::AccountBalanceResponse {
            balance: Amount(10),
            pending: Amount(3),
        });
    }

    #[test]
    fn process_roundtrip() {
        use crate::crypto::Hashable;

        let keypair = crate::crypto::KeyPair::from_seed(&[1; 32]);
        let block =
            crate::base::schema::tests::create_test_send(&keypair, Hash::new([5; 32]), 1000);
        roundtrip(Message::Process {
            block: block.clone(),
            subtype: Some(BlockSubtype::Send),
        });
        roundtrip(Message::ProcessResponse {
            hash: block.hash(),
            result: ProcessResult::Progress,
        });
    }

    #[test]
    fn packed_roundtrip() {
        let inner = Message::Flush;
        let buf = rmp_serialize(&inner).unwrap();
        let msg = Message::Packed { buf: buf.clone() };

        let bytes = rmp_serialize(&msg).unwrap();
        match rmp_deserialize(&bytes).unwrap() {
            Message::Packed { buf: inner_buf } => {
                let back: Message = rmp_deserialize(&inner_buf).unwrap();
                assert_eq!(back, inner);
            }
            _ => panic!("unexpected"),
        }
    }

    #[test]
    fn multi_message_sequence() {
        let msgs = vec![
            Message::Flush,
            Message::Exception(Error::new(ErrorKind::Stopped)),
        ];
        let buf = rmp_serialize(&msgs).unwrap();

        match rmp_deserialize(&buf).unwrap() {
            MultiMessage::Sequence(seq) => assert_eq!(seq, msgs),
            _ => panic!("unexpected"),
        }
    }
}
