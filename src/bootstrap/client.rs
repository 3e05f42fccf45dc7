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

//! Legacy bootstrap client: frontier comparison, parallel chain pulls and
//! the push of chains the peer is missing.

use super::{connect, BootstrapContext};
use crate::{
    base::{schema::Account, unix_time},
    blockchain::Message,
    bootstrap::server::write_block,
    crypto::{Hash, Hashable},
    db::Db,
    net::message::WireMessage,
    Error, ErrorKind, Result,
};
use async_std::net::TcpStream;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use std::net::SocketAddr;

/// One missing chain segment: pull from the peer's frontier back to ours.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PullRequest {
    pub account: Account,
    /// Stop hash: our frontier, or zero for unknown accounts.
    pub end: Hash,
}

/// One chain segment the peer lacks: push from our frontier back to theirs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushRequest {
    pub account: Account,
    /// The peer's frontier, where our stream stops.
    pub end: Hash,
}

/// Read exactly `buf.len()` bytes under the context deadline.
async fn read_exact_deadline<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    timeout: std::time::Duration,
) -> Result<()> {
    async_std::future::timeout(timeout, reader.read_exact(buf))
        .await
        .map_err(|_| Error::new(ErrorKind::PeerTimeout))?
        .map_err(Error::from)
}

/// Read one stream-framed block; `None` at the `not_a_block` sentinel.
pub async fn read_block<R: AsyncRead + Unpin>(
    reader: &mut R,
    timeout: std::time::Duration,
) -> Result<Option<crate::base::schema::Block>> {
    let mut type_byte = [0_u8; 1];
    read_exact_deadline(reader, &mut type_byte, timeout).await?;
    let block_type = crate::base::schema::BlockType::from_u8(type_byte[0])
        .ok_or_else(|| Error::new(ErrorKind::MalformedData))?;
    if block_type == crate::base::schema::BlockType::NotABlock {
        return Ok(None);
    }
    let len = block_type.wire_len();
    if len == 0 {
        return Err(Error::new(ErrorKind::MalformedData));
    }
    let mut body = vec![0_u8; len];
    read_exact_deadline(reader, &mut body, timeout).await?;
    Ok(Some(crate::base::schema::Block::from_wire(
        block_type, &body,
    )?))
}

/// Read one frontier pair; `None` at the all-zero terminator.
pub async fn read_frontier<R: AsyncRead + Unpin>(
    reader: &mut R,
    timeout: std::time::Duration,
) -> Result<Option<(Account, Hash)>> {
    let mut pair = [0_u8; 64];
    read_exact_deadline(reader, &mut pair, timeout).await?;
    if pair == [0_u8; 64] {
        return Ok(None);
    }
    Ok(Some((
        Account::from_bytes(&pair[..32])?,
        Hash::from_bytes(&pair[32..])?,
    )))
}

/// Outcome counters of one legacy attempt.
#[derive(Default, Debug)]
pub struct LegacyOutcome {
    pub frontiers: u64,
    pub pulled: u64,
    pub pushed: u64,
}

/// Run one legacy attempt against `peer`.
pub(crate) async fn run_legacy<D: Db>(
    ctx: &BootstrapContext<D>,
    peer: SocketAddr,
) -> Result<LegacyOutcome> {
    let timeout = ctx.config.tcp_io_timeout;
    let mut outcome = LegacyOutcome::default();

    // Phase 1: frontier comparison.
    let mut stream = connect(peer, timeout).await?;
    let req = WireMessage::FrontierReq {
        start: Account::zero(),
        age: super::server::AGE_UNLIMITED,
        count: super::server::FRONTIER_MAX,
    };
    stream.write_all(&req.encode(&ctx.network)).await?;

    let mut pulls = Vec::new();
    let mut pushes = Vec::new();
    while let Some((account, their_frontier)) = read_frontier(&mut stream, timeout).await? {
        outcome.frontiers += 1;
        let ours = ctx.db.read().account_info(&account);
        match ours {
            None => pulls.push(PullRequest {
                account,
                end: Hash::zero(),
            }),
            Some(info) if info.head == their_frontier => {}
            Some(info) => {
                if ctx.db.read().contains_block(&their_frontier) {
                    // The peer is behind on this chain; offer the suffix.
                    pushes.push(PushRequest {
                        account,
                        end: their_frontier,
                    });
                } else {
                    pulls.push(PullRequest {
                        account,
                        end: info.head,
                    });
                }
            }
        }
    }
    drop(stream);

    // Phase 2: drain pulls, a bounded number of connections at a time.
    let concurrency = ctx.config.bootstrap_connections.max(1);
    for batch in pulls.chunks(concurrency) {
        let tasks = batch.iter().map(|pull| run_pull(ctx, peer, pull.clone()));
        for result in futures::future::join_all(tasks).await {
            outcome.pulled += result?;
        }
    }

    // Phase 3: push chains the peer is missing.
    for push in pushes {
        outcome.pushed += run_push(ctx, peer, push).await?;
    }

    // Synchronize with the processor before reporting success.
    if let Ok(rx) = ctx.block_tx.send(Message::Flush).await {
        let _ = rx.recv().await;
    }
    Ok(outcome)
}

/// Pull one account chain and feed it to the block processor.
async fn run_pull<D: Db>(
    ctx: &BootstrapContext<D>,
    peer: SocketAddr,
    pull: PullRequest,
) -> Result<u64> {
    let timeout = ctx.config.tcp_io_timeout;
    let mut stream = connect(peer, timeout).await?;
    let req = WireMessage::BulkPull {
        start: Hash::new(*pull.account.as_bytes()),
        end: pull.end,
        count: None,
    };
    stream.write_all(&req.encode(&ctx.network)).await?;

    let mut pulled = 0_u64;
    while let Some(block) = read_block(&mut stream, timeout).await? {
        enqueue_block(ctx, block).await?;
        pulled += 1;
    }
    Ok(pulled)
}

/// Stream our chain suffix for one account to the peer.
async fn run_push<D: Db>(
    ctx: &BootstrapContext<D>,
    peer: SocketAddr,
    push: PushRequest,
) -> Result<u64> {
    let timeout = ctx.config.tcp_io_timeout;
    let mut stream: TcpStream = connect(peer, timeout).await?;
    let req = WireMessage::BulkPush;
    stream.write_all(&req.encode(&ctx.network)).await?;

    // Collect the suffix newest-first; the receiving side resolves order
    // through its unchecked table.
    let blocks = {
        let db = ctx.db.read();
        let mut cursor = match db.account_info(&push.account) {
            Some(info) => info.head,
            None => Hash::zero(),
        };
        let mut blocks = Vec::new();
        while !cursor.is_zero() && cursor != push.end {
            match db.block(&cursor) {
                Some(stored) => {
                    cursor = stored.block.previous();
                    blocks.push(stored.block);
                }
                None => break,
            }
        }
        blocks
    };
    let mut pushed = 0_u64;
    for block in &blocks {
        write_block(&mut stream, block).await?;
        pushed += 1;
    }
    stream
        .write_all(&[crate::base::schema::BlockType::NotABlock as u8])
        .await?;
    stream.flush().await?;
    Ok(pushed)
}

/// Hand a pulled block to the processor queue.
pub(crate) async fn enqueue_block<D: Db>(
    ctx: &BootstrapContext<D>,
    block: crate::base::schema::Block,
) -> Result<()> {
    trace!("bootstrap queueing {}", block.hash());
    let rx = ctx
        .block_tx
        .send(Message::ProcessBlock {
            block,
            arrival: unix_time(),
            verified: crate::base::schema::SignatureState::Unknown,
        })
        .await
        .map_err(|_| Error::new(ErrorKind::Stopped))?;
    let _ = rx.recv().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::schema::tests::{create_test_send, test_keypair};
    use crate::base::schema::BlockType;
    use futures::io::Cursor;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[test]
    fn block_stream_roundtrip() {
        let block = create_test_send(&test_keypair(1), Hash::new([5; 32]), 42);
        let mut raw = Vec::new();
        raw.push(block.block_type() as u8);
        raw.extend_from_slice(&block.to_wire());
        raw.push(BlockType::NotABlock as u8);

        let mut reader = Cursor::new(raw);
        let first = async_std::task::block_on(read_block(&mut reader, TIMEOUT)).unwrap();
        assert_eq!(first, Some(block));
        let done = async_std::task::block_on(read_block(&mut reader, TIMEOUT)).unwrap();
        assert_eq!(done, None);
    }

    #[test]
    fn block_stream_rejects_unknown_type() {
        let mut reader = Cursor::new(vec![0xee_u8; 10]);

        let err = async_std::task::block_on(read_block(&mut reader, TIMEOUT)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::MalformedData);
    }

    #[test]
    fn frontier_stream_roundtrip() {
        let account = Account::new([3; 32]);
        let head = Hash::new([4; 32]);
        let mut raw = Vec::new();
        raw.extend_from_slice(account.as_bytes());
        raw.extend_from_slice(head.as_ref());
        raw.extend_from_slice(&[0_u8; 64]);

        let mut reader = Cursor::new(raw);
        let first = async_std::task::block_on(read_frontier(&mut reader, TIMEOUT)).unwrap();
        assert_eq!(first, Some((account, head)));
        let done = async_std::task::block_on(read_frontier(&mut reader, TIMEOUT)).unwrap();
        assert_eq!(done, None);
    }

    #[test]
    fn truncated_stream_times_out_or_errors() {
        // A stream that ends mid-record surfaces a transport error, not a
        // panic or a half-block.
        let block = create_test_send(&test_keypair(1), Hash::new([5; 32]), 42);
        let mut raw = Vec::new();
        raw.push(block.block_type() as u8);
        raw.extend_from_slice(&block.to_wire()[..10]);

        let mut reader = Cursor::new(raw);
        assert!(async_std::task::block_on(read_block(&mut reader, TIMEOUT)).is_err());
    }
}
