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

//! Serving side of the bootstrap protocols: frontier streaming, chain
//! walking for bulk pulls and pending projection for account pulls.
//!
//! Responses are raw streams without headers. Frontier and pending streams
//! terminate with an all-zero record; block streams terminate with the
//! `not_a_block` type byte.

use crate::{
    base::{
        schema::{Account, AccountInfo, Block, BlockType, PendingKey},
        RwLock,
    },
    crypto::Hash,
    db::Db,
    Result,
};
use futures::io::{AsyncWrite, AsyncWriteExt};
use std::sync::Arc;

/// Most frontiers served per request, whatever the requested count.
pub const FRONTIER_MAX: u32 = 1 << 20;

/// Age value meaning "no age filter".
pub const AGE_UNLIMITED: u32 = u32::MAX;

/// bulk_pull_account projection flags.
pub const PENDING_HASH_AND_AMOUNT: u8 = 0;
pub const PENDING_ADDRESS_ONLY: u8 = 1;
pub const PENDING_HASH_AMOUNT_SOURCE: u8 = 2;

/// Stream `(account, frontier)` pairs from `start` in account order,
/// skipping accounts untouched for longer than `age` seconds.
pub async fn frontier_req<D: Db, W: AsyncWrite + Unpin>(
    db: &Arc<RwLock<D>>,
    start: Account,
    age: u32,
    count: u32,
    now: u64,
    writer: &mut W,
) -> Result<u32> {
    let count = count.min(FRONTIER_MAX);
    let mut cursor = start;
    let mut written = 0_u32;
    'outer: while written < count {
        let chunk: Vec<(Account, AccountInfo)> = {
            let db = db.read();
            db.frontier_range(&cursor, 256)
        };
        if chunk.is_empty() {
            break;
        }
        for (account, info) in &chunk {
            if written >= count {
                break 'outer;
            }
            if age != AGE_UNLIMITED && now.saturating_sub(info.modified) > age as u64 {
                continue;
            }
            writer.write_all(account.as_bytes()).await?;
            writer.write_all(info.head.as_ref()).await?;
            written += 1;
        }
        let last = chunk.last().expect("chunk not empty").0;
        cursor = match next_account(&last) {
            Some(next) => next,
            None => break,
        };
    }
    // All-zero terminator pair.
    writer.write_all(&[0_u8; 64]).await?;
    writer.flush().await?;
    Ok(written)
}

/// Lexicographic successor of an account key.
fn next_account(account: &Account) -> Option<Account> {
    let mut bytes = *account.as_bytes();
    for i in (0..bytes.len()).rev() {
        if bytes[i] != 0xff {
            bytes[i] += 1;
            for b in bytes.iter_mut().skip(i + 1) {
                *b = 0;
            }
            return Some(Account::new(bytes));
        }
    }
    None
}

/// Serve a bulk pull: walk from the resolved start block back towards
/// `end` (or the chain origin), streaming at most `count` blocks when a
/// count is given. Ends with the `not_a_block` sentinel.
pub async fn bulk_pull<D: Db, W: AsyncWrite + Unpin>(
    db: &Arc<RwLock<D>>,
    start: Hash,
    end: Hash,
    count: Option<u32>,
    writer: &mut W,
) -> Result<u32> {
    // `start` is either an account (pull from its frontier) or a specific
    // block hash.
    let mut cursor = {
        let db = db.read();
        let as_account = Account::new(start.to_bytes());
        match db.account_info(&as_account) {
            Some(info) => info.head,
            None => start,
        }
    };
    let mut streamed = 0_u32;
    loop {
        if let Some(count) = count {
            if streamed >= count {
                break;
            }
        }
        if cursor.is_zero() || cursor == end {
            break;
        }
        let stored = {
            let db = db.read();
            db.block(&cursor)
        };
        let block = match stored {
            Some(stored) => stored.block,
            None => break,
        };
        write_block(writer, &block).await?;
        streamed += 1;
        cursor = block.previous();
    }
    writer.write_all(&[BlockType::NotABlock as u8]).await?;
    writer.flush().await?;
    Ok(streamed)
}

/// Serve a bulk account pull: pending entries above `minimum` with the
/// projection picked by `flags`, zero-record terminated.
pub async fn bulk_pull_account<D: Db, W: AsyncWrite + Unpin>(
    db: &Arc<RwLock<D>>,
    account: Account,
    minimum: crate::base::schema::Amount,
    flags: u8,
    writer: &mut W,
) -> Result<u32> {
    let entries = {
        let db = db.read();
        let start = PendingKey::new(account, Hash::zero());
        db.pending_range(&start, usize::MAX)
            .into_iter()
            .take_while(|(key, _)| key.account == account)
            .filter(|(_, info)| info.amount >= minimum)
            .collect::<Vec<_>>()
    };
    let mut written = 0_u32;
    for (key, info) in entries {
        match flags {
            PENDING_ADDRESS_ONLY => {
                writer.write_all(info.source.as_bytes()).await?;
            }
            PENDING_HASH_AMOUNT_SOURCE => {
                writer.write_all(key.hash.as_ref()).await?;
                writer.write_all(&info.amount.to_be_bytes()).await?;
                writer.write_all(info.source.as_bytes()).await?;
            }
            _ => {
                writer.write_all(key.hash.as_ref()).await?;
                writer.write_all(&info.amount.to_be_bytes()).await?;
            }
        }
        written += 1;
    }
    let terminator_len = match flags {
        PENDING_ADDRESS_ONLY => 32,
        PENDING_HASH_AMOUNT_SOURCE => 80,
        _ => 48,
    };
    writer.write_all(&vec![0_u8; terminator_len]).await?;
    writer.flush().await?;
    Ok(written)
}

/// Write one block in stream framing: type byte then wire body.
pub async fn write_block<W: AsyncWrite + Unpin>(writer: &mut W, block: &Block) -> Result<()> {
    writer.write_all(&[block.block_type() as u8]).await?;
    writer.write_all(&block.to_wire()).await?;
    Ok(())
}
