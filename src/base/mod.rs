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

//! Common base types shared by the whole library.

pub mod queue_set;
pub mod schema;
pub mod serialize;

/// Mutex type used by all components.
pub type Mutex<T> = parking_lot::Mutex<T>;

/// RwLock type used by all components.
pub type RwLock<T> = parking_lot::RwLock<T>;

pub use schema::{
    Account, AccountInfo, Amount, Block, BlockType, PendingInfo, PendingKey, Sideband,
    SignatureState, StoredBlock, Vote,
};

/// Seconds since the UNIX epoch. Store timestamps and peer bookkeeping use
/// second resolution.
pub fn unix_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
