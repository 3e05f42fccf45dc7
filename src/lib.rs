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

//! Core components of the Vela block-lattice node: ledger and store,
//! block processor, vote-driven elections, peer networking and bootstrap.

// External crates macros.
#[macro_use]
extern crate serde;
#[macro_use]
extern crate log;

// Public modules.
pub mod alarm;
pub mod base;
pub mod blockchain;
pub mod bootstrap;
pub mod channel;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod net;
pub mod node;

pub use base::schema::{Account, AccountInfo, Amount, Block, Vote};
pub use blockchain::{BlockService, Ledger, Message, ProcessResult};
pub use config::{Network, NodeConfig};
pub use crypto::{Hash, KeyPair, PublicKey};
pub use error::{Error, ErrorKind, Result};
pub use node::Node;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const VERSION_MAJOR: &str = env!("CARGO_PKG_VERSION_MAJOR");
pub const VERSION_MINOR: &str = env!("CARGO_PKG_VERSION_MINOR");
pub const VERSION_PATCH: &str = env!("CARGO_PKG_VERSION_PATCH");
