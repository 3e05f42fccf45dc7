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

//! Cryptographic primitives consumed by the node as pure functions:
//! Blake2b digests, Ed25519 signatures and the proof-of-work check.

pub mod ed25519;
pub mod hash;
pub mod work;

pub use ed25519::{KeyPair, PublicKey, Signature};
pub use hash::{Hash, Hashable};
pub use work::{work_valid, work_value, WorkPool};
