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

//! MessagePack helpers for store values and internal service messages.
//!
//! The node-to-node wire format is NOT MessagePack; it is the fixed
//! big-endian layout implemented in `net::message`. This module only covers
//! state that never leaves the process boundary uninterpreted.

use crate::{Error, ErrorKind, Result};
use serde::{Deserialize, Serialize};

/// Serialize using MessagePack format (without field names).
///
/// # Error
///
/// If the data cannot be serialized a `MalformedData` error kind is returned.
pub fn rmp_serialize<T>(val: &T) -> Result<Vec<u8>>
where
    T: Serialize,
{
    rmp_serde::to_vec(val).map_err(|err| Error::new_ext(ErrorKind::MalformedData, err))
}

/// Deserialize using MessagePack format.
///
/// # Error
///
/// If the data cannot be deserialized a `MalformedData` error kind is returned.
pub fn rmp_deserialize<'a, T>(buf: &'a [u8]) -> Result<T>
where
    T: Deserialize<'a>,
{
    rmp_serde::from_slice(buf).map_err(|err| Error::new_ext(ErrorKind::MalformedData, err))
}

/// Trait implemented by all types that can be serialized with MessagePack format.
pub trait MessagePack<'a>: Sized + Serialize + Deserialize<'a> {
    /// Serialize using MessagePack format.
    ///
    /// # Panics
    ///
    /// Panics if the concrete type cannot be serialized using message pack.
    fn serialize(&self) -> Vec<u8> {
        rmp_serialize(self).unwrap() // Safe for core structs.
    }

    /// Deserialize using MessagePack format.
    ///
    /// # Errors
    ///
    /// Propagates the message pack decoder error.
    fn deserialize(buf: &'a [u8]) -> Result<Self> {
        rmp_deserialize(buf)
    }
}

/// Blanket implementation for types implementing `Serialize` and `Deserialize`.
impl<'a, T: Serialize + Deserialize<'a>> MessagePack<'a> for T {}
