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

//! Opaque cryptographic secure hash used by the overall project.
//!
//! Block identities, vote digests and handshake cookies are all 32-byte
//! Blake2b digests.

use crate::{Error, ErrorKind, Result};
use blake2::{
    digest::{Update, VariableOutput},
    VarBlake2b,
};
use serde::{de::Visitor, Deserializer, Serializer};

/// Digest byte length.
pub const HASH_LEN: usize = 32;

/// 32-byte Blake2b digest.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct Hash([u8; HASH_LEN]);

impl Hash {
    /// The all-zero hash, used as chain terminator and "not a block" marker.
    pub const fn zero() -> Self {
        Hash([0; HASH_LEN])
    }

    pub const fn new(bytes: [u8; HASH_LEN]) -> Self {
        Hash(bytes)
    }

    /// Construct from a byte slice of exactly `HASH_LEN` bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HASH_LEN {
            return Err(Error::new(ErrorKind::MalformedData));
        }
        let mut buf = [0; HASH_LEN];
        buf.copy_from_slice(bytes);
        Ok(Hash(buf))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; HASH_LEN] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; HASH_LEN]
    }

    /// Creates a new instance from a hex string. Mostly used for testing.
    pub fn from_hex(hex: &str) -> Result<Self> {
        match hex::decode(hex) {
            Ok(buf) => Self::from_bytes(&buf),
            Err(_) => Err(Error::new(ErrorKind::MalformedData)),
        }
    }
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash({})", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; HASH_LEN]> for Hash {
    fn from(bytes: [u8; HASH_LEN]) -> Self {
        Hash(bytes)
    }
}

impl serde::Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct BytesVisitor;

        impl<'de> Visitor<'de> for BytesVisitor {
            type Value = Hash;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("32 bytes")
            }

            fn visit_bytes<E>(self, value: &[u8]) -> std::result::Result<Hash, E>
            where
                E: serde::de::Error,
            {
                Hash::from_bytes(value).map_err(|_| E::invalid_length(value.len(), &self))
            }
        }

        deserializer.deserialize_bytes(BytesVisitor)
    }
}

/// Compute the 32-byte Blake2b digest of the concatenation of `parts`.
pub fn blake2b(parts: &[&[u8]]) -> Hash {
    let mut hasher = VarBlake2b::new(HASH_LEN).expect("valid digest length");
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0; HASH_LEN];
    hasher.finalize_variable(|digest| out.copy_from_slice(digest));
    Hash(out)
}

/// Compute an 8-byte Blake2b digest, interpreted as a little-endian integer.
/// This is the proof-of-work evaluation primitive.
pub fn blake2b_u64(parts: &[&[u8]]) -> u64 {
    let mut hasher = VarBlake2b::new(8).expect("valid digest length");
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0; 8];
    hasher.finalize_variable(|digest| out.copy_from_slice(digest));
    u64::from_le_bytes(out)
}

/// Trait implemented by types identified by their Blake2b digest.
pub trait Hashable {
    fn hash(&self) -> Hash;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::serialize::{rmp_deserialize, rmp_serialize};

    #[test]
    fn digest_is_input_sensitive() {
        let a = blake2b(&[b"lattice"]);
        let b = blake2b(&[b"lattice!"]);

        assert_ne!(a, b);
        assert!(!a.is_zero());
    }

    #[test]
    fn digest_of_concatenation() {
        let split = blake2b(&[b"block", b"chain"]);
        let joined = blake2b(&[b"blockchain"]);

        assert_eq!(split, joined);
    }

    #[test]
    fn from_bytes_length_check() {
        assert!(Hash::from_bytes(&[0; 32]).is_ok());
        assert!(Hash::from_bytes(&[0; 31]).is_err());
        assert!(Hash::from_bytes(&[0; 33]).is_err());
    }

    #[test]
    fn hex_roundtrip() {
        let hash = blake2b(&[b"frontier"]);

        let back = Hash::from_hex(&hash.to_string()).unwrap();

        assert_eq!(back, hash);
    }

    #[test]
    fn serde_roundtrip() {
        let hash = blake2b(&[b"pending"]);

        let buf = rmp_serialize(&hash).unwrap();
        let back: Hash = rmp_deserialize(&buf).unwrap();

        assert_eq!(back, hash);
    }

    #[test]
    fn zero_is_default() {
        assert_eq!(Hash::default(), Hash::zero());
        assert!(Hash::zero().is_zero());
    }
}
