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

//! Ed25519 wrappers. Accounts are public keys; block and vote authenticity
//! is a signature over a 32-byte digest.

use crate::{Error, ErrorKind, Result};
use ed25519_dalek::{
    Keypair as KeyPairImpl, PublicKey as PublicKeyImpl, SecretKey, Signer as _, Verifier as _,
};
use rand::rngs::OsRng;
use serde::{de::Visitor, Deserializer, Serializer};
use std::convert::TryFrom;

/// Signature byte length.
pub const SIGNATURE_LEN: usize = 64;

/// Public key (and seed) byte length.
pub const PUBLIC_KEY_LEN: usize = 32;

pub struct KeyPair(KeyPairImpl);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    imp: PublicKeyImpl,
}

/// Detached Ed25519 signature.
#[derive(Copy, Clone)]
pub struct Signature([u8; SIGNATURE_LEN]);

impl KeyPair {
    /// Rebuild a keypair from its 64-byte secret+public serialization.
    pub fn from_bytes(bytes: &[u8]) -> Result<KeyPair> {
        let internal = KeyPairImpl::from_bytes(bytes)
            .map_err(|err| Error::new_ext(ErrorKind::MalformedData, err))?;
        Ok(KeyPair(internal))
    }

    /// Derive a keypair from a 32-byte seed. Deterministic; used by the test
    /// networks and by node identity restoration.
    pub fn from_seed(seed: &[u8; PUBLIC_KEY_LEN]) -> KeyPair {
        let secret = SecretKey::from_bytes(seed).expect("seed length is fixed");
        let public = PublicKeyImpl::from(&secret);
        KeyPair(KeyPairImpl { secret, public })
    }

    pub fn from_random() -> KeyPair {
        let mut csprng = OsRng {};
        let internal = KeyPairImpl::generate(&mut csprng);
        KeyPair(internal)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes().to_vec()
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        Signature(self.0.sign(data).to_bytes())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey { imp: self.0.public }
    }
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<PublicKey> {
        let internal = PublicKeyImpl::from_bytes(bytes)
            .map_err(|err| Error::new_ext(ErrorKind::MalformedData, err))?;
        Ok(PublicKey { imp: internal })
    }

    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.imp.to_bytes()
    }

    pub fn verify(&self, data: &[u8], sig: &Signature) -> bool {
        ed25519_dalek::Signature::try_from(&sig.0[..])
            .and_then(|s| self.imp.verify(data, &s))
            .is_ok()
    }
}

impl Signature {
    pub const fn zero() -> Self {
        Signature([0; SIGNATURE_LEN])
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SIGNATURE_LEN {
            return Err(Error::new(ErrorKind::MalformedData));
        }
        let mut buf = [0; SIGNATURE_LEN];
        buf.copy_from_slice(bytes);
        Ok(Signature(buf))
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LEN] {
        &self.0
    }
}

impl Default for Signature {
    fn default() -> Self {
        Signature::zero()
    }
}

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.0[..] == other.0[..]
    }
}

impl Eq for Signature {}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({})", hex::encode(&self.0[..8]))
    }
}

impl serde::Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct BytesVisitor;

        impl<'de> Visitor<'de> for BytesVisitor {
            type Value = Signature;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("64 bytes")
            }

            fn visit_bytes<E>(self, value: &[u8]) -> std::result::Result<Signature, E>
            where
                E: serde::de::Error,
            {
                Signature::from_bytes(value).map_err(|_| E::invalid_length(value.len(), &self))
            }
        }

        deserializer.deserialize_bytes(BytesVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify() {
        let keypair = KeyPair::from_random();

        let sig = keypair.sign(b"hello");

        assert!(keypair.public_key().verify(b"hello", &sig));
        assert!(!keypair.public_key().verify(b"hellO", &sig));
    }

    #[test]
    fn verify_wrong_key() {
        let keypair = KeyPair::from_random();
        let other = KeyPair::from_random();

        let sig = keypair.sign(b"hello");

        assert!(!other.public_key().verify(b"hello", &sig));
    }

    #[test]
    fn seed_is_deterministic() {
        let a = KeyPair::from_seed(&[7; 32]);
        let b = KeyPair::from_seed(&[7; 32]);
        let c = KeyPair::from_seed(&[8; 32]);

        assert_eq!(a.public_key(), b.public_key());
        assert_ne!(a.public_key(), c.public_key());
    }

    #[test]
    fn keypair_roundtrip() {
        let keypair = KeyPair::from_random();

        let back = KeyPair::from_bytes(&keypair.to_bytes()).unwrap();

        assert_eq!(back.public_key(), keypair.public_key());
    }

    #[test]
    fn signature_from_bytes_length() {
        assert!(Signature::from_bytes(&[0; 64]).is_ok());
        assert!(Signature::from_bytes(&[0; 63]).is_err());
    }
}
