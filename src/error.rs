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

//! Library error codes and results.
//!
//! Ledger outcomes (gaps, forks, stale blocks) are not errors; they are
//! ordinary values of `blockchain::ledger::ProcessResult`. The `Error` type
//! covers transport, store and fatal conditions that propagate to callers.

use serde::{de::Visitor, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};

/// Project-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Max string length when the error is converted to string using `to_string_full`.
const MAX_ERROR_SOURCE_STRING_LENGTH: usize = 128;

/// Error kind to better contextualize the returned error.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorKind {
    /// Undecodable or size-violating payload.
    MalformedData,
    /// Wrong magic bytes or unsupported protocol version.
    BadNetwork,
    /// Ed25519 verification failure outside the ledger (votes, handshakes).
    InvalidSignature,
    /// Requested entity is not in the store or in any queue.
    ResourceNotFound,
    /// Side-effecting verb received while control is disabled.
    ControlDisabled,
    /// Peer did not answer within the read deadline.
    PeerTimeout,
    /// Connection refused, reset or short read/write.
    ConnectionFault,
    /// Bounded queue or table refused the entry.
    CapacityReached,
    /// Store corruption or failed commit. Fatal.
    StoreFault,
    /// Persistent state written by an unknown schema version. Fatal.
    SchemaMismatch,
    /// Component is shutting down.
    Stopped,
    Other,
}

/// Error kind strings.
pub(super) mod error_kind_str {
    pub const MALFORMED_DATA: &str = "malformed data";
    pub const BAD_NETWORK: &str = "bad network";
    pub const INVALID_SIGNATURE: &str = "invalid signature";
    pub const RESOURCE_NOT_FOUND: &str = "resource not found";
    pub const CONTROL_DISABLED: &str = "control disabled";
    pub const PEER_TIMEOUT: &str = "peer timeout";
    pub const CONNECTION_FAULT: &str = "connection fault";
    pub const CAPACITY_REACHED: &str = "capacity reached";
    pub const STORE_FAULT: &str = "store fault";
    pub const SCHEMA_MISMATCH: &str = "schema mismatch";
    pub const STOPPED: &str = "stopped";
    pub const OTHER: &str = "other";
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        use ErrorKind::*;
        let kind_str = match self {
            MalformedData => error_kind_str::MALFORMED_DATA,
            BadNetwork => error_kind_str::BAD_NETWORK,
            InvalidSignature => error_kind_str::INVALID_SIGNATURE,
            ResourceNotFound => error_kind_str::RESOURCE_NOT_FOUND,
            ControlDisabled => error_kind_str::CONTROL_DISABLED,
            PeerTimeout => error_kind_str::PEER_TIMEOUT,
            ConnectionFault => error_kind_str::CONNECTION_FAULT,
            CapacityReached => error_kind_str::CAPACITY_REACHED,
            StoreFault => error_kind_str::STORE_FAULT,
            SchemaMismatch => error_kind_str::SCHEMA_MISMATCH,
            Stopped => error_kind_str::STOPPED,
            Other => error_kind_str::OTHER,
        };
        write!(f, "{}", kind_str)
    }
}

impl Serialize for ErrorKind {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let msg = self.to_string();
        serializer.serialize_str(&msg)
    }
}

impl<'de> Deserialize<'de> for ErrorKind {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ErrorKindVisitor;

        impl<'de> Visitor<'de> for ErrorKindVisitor {
            type Value = String;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a string")
            }

            fn visit_str<R>(self, value: &str) -> std::result::Result<String, R> {
                Ok(value.to_string())
            }
        }

        let kind = match deserializer.deserialize_str(ErrorKindVisitor)?.as_str() {
            error_kind_str::MALFORMED_DATA => ErrorKind::MalformedData,
            error_kind_str::BAD_NETWORK => ErrorKind::BadNetwork,
            error_kind_str::INVALID_SIGNATURE => ErrorKind::InvalidSignature,
            error_kind_str::RESOURCE_NOT_FOUND => ErrorKind::ResourceNotFound,
            error_kind_str::CONTROL_DISABLED => ErrorKind::ControlDisabled,
            error_kind_str::PEER_TIMEOUT => ErrorKind::PeerTimeout,
            error_kind_str::CONNECTION_FAULT => ErrorKind::ConnectionFault,
            error_kind_str::CAPACITY_REACHED => ErrorKind::CapacityReached,
            error_kind_str::STORE_FAULT => ErrorKind::StoreFault,
            error_kind_str::SCHEMA_MISMATCH => ErrorKind::SchemaMismatch,
            error_kind_str::STOPPED => ErrorKind::Stopped,
            _ => ErrorKind::Other,
        };
        Ok(kind)
    }
}

/// Project-wide error type.
/// Contains a kind enumerate and a `source` to identify the subsystem that
/// may have propagated the error.
#[derive(Debug, Serialize, Deserialize)]
pub struct Error {
    /// Error kind.
    pub kind: ErrorKind,
    /// Not propagated by service messages.
    #[serde(serialize_with = "source_se", deserialize_with = "source_de")]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

fn source_se<S: Serializer>(
    source: &Option<Box<dyn std::error::Error + Send + Sync>>,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    match source {
        Some(b) => s.serialize_str(&b.to_string()),
        None => s.serialize_unit(),
    }
}

fn source_de<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<Box<dyn std::error::Error + Send + Sync>>, D::Error> {
    struct ErrorVisitor;

    impl<'de> Visitor<'de> for ErrorVisitor {
        type Value = String;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string")
        }

        fn visit_str<R>(self, value: &str) -> std::result::Result<String, R> {
            Ok(value.to_string())
        }
    }

    match d.deserialize_str(ErrorVisitor) {
        Ok(s) => Ok(Some(s.into())),
        Err(_err) => Ok(None),
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        Error {
            kind: self.kind,
            source: None,
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::new_ext(ErrorKind::Other, s)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ErrorKind::PeerTimeout,
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof => ErrorKind::ConnectionFault,
            _ => ErrorKind::Other,
        };
        Error::new_ext(kind, err)
    }
}

impl<T> From<ErrorKind> for Result<T> {
    fn from(kind: ErrorKind) -> Self {
        Err(kind.into())
    }
}

impl Error {
    pub fn new_ext<E>(kind: ErrorKind, error: E) -> Error
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let source = error.into();
        Error {
            kind,
            source: Some(source),
        }
    }

    pub fn new(kind: ErrorKind) -> Error {
        Error { kind, source: None }
    }

    /// True for conditions that must abort the node per the error policy.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind, ErrorKind::StoreFault | ErrorKind::SchemaMismatch)
    }

    pub fn to_string_full(&self) -> String {
        let mut err_string = self.to_string();
        if let Some(ref source) = self.source {
            let detail = format!(": {}", source);
            let max_len = std::cmp::min(detail.len(), MAX_ERROR_SOURCE_STRING_LENGTH);
            err_string.push_str(&detail[..max_len]);
        }
        err_string
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Error) -> bool {
        if self.kind != other.kind {
            return false;
        }
        if self.source.is_none() && other.source.is_none() {
            true
        } else if self.source.is_some() && other.source.is_some() {
            format!("{:?}", self.source) == format!("{:?}", other.source)
        } else {
            false
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self.source {
            None => None,
            Some(ref source) => Some(source.as_ref()),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::serialize::{rmp_deserialize, rmp_serialize};
    use std::io;
    use ErrorKind::*;

    #[test]
    fn generic_error_type() {
        let src1 = io::Error::new(io::ErrorKind::PermissionDenied, "oh no!");
        let src2 = io::Error::new(io::ErrorKind::TimedOut, "oh no!");
        let err1 = Error::new_ext(StoreFault, src1);
        let err2 = Error::new_ext(StoreFault, src2);

        assert_ne!(err1, err2);
    }

    #[test]
    fn external_store_failure() {
        let source = io::Error::new(io::ErrorKind::PermissionDenied, "oh no!");

        let error = Error::new_ext(StoreFault, source);

        assert_eq!(error.to_string(), "store fault");
        assert_eq!(error.to_string_full(), "store fault: oh no!");
        let source = std::error::Error::source(&error)
            .unwrap()
            .downcast_ref::<io::Error>()
            .unwrap();
        assert_eq!(source.kind(), io::ErrorKind::PermissionDenied);
        assert!(std::error::Error::source(&source).is_none());
    }

    #[test]
    fn io_error_mapping() {
        let err: Error = io::Error::new(io::ErrorKind::TimedOut, "slow peer").into();
        assert_eq!(err.kind, PeerTimeout);

        let err: Error = io::Error::new(io::ErrorKind::ConnectionReset, "gone").into();
        assert_eq!(err.kind, ConnectionFault);
    }

    #[test]
    fn fatal_kinds() {
        assert!(Error::new(StoreFault).is_fatal());
        assert!(Error::new(SchemaMismatch).is_fatal());
        assert!(!Error::new(PeerTimeout).is_fatal());
    }

    #[test]
    fn error_serialize_roundtrip() {
        let source = io::Error::new(io::ErrorKind::PermissionDenied, "oh no!");
        let error = Error::new_ext(ConnectionFault, source);

        let buf = rmp_serialize(&error).unwrap();
        let err: Error = rmp_deserialize(&buf).unwrap();

        assert_eq!(err, Error::new_ext(ConnectionFault, "oh no!"));
    }

    #[test]
    fn error_serialize_roundtrip_no_source() {
        let error = Error::new(CapacityReached);

        let buf = rmp_serialize(&error).unwrap();
        let err: Error = rmp_deserialize(&buf).unwrap();

        assert_eq!(err, Error::new(CapacityReached));
    }
}
