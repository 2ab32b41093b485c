//! Error taxonomy shared by every AFF4 subsystem.
//!
//! The original C++ library communicates failures through status codes
//! rather than exceptions; this mirrors that discipline with a single
//! `Result<T, Aff4Error>` used pervasively instead of panics.

use std::fmt;
use std::io;

#[derive(Debug)]
pub enum Aff4Error {
    /// URN or member absent.
    NotFound(String),
    /// Malformed argument, odd-length hex, URN outside volume, etc.
    InvalidInput(String),
    /// On-disk structure corrupted or unexpected.
    Parsing(String),
    /// Underlying OS I/O failure or unwritable stream.
    Io(io::Error),
    /// Unsupported compression method or symbolic stream.
    NotImplemented(String),
    /// RDF value type mismatch on Get.
    IncompatibleTypes(String),
    /// A progress callback cancelled the operation.
    Aborted,
    /// Codec initialization failure.
    Memory(String),
}

impl fmt::Display for Aff4Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aff4Error::NotFound(s) => write!(f, "not found: {s}"),
            Aff4Error::InvalidInput(s) => write!(f, "invalid input: {s}"),
            Aff4Error::Parsing(s) => write!(f, "parsing error: {s}"),
            Aff4Error::Io(e) => write!(f, "io error: {e}"),
            Aff4Error::NotImplemented(s) => write!(f, "not implemented: {s}"),
            Aff4Error::IncompatibleTypes(s) => write!(f, "incompatible types: {s}"),
            Aff4Error::Aborted => write!(f, "operation aborted"),
            Aff4Error::Memory(s) => write!(f, "memory/codec error: {s}"),
        }
    }
}

impl std::error::Error for Aff4Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Aff4Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Aff4Error {
    fn from(e: io::Error) -> Self {
        Aff4Error::Io(e)
    }
}

impl From<Aff4Error> for io::Error {
    fn from(e: Aff4Error) -> Self {
        match e {
            Aff4Error::Io(e) => e,
            other => io::Error::other(other.to_string()),
        }
    }
}

pub type Aff4Result<T> = Result<T, Aff4Error>;
