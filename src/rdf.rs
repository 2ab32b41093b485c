//! RDFValue type model (spec.md §4.A).
//!
//! Mirrors `original_source/src/rdf.h`'s `RDFBytes`/`XSDString`/`XSDInteger`/
//! `XSDBoolean`/`URN` hierarchy as a closed enum per the REDESIGN notes
//! (spec.md §9: "replace the string-keyed class registry with a closed
//! tagged variant").

use crate::error::{Aff4Error, Aff4Result};
use crate::urn::Urn;

pub const XSD_STRING: &str = "http://www.w3.org/2001/XMLSchema#string";
pub const XSD_INTEGER: &str = "http://www.w3.org/2001/XMLSchema#integer";
pub const XSD_BOOLEAN: &str = "http://www.w3.org/2001/XMLSchema#boolean";
pub const RDF_BYTES_TYPE: &str = "http://aff4.org/Schema#bytes";
pub const RDF_URN_TYPE: &str = "http://www.w3.org/2001/XMLSchema#anyURI";

pub const MD5_TYPE: &str = "http://aff4.org/Schema#MD5";
pub const SHA1_TYPE: &str = "http://aff4.org/Schema#SHA1";
pub const SHA256_TYPE: &str = "http://aff4.org/Schema#SHA256";
pub const SHA512_TYPE: &str = "http://aff4.org/Schema#SHA512";
pub const BLAKE2B_TYPE: &str = "http://aff4.org/Schema#Blake2b";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashKind {
    Md5,
    Sha1,
    Sha256,
    Sha512,
    Blake2b,
}

impl HashKind {
    pub fn type_uri(&self) -> &'static str {
        match self {
            HashKind::Md5 => MD5_TYPE,
            HashKind::Sha1 => SHA1_TYPE,
            HashKind::Sha256 => SHA256_TYPE,
            HashKind::Sha512 => SHA512_TYPE,
            HashKind::Blake2b => BLAKE2B_TYPE,
        }
    }
}

/// Tagged sum over every literal/URN kind the resolver can store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RdfValue {
    Bytes(Vec<u8>),
    XsdString(String),
    XsdInteger(i64),
    XsdBoolean(bool),
    Urn(Urn),
    Hash(HashKind, String),
}

impl RdfValue {
    /// The stable type URI used in Turtle output.
    pub fn type_uri(&self) -> &str {
        match self {
            RdfValue::Bytes(_) => RDF_BYTES_TYPE,
            RdfValue::XsdString(_) => XSD_STRING,
            RdfValue::XsdInteger(_) => XSD_INTEGER,
            RdfValue::XsdBoolean(_) => XSD_BOOLEAN,
            RdfValue::Urn(_) => RDF_URN_TYPE,
            RdfValue::Hash(k, _) => k.type_uri(),
        }
    }

    /// Serialize the value's lexical form (the Turtle object literal body,
    /// without the type suffix).
    pub fn serialize_to_string(&self) -> String {
        match self {
            RdfValue::Bytes(b) => hex_encode_upper(b),
            RdfValue::XsdString(s) => s.clone(),
            RdfValue::XsdInteger(i) => i.to_string(),
            RdfValue::XsdBoolean(b) => b.to_string(),
            RdfValue::Urn(u) => u.as_str().to_string(),
            RdfValue::Hash(_, s) => s.clone(),
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RdfValue::XsdInteger(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_urn(&self) -> Option<&Urn> {
        match self {
            RdfValue::Urn(u) => Some(u),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            RdfValue::XsdString(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RdfValue::XsdBoolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Parse a lexical form given its type URI, as the resolver's Turtle
    /// loader does for every object it reads back.
    pub fn parse(type_uri: &str, lexical: &str) -> Aff4Result<RdfValue> {
        match type_uri {
            XSD_STRING => Ok(RdfValue::XsdString(lexical.to_string())),
            XSD_INTEGER | "xsd:int" | "xsd:long" => lexical
                .parse::<i64>()
                .map(RdfValue::XsdInteger)
                .map_err(|e| Aff4Error::InvalidInput(e.to_string())),
            XSD_BOOLEAN => parse_bool(lexical).map(RdfValue::XsdBoolean),
            RDF_URN_TYPE => Ok(RdfValue::Urn(Urn::new(lexical))),
            RDF_BYTES_TYPE => hex_decode(lexical).map(RdfValue::Bytes),
            MD5_TYPE => Ok(RdfValue::Hash(HashKind::Md5, lexical.to_string())),
            SHA1_TYPE => Ok(RdfValue::Hash(HashKind::Sha1, lexical.to_string())),
            SHA256_TYPE => Ok(RdfValue::Hash(HashKind::Sha256, lexical.to_string())),
            SHA512_TYPE => Ok(RdfValue::Hash(HashKind::Sha512, lexical.to_string())),
            BLAKE2B_TYPE => Ok(RdfValue::Hash(HashKind::Blake2b, lexical.to_string())),
            other => Err(Aff4Error::NotImplemented(format!(
                "unknown RDF value type: {other}"
            ))),
        }
    }
}

fn parse_bool(s: &str) -> Aff4Result<bool> {
    match s {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(Aff4Error::InvalidInput(format!(
            "invalid xsd:boolean literal: {other}"
        ))),
    }
}

fn hex_encode_upper(data: &[u8]) -> String {
    const LUT: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(data.len() * 2);
    for b in data {
        out.push(LUT[(b >> 4) as usize] as char);
        out.push(LUT[(b & 0xf) as usize] as char);
    }
    out
}

fn hex_decode(s: &str) -> Aff4Result<Vec<u8>> {
    if !s.len().is_multiple_of(2) {
        return Err(Aff4Error::InvalidInput(
            "odd-length hex string".to_string(),
        ));
    }
    let mut out = Vec::with_capacity(s.len() / 2);
    let bytes = s.as_bytes();
    for chunk in bytes.chunks(2) {
        let hi = hex_val(chunk[0])?;
        let lo = hex_val(chunk[1])?;
        out.push((hi << 4) | lo);
    }
    Ok(out)
}

fn hex_val(c: u8) -> Aff4Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(Aff4Error::InvalidInput(format!("invalid hex digit {c}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_variants() {
        let values = vec![
            RdfValue::Bytes(vec![0xDE, 0xAD, 0xBE, 0xEF]),
            RdfValue::XsdString("hello world".to_string()),
            RdfValue::XsdInteger(-42),
            RdfValue::XsdBoolean(true),
            RdfValue::XsdBoolean(false),
            RdfValue::Urn(Urn::new("aff4://abcd-1234")),
            RdfValue::Hash(HashKind::Sha256, "abcd".to_string()),
        ];
        for v in values {
            let serialized = v.serialize_to_string();
            let parsed = RdfValue::parse(v.type_uri(), &serialized).unwrap();
            assert_eq!(parsed, v);
        }
    }

    #[test]
    fn odd_length_hex_rejected() {
        assert!(RdfValue::parse(RDF_BYTES_TYPE, "ABC").is_err());
    }

    #[test]
    fn boolean_accepts_numeric_forms() {
        assert_eq!(
            RdfValue::parse(XSD_BOOLEAN, "1").unwrap(),
            RdfValue::XsdBoolean(true)
        );
        assert_eq!(
            RdfValue::parse(XSD_BOOLEAN, "0").unwrap(),
            RdfValue::XsdBoolean(false)
        );
    }
}
