//! Triple-store resolver (spec.md §4.B).
//!
//! An in-memory subject/predicate/value store with Turtle
//! serialization/parsing via the `rio_turtle`/`rio_api` crates (declared
//! in the teacher's `Cargo.toml` but unused by its stub `aff4.rs` —
//! this is where they earn their keep).

use std::collections::BTreeMap;
use std::io::{BufReader, Read, Write};

use rio_api::formatter::TriplesFormatter;
use rio_api::model::{Literal, NamedNode, Subject, Term, Triple};
use rio_api::parser::TriplesParser;
use rio_turtle::{TurtleError, TurtleFormatter, TurtleParser};

use crate::error::{Aff4Error, Aff4Result};
use crate::rdf::RdfValue;
use crate::urn::Urn;

pub const NS_AFF4: &str = "http://aff4.org/Schema#";
pub const NS_RDF: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#";
pub const NS_XSD: &str = "http://www.w3.org/2001/XMLSchema#";
pub const NS_VOLATILE: &str = "http://aff4.org/VolatileSchema#";

pub const RDF_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";
pub const AFF4_STORED: &str = "http://aff4.org/Schema#stored";
pub const AFF4_CONTAINS: &str = "http://aff4.org/Schema#contains";
pub const AFF4_SIZE: &str = "http://aff4.org/Schema#size";
pub const AFF4_CHUNK_SIZE: &str = "http://aff4.org/Schema#chunkSize";
pub const AFF4_CHUNKS_IN_SEGMENT: &str = "http://aff4.org/Schema#chunksInSegment";
pub const AFF4_COMPRESSION_METHOD: &str = "http://aff4.org/Schema#compressionMethod";
pub const AFF4_DATA_STREAM: &str = "http://aff4.org/Schema#dataStream";
pub const AFF4_ORIGINAL_FILENAME: &str = "http://aff4.org/Schema#originalFileName";
pub const AFF4_CATEGORY: &str = "http://aff4.org/Schema#category";

pub const TYPE_IMAGE: &str = "http://aff4.org/Schema#Image";
pub const TYPE_DISK_IMAGE: &str = "http://aff4.org/Schema#DiskImage";
pub const TYPE_VOLUME_IMAGE: &str = "http://aff4.org/Schema#VolumeImage";
pub const TYPE_MEMORY_IMAGE: &str = "http://aff4.org/Schema#MemoryImage";
pub const TYPE_CONTIGUOUS_IMAGE: &str = "http://aff4.org/Schema#ContiguousImage";
pub const TYPE_DISCONTIGUOUS_IMAGE: &str = "http://aff4.org/Schema#DiscontiguousImage";
pub const TYPE_IMAGE_STREAM: &str = "http://aff4.org/Schema#ImageStream";
pub const TYPE_MAP: &str = "http://aff4.org/Schema#Map";
pub const TYPE_ZIP: &str = "http://aff4.org/Schema#Zip";
pub const TYPE_ZIP_SEGMENT: &str = "http://aff4.org/Schema#ZipSegment";
pub const TYPE_DIRECTORY: &str = "http://aff4.org/Schema#Directory";
pub const TYPE_FILE: &str = "http://aff4.org/Schema#File";

/// The `Image` family (spec.md §4.H item 1, §6): a logical image handle
/// that carries no bytes itself, only an `aff4:dataStream` pointer to the
/// stream that actually does.
pub const IMAGE_FAMILY_TYPES: &[&str] = &[
    TYPE_IMAGE,
    TYPE_DISK_IMAGE,
    TYPE_VOLUME_IMAGE,
    TYPE_MEMORY_IMAGE,
    TYPE_CONTIGUOUS_IMAGE,
    TYPE_DISCONTIGUOUS_IMAGE,
];

/// The implicit default `rdf:type` when a subject carries none (spec.md §4.B).
pub const AFF4_ZIP_SEGMENT_TYPE: &str = TYPE_ZIP_SEGMENT;

/// In-memory subject→predicate→[value] triple store.
#[derive(Debug, Default)]
pub struct Resolver {
    store: BTreeMap<Urn, BTreeMap<Urn, Vec<RdfValue>>>,
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value for (subject, predicate). `replace=true` clears prior
    /// values first; `replace=false` appends.
    pub fn set(&mut self, subject: &Urn, predicate: &str, value: RdfValue, replace: bool) {
        let preds = self.store.entry(subject.clone()).or_default();
        let values = preds.entry(Urn::new(predicate)).or_default();
        if replace {
            values.clear();
        }
        values.push(value);
    }

    /// All values of predicate for subject, or the implicit ZipSegment
    /// type default if predicate is rdf:type and none is set.
    pub fn get_all(&self, subject: &Urn, predicate: &str) -> Vec<RdfValue> {
        let values = self
            .store
            .get(subject)
            .and_then(|preds| preds.get(&Urn::new(predicate)))
            .cloned()
            .unwrap_or_default();

        if values.is_empty() && predicate == RDF_TYPE {
            return vec![RdfValue::Urn(Urn::new(AFF4_ZIP_SEGMENT_TYPE))];
        }
        values
    }

    /// First value, and the only way to observe a real NotFound (the
    /// implicit rdf:type default above bypasses this).
    pub fn get_one(&self, subject: &Urn, predicate: &str) -> Aff4Result<RdfValue> {
        let values = self.get_all(subject, predicate);
        values
            .into_iter()
            .next()
            .ok_or_else(|| Aff4Error::NotFound(format!("{subject} {predicate}")))
    }

    pub fn has_subject(&self, subject: &Urn) -> bool {
        self.store.contains_key(subject)
    }

    pub fn has_predicate(&self, subject: &Urn, predicate: &str) -> bool {
        self.store
            .get(subject)
            .map(|p| p.contains_key(&Urn::new(predicate)))
            .unwrap_or(false)
    }

    pub fn has_value(&self, subject: &Urn, predicate: &str, value: &RdfValue) -> bool {
        self.get_all(subject, predicate).iter().any(|v| v == value)
    }

    /// All subjects carrying `predicate`, optionally filtered to a specific value.
    pub fn query(&self, predicate: &str, value: Option<&RdfValue>) -> Vec<Urn> {
        let mut out = Vec::new();
        for (subject, preds) in &self.store {
            if let Some(values) = preds.get(&Urn::new(predicate)) {
                let matched = match value {
                    None => !values.is_empty(),
                    Some(v) => values.contains(v),
                };
                if matched {
                    out.push(subject.clone());
                }
            }
        }
        out
    }

    pub fn delete_subject(&mut self, subject: &Urn) {
        self.store.remove(subject);
    }

    fn subject_type(&self, subject: &Urn) -> String {
        self.get_all(subject, RDF_TYPE)
            .into_iter()
            .find_map(|v| v.as_urn().map(|u| u.as_str().to_string()))
            .unwrap_or_default()
    }

    /// Emit canonical Turtle for the whole store, or just `base_urn`'s
    /// subtree when given. Suppresses `aff4:stored`/`rdf:type` for
    /// ZipSegment|Zip|Directory subjects and volatile predicates, unless
    /// `verbose`.
    pub fn dump_to_turtle<W: Write>(
        &self,
        out: W,
        base_urn: Option<&Urn>,
        verbose: bool,
    ) -> Aff4Result<()> {
        let mut formatter = TurtleFormatter::new(out);
        for (subject, preds) in &self.store {
            if let Some(base) = base_urn {
                if subject != base {
                    continue;
                }
            }
            let subject_type = self.subject_type(subject);
            let suppress_stored = matches!(
                subject_type.as_str(),
                TYPE_ZIP_SEGMENT | TYPE_ZIP | TYPE_DIRECTORY
            );

            for (predicate, values) in preds {
                if !verbose && predicate.as_str().starts_with(NS_VOLATILE) {
                    continue;
                }
                if suppress_stored && predicate.as_str() == AFF4_STORED {
                    continue;
                }
                let is_type_pred = predicate.as_str() == RDF_TYPE;
                for value in values {
                    if !verbose
                        && is_type_pred
                        && suppress_stored
                        && value
                            .as_urn()
                            .map(|u| u.as_str() == subject_type)
                            .unwrap_or(false)
                    {
                        continue;
                    }
                    let lexical = value.serialize_to_string();
                    let triple = build_triple(subject, predicate, value, &lexical);
                    formatter
                        .format(&triple)
                        .map_err(Aff4Error::Io)?;
                }
            }
        }
        formatter.finish().map_err(Aff4Error::Io)?;
        Ok(())
    }

    /// Parse Turtle text, reconstructing RDFValues via the type-URI
    /// registry and inserting with `replace=false`.
    pub fn load_from_turtle<R: Read>(&mut self, input: R) -> Aff4Result<()> {
        let mut parser = TurtleParser::new(BufReader::new(input), None);
        parser.parse_all(&mut |triple: Triple<'_>| -> Aff4Result<()> {
            let subject = match triple.subject {
                Subject::NamedNode(n) => Urn::new(n.iri),
                _ => return Ok(()),
            };
            let predicate = triple.predicate.iri;
            match triple.object {
                Term::NamedNode(n) => {
                    self.set(&subject, predicate, RdfValue::Urn(Urn::new(n.iri)), false);
                }
                Term::Literal(Literal::Typed { value, datatype }) => {
                    let v = RdfValue::parse(datatype.iri, value)?;
                    self.set(&subject, predicate, v, false);
                }
                Term::Literal(Literal::Simple { value }) => {
                    self.set(
                        &subject,
                        predicate,
                        RdfValue::XsdString(value.to_string()),
                        false,
                    );
                }
                _ => {}
            }
            Ok(())
        })
    }
}

impl From<TurtleError> for Aff4Error {
    fn from(e: TurtleError) -> Self {
        Aff4Error::Parsing(e.to_string())
    }
}

fn build_triple<'a>(
    subject: &'a Urn,
    predicate: &'a Urn,
    value: &'a RdfValue,
    lexical: &'a str,
) -> Triple<'a> {
    let subject_node = Subject::NamedNode(NamedNode {
        iri: subject.as_str(),
    });
    let predicate_node = NamedNode {
        iri: predicate.as_str(),
    };
    let object = match value {
        RdfValue::Urn(u) => Term::NamedNode(NamedNode { iri: u.as_str() }),
        other => Term::Literal(Literal::Typed {
            value: lexical,
            datatype: NamedNode {
                iri: other.type_uri(),
            },
        }),
    };
    Triple {
        subject: subject_node,
        predicate: predicate_node,
        object,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implicit_zip_segment_type() {
        let resolver = Resolver::new();
        let subject = Urn::new("aff4://abcd/hello.txt");
        let values = resolver.get_all(&subject, RDF_TYPE);
        assert_eq!(values, vec![RdfValue::Urn(Urn::new(AFF4_ZIP_SEGMENT_TYPE))]);
    }

    #[test]
    fn set_replace_vs_append() {
        let mut resolver = Resolver::new();
        let subject = Urn::new("aff4://abcd");
        resolver.set(&subject, AFF4_SIZE, RdfValue::XsdInteger(1), true);
        resolver.set(&subject, AFF4_SIZE, RdfValue::XsdInteger(2), false);
        assert_eq!(resolver.get_all(&subject, AFF4_SIZE).len(), 2);
        resolver.set(&subject, AFF4_SIZE, RdfValue::XsdInteger(3), true);
        assert_eq!(
            resolver.get_all(&subject, AFF4_SIZE),
            vec![RdfValue::XsdInteger(3)]
        );
    }

    #[test]
    fn turtle_round_trip_and_suppression() {
        let mut resolver = Resolver::new();
        let subject = Urn::new("aff4://abcd/hello.txt");
        resolver.set(
            &subject,
            RDF_TYPE,
            RdfValue::Urn(Urn::new(TYPE_ZIP_SEGMENT)),
            true,
        );
        resolver.set(
            &subject,
            AFF4_STORED,
            RdfValue::Urn(Urn::new("aff4://abcd")),
            true,
        );
        resolver.set(
            &subject,
            AFF4_SIZE,
            RdfValue::XsdInteger(11),
            true,
        );

        let mut buf = Vec::new();
        resolver.dump_to_turtle(&mut buf, None, false).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(!text.contains(AFF4_STORED));
        assert!(!text.contains(TYPE_ZIP_SEGMENT));
        assert!(text.contains(AFF4_SIZE));

        let mut loaded = Resolver::new();
        loaded.load_from_turtle(text.as_bytes()).unwrap();
        assert_eq!(
            loaded.get_one(&subject, AFF4_SIZE).unwrap(),
            RdfValue::XsdInteger(11)
        );
    }

    #[test]
    fn query_filters_by_value() {
        let mut resolver = Resolver::new();
        let a = Urn::new("aff4://a");
        let b = Urn::new("aff4://b");
        resolver.set(&a, RDF_TYPE, RdfValue::Urn(Urn::new(TYPE_MAP)), true);
        resolver.set(&b, RDF_TYPE, RdfValue::Urn(Urn::new(TYPE_IMAGE_STREAM)), true);

        let maps = resolver.query(RDF_TYPE, Some(&RdfValue::Urn(Urn::new(TYPE_MAP))));
        assert_eq!(maps, vec![a]);
    }
}
