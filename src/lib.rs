//! AFF4 (Advanced Forensic Format 4) container library: a resolver-backed
//! triple store, ZIP64 volumes, chunked image streams and sparse map
//! streams.

pub mod context;
pub mod dir_volume;
pub mod error;
pub mod factory;
pub mod file_backed;
pub mod image;
pub mod map;
pub mod rdf;
pub mod resolver;
pub mod stream;
pub mod urn;
pub mod volume;
pub mod zip;
pub mod zip_records;

pub use error::{Aff4Error, Aff4Result};
pub use rdf::RdfValue;
pub use resolver::Resolver;
pub use stream::Aff4Stream;
pub use urn::Urn;
