//! Concrete pipeline stages for oerflow.
//!
//! Sources ([`MemorySource`], [`JsonlSource`], [`HttpPollSource`]) feed raw
//! descriptors in; the bolts normalize ([`FormatBolt`]), enrich
//! ([`ExtractionBolt`], [`EnrichmentBolt`]), gate ([`ValidatorBolt`]), and
//! persist ([`CatalogSink`], [`PartialSink`]) the material envelopes.

pub mod enrichment;
pub mod extraction;
pub mod format;
pub mod sink;
pub mod source;
pub mod validator;

pub use enrichment::{CONCEPTS_KEY, Concept, EnrichmentBolt};
pub use extraction::{ExtractionBolt, RAW_TEXT_KEY};
pub use format::FormatBolt;
pub use sink::{CatalogSink, PartialSink};
pub use source::{HttpPollSource, JsonlSource, MemorySource};
pub use validator::ValidatorBolt;
