//! Core domain types for the oerflow pipeline.
//!
//! A [`Material`] is the envelope that traverses the pipeline: created by the
//! spout from a [`RawDescriptor`], cloned (never shared mutably) by each
//! stage, and terminated at a sink. Its material URL is the identity key and
//! never changes after creation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

// ---------------------------------------------------------------------------
// StreamTag
// ---------------------------------------------------------------------------

/// Named output channel of a stage.
///
/// The set is finite and declared up front so topology bindings can be
/// checked at build time rather than failing on a typo at runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamTag {
    /// The main processing path.
    #[default]
    Main,
    /// Diagnostic side channel capturing intermediate envelope state.
    Partial,
}

impl std::fmt::Display for StreamTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamTag::Main => write!(f, "main"),
            StreamTag::Partial => write!(f, "partial"),
        }
    }
}

// ---------------------------------------------------------------------------
// ValidationStatus
// ---------------------------------------------------------------------------

/// Outcome of the validation stage, carried on the envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ValidationStatus {
    /// Not yet seen by the validator.
    #[default]
    Unverified,
    /// Passed the validation policy; eligible for catalog persistence.
    Passed,
    /// Failed the validation policy; captured in the partial store only.
    Failed { reason: String },
}

impl ValidationStatus {
    /// Short label used for the catalog column.
    pub fn label(&self) -> &'static str {
        match self {
            ValidationStatus::Unverified => "unverified",
            ValidationStatus::Passed => "passed",
            ValidationStatus::Failed { .. } => "failed",
        }
    }
}

// ---------------------------------------------------------------------------
// RawDescriptor
// ---------------------------------------------------------------------------

/// Inbound message body describing one discovered OER material.
///
/// This is what the upstream queue delivers; the format stage turns it into
/// a [`Material`]. Everything except the URL is optional; upstream harvesters
/// vary wildly in what they manage to collect.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawDescriptor {
    /// Unique URL of the material (identity key).
    pub material_url: String,
    /// URL or name of the providing repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    /// ISO 639-1 language code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    /// When the material was created at the provider, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_date: Option<DateTime<Utc>>,
    /// Free-form metadata attached upstream.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub material_metadata: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Material
// ---------------------------------------------------------------------------

/// The evolving record describing one OER material as it traverses the
/// pipeline.
///
/// Stages only add or refine enrichment fields; the material URL is fixed at
/// creation (private field, accessor only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Material {
    /// Identity key. Never reassigned after construction.
    material_url: Url,
    /// URL or name of the providing repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    /// ISO 639-1 language code, lowercased by the format stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// When the material was created at the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_date: Option<DateTime<Utc>>,
    /// When the pipeline first saw the material.
    pub retrieved_date: DateTime<Utc>,
    /// Short type derived from the mimetype: "video", "audio", or "text".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub material_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    /// Incrementally-added enrichment fields (`raw_text`,
    /// `wikipedia_concepts`, ...).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub material_metadata: Map<String, Value>,
    /// Validation outcome, set by the validator stage.
    #[serde(default)]
    pub validation: ValidationStatus,
    /// Diagnostic note carried to the partial store (e.g. why enrichment
    /// was skipped).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Ordered names of the stages that processed this envelope.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stage_trace: Vec<String>,
}

impl Material {
    /// Create a fresh envelope from a parsed material URL and its descriptor.
    pub fn new(material_url: Url, descriptor: RawDescriptor) -> Self {
        Self {
            material_url,
            provider_uri: descriptor.provider_uri,
            title: descriptor.title,
            description: descriptor.description,
            authors: descriptor.authors,
            language: descriptor.language,
            creation_date: descriptor.creation_date,
            retrieved_date: Utc::now(),
            material_type: None,
            mimetype: descriptor.mimetype,
            license: descriptor.license,
            material_metadata: descriptor.material_metadata,
            validation: ValidationStatus::Unverified,
            message: None,
            stage_trace: Vec::new(),
        }
    }

    /// The identity key of this material.
    pub fn material_url(&self) -> &Url {
        &self.material_url
    }

    /// Append a stage name to the trace. Called once per stage on entry.
    pub fn record_stage(&mut self, name: &str) {
        self.stage_trace.push(name.to_string());
    }

    /// The most recent stage that touched this envelope, if any.
    pub fn last_stage(&self) -> Option<&str> {
        self.stage_trace.last().map(String::as_str)
    }

    /// Set or append to the diagnostic message.
    pub fn note(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        match &mut self.message {
            Some(existing) => {
                existing.push_str("; ");
                existing.push_str(&msg);
            }
            None => self.message = Some(msg),
        }
    }
}

// ---------------------------------------------------------------------------
// PartialSnapshot
// ---------------------------------------------------------------------------

/// Labeled snapshot of intermediate envelope state, as stored by the
/// partial-capture sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialSnapshot {
    /// Name of the stage that emitted the snapshot.
    pub stage: String,
    /// When the snapshot was captured.
    pub captured_at: DateTime<Utc>,
    /// Diagnostic message attached to the envelope, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Full envelope state at capture time.
    pub material: Material,
}

impl PartialSnapshot {
    /// Capture the given envelope, labeling it with its most recent stage.
    pub fn capture(material: &Material) -> Self {
        Self {
            stage: material.last_stage().unwrap_or("unknown").to_string(),
            captured_at: Utc::now(),
            message: material.message.clone(),
            material: material.clone(),
        }
    }
}
