//! Shared types, error model, and configuration for oerflow.
//!
//! This crate is the foundation depended on by all other oerflow crates.
//! It provides:
//! - [`PipelineError`] — the unified error type
//! - Domain types ([`Material`], [`RawDescriptor`], [`StreamTag`],
//!   [`PartialSnapshot`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, EnrichmentConfig, ExtractionConfig, PartialFailurePolicy, PipelineConfig,
    StorageConfig, ValidationConfig, config_dir, config_file_path, init_config, load_config,
    load_config_from, validate_user_key,
};
pub use error::{PipelineError, Result};
pub use types::{Material, PartialSnapshot, RawDescriptor, StreamTag, ValidationStatus};
