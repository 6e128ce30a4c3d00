//! Pipeline assembly for oerflow: the standard preprocessing topology, the
//! stage kind registry, and the end-to-end runner.

pub mod pipeline;
pub mod registry;
pub mod standard;

pub use pipeline::run_pipeline;
pub use registry::StageBuilder;
pub use standard::{INPUT_STAGE, http_spout, jsonl_spout, memory_spout, standard_spec};
