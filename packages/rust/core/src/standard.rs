//! The built-in preprocessing topology.
//!
//! material-input → material-format → content-extraction →
//! concept-enrichment → material-validator → {catalog-production,
//! catalog-staging}; the partial stream of every transforming bolt fans in
//! to catalog-partial.

use std::path::Path;

use oerflow_shared::RawDescriptor;
use oerflow_topology::{BoltSpec, InputBinding, SpoutSpec, TopologySpec};

/// Name of the standard topology's spout stage.
pub const INPUT_STAGE: &str = "material-input";

/// The standard preprocessing topology with the given spout.
pub fn standard_spec(spout: SpoutSpec) -> TopologySpec {
    let bolt = |name: &str, kind: &str, inputs: Vec<InputBinding>| BoltSpec {
        name: name.into(),
        kind: kind.into(),
        inputs,
        params: serde_json::Value::Null,
    };

    TopologySpec {
        name: "oer-preprocessing".into(),
        spouts: vec![spout],
        bolts: vec![
            bolt(
                "material-format",
                "material-format",
                vec![InputBinding::main(INPUT_STAGE)],
            ),
            bolt(
                "content-extraction",
                "content-extraction",
                vec![InputBinding::main("material-format")],
            ),
            bolt(
                "concept-enrichment",
                "concept-enrichment",
                vec![InputBinding::main("content-extraction")],
            ),
            bolt(
                "material-validator",
                "material-validator",
                vec![InputBinding::main("concept-enrichment")],
            ),
            bolt(
                "catalog-production",
                "catalog-production",
                vec![InputBinding::main("material-validator")],
            ),
            bolt(
                "catalog-staging",
                "catalog-staging",
                vec![InputBinding::main("material-validator")],
            ),
            bolt(
                "catalog-partial",
                "partial-sink",
                vec![
                    InputBinding::partial("material-format"),
                    InputBinding::partial("content-extraction"),
                    InputBinding::partial("concept-enrichment"),
                    InputBinding::partial("material-validator"),
                ],
            ),
        ],
    }
}

/// Spout pulling from a JSONL descriptor file.
pub fn jsonl_spout(path: &Path) -> SpoutSpec {
    SpoutSpec {
        name: INPUT_STAGE.into(),
        source: "jsonl".into(),
        params: serde_json::json!({ "path": path }),
    }
}

/// Spout polling an upstream queue over HTTP.
pub fn http_spout(endpoint: &str) -> SpoutSpec {
    SpoutSpec {
        name: INPUT_STAGE.into(),
        source: "http-poll".into(),
        params: serde_json::json!({ "endpoint": endpoint }),
    }
}

/// Spout over a fixed in-memory descriptor list.
pub fn memory_spout(descriptors: Vec<RawDescriptor>) -> SpoutSpec {
    SpoutSpec {
        name: INPUT_STAGE.into(),
        source: "memory".into(),
        params: serde_json::json!({ "descriptors": descriptors }),
    }
}
