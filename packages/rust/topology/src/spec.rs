//! Declarative topology definition and build-time validation.
//!
//! A [`TopologySpec`] enumerates spouts, bolts, and the stream bindings
//! between them. It is fully resolved and validated before any runtime task
//! is spawned; malformed or unresolvable bindings abort startup.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use serde::{Deserialize, Serialize};

use oerflow_shared::{PipelineError, Result, StreamTag};

// ---------------------------------------------------------------------------
// Spec structs (matching the topology TOML schema)
// ---------------------------------------------------------------------------

/// A complete pipeline topology: spouts, bolts, and their bindings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologySpec {
    /// Topology name, used in logs.
    pub name: String,

    /// Record-originating stages.
    #[serde(default)]
    pub spouts: Vec<SpoutSpec>,

    /// Transforming and terminal stages.
    #[serde(default)]
    pub bolts: Vec<BoltSpec>,
}

/// A spout declaration: where records come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoutSpec {
    /// Unique stage name.
    pub name: String,

    /// Source implementation kind (e.g. "jsonl", "http-poll", "memory").
    pub source: String,

    /// Implementation-specific init parameters.
    #[serde(default)]
    pub params: serde_json::Value,
}

/// A bolt declaration: implementation kind plus input bindings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoltSpec {
    /// Unique stage name.
    pub name: String,

    /// Bolt implementation kind (e.g. "material-format", "catalog-sink").
    pub kind: String,

    /// Stream bindings this bolt consumes.
    #[serde(default)]
    pub inputs: Vec<InputBinding>,

    /// Implementation-specific init parameters.
    #[serde(default)]
    pub params: serde_json::Value,
}

/// One (producer stage, stream tag) → this bolt binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputBinding {
    /// Name of the producing stage.
    pub source: String,

    /// Which of the producer's output streams to consume.
    #[serde(default)]
    pub stream: StreamTag,
}

impl InputBinding {
    /// Binding on the main stream.
    pub fn main(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            stream: StreamTag::Main,
        }
    }

    /// Binding on the partial (diagnostic) stream.
    pub fn partial(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            stream: StreamTag::Partial,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl TopologySpec {
    /// Validate the declared graph before runtime start.
    ///
    /// Rejects: no spouts, duplicate stage names, bolts without inputs,
    /// bindings naming unknown stages, a bolt consuming its own main stream,
    /// and bolts unreachable from every spout.
    pub fn validate(&self) -> Result<()> {
        if self.spouts.is_empty() {
            return Err(PipelineError::topology(format!(
                "topology '{}' declares no spouts",
                self.name
            )));
        }

        let mut names = HashSet::new();
        for name in self
            .spouts
            .iter()
            .map(|s| &s.name)
            .chain(self.bolts.iter().map(|b| &b.name))
        {
            if !names.insert(name.as_str()) {
                return Err(PipelineError::topology(format!(
                    "duplicate stage name '{name}'"
                )));
            }
        }

        for bolt in &self.bolts {
            if bolt.inputs.is_empty() {
                return Err(PipelineError::topology(format!(
                    "bolt '{}' declares no input bindings",
                    bolt.name
                )));
            }
            for binding in &bolt.inputs {
                if !names.contains(binding.source.as_str()) {
                    return Err(PipelineError::topology(format!(
                        "bolt '{}' input names unknown stage '{}'",
                        bolt.name, binding.source
                    )));
                }
                if binding.source == bolt.name && binding.stream == StreamTag::Main {
                    return Err(PipelineError::topology(format!(
                        "bolt '{}' consumes its own main stream",
                        bolt.name
                    )));
                }
            }
        }

        self.check_reachability()
    }

    /// Every bolt must be reachable from at least one spout via the declared
    /// bindings (any stream tag counts).
    fn check_reachability(&self) -> Result<()> {
        // producer name → consumer names
        let mut downstream: HashMap<&str, Vec<&str>> = HashMap::new();
        for bolt in &self.bolts {
            for binding in &bolt.inputs {
                downstream
                    .entry(binding.source.as_str())
                    .or_default()
                    .push(bolt.name.as_str());
            }
        }

        let mut reached: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = self.spouts.iter().map(|s| s.name.as_str()).collect();
        while let Some(stage) = queue.pop_front() {
            if !reached.insert(stage) {
                continue;
            }
            if let Some(consumers) = downstream.get(stage) {
                queue.extend(consumers.iter().copied());
            }
        }

        for bolt in &self.bolts {
            if !reached.contains(bolt.name.as_str()) {
                return Err(PipelineError::topology(format!(
                    "bolt '{}' is not reachable from any spout",
                    bolt.name
                )));
            }
        }
        Ok(())
    }

    /// Names of all declared stages, spouts first.
    pub fn stage_names(&self) -> Vec<&str> {
        self.spouts
            .iter()
            .map(|s| s.name.as_str())
            .chain(self.bolts.iter().map(|b| b.name.as_str()))
            .collect()
    }
}

/// Load and validate a topology definition from a TOML file.
pub fn load_topology(path: &Path) -> Result<TopologySpec> {
    let content = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
    let spec: TopologySpec = toml::from_str(&content)
        .map_err(|e| PipelineError::topology(format!("failed to parse {}: {e}", path.display())))?;
    spec.validate()?;
    Ok(spec)
}
