//! Maps declared stage kinds to concrete implementations.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use oerflow_shared::{AppConfig, PipelineError, RawDescriptor, Result};
use oerflow_stages::{
    CatalogSink, EnrichmentBolt, ExtractionBolt, FormatBolt, HttpPollSource, JsonlSource,
    MemorySource, PartialSink, ValidatorBolt,
};
use oerflow_topology::{Bolt, Source, TopologySpec};

#[derive(Debug, Deserialize)]
struct JsonlParams {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct HttpPollParams {
    endpoint: String,
    #[serde(default)]
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct MemoryParams {
    #[serde(default)]
    descriptors: Vec<RawDescriptor>,
}

/// Builds concrete stage instances for a declared topology.
///
/// Bolt kinds carry their section of the application config; spout params
/// come from the topology definition itself.
pub struct StageBuilder {
    config: AppConfig,
}

impl StageBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    /// Instantiate every stage the spec declares.
    pub fn build(
        &self,
        spec: &TopologySpec,
    ) -> Result<(HashMap<String, Box<dyn Bolt>>, HashMap<String, Box<dyn Source>>)> {
        let mut bolts: HashMap<String, Box<dyn Bolt>> = HashMap::new();
        for bolt_spec in &spec.bolts {
            bolts.insert(bolt_spec.name.clone(), self.build_bolt(&bolt_spec.kind)?);
        }

        let mut sources: HashMap<String, Box<dyn Source>> = HashMap::new();
        for spout_spec in &spec.spouts {
            sources.insert(
                spout_spec.name.clone(),
                build_source(&spout_spec.source, &spout_spec.params)?,
            );
        }
        Ok((bolts, sources))
    }

    fn build_bolt(&self, kind: &str) -> Result<Box<dyn Bolt>> {
        let bolt: Box<dyn Bolt> = match kind {
            "material-format" => Box::new(FormatBolt::new()),
            "content-extraction" => {
                Box::new(ExtractionBolt::new(self.config.extraction.clone()))
            }
            "concept-enrichment" => {
                Box::new(EnrichmentBolt::new(self.config.enrichment.clone()))
            }
            "material-validator" => Box::new(ValidatorBolt::new(self.config.validation.clone())),
            "catalog-production" => Box::new(CatalogSink::production(self.config.storage.clone())),
            "catalog-staging" => Box::new(CatalogSink::staging(self.config.storage.clone())),
            "partial-sink" => Box::new(PartialSink::new(self.config.storage.clone())),
            other => {
                return Err(PipelineError::topology(format!(
                    "unknown bolt kind '{other}'"
                )));
            }
        };
        Ok(bolt)
    }
}

fn build_source(kind: &str, params: &serde_json::Value) -> Result<Box<dyn Source>> {
    let source: Box<dyn Source> = match kind {
        "jsonl" => {
            let params: JsonlParams = parse_params(kind, params)?;
            Box::new(JsonlSource::new(params.path))
        }
        "http-poll" => {
            let params: HttpPollParams = parse_params(kind, params)?;
            let mut source = HttpPollSource::new(params.endpoint);
            if let Some(ms) = params.poll_interval_ms {
                source = source.with_poll_interval(Duration::from_millis(ms));
            }
            Box::new(source)
        }
        "memory" => {
            let params: MemoryParams = if params.is_null() {
                MemoryParams::default()
            } else {
                parse_params(kind, params)?
            };
            Box::new(MemorySource::new(params.descriptors))
        }
        other => {
            return Err(PipelineError::topology(format!(
                "unknown source kind '{other}'"
            )));
        }
    };
    Ok(source)
}

fn parse_params<T: for<'de> Deserialize<'de>>(kind: &str, params: &serde_json::Value) -> Result<T> {
    serde_json::from_value(params.clone())
        .map_err(|e| PipelineError::topology(format!("invalid params for '{kind}' source: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::standard::{memory_spout, standard_spec};

    #[test]
    fn builds_every_standard_stage() {
        let spec = standard_spec(memory_spout(Vec::new()));
        let builder = StageBuilder::new(AppConfig::default());
        let (bolts, sources) = builder.build(&spec).expect("build");
        assert_eq!(bolts.len(), spec.bolts.len());
        assert_eq!(sources.len(), 1);
    }

    #[test]
    fn rejects_unknown_bolt_kind() {
        let mut spec = standard_spec(memory_spout(Vec::new()));
        spec.bolts[0].kind = "frobnicator".into();
        let builder = StageBuilder::new(AppConfig::default());
        let err = builder.build(&spec).err().expect("expected build error");
        assert!(err.to_string().contains("unknown bolt kind 'frobnicator'"));
    }

    #[test]
    fn rejects_jsonl_spout_without_path() {
        let mut spec = standard_spec(memory_spout(Vec::new()));
        spec.spouts[0].source = "jsonl".into();
        spec.spouts[0].params = serde_json::Value::Null;
        let builder = StageBuilder::new(AppConfig::default());
        let err = builder.build(&spec).err().expect("expected build error");
        assert!(err.to_string().contains("invalid params for 'jsonl'"));
    }
}
