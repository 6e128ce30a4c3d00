//! Pipeline assembly: config + topology spec → running topology.

use tracing::info;

use oerflow_shared::{AppConfig, Result};
use oerflow_topology::{RuntimeOptions, TopologyHandle, TopologySpec, run};

use crate::registry::StageBuilder;

/// Instantiate every declared stage and start the topology.
///
/// Fails fast: spec validation errors, unknown stage kinds, and stage init
/// failures all surface here, before any record flows.
pub async fn run_pipeline(config: &AppConfig, spec: TopologySpec) -> Result<TopologyHandle> {
    let (bolts, sources) = StageBuilder::new(config.clone()).build(&spec)?;
    let opts = RuntimeOptions::from(&config.pipeline);
    info!(
        topology = %spec.name,
        heartbeat_ms = config.pipeline.heartbeat_ms,
        backpressure_window = config.pipeline.backpressure_window,
        "starting pipeline"
    );
    run(spec, bolts, sources, opts).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use url::Url;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use oerflow_shared::RawDescriptor;
    use oerflow_shared::config::PartialFailurePolicy;
    use oerflow_storage::Storage;

    use crate::standard::{jsonl_spout, memory_spout, standard_spec};

    const TEST_KEY_ENV: &str = "OERFLOW_E2E_WIKIFIER_KEY";

    async fn collaborators() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/extract"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "text": "vectors, matrices, and linear maps"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/annotate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "concepts": [
                    { "name": "Linear map", "uri": "http://en.wikipedia.org/wiki/Linear_map",
                      "cosine": 0.7, "page_rank": 0.3 }
                ]
            })))
            .mount(&server)
            .await;
        server
    }

    fn test_config(server: &MockServer) -> AppConfig {
        // SAFETY: test-only env mutation, key name is test-local
        unsafe { std::env::set_var(TEST_KEY_ENV, "test-key") };

        let mut config = AppConfig::default();
        config.storage.db_path = std::env::temp_dir()
            .join(format!("oerflow_e2e_{}.db", Uuid::now_v7()))
            .to_string_lossy()
            .into_owned();
        config.storage.partial_failure_policy = Some(PartialFailurePolicy::Log);
        config.extraction.endpoint = format!("{}/extract", server.uri());
        config.enrichment.endpoint = format!("{}/annotate", server.uri());
        config.enrichment.user_key_env = TEST_KEY_ENV.into();
        config.pipeline.heartbeat_ms = 100;
        config
    }

    fn descriptor(url: &str, title: Option<&str>) -> RawDescriptor {
        RawDescriptor {
            material_url: url.into(),
            title: title.map(String::from),
            language: Some("EN".into()),
            mimetype: Some("video/mp4".into()),
            license: Some("CC BY".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn standard_pipeline_end_to_end() {
        let server = collaborators().await;
        let config = test_config(&server);

        let spec = standard_spec(memory_spout(vec![
            descriptor("http://x.edu/v1", Some("Linear Algebra")),
            descriptor("http://x.edu/v2", None), // fails validation: no title
            descriptor("http://x.edu/v1", Some("Linear Algebra")), // duplicate
        ]));

        let handle = run_pipeline(&config, spec).await.expect("pipeline starts");
        let report = handle.join().await;
        assert!(report.errors.is_empty(), "errors: {:?}", report.errors);

        let storage = Storage::open(Path::new(&config.storage.db_path), &config.storage)
            .await
            .expect("reopen");

        // duplicate URL upserted into exactly one row, in both catalogs
        assert_eq!(
            storage
                .count_materials(&config.storage.production_table)
                .await
                .expect("count"),
            1
        );
        assert_eq!(
            storage
                .count_materials(&config.storage.staging_table)
                .await
                .expect("count"),
            1
        );

        let row = storage
            .get_material(&config.storage.production_table, "http://x.edu/v1")
            .await
            .expect("get")
            .expect("row present");
        assert_eq!(row.validation_status, "passed");
        assert_eq!(row.language.as_deref(), Some("en"));
        assert!(row.material_metadata.contains_key("raw_text"));
        assert!(row.material_metadata.contains_key("wikipedia_concepts"));

        // the failed record never reached a catalog but left its trace
        assert!(
            storage
                .get_material(&config.storage.production_table, "http://x.edu/v2")
                .await
                .expect("get")
                .is_none()
        );
        let mut stages = storage
            .list_partial_stages(&config.storage.partial_table, "http://x.edu/v2")
            .await
            .expect("stages");
        stages.sort();
        assert_eq!(
            stages,
            [
                "concept-enrichment",
                "content-extraction",
                "material-format",
                "material-validator"
            ]
        );
    }

    #[tokio::test]
    async fn jsonl_pipeline_end_to_end() {
        let server = collaborators().await;
        let config = test_config(&server);

        let input = std::env::temp_dir().join(format!("oerflow_e2e_{}.jsonl", Uuid::now_v7()));
        std::fs::write(
            &input,
            concat!(
                r#"{"material_url": "http://x.edu/a1", "title": "Calculus I", "#,
                r#""language": "en", "mimetype": "video/mp4"}"#,
                "\n",
            ),
        )
        .expect("write fixture");

        let spec = standard_spec(jsonl_spout(&input));
        let handle = run_pipeline(&config, spec).await.expect("pipeline starts");
        let report = handle.join().await;
        assert!(report.errors.is_empty(), "errors: {:?}", report.errors);

        let storage = Storage::open(Path::new(&config.storage.db_path), &config.storage)
            .await
            .expect("reopen");
        let row = storage
            .get_material(&config.storage.production_table, "http://x.edu/a1")
            .await
            .expect("get")
            .expect("row present");
        assert_eq!(row.title.as_deref(), Some("Calculus I"));
        assert_eq!(row.material_type.as_deref(), Some("video"));
    }

    #[tokio::test]
    async fn startup_fails_without_partial_policy() {
        let server = collaborators().await;
        let mut config = test_config(&server);
        config.storage.partial_failure_policy = None;

        let spec = standard_spec(memory_spout(Vec::new()));
        let err = run_pipeline(&config, spec).await.err().expect("must fail");
        let msg = err.to_string();
        assert!(msg.contains("catalog-partial"), "got: {msg}");
        assert!(msg.contains("failed to initialize"), "got: {msg}");
    }

    #[tokio::test]
    async fn identity_is_immutable_end_to_end() {
        let server = collaborators().await;
        let config = test_config(&server);

        let url = "http://x.edu/stable?lecture=1";
        let spec = standard_spec(memory_spout(vec![descriptor(url, Some("Stable"))]));
        let handle = run_pipeline(&config, spec).await.expect("pipeline starts");
        handle.join().await;

        let storage = Storage::open(Path::new(&config.storage.db_path), &config.storage)
            .await
            .expect("reopen");

        // same key in both catalogs and in every partial snapshot
        for table in [
            &config.storage.production_table,
            &config.storage.staging_table,
        ] {
            let row = storage
                .get_material(table, url)
                .await
                .expect("get")
                .expect("row present");
            assert_eq!(row.material_url, url);
        }
        let snapshot = storage
            .get_partial(&config.storage.partial_table, url, "material-format")
            .await
            .expect("get")
            .expect("snapshot present");
        assert_eq!(
            snapshot.material.material_url(),
            &Url::parse(url).expect("url")
        );
    }
}
