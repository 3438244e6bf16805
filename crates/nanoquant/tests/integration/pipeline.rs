//! End-to-end pipeline with fake and local collaborators.

use std::fs;

use nanoquant::generator::ARTIFACT_CONFIG_FILE;
use nanoquant::store::{write_tensors, NamedTensor, ADAPTER_CONFIG_FILE, WEIGHTS_FILE};
use nanoquant::{
    CompressionPipeline, CompressionRecipe, GeneratorConfig, LocalIngestor, PipelineConfig, SafetensorsStore,
};

use super::common::{synthetic_llama, FakeIngestor, RecordingRegistry};

fn config(base: &std::path::Path, levels: &[&str], push: bool) -> PipelineConfig {
    PipelineConfig {
        output_base_dir: base.to_path_buf(),
        push_to_serving: push,
        generator: GeneratorConfig {
            levels: Some(levels.iter().map(|s| s.to_string()).collect()),
            ..GeneratorConfig::default()
        },
        ..PipelineConfig::default()
    }
}

fn ingestor() -> FakeIngestor {
    FakeIngestor {
        handle: synthetic_llama(21),
    }
}

#[test]
fn test_process_model_registers_every_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let registry = RecordingRegistry::available();
    let pipeline = CompressionPipeline::new(ingestor(), &registry, config(dir.path(), &["light", "heavy"], true));

    let report = pipeline.process_model("acme/llama-mini").unwrap();

    assert_eq!(report.family, "llama");
    assert_eq!(report.output_directory, dir.path().join("acme_llama-mini"));
    assert_eq!(report.artifacts.len(), 2);
    assert_eq!(
        report.serving_tags,
        ["nanoquant_acme_llama-mini:light", "nanoquant_acme_llama-mini:heavy"]
    );
    assert_eq!(report.pull_commands["heavy"], "ollama pull nanoquant_acme_llama-mini:heavy");
    assert_eq!(registry.tags(), report.serving_tags);

    let light = &report.artifacts[0];
    assert_eq!(light.path, dir.path().join("acme_llama-mini").join("acme_llama-mini_light"));
    assert!(light.path.join(ADAPTER_CONFIG_FILE).exists());
}

#[test]
fn test_resumed_run_registers_only_requested_levels() {
    let dir = tempfile::tempdir().unwrap();
    CompressionPipeline::new(ingestor(), RecordingRegistry::available(), config(dir.path(), &["light"], false))
        .process_model("acme/llama-mini")
        .unwrap();

    let registry = RecordingRegistry::available();
    let mut resumed = config(dir.path(), &["medium"], true);
    resumed.generator.resume = true;
    let report = CompressionPipeline::new(ingestor(), &registry, resumed)
        .process_model("acme/llama-mini")
        .unwrap();

    assert_eq!(report.artifacts.len(), 1);
    assert_eq!(report.artifacts[0].level, "medium");
    assert_eq!(registry.tags(), ["nanoquant_acme_llama-mini:medium"]);
    assert_eq!(report.pull_commands.len(), 1);
}

#[test]
fn test_registration_failure_is_advisory() {
    let dir = tempfile::tempdir().unwrap();
    let registry = RecordingRegistry {
        available: true,
        fail_on: Some(":heavy"),
        ..RecordingRegistry::default()
    };
    let pipeline = CompressionPipeline::new(ingestor(), &registry, config(dir.path(), &["light", "heavy"], true));

    let report = pipeline.process_model("acme/llama-mini").unwrap();

    assert_eq!(report.artifacts.len(), 2);
    assert_eq!(report.serving_tags, ["nanoquant_acme_llama-mini:light"]);
    assert_eq!(registry.tags().len(), 2);
}

#[test]
fn test_unavailable_registry_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let registry = RecordingRegistry::default();
    let pipeline = CompressionPipeline::new(ingestor(), &registry, config(dir.path(), &["medium"], true));

    let report = pipeline.process_model("acme/llama-mini").unwrap();

    assert_eq!(report.artifacts.len(), 1);
    assert!(report.serving_tags.is_empty());
    assert!(registry.tags().is_empty());
}

#[test]
fn test_ingestion_failure_propagates() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = CompressionPipeline::new(ingestor(), RecordingRegistry::available(), config(dir.path(), &["light"], true));

    let err = pipeline.process_model("").unwrap_err();
    assert_eq!(err.category(), "ingestion");
}

#[test]
fn test_unknown_level_in_config_propagates() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = CompressionPipeline::new(ingestor(), RecordingRegistry::available(), config(dir.path(), &["turbo"], false));

    let err = pipeline.process_model("acme/llama-mini").unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn test_process_custom_model() {
    let dir = tempfile::tempdir().unwrap();
    let registry = RecordingRegistry::available();
    let pipeline = CompressionPipeline::new(ingestor(), &registry, config(dir.path(), &[], true));
    let recipe = CompressionRecipe::from_json(
        r#"{
            "description": "attention only",
            "quantization": {"type": "4bit"},
            "decomposition": {"type": "calr", "rank_ratio": 0.5, "correction_factor": 0.2},
            "lora": {"r": 2, "alpha": 4}
        }"#,
    )
    .unwrap();

    let report = pipeline.process_custom_model("acme/llama-mini", &recipe, "attn").unwrap();

    assert_eq!(report.artifacts.len(), 1);
    let artifact = &report.artifacts[0];
    assert_eq!(artifact.level, "custom");
    assert_eq!(artifact.description, "attention only");
    assert_eq!(artifact.compression_ratio, 0.1);
    assert_eq!(report.serving_tags, ["nanoquant_acme_llama-mini:attn"]);
    assert!(artifact.path.join(ARTIFACT_CONFIG_FILE).exists());
}

#[test]
fn test_invalid_custom_recipe_rejected_before_ingestion() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = CompressionPipeline::new(ingestor(), RecordingRegistry::available(), config(dir.path(), &[], false));
    let mut recipe = CompressionRecipe::new();
    recipe.lora = Some(nanoquant::LoraStage::new(0, 4, 0.1));

    let err = pipeline.process_custom_model("", &recipe, "bad").unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn test_local_ingestion_end_to_end() {
    let models = tempfile::tempdir().unwrap();
    let model_dir = models.path().join("tiny-gpt2");
    fs::create_dir(&model_dir).unwrap();
    fs::write(model_dir.join("config.json"), r#"{"model_type": "gpt2"}"#).unwrap();
    let attn: Vec<f32> = (0..48).map(|i| ((i * 7 % 11) as f32 - 5.0) * 0.1).collect();
    let mlp: Vec<f32> = (0..32).map(|i| ((i * 5 % 13) as f32 - 6.0) * 0.05).collect();
    write_tensors(
        &model_dir.join("model.safetensors"),
        &[
            NamedTensor::new("h.0.attn.c_attn.weight", vec![12, 4], attn),
            NamedTensor::new("h.0.attn.c_attn.bias", vec![12], vec![0.0; 12]),
            NamedTensor::new("h.0.mlp.c_fc.weight", vec![8, 4], mlp),
        ],
    )
    .unwrap();

    let out = tempfile::tempdir().unwrap();
    let pipeline = CompressionPipeline::with_store(
        LocalIngestor::with_root(models.path()),
        RecordingRegistry::default(),
        SafetensorsStore::new(),
        config(out.path(), &["heavy"], false),
    );

    let report = pipeline.process_model("tiny-gpt2").unwrap();

    assert_eq!(report.family, "gpt2");
    assert_eq!(report.artifacts.len(), 1);
    let artifact = &report.artifacts[0];
    assert_eq!(artifact.failures, 0);
    let saved = nanoquant::store::read_tensors(&artifact.path.join(WEIGHTS_FILE)).unwrap();
    let names: Vec<&str> = saved.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, ["h.0.attn.c_attn.bias", "h.0.attn.c_attn.weight", "h.0.mlp.c_fc.weight"]);
    assert!(artifact.path.join(ADAPTER_CONFIG_FILE).exists());
}
