//! Multi-level generation: scenarios, batch resilience, resume and cancellation.

use std::sync::Arc;

use nanoquant::generator::{read_artifact_config, ARTIFACT_CONFIG_FILE, MANIFEST_FILE};
use nanoquant::recipe::QuantizationStage;
use nanoquant::store::{read_tensors, WEIGHTS_FILE};
use nanoquant::{
    CancellationToken, CompressionEngine, CompressionRecipe, GenerationManifest, GeneratorConfig, LevelStatus,
    NanoQuantGenerator, SafetensorsStore,
};

use super::common::{
    capture_logs, count_lines, llama_targets, synthetic_llama, toy_model, CountingStore, FailStrategy, FailingStore,
};

fn only(levels: &[&str]) -> GeneratorConfig {
    GeneratorConfig {
        levels: Some(levels.iter().map(|s| s.to_string()).collect()),
        ..GeneratorConfig::default()
    }
}

#[test]
fn test_light_single_level_on_toy_model() {
    let dir = tempfile::tempdir().unwrap();
    let generator = NanoQuantGenerator::new(CompressionEngine::new(vec!["fc1".into()]), SafetensorsStore::new())
        .with_config(only(&["light"]));

    let artifacts = generator.generate_all(&toy_model(), dir.path()).unwrap();

    assert_eq!(artifacts.len(), 1);
    let artifact = &artifacts[0];
    assert_eq!(artifact.level, "light");
    assert_eq!(artifact.name, "toy_light");
    assert_eq!(artifact.compression_ratio, 0.30);
    assert_eq!(artifact.config.pruning.as_ref().unwrap().ratio, 0.15);
    assert!(artifact.path.exists());
    assert!(artifact.path.join(WEIGHTS_FILE).exists());
    assert!(artifact.path.join(ARTIFACT_CONFIG_FILE).exists());

    let json = serde_json::to_value(artifact).unwrap();
    assert_eq!(json["config"]["pruning"]["ratio"], 0.15);

    let tensors = read_tensors(&artifact.path.join(WEIGHTS_FILE)).unwrap();
    let shapes: Vec<(&str, &[usize])> = tensors.iter().map(|t| (t.name.as_str(), t.shape.as_slice())).collect();
    assert_eq!(shapes, [("fc1.weight", &[2, 2][..]), ("fc2.weight", &[1, 2][..])]);
}

#[test]
fn test_all_levels_in_table_order() {
    let dir = tempfile::tempdir().unwrap();
    let generator = NanoQuantGenerator::new(CompressionEngine::new(llama_targets()), SafetensorsStore::new());

    let artifacts = generator.generate_all(&synthetic_llama(7), dir.path()).unwrap();

    let levels: Vec<&str> = artifacts.iter().map(|a| a.level.as_str()).collect();
    assert_eq!(levels, ["light", "medium", "heavy", "extreme", "ultra", "nano", "atomic"]);

    let ratios: Vec<f64> = artifacts.iter().map(|a| a.compression_ratio).collect();
    assert!(ratios.windows(2).all(|w| w[0] >= w[1]), "{ratios:?}");
    let prune: Vec<f64> = artifacts
        .iter()
        .map(|a| a.config.pruning.as_ref().unwrap().ratio)
        .collect();
    assert!(prune.windows(2).all(|w| w[0] <= w[1]), "{prune:?}");

    for artifact in &artifacts {
        assert_eq!(artifact.failures, 0, "{}", artifact.name);
        assert!(artifact.checksum.is_some());
        let quality = artifact.quality.as_ref().unwrap();
        assert_eq!(quality.layer_count, 5);
    }

    let manifest = GenerationManifest::load(&dir.path().join(MANIFEST_FILE)).unwrap();
    assert_eq!(manifest.completed(), 7);
    assert_eq!(manifest.model_id, "test-org/tiny-llama");
}

#[test]
fn test_levels_compress_independent_copies() {
    let source = synthetic_llama(8);
    let engine = CompressionEngine::new(llama_targets());

    let batch_dir = tempfile::tempdir().unwrap();
    let batch = NanoQuantGenerator::new(engine.clone(), SafetensorsStore::new())
        .generate_all(&source, batch_dir.path())
        .unwrap();

    let single_dir = tempfile::tempdir().unwrap();
    let single = NanoQuantGenerator::new(engine, SafetensorsStore::new())
        .with_config(only(&["atomic"]))
        .generate_all(&source, single_dir.path())
        .unwrap();

    let batch_atomic = batch.iter().find(|a| a.level == "atomic").unwrap();
    assert_eq!(batch_atomic.checksum, single[0].checksum);
}

#[test]
fn test_operator_fault_does_not_stop_batch() {
    let dir = tempfile::tempdir().unwrap();
    let engine = CompressionEngine::new(llama_targets()).with_fault_injector(Arc::new(FailStrategy("quip")));
    let generator = NanoQuantGenerator::new(engine, SafetensorsStore::new());

    let artifacts = generator.generate_all(&synthetic_llama(9), dir.path()).unwrap();

    assert_eq!(artifacts.len(), 7);
    let extreme = artifacts.iter().find(|a| a.level == "extreme").unwrap();
    assert_eq!(extreme.failures, 5);
    assert!(artifacts.iter().filter(|a| a.level != "extreme").all(|a| a.failures == 0));

    let config = read_artifact_config(&extreme.path).unwrap();
    let quant = config.dispatch.stage("quantization").unwrap();
    assert_eq!(quant.failures.len(), 5);
    assert_eq!(quant.failures[0].category, "operator_failure");
}

#[test]
fn test_persistence_failure_skips_one_level() {
    let dir = tempfile::tempdir().unwrap();
    let generator = NanoQuantGenerator::new(CompressionEngine::new(llama_targets()), FailingStore::new("_ultra"));

    let (artifacts, logs) = capture_logs(|| generator.generate_all(&synthetic_llama(10), dir.path()).unwrap());

    assert_eq!(artifacts.len(), 6);
    assert!(artifacts.iter().all(|a| a.level != "ultra"));
    assert!(count_lines(&logs, "artifact not written") >= 1, "logs:\n{logs}");
    assert!(logs.contains("ultra"));

    let manifest = GenerationManifest::load(&dir.path().join(MANIFEST_FILE)).unwrap();
    assert_eq!(manifest.failed(), 1);
    assert!(matches!(manifest.get("ultra"), Some(LevelStatus::Failed { .. })));
}

#[test]
fn test_resume_reuses_completed_levels() {
    let dir = tempfile::tempdir().unwrap();
    let source = synthetic_llama(11);
    let engine = CompressionEngine::new(llama_targets());

    let first = CountingStore::default();
    NanoQuantGenerator::new(engine.clone(), &first)
        .with_config(only(&["light", "medium"]))
        .generate_all(&source, dir.path())
        .unwrap();
    assert_eq!(first.count(), 2);

    let second = CountingStore::default();
    let config = GeneratorConfig {
        resume: true,
        ..only(&["light", "medium", "heavy"])
    };
    let artifacts = NanoQuantGenerator::new(engine, &second)
        .with_config(config)
        .generate_all(&source, dir.path())
        .unwrap();

    assert_eq!(second.count(), 1);
    assert_eq!(artifacts.len(), 3);
}

#[test]
fn test_resume_with_subset_returns_only_requested_levels() {
    let dir = tempfile::tempdir().unwrap();
    let source = synthetic_llama(14);
    let engine = CompressionEngine::new(llama_targets());

    NanoQuantGenerator::new(engine.clone(), SafetensorsStore::new())
        .with_config(only(&["light", "medium"]))
        .generate_all(&source, dir.path())
        .unwrap();

    let config = GeneratorConfig {
        resume: true,
        ..only(&["heavy"])
    };
    let artifacts = NanoQuantGenerator::new(engine.clone(), SafetensorsStore::new())
        .with_config(config)
        .generate_all(&source, dir.path())
        .unwrap();

    let levels: Vec<&str> = artifacts.iter().map(|a| a.level.as_str()).collect();
    assert_eq!(levels, ["heavy"]);
    let manifest = GenerationManifest::load(&dir.path().join(MANIFEST_FILE)).unwrap();
    assert_eq!(manifest.completed(), 3);

    // Requested out of order, returned in table order.
    let config = GeneratorConfig {
        resume: true,
        ..only(&["heavy", "light"])
    };
    let artifacts = NanoQuantGenerator::new(engine, SafetensorsStore::new())
        .with_config(config)
        .generate_all(&source, dir.path())
        .unwrap();
    let levels: Vec<&str> = artifacts.iter().map(|a| a.level.as_str()).collect();
    assert_eq!(levels, ["light", "heavy"]);
}

#[test]
fn test_resume_recomputes_missing_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let source = synthetic_llama(12);
    let engine = CompressionEngine::new(llama_targets());
    let config = GeneratorConfig {
        resume: true,
        ..only(&["light"])
    };

    let artifacts = NanoQuantGenerator::new(engine.clone(), SafetensorsStore::new())
        .with_config(config.clone())
        .generate_all(&source, dir.path())
        .unwrap();
    std::fs::remove_dir_all(&artifacts[0].path).unwrap();

    let store = CountingStore::default();
    NanoQuantGenerator::new(engine, &store)
        .with_config(config)
        .generate_all(&source, dir.path())
        .unwrap();
    assert_eq!(store.count(), 1);
}

#[test]
fn test_cancellation_between_levels() {
    let dir = tempfile::tempdir().unwrap();
    let token = CancellationToken::new();
    let store = CountingStore::cancelling(token.clone());
    let generator = NanoQuantGenerator::new(CompressionEngine::new(llama_targets()), &store);

    let manifest = generator.generate(&synthetic_llama(13), dir.path(), &token).unwrap();

    assert_eq!(store.count(), 1);
    assert_eq!(manifest.completed(), 1);
    assert_eq!(manifest.skipped(), 6);
    assert!(matches!(manifest.get("atomic"), Some(LevelStatus::Skipped { reason, .. }) if reason == "cancelled"));
}

#[test]
fn test_custom_recipe_with_unknown_key() {
    let dir = tempfile::tempdir().unwrap();
    let recipe = CompressionRecipe::from_json(r#"{"quantization": {"type": "foo"}, "pruning": {"ratio": 0.2}}"#).unwrap();
    let generator = NanoQuantGenerator::new(CompressionEngine::new(llama_targets()), SafetensorsStore::new());

    let (artifact, logs) =
        capture_logs(|| generator.generate_custom(&synthetic_llama(14), &recipe, dir.path(), "mine").unwrap());

    assert_eq!(count_lines(&logs, "unknown strategy"), 1, "logs:\n{logs}");
    assert_eq!(artifact.level, "custom");
    assert_eq!(artifact.name, "test-org_tiny-llama_mine");
    assert_eq!(artifact.compression_ratio, 0.1);
    assert_eq!(artifact.config.quantization, Some(QuantizationStage::new("foo")));

    let config = read_artifact_config(&artifact.path).unwrap();
    assert_eq!(config.dispatch.fallbacks.len(), 1);
    assert_eq!(config.dispatch.stage("pruning").unwrap().strategy, "unstructured");
}
