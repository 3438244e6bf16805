//! Dispatcher behavior on whole models.

use std::sync::Arc;

use nanoquant::recipe::{DecompositionStage, LoraStage, PruningStage, QuantizationStage};
use nanoquant::{level, merged_weight, CompressionEngine, CompressionRecipe, LoraReport};

use super::common::{capture_logs, count_lines, llama_targets, synthetic_llama, toy_model, FailStrategy};

#[test]
fn test_unknown_quant_key_falls_back_and_logs_once() {
    let recipe = CompressionRecipe::new()
        .with_quantization(QuantizationStage::new("foo"))
        .with_pruning(PruningStage::new("magnitude", 0.3));
    let engine = CompressionEngine::new(llama_targets());

    let (out, logs) = capture_logs(|| engine.compress(synthetic_llama(1), &recipe));

    assert_eq!(count_lines(&logs, "unknown strategy"), 1, "logs:\n{logs}");
    assert_eq!(out.report.fallbacks.len(), 1);
    assert_eq!(out.report.fallbacks[0].requested, "foo");
    assert_eq!(out.report.stage("quantization").unwrap().strategy, "8bit");

    let explicit = CompressionRecipe::new()
        .with_quantization(QuantizationStage::new("8bit"))
        .with_pruning(PruningStage::new("magnitude", 0.3));
    assert_eq!(engine.compress(synthetic_llama(1), &explicit).handle, out.handle);
}

#[test]
fn test_unknown_prune_and_decomp_keys_fall_back() {
    let recipe = CompressionRecipe::new()
        .with_pruning(PruningStage::new("lottery", 0.5))
        .with_decomposition(DecompositionStage::new("tucker", 0.5));
    let out = CompressionEngine::new(llama_targets()).compress(synthetic_llama(2), &recipe);

    let used: Vec<&str> = out.report.fallbacks.iter().map(|f| f.used.as_str()).collect();
    assert_eq!(used, ["unstructured", "low_rank"]);
    assert!(out.report.is_clean());
}

#[test]
fn test_every_level_preserves_shapes() {
    let original = synthetic_llama(3);
    let engine = CompressionEngine::new(llama_targets());
    for name in nanoquant::list_levels() {
        let recipe = &level(name.as_str()).unwrap().recipe;
        let out = engine.compress(original.clone(), recipe);
        for (before, after) in original.layers.iter().zip(&out.handle.layers) {
            assert_eq!(before.weight.shape(), after.weight.shape(), "level {name} layer {}", before.name);
            assert!(after.weight.is_finite());
        }
        assert!(out.report.is_clean(), "level {name}: {:?}", out.report);
    }
}

#[test]
fn test_operator_failure_leaves_layers_and_continues() {
    let original = synthetic_llama(4);
    let recipe = CompressionRecipe::new()
        .with_quantization(QuantizationStage::new("quip"))
        .with_pruning(PruningStage::new("sparsegpt", 0.5));
    let out = CompressionEngine::new(llama_targets())
        .with_fault_injector(Arc::new(FailStrategy("quip")))
        .compress(original.clone(), &recipe);

    let quant = out.report.stage("quantization").unwrap();
    assert!(quant.applied.is_empty());
    assert_eq!(quant.failures.len(), original.layers.len());

    // Pruning ran on the untouched weights.
    let pruned_only = CompressionEngine::new(llama_targets())
        .compress(original, &CompressionRecipe::new().with_pruning(PruningStage::new("sparsegpt", 0.5)));
    assert_eq!(out.handle, pruned_only.handle);
}

#[test]
fn test_lora_attaches_to_family_targets() {
    let recipe = CompressionRecipe::new().with_lora(LoraStage::new(4, 8, 0.05));
    let out = CompressionEngine::new(llama_targets()).compress(synthetic_llama(5), &recipe);

    assert!(matches!(out.report.lora, Some(LoraReport::Attached { adapters: 2, r: 4, .. })));
    let names: Vec<&str> = out.handle.adapters.iter().map(|a| a.layer.as_str()).collect();
    assert_eq!(names, ["model.layers.0.self_attn.q_proj", "model.layers.0.self_attn.v_proj"]);

    // Fresh adapters do not change the merged weights.
    let merged = merged_weight(&out.handle, "model.layers.0.self_attn.q_proj").unwrap().unwrap();
    assert_eq!(&merged, &out.handle.layers[0].weight);
}

#[test]
fn test_lora_failure_keeps_earlier_stages() {
    let recipe = CompressionRecipe::new()
        .with_pruning(PruningStage::new("magnitude", 0.5))
        .with_lora(LoraStage::new(2, 2, 0.1));
    let out = CompressionEngine::new(vec!["c_attn".into()]).compress(toy_model(), &recipe);

    assert!(matches!(out.report.lora, Some(LoraReport::Failed { .. })));
    assert!(out.handle.adapters.is_empty());
    assert_eq!(out.report.stage("pruning").unwrap().applied.len(), 2);
    assert_eq!(out.handle.layers[0].weight.as_slice(), &[0.0, 0.0, 3.0, -4.0]);
}
