//! Multi-stage pipelines driven from a parsed configuration document.

use candle_core::{DType, Device, Tensor};
use stagegen_core::config::StageConfig;
use stagegen_core::error::BindingDirection;
use stagegen_core::testing::{tiny_config, MockBackend, TINY_VOCAB};
use stagegen_core::{
    DeviceId, DevicePlacement, DeviceRegistry, GenerationError, Generator, GeneratorConfig,
    GeneratorParams,
};

const SPLIT_DECODER: &str = r#"{
    "model": {
        "type": "split-decoder",
        "vocab_size": 16,
        "context_length": 32,
        "pad_token_id": 0,
        "eos_token_id": [2],
        "decoder": {
            "hidden_size": 8,
            "num_attention_heads": 2,
            "num_hidden_layers": 1,
            "pipeline": [
                { "embeds": {
                    "inputs": ["input_ids"],
                    "outputs": ["inputs_embeds"]
                } },
                { "transformer": {
                    "inputs": [
                        "inputs_embeds", "attention_mask", "position_ids",
                        "past_key_values.0.key", "past_key_values.0.value"
                    ],
                    "outputs": ["hidden_out", "present.0.key", "present.0.value"],
                    "output_names_forwarder": { "hidden_out": "hidden_states" }
                } },
                { "lm_head": {
                    "inputs": ["hidden_states"],
                    "outputs": ["logits"]
                } }
            ]
        }
    },
    "search": { "max_length": 5 }
}"#;

fn new_generator<'a>(
    config: &GeneratorConfig,
    params: &GeneratorParams,
    backend: &'a MockBackend,
    placement: DevicePlacement,
    registry: &DeviceRegistry,
) -> Result<Generator<&'a MockBackend>, GenerationError> {
    Generator::new(config, params, backend, placement, registry)
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

// ─── Dataflow ────────────────────────────────────────────────────────────────

#[test]
fn split_decoder_runs_stages_in_order() {
    let config = GeneratorConfig::from_json_str(SPLIT_DECODER).unwrap();
    let params = GeneratorParams::new(&config, 1, vec![1, 3]);
    let backend = MockBackend::new(TINY_VOCAB);
    backend.push_argmax(&[7]);
    backend.push_argmax(&[8]);
    backend.push_argmax(&[9]);

    let mut gen = new_generator(
        &config,
        &params,
        &backend,
        DevicePlacement::cpu(),
        &DeviceRegistry::default(),
    )
    .unwrap();
    let out = gen.generate().unwrap();
    assert_eq!(out, vec![vec![1, 3, 7, 8, 9]]);

    let calls = backend.calls();
    let order: Vec<&str> = calls.iter().map(|c| c.stage.as_str()).collect();
    assert_eq!(
        order,
        vec![
            "embeds", "transformer", "lm_head",
            "embeds", "transformer", "lm_head",
            "embeds", "transformer", "lm_head",
        ]
    );

    // Managed outputs go to the session, the rest is renamed for later stages.
    assert_eq!(
        calls[1].input_names,
        names(&[
            "attention_mask",
            "inputs_embeds",
            "past_key_values.0.key",
            "past_key_values.0.value",
            "position_ids",
        ])
    );
    assert_eq!(calls[2].input_names, names(&["hidden_states"]));
    assert_eq!(calls[4].past_len, Some(2));
    assert_eq!(calls[7].past_len, Some(3));
}

#[test]
fn prompt_only_stage_is_skipped_during_token_generation() {
    let mut prefill = StageConfig::new("prefill", &["input_ids"], &["prompt_hint"]);
    prefill.run_on_token_gen = false;
    let decoder = StageConfig::new("decoder", &["input_ids", "prompt_hint"], &["logits"]);
    let mut config = tiny_config(vec![prefill, decoder]);
    config.search.max_length = 5;
    let params = GeneratorParams::new(&config, 1, vec![1, 3]);
    let backend = MockBackend::new(TINY_VOCAB);

    let mut gen = new_generator(
        &config,
        &params,
        &backend,
        DevicePlacement::cpu(),
        &DeviceRegistry::default(),
    )
    .unwrap();
    gen.generate().unwrap();

    let calls = backend.calls();
    let order: Vec<&str> = calls.iter().map(|c| c.stage.as_str()).collect();
    assert_eq!(order, vec!["prefill", "decoder", "decoder", "decoder"]);
    assert_eq!(calls[1].input_names, names(&["input_ids", "prompt_hint"]));
    assert_eq!(calls[2].input_names, names(&["input_ids"]));
}

#[test]
fn consuming_a_later_output_is_rejected() {
    let config = tiny_config(vec![
        StageConfig::new("head", &["hidden_states"], &["logits"]),
        StageConfig::new("body", &["input_ids"], &["hidden_states"]),
    ]);
    let params = GeneratorParams::new(&config, 1, vec![1]);
    let backend = MockBackend::new(TINY_VOCAB);
    let result = new_generator(
        &config,
        &params,
        &backend,
        DevicePlacement::cpu(),
        &DeviceRegistry::default(),
    );
    assert!(matches!(result, Err(GenerationError::InvalidPipeline(_))));
}

#[test]
fn extra_inputs_are_bound_by_name() {
    let config = tiny_config(vec![StageConfig::new(
        "decoder",
        &["input_ids", "image_features"],
        &["logits"],
    )]);
    let features = Tensor::zeros((1, 4, 8), DType::F32, &Device::Cpu).unwrap();
    let params =
        GeneratorParams::new(&config, 1, vec![1, 3]).with_extra_input("image_features", features);
    let backend = MockBackend::new(TINY_VOCAB);

    let mut gen = new_generator(
        &config,
        &params,
        &backend,
        DevicePlacement::cpu(),
        &DeviceRegistry::default(),
    )
    .unwrap();
    gen.compute_logits().unwrap();
    assert_eq!(
        backend.calls()[0].input_names,
        names(&["image_features", "input_ids"])
    );
}

// ─── Devices and failures ────────────────────────────────────────────────────

fn cuda_placement() -> DevicePlacement {
    DevicePlacement::new(DeviceId::cuda(), Device::Cpu)
}

#[test]
fn host_only_stage_rejects_managed_tensors_on_cuda() {
    let config = tiny_config(vec![
        StageConfig::new("decoder", &["input_ids"], &["logits"]).with_providers(&["cpu"])
    ]);
    let params = GeneratorParams::new(&config, 1, vec![1]);
    let backend = MockBackend::new(TINY_VOCAB);
    let mut gen = new_generator(
        &config,
        &params,
        &backend,
        cuda_placement(),
        &DeviceRegistry::default(),
    )
    .unwrap();

    match gen.compute_logits() {
        Err(GenerationError::DeviceMismatch {
            stage,
            tensor,
            direction,
            device,
        }) => {
            assert_eq!(stage, "decoder");
            assert_eq!(tensor, "input_ids");
            assert_eq!(direction, BindingDirection::Input);
            assert_eq!(device, "cuda");
        }
        other => panic!("expected a device mismatch, got {other:?}"),
    }
    assert!(backend.calls().is_empty());
}

#[test]
fn cuda_stage_accepts_managed_tensors_on_cuda() {
    let config = tiny_config(vec![
        StageConfig::new("decoder", &["input_ids"], &["logits"]).with_providers(&["cuda"])
    ]);
    let params = GeneratorParams::new(&config, 1, vec![1]);
    let backend = MockBackend::new(TINY_VOCAB);
    let mut gen = new_generator(
        &config,
        &params,
        &backend,
        cuda_placement(),
        &DeviceRegistry::default(),
    )
    .unwrap();
    gen.compute_logits().unwrap();
    assert_eq!(backend.calls().len(), 1);
}

#[test]
fn unknown_device_needs_registration() {
    let config = tiny_config(vec![StageConfig::new("decoder", &["input_ids"], &["logits"])]);
    let params = GeneratorParams::new(&config, 1, vec![1]);
    let backend = MockBackend::new(TINY_VOCAB);
    let npu = || DevicePlacement::new(DeviceId::new("npu"), Device::Cpu);

    let mut registry = DeviceRegistry::default();
    let result = new_generator(&config, &params, &backend, npu(), &registry);
    assert!(matches!(
        result,
        Err(GenerationError::UnsupportedDeviceType(ref name)) if name == "npu"
    ));

    registry.register(DeviceId::new("npu"));
    assert!(new_generator(&config, &params, &backend, npu(), &registry).is_ok());
}

#[test]
fn backend_failure_names_the_stage() {
    let config = GeneratorConfig::from_json_str(SPLIT_DECODER).unwrap();
    let params = GeneratorParams::new(&config, 1, vec![1, 3]);
    let backend = MockBackend::new(TINY_VOCAB);
    backend.fail_stage("lm_head");

    let mut gen = new_generator(
        &config,
        &params,
        &backend,
        DevicePlacement::cpu(),
        &DeviceRegistry::default(),
    )
    .unwrap();
    match gen.generate() {
        Err(GenerationError::Backend { stage, .. }) => assert_eq!(stage, "lm_head"),
        other => panic!("expected a backend error, got {other:?}"),
    }
}
