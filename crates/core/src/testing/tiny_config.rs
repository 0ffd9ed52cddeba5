use crate::config::{
    DecoderConfig, DecoderInputNames, DecoderOutputNames, GeneratorConfig, ModelConfig,
    SearchConfig, StageConfig,
};

pub const TINY_VOCAB: usize = 16;
pub const TINY_EOS: u32 = 2;

/// A validated config with one decoder layer (2 kv heads, head size 4),
/// a 16-token vocabulary and a 32-token context.
pub fn tiny_config(pipeline: Vec<StageConfig>) -> GeneratorConfig {
    let mut config = GeneratorConfig {
        model: ModelConfig {
            model_type: "decoder-pipeline".to_string(),
            vocab_size: TINY_VOCAB,
            context_length: 32,
            pad_token_id: 0,
            eos_token_id: vec![TINY_EOS],
            bos_token_id: Some(1),
            decoder: DecoderConfig {
                filename: None,
                session_options: None,
                hidden_size: 8,
                num_attention_heads: 2,
                num_key_value_heads: 2,
                num_hidden_layers: 1,
                head_size: 4,
                kv_cache_type: "float32".to_string(),
                inputs: DecoderInputNames::default(),
                outputs: DecoderOutputNames::default(),
                pipeline,
            },
        },
        search: SearchConfig::default(),
    };
    if let Err(e) = config.validate() {
        panic!("tiny config failed validation: {e}");
    }
    config
}
