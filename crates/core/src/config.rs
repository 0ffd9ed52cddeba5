//! Generator configuration document.
//!
//! The document has two top-level objects, `model` and `search`. Stage lists
//! and provider options are arrays of single-key objects keyed by their
//! identity:
//!
//! ```json
//! "pipeline": [
//!   { "embeds": { "filename": "embeds.onnx", "inputs": ["input_ids"], "outputs": ["hidden"] } },
//!   { "decoder": { "filename": "decoder.onnx", "inputs": ["hidden"], "outputs": ["logits"] } }
//! ]
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};

use candle_core::DType;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

use crate::error::{GenerationError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneratorConfig {
    pub model: ModelConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

impl GeneratorConfig {
    /// Parse and validate a configuration document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let mut config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints and fill in derived defaults.
    pub fn validate(&mut self) -> Result<()> {
        let model = &mut self.model;
        if model.context_length == 0 {
            return Err(GenerationError::Config(
                "model.context_length must be greater than zero".into(),
            ));
        }
        if model.eos_token_id.is_empty() {
            return Err(GenerationError::Config(
                "model.eos_token_id must name at least one token".into(),
            ));
        }

        let decoder = &mut model.decoder;
        if decoder.num_key_value_heads == 0 {
            decoder.num_key_value_heads = decoder.num_attention_heads;
        }
        if decoder.head_size == 0 && decoder.num_attention_heads > 0 {
            decoder.head_size = decoder.hidden_size / decoder.num_attention_heads;
        }
        decoder.kv_dtype()?;

        let mut seen = HashSet::new();
        for stage in &decoder.pipeline {
            if !seen.insert(stage.model_id.as_str()) {
                return Err(GenerationError::InvalidPipeline(format!(
                    "duplicate stage id {}",
                    stage.model_id
                )));
            }
        }

        let search = &mut self.search;
        if search.max_length == 0 {
            search.max_length = model.context_length;
        }
        if search.max_length > model.context_length {
            return Err(GenerationError::Config(format!(
                "search.max_length {} exceeds model.context_length {}",
                search.max_length, model.context_length
            )));
        }
        if search.num_beams == 0 {
            return Err(GenerationError::Config(
                "search.num_beams must be at least 1".into(),
            ));
        }
        if search.num_return_sequences == 0 || search.num_return_sequences > search.num_beams {
            return Err(GenerationError::Config(format!(
                "search.num_return_sequences must be in 1..={}",
                search.num_beams
            )));
        }
        search.reject_unsupported()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    #[serde(rename = "type", default)]
    pub model_type: String,
    pub vocab_size: usize,
    pub context_length: usize,
    #[serde(default)]
    pub pad_token_id: u32,
    /// End tokens; the first one is the primary end token.
    #[serde(deserialize_with = "deserialize_token_ids")]
    pub eos_token_id: Vec<u32>,
    #[serde(default)]
    pub bos_token_id: Option<u32>,
    pub decoder: DecoderConfig,
}

impl ModelConfig {
    pub fn primary_eos(&self) -> u32 {
        self.eos_token_id.first().copied().unwrap_or(self.pad_token_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecoderConfig {
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub session_options: Option<SessionOptions>,
    #[serde(default)]
    pub hidden_size: usize,
    #[serde(default)]
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: usize,
    #[serde(default)]
    pub num_hidden_layers: usize,
    #[serde(default)]
    pub head_size: usize,
    /// Element type of the key/value cache, `"float32"` or `"float16"`.
    #[serde(default = "default_kv_cache_type")]
    pub kv_cache_type: String,
    #[serde(default)]
    pub inputs: DecoderInputNames,
    #[serde(default)]
    pub outputs: DecoderOutputNames,
    #[serde(default, deserialize_with = "deserialize_pipeline")]
    pub pipeline: Vec<StageConfig>,
}

impl DecoderConfig {
    pub fn kv_dtype(&self) -> Result<DType> {
        parse_tensor_type(&self.kv_cache_type)
    }
}

fn default_kv_cache_type() -> String {
    "float32".to_string()
}

/// Map a configuration tensor type name to a candle dtype.
pub fn parse_tensor_type(name: &str) -> Result<DType> {
    match name {
        "float32" => Ok(DType::F32),
        "float16" => Ok(DType::F16),
        other => Err(GenerationError::Config(format!(
            "unsupported tensor type {other}"
        ))),
    }
}

/// Names of the inputs the session manages. Names ending in `_names` are
/// per-layer patterns where `%d` is replaced by the layer index.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DecoderInputNames {
    pub input_ids: String,
    pub inputs_embeds: String,
    pub attention_mask: String,
    pub position_ids: String,
    pub past_key_names: String,
    pub past_value_names: String,
}

impl Default for DecoderInputNames {
    fn default() -> Self {
        Self {
            input_ids: "input_ids".to_string(),
            inputs_embeds: "inputs_embeds".to_string(),
            attention_mask: "attention_mask".to_string(),
            position_ids: "position_ids".to_string(),
            past_key_names: "past_key_values.%d.key".to_string(),
            past_value_names: "past_key_values.%d.value".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DecoderOutputNames {
    pub logits: String,
    pub present_key_names: String,
    pub present_value_names: String,
}

impl Default for DecoderOutputNames {
    fn default() -> Self {
        Self {
            logits: "logits".to_string(),
            present_key_names: "present.%d.key".to_string(),
            present_value_names: "present.%d.value".to_string(),
        }
    }
}

/// Expand a per-layer name pattern.
pub fn layer_name(pattern: &str, layer: usize) -> String {
    pattern.replace("%d", &layer.to_string())
}

/// One sub-model invocation in the decoder pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    /// Filled from the key of the enclosing single-key object.
    #[serde(skip)]
    pub model_id: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub session_options: Option<SessionOptions>,
    #[serde(default = "default_true")]
    pub run_on_prompt: bool,
    #[serde(default = "default_true")]
    pub run_on_token_gen: bool,
    /// Renames outputs as they are handed to later stages.
    #[serde(default)]
    pub output_names_forwarder: HashMap<String, String>,
}

impl StageConfig {
    pub fn new(model_id: impl Into<String>, inputs: &[&str], outputs: &[&str]) -> Self {
        Self {
            model_id: model_id.into(),
            filename: None,
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            session_options: None,
            run_on_prompt: true,
            run_on_token_gen: true,
            output_names_forwarder: HashMap::new(),
        }
    }

    pub fn with_providers(mut self, providers: &[&str]) -> Self {
        self.session_options = Some(SessionOptions {
            provider_options: providers
                .iter()
                .map(|name| ProviderOptions {
                    name: name.to_string(),
                    options: BTreeMap::new(),
                })
                .collect(),
            ..Default::default()
        });
        self
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionOptions {
    #[serde(default)]
    pub log_id: Option<String>,
    #[serde(default)]
    pub enable_profiling: Option<String>,
    #[serde(default)]
    pub intra_op_num_threads: Option<u32>,
    #[serde(default)]
    pub inter_op_num_threads: Option<u32>,
    #[serde(default)]
    pub log_severity_level: Option<i32>,
    #[serde(default)]
    pub enable_cpu_mem_arena: Option<bool>,
    #[serde(default)]
    pub enable_mem_pattern: Option<bool>,
    #[serde(default, deserialize_with = "deserialize_provider_options")]
    pub provider_options: Vec<ProviderOptions>,
}

impl SessionOptions {
    pub fn lists_provider(&self, name: &str) -> bool {
        self.provider_options.iter().any(|p| p.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderOptions {
    pub name: String,
    pub options: BTreeMap<String, String>,
}

impl ProviderOptions {
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SearchConfig {
    pub min_length: usize,
    /// Zero means "use the model context length".
    pub max_length: usize,
    pub num_beams: usize,
    pub num_return_sequences: usize,
    pub top_k: usize,
    pub top_p: f32,
    pub temperature: f32,
    pub repetition_penalty: f32,
    pub length_penalty: f32,
    pub no_repeat_ngram_size: usize,
    pub diversity_penalty: f32,
    pub random_seed: Option<u64>,
    pub do_sample: bool,
    pub past_present_share_buffer: bool,
    pub early_stopping: bool,
}

impl SearchConfig {
    /// Fields accepted for compatibility with existing documents; only their
    /// defaults are implemented.
    fn reject_unsupported(&self) -> Result<()> {
        let unsupported = [
            ("no_repeat_ngram_size", self.no_repeat_ngram_size != 0),
            ("diversity_penalty", self.diversity_penalty != 0.0),
            ("past_present_share_buffer", self.past_present_share_buffer),
        ];
        match unsupported.iter().find(|(_, set)| *set) {
            Some((name, _)) => Err(GenerationError::Config(format!(
                "search.{name} is not supported"
            ))),
            None => Ok(()),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            min_length: 0,
            max_length: 0,
            num_beams: 1,
            num_return_sequences: 1,
            top_k: 50,
            top_p: 0.0,
            temperature: 1.0,
            repetition_penalty: 1.0,
            length_penalty: 1.0,
            no_repeat_ngram_size: 0,
            diversity_penalty: 0.0,
            random_seed: None,
            do_sample: false,
            past_present_share_buffer: false,
            early_stopping: true,
        }
    }
}

// ─── Custom deserializers ─────────────────────────────────────────────────

fn deserialize_token_ids<'de, D>(deserializer: D) -> std::result::Result<Vec<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TokenIds {
        Single(u32),
        Many(Vec<u32>),
    }

    Ok(match TokenIds::deserialize(deserializer)? {
        TokenIds::Single(id) => vec![id],
        TokenIds::Many(ids) => ids,
    })
}

/// Unwrap an array of `{ key: value }` objects into `(key, value)` pairs.
fn single_key_entries<'de, D, T>(deserializer: D) -> std::result::Result<Vec<(String, T)>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    let entries: Vec<BTreeMap<String, T>> = Vec::deserialize(deserializer)?;
    entries
        .into_iter()
        .map(|entry| {
            if entry.len() != 1 {
                return Err(D::Error::custom(format!(
                    "expected an object with exactly one key, found {}",
                    entry.len()
                )));
            }
            entry
                .into_iter()
                .next()
                .ok_or_else(|| D::Error::custom("empty entry"))
        })
        .collect()
}

fn deserialize_pipeline<'de, D>(deserializer: D) -> std::result::Result<Vec<StageConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(single_key_entries::<D, StageConfig>(deserializer)?
        .into_iter()
        .map(|(model_id, mut stage)| {
            stage.model_id = model_id;
            stage
        })
        .collect())
}

fn deserialize_provider_options<'de, D>(
    deserializer: D,
) -> std::result::Result<Vec<ProviderOptions>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(single_key_entries::<D, BTreeMap<String, String>>(deserializer)?
        .into_iter()
        .map(|(name, options)| ProviderOptions { name, options })
        .collect())
}
