//! Generation loop driver.
//!
//! A [`Generator`] owns one [`GenerationSession`] and one search strategy and
//! alternates between them:
//!
//! ```text
//! compute_logits ─► session.run(len, next_tokens, next_indices) ─► search.set_logits
//!       ▲                                                              │
//!       └──────────── generate_next_token (constrain, select) ◄────────┘
//! ```
//!
//! For speculative decoding [`Generator::verify_candidates`] replaces the
//! pair: it runs the last committed token plus a draft in one step, keeps
//! the agreeing prefix and rolls the session back over the rest.

use candle_core::Tensor;
use tracing::{debug, info};

use crate::config::{GeneratorConfig, SearchConfig};
use crate::device::{DevicePlacement, DeviceRegistry};
use crate::error::{GenerationError, Result};
use crate::pipeline::InferenceBackend;
use crate::search::{self, CandidateCheck, Search, SearchKind, SearchParams};
use crate::state::GenerationSession;

/// Per-request inputs: prompt, batch shape and search settings.
#[derive(Debug, Clone)]
pub struct GeneratorParams {
    pub search: SearchConfig,
    pub batch_size: usize,
    /// Row-major prompt tokens, `batch_size` rows of equal length.
    pub input_ids: Vec<u32>,
    pub pad_token_id: u32,
    pub eos_token_ids: Vec<u32>,
    pub vocab_size: usize,
    pub context_length: usize,
    /// Additional caller-owned inputs bound by name on every step.
    pub extra_inputs: Vec<(String, Tensor)>,
    pub speculative: bool,
}

impl GeneratorParams {
    pub fn new(config: &GeneratorConfig, batch_size: usize, input_ids: Vec<u32>) -> Self {
        Self {
            search: config.search.clone(),
            batch_size,
            input_ids,
            pad_token_id: config.model.pad_token_id,
            eos_token_ids: config.model.eos_token_id.clone(),
            vocab_size: config.model.vocab_size,
            context_length: config.model.context_length,
            extra_inputs: Vec::new(),
            speculative: false,
        }
    }

    /// Drive the request with speculative greedy search.
    pub fn with_speculative(mut self) -> Self {
        self.speculative = true;
        self
    }

    pub fn with_extra_input(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.extra_inputs.push((name.into(), tensor));
        self
    }

    pub fn batch_beam_size(&self) -> usize {
        self.batch_size * self.search.num_beams.max(1)
    }

    pub fn prompt_length(&self) -> usize {
        if self.batch_size == 0 {
            0
        } else {
            self.input_ids.len() / self.batch_size
        }
    }

    /// Prompt with every batch entry repeated once per beam.
    pub fn expanded_input_ids(&self) -> Vec<u32> {
        let beams = self.search.num_beams.max(1);
        let len = self.prompt_length();
        if beams == 1 || len == 0 {
            return self.input_ids.clone();
        }
        let mut out = Vec::with_capacity(self.input_ids.len() * beams);
        for row in self.input_ids.chunks(len) {
            for _ in 0..beams {
                out.extend_from_slice(row);
            }
        }
        out
    }

    pub fn search_params(&self) -> SearchParams {
        let max_length = if self.search.max_length == 0 {
            self.context_length
        } else {
            self.search.max_length
        };
        SearchParams {
            batch_size: self.batch_size,
            num_beams: self.search.num_beams.max(1),
            num_return_sequences: self.search.num_return_sequences,
            max_length,
            vocab_size: self.vocab_size,
            pad_token_id: self.pad_token_id,
            eos_token_ids: self.eos_token_ids.clone(),
            length_penalty: self.search.length_penalty,
            early_stopping: self.search.early_stopping,
            random_seed: self.search.random_seed,
            min_length: self.search.min_length,
            repetition_penalty: self.search.repetition_penalty,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(GenerationError::Config("batch_size must be at least 1".into()));
        }
        if self.input_ids.is_empty() || self.input_ids.len() % self.batch_size != 0 {
            return Err(GenerationError::shape(
                format!("a non-empty multiple of {} prompt tokens", self.batch_size),
                self.input_ids.len().to_string(),
            ));
        }
        if self.eos_token_ids.is_empty() {
            return Err(GenerationError::Config("at least one end token is required".into()));
        }
        Ok(())
    }
}

pub struct Generator<B> {
    session: GenerationSession<B>,
    search: Box<dyn Search>,
    config: SearchConfig,
    computed_logits: bool,
    /// Tokens committed but not yet fed to the session, when they differ
    /// from the search's latest selection.
    pending_feed: Option<Vec<u32>>,
}

impl<B: InferenceBackend> Generator<B> {
    pub fn new(
        config: &GeneratorConfig,
        params: &GeneratorParams,
        backend: B,
        placement: DevicePlacement,
        registry: &DeviceRegistry,
    ) -> Result<Self> {
        params.validate()?;
        let search =
            search::create_search(params.search_params(), &params.input_ids, params.speculative)?;
        let session = GenerationSession::new(config, params, backend, placement, registry)?;

        info!(
            strategy = search.kind().name(),
            batch = params.batch_size,
            prompt_len = params.prompt_length(),
            "generator created"
        );

        Ok(Self {
            session,
            search,
            config: params.search.clone(),
            computed_logits: false,
            pending_feed: None,
        })
    }

    /// Run the pipeline for the next step and hand its logits to search.
    pub fn compute_logits(&mut self) -> Result<()> {
        let feed = match self.pending_feed.take() {
            Some(feed) => feed,
            None => self.search.next_tokens().to_vec(),
        };
        let logits = self.session.run(
            self.search.sequence_length(),
            &feed,
            self.search.next_indices(),
        )?;
        self.search.set_logits(&logits)?;
        self.computed_logits = true;
        Ok(())
    }

    /// Constrain the pending logits and commit one token per row.
    pub fn generate_next_token(&mut self) -> Result<()> {
        if !self.computed_logits {
            return Err(GenerationError::LogitsNotComputed);
        }
        self.computed_logits = false;

        let cfg = &self.config;
        if cfg.min_length > 0 {
            self.search.apply_min_length(cfg.min_length)?;
        }
        if cfg.repetition_penalty != 1.0 {
            self.search.apply_repetition_penalty(cfg.repetition_penalty)?;
        }

        let top_p_active = cfg.top_p > 0.0 && cfg.top_p < 1.0;
        if !cfg.do_sample || cfg.top_k == 1 {
            self.search.select_top()
        } else if cfg.top_k > 1 && top_p_active {
            self.search
                .sample_top_k_top_p(cfg.top_k, cfg.top_p, cfg.temperature)
        } else if cfg.top_k > 1 {
            self.search.sample_top_k(cfg.top_k, cfg.temperature)
        } else if top_p_active {
            self.search.sample_top_p(cfg.top_p, cfg.temperature)
        } else {
            self.search.sample_top_p(1.0, cfg.temperature)
        }
    }

    pub fn is_done(&self) -> bool {
        self.search.is_done()
    }

    pub fn search(&self) -> &dyn Search {
        self.search.as_ref()
    }

    pub fn session(&self) -> &GenerationSession<B> {
        &self.session
    }

    /// Tokens of result `index`. For beam search this finalizes the search.
    pub fn sequence(&mut self, index: usize) -> Result<Vec<u32>> {
        self.search.sequence(index)
    }

    /// Run to completion and return every result sequence.
    pub fn generate(&mut self) -> Result<Vec<Vec<u32>>> {
        while !self.is_done() {
            self.compute_logits()?;
            self.generate_next_token()?;
        }
        let count = match self.search.kind() {
            SearchKind::Beam => self.search.sequences().rows() / self.config.num_beams.max(1)
                * self.config.num_return_sequences,
            _ => self.search.sequences().rows(),
        };
        (0..count).map(|i| self.search.sequence(i)).collect()
    }

    /// Verify `draft` against the model and commit the agreeing prefix plus
    /// the model's own next token.
    ///
    /// The prompt step runs first if it has not yet. The draft is clipped so
    /// the committed tokens fit in the remaining capacity.
    pub fn verify_candidates(&mut self, draft: &[u32]) -> Result<CandidateCheck> {
        let kind = self.search.kind();
        if kind != SearchKind::SpeculativeGreedy {
            return Err(search::unsupported(kind, "check_candidates"));
        }
        if self.computed_logits {
            return Err(search::unsupported(kind, "verify_candidates with pending logits"));
        }
        if self.session.is_first_run() {
            self.compute_logits()?;
            self.generate_next_token()?;
        }
        if self.is_done() {
            return Ok(CandidateCheck::default());
        }

        let committed_len = self.search.sequence_length();
        let room = self
            .search
            .sequences()
            .max_length()
            .saturating_sub(committed_len + 1);
        let draft = &draft[..draft.len().min(room)];
        let k = draft.len();

        let mut feed = match self.pending_feed.take() {
            Some(feed) => feed,
            None => self.search.next_tokens().to_vec(),
        };
        let fed_committed = feed.len();
        feed.extend_from_slice(draft);

        let logits = self.session.run(committed_len + k, &feed, &[])?;
        self.search.set_logits(&logits)?;

        let mut candidates = self.search.sequence(0)?;
        candidates.extend_from_slice(draft);
        let check = self.search.check_candidates(&candidates, k)?;

        self.search.set_next_tokens(&check.committed())?;
        self.session.rollback(k - check.accepted_len())?;
        self.pending_feed = check.correction.map(|t| vec![t]);

        debug!(
            fed = fed_committed + k,
            accepted = check.accepted_len(),
            length = self.search.sequence_length(),
            "verified draft"
        );
        Ok(check)
    }
}
