use std::time::{Duration, Instant};

use async_stream::try_stream;
use futures::stream::Stream;
use log::{debug, info, warn};
use ndarray::{s, Array2};
use serde::Serialize;

use crate::batch::{append_column, next_token_logits, PaddedBatch};
use crate::cache::{KvCacheManager, StepMode};
use crate::config::GenerationConfig;
use crate::error::{GenerationError, GenerationResult};
use crate::logits::LogitsProcessorChain;
use crate::model::{EncoderContext, SequenceModel, StepInput};
use crate::sampler::Sampler;
use crate::sequence::Sequence;
use crate::stopping::{all_done, StopReason, StoppingCriteria};

/// Tokens appended to each row by one decoder step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepTokens {
    pub step: usize,
    /// `None` for rows that were already finished before this step.
    pub tokens: Vec<Option<u32>>,
    /// Rows that finished on this step, with the reason.
    pub finished: Vec<Option<StopReason>>,
}

/// Full result of a generation call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationOutput {
    /// Generated tokens per row, prompt and start token excluded.
    pub sequences: Vec<Vec<u32>>,
    pub stop_reasons: Vec<Option<StopReason>>,
    /// Number of forward passes run by the decoder loop.
    pub steps: usize,
}

/// Orchestrates autoregressive generation for decoder-only and encoder-decoder models.
///
/// The generator owns the model handle; all per-call state lives in a
/// `DecodingState` created by each call, so one generator can serve
/// concurrent calls on independent batches.
///
/// # Example
/// ```no_run
/// use kjarni_generation::{GenerationConfig, SequenceGenerator, SequenceModel};
///
/// # async fn example(model: Box<dyn SequenceModel>) -> kjarni_generation::GenerationResult<()> {
/// let generator = SequenceGenerator::new(model);
/// let config = GenerationConfig::sampling(0.7, 50, 0.9).with_seed(42);
///
/// let output = generator.generate(&[vec![7, 9, 2]], &config).await?;
/// println!("Generated: {:?}", output[0]);
/// # Ok(())
/// # }
/// ```
pub struct SequenceGenerator {
    pub model: Box<dyn SequenceModel>,
}

impl SequenceGenerator {
    pub fn new(model: Box<dyn SequenceModel>) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &dyn SequenceModel {
        self.model.as_ref()
    }

    /// Generates a continuation for every sequence in `batch`.
    ///
    /// Either every row is returned or an error is; a failure part-way
    /// through discards everything produced so far.
    pub async fn generate(
        &self,
        batch: &[Vec<u32>],
        config: &GenerationConfig,
    ) -> GenerationResult<Vec<Vec<u32>>> {
        Ok(self.generate_with_details(batch, config).await?.sequences)
    }

    /// Like [`generate`](Self::generate), using the model's default config.
    pub async fn generate_default(&self, batch: &[Vec<u32>]) -> GenerationResult<Vec<Vec<u32>>> {
        let config = self.model.default_generation_config();
        self.generate(batch, &config).await
    }

    /// Generates and also reports why each row stopped.
    pub async fn generate_with_details(
        &self,
        batch: &[Vec<u32>],
        config: &GenerationConfig,
    ) -> GenerationResult<GenerationOutput> {
        let t_start = Instant::now();
        let mut state = DecodingState::new(self.model(), batch, config)?;

        if !state.is_finished() {
            let encoder_context = self.encode(batch, config).await?;
            while !state.is_finished() {
                state.step(encoder_context.as_ref()).await?;
            }
        }

        let output = state.finish();
        state.log_performance(t_start.elapsed());
        Ok(output)
    }

    /// Generates a stream of per-step tokens.
    ///
    /// The stream yields one `StepTokens` per forward pass. Stop tokens are
    /// always yielded; `include_stop_token` only applies to `generate`.
    ///
    /// # Example
    /// ```no_run
    /// use futures::StreamExt;
    /// # async fn example(generator: kjarni_generation::SequenceGenerator, config: kjarni_generation::GenerationConfig) -> kjarni_generation::GenerationResult<()> {
    /// let batch = vec![vec![7, 9, 2]];
    /// let stream = generator.generate_stream(&batch, &config);
    /// futures::pin_mut!(stream);
    /// while let Some(step) = stream.next().await {
    ///     let step = step?;
    ///     println!("step {}: {:?}", step.step, step.tokens);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub fn generate_stream<'a>(
        &'a self,
        batch: &'a [Vec<u32>],
        config: &'a GenerationConfig,
    ) -> impl Stream<Item = GenerationResult<StepTokens>> + 'a {
        try_stream! {
            let t_start = Instant::now();
            let mut state = DecodingState::new(self.model(), batch, config)?;

            if !state.is_finished() {
                let encoder_context = self.encode(batch, config).await?;
                while !state.is_finished() {
                    let tokens = state.step(encoder_context.as_ref()).await?;
                    yield tokens;
                }
            }
            state.log_performance(t_start.elapsed());
        }
    }

    /// Runs the encoder once for encoder-decoder models.
    async fn encode(
        &self,
        batch: &[Vec<u32>],
        config: &GenerationConfig,
    ) -> GenerationResult<Option<EncoderContext>> {
        if !self.model.architecture().is_encoder_decoder() {
            return Ok(None);
        }

        let t_encode = Instant::now();
        let source = PaddedBatch::from_sequences(
            batch,
            self.model.pad_token_id(),
            config.max_input_length,
        );
        let context = self
            .model
            .encode(&source)
            .await
            .map_err(|e| GenerationError::executor(None, e))?;

        if context.batch_size() != batch.len() {
            return Err(GenerationError::executor(
                None,
                anyhow::anyhow!(
                    "encoder returned batch of {}, expected {}",
                    context.batch_size(),
                    batch.len()
                ),
            ));
        }

        info!(
            "Encoder pass complete in {:.2}ms ({} x {} tokens)",
            t_encode.elapsed().as_secs_f64() * 1000.0,
            source.batch_size(),
            source.seq_len()
        );
        Ok(Some(context))
    }
}

/// All mutable state of one generation call.
///
/// Dropping the state releases any cache still held, so the executor gets its
/// tensors back on every exit path, including errors and abandoned streams.
struct DecodingState<'m> {
    model: &'m dyn SequenceModel,
    sequences: Vec<Sequence>,
    cache: KvCacheManager,
    sampler: Sampler,
    chain: LogitsProcessorChain,
    criteria: StoppingCriteria,
    /// Mask over every position already held in the cache.
    cached_mask: Option<Array2<u32>>,
    step: usize,
    pad_token_id: u32,
    include_stop_token: bool,
    backend_time: Duration,
    sampling_time: Duration,
}

impl<'m> DecodingState<'m> {
    /// Validates everything up front; no executor call happens here.
    fn new(
        model: &'m dyn SequenceModel,
        batch: &[Vec<u32>],
        config: &GenerationConfig,
    ) -> GenerationResult<Self> {
        config.validate(model)?;
        config.validate_batch(batch)?;

        let vocab = model.vocab_size();
        if let Some(idx) = batch.iter().position(|seq| seq.iter().any(|&t| t as usize >= vocab)) {
            return Err(GenerationError::invalid_config(format!(
                "input sequence {} contains a token id outside the vocabulary of {}",
                idx, vocab
            )));
        }

        let limit = model.max_position_embeddings();
        let max_text_length = config.max_text_length.unwrap_or(limit).min(limit);
        let criteria = StoppingCriteria::new(
            config.stop_token(model),
            config.max_new_tokens,
            Some(max_text_length),
        );

        let mut sequences: Vec<Sequence> = batch
            .iter()
            .enumerate()
            .map(|(index, tokens)| {
                let prefix = if model.architecture().is_encoder_decoder() {
                    vec![model.decoder_start_token_id()]
                } else {
                    let len = config.max_input_length.map_or(tokens.len(), |m| tokens.len().min(m));
                    tokens[..len].to_vec()
                };
                Sequence::new(index, prefix)
            })
            .collect();

        for seq in sequences.iter_mut() {
            if let Some(reason) = criteria.evaluate_initial(seq.tokens.len()) {
                if reason == StopReason::MaxTextLength {
                    warn!(
                        "Sequence {} already fills the length limit ({}), nothing to generate.",
                        seq.index, max_text_length
                    );
                }
                seq.finish(reason);
            }
        }

        let chain = LogitsProcessorChain::from_config(config, config.eos_token(model));
        let sampler = Sampler::from_config(config);
        info!(
            "Starting generation: batch={}, max_new_tokens={}, sampler={}, cache={}",
            batch.len(),
            config.max_new_tokens,
            if sampler.is_greedy() { "greedy" } else { "multinomial" },
            config.use_cache
        );
        debug!("Logits processors: {:?}", chain.names());

        Ok(Self {
            model,
            sequences,
            cache: KvCacheManager::new(config.use_cache),
            sampler,
            chain,
            criteria,
            cached_mask: None,
            step: 0,
            pad_token_id: model.pad_token_id(),
            include_stop_token: config.include_stop_token,
            backend_time: Duration::ZERO,
            sampling_time: Duration::ZERO,
        })
    }

    fn is_finished(&self) -> bool {
        all_done(&self.sequences)
    }

    /// Builds the step input: the full padded prefix on an init step, the last
    /// token of every row on a cached step. Finished rows feed the pad token
    /// with a zero mask.
    fn build_input(&self) -> (Array2<u32>, Array2<u32>) {
        match (self.cache.mode(), &self.cached_mask) {
            (StepMode::Cached(_), Some(cached_mask)) => {
                let (ids, mask): (Vec<u32>, Vec<u32>) = self
                    .sequences
                    .iter()
                    .map(|seq| match (seq.is_done(), seq.last_token()) {
                        (false, Some(token)) => (token, 1),
                        _ => (self.pad_token_id, 0),
                    })
                    .unzip();
                let column = PaddedBatch::single_column(&ids, &mask);
                (column.input_ids, append_column(cached_mask, &mask))
            }
            _ => {
                let prefixes: Vec<&[u32]> =
                    self.sequences.iter().map(|s| s.tokens.as_slice()).collect();
                let padded = PaddedBatch::from_sequences(&prefixes, self.pad_token_id, None);
                (padded.input_ids, padded.attention_mask)
            }
        }
    }

    /// Runs one forward pass, processes the scores and appends a token to
    /// every unfinished row.
    async fn step(&mut self, encoder_context: Option<&EncoderContext>) -> GenerationResult<StepTokens> {
        let step = self.step;
        let batch_size = self.sequences.len();
        let vocab = self.model.vocab_size();

        let (input_ids, attention_mask) = self.build_input();
        let fed_len = input_ids.ncols();
        let cache = match self.cache.mode() {
            StepMode::Cached(pair) if self.cached_mask.is_some() => Some(pair),
            _ => None,
        };
        debug!(
            "step {}: feeding {} x {} tokens ({})",
            step,
            batch_size,
            fed_len,
            if cache.is_some() { "cached" } else { "init" }
        );

        let t_backend = Instant::now();
        let output = self
            .model
            .forward_step(StepInput {
                input_ids: &input_ids,
                attention_mask: &attention_mask,
                encoder_context,
                cache,
            })
            .await
            .map_err(|e| GenerationError::executor(Some(step), e))?;
        self.backend_time += t_backend.elapsed();

        let expected = vec![batch_size, fed_len, vocab];
        if output.logits.shape() != expected.as_slice() {
            // The returned cache is still handed back for release.
            self.cache.replace(output.cache, self.model);
            return Err(GenerationError::ShapeMismatch {
                step,
                expected,
                actual: output.logits.shape().to_vec(),
            });
        }

        let t_sampling = Instant::now();
        let total_len = attention_mask.ncols();
        let window = attention_mask.slice(s![.., total_len - fed_len..]);
        let raw_scores = next_token_logits(&output.logits, window);
        drop(output.logits);

        for (b, seq) in self.sequences.iter().enumerate() {
            if !seq.is_done() && raw_scores.row(b).iter().any(|s| s.is_nan()) {
                self.cache.replace(output.cache, self.model);
                return Err(GenerationError::NonFiniteLogits { step, batch_index: b });
            }
        }

        let history: Vec<Vec<u32>> = self.sequences.iter().map(|s| s.tokens.clone()).collect();
        let scores = self.chain.process(&history, &raw_scores, step);
        let active: Vec<bool> = self.sequences.iter().map(|s| !s.is_done()).collect();
        let tokens = self.sampler.sample(&scores, &active);

        let mut finished = Vec::with_capacity(batch_size);
        for (seq, token) in self.sequences.iter_mut().zip(&tokens) {
            match token {
                Some(token) if seq.push(*token, &self.criteria) => {
                    finished.push(seq.status.reason());
                }
                _ => finished.push(None),
            }
        }
        self.sampling_time += t_sampling.elapsed();

        self.cache.replace(output.cache, self.model);
        self.cached_mask = if self.cache.current().is_some() {
            Some(attention_mask)
        } else {
            None
        };

        debug!("step {}: sampled {:?}", step, tokens);
        self.step += 1;
        Ok(StepTokens {
            step,
            tokens,
            finished,
        })
    }

    /// Collects the per-row outputs and releases the cache.
    fn finish(&mut self) -> GenerationOutput {
        self.cache.release(self.model);
        let sequences = std::mem::take(&mut self.sequences);
        GenerationOutput {
            stop_reasons: sequences.iter().map(|s| s.status.reason()).collect(),
            sequences: sequences
                .into_iter()
                .map(|s| s.into_output(self.include_stop_token))
                .collect(),
            steps: self.step,
        }
    }

    fn log_performance(&self, total: Duration) {
        let steps = self.step as u32;
        if steps == 0 {
            info!("Generation complete without decoding steps in {:?}.", total);
            return;
        }
        let tokens_per_sec = steps as f64 / total.as_secs_f64().max(f64::EPSILON);

        info!("-------------------- Generation Performance --------------------");
        info!("Total Steps:  {}", steps);
        info!("Total Time:   {:.3}s", total.as_secs_f64());
        info!("Steps/s:      {:.2}", tokens_per_sec);
        info!("----------------------------------------------------------------");
        info!("Avg. Time per Step Breakdown:");
        info!("  - Total:    {:?}", total / steps);
        info!("  - Sampling: {:?}", self.sampling_time / steps);
        info!("  - Backend:  {:?}", self.backend_time / steps);
        info!("Cache pairs released: {}", self.cache.released());
        info!("----------------------------------------------------------------");
    }
}

impl Drop for DecodingState<'_> {
    fn drop(&mut self) {
        self.cache.release(self.model);
    }
}
