//! Buffers decoder steps into timestamp-delimited chunks.

use crate::alignment::confidence::argmax;
use crate::config::AlignerConfig;
use crate::error::AlignmentError;
use crate::pipeline::traits::SpecialTokens;
use crate::types::{DecodeStep, FeatureWindow, StepAttention};

/// Everything one decoding window has produced so far.
#[derive(Debug, Clone, Default)]
pub(crate) struct WindowBuffer {
    /// Input of the step that opened the window.
    pub prompt: Vec<u32>,
    /// Sampled tokens fed back to the decoder, in order.
    pub tokens: Vec<u32>,
    /// Next-token log-probabilities of every step, prompt step included.
    pub logprobs: Vec<Vec<f32>>,
    pub no_speech_prob: Option<f64>,
    pub features: Option<FeatureWindow>,
}

impl WindowBuffer {
    pub(crate) fn reached_decoding_limit(&self, max_sample_len: usize, n_text_ctx: usize) -> bool {
        let sampled = self.tokens.len() + 1;
        sampled >= max_sample_len || sampled + self.prompt.len() > n_text_ctx
    }

    /// Token a greedy decoder would have sampled after the last step.
    pub(crate) fn greedy_next(&self) -> Result<u32, AlignmentError> {
        self.logprobs
            .last()
            .and_then(|row| argmax(row))
            .map(|i| i as u32)
            .ok_or_else(|| {
                AlignmentError::inconsistency(
                    "token logprobs",
                    "no step distribution to recover the last token from",
                )
            })
    }
}

/// A chunk cut from the token stream, ready for alignment.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ChunkReady {
    /// Tokens to align. The closing timestamp may have been re-predicted.
    pub tokens: Vec<u32>,
    /// Tokens as the decoder produced them, plus any recovered last token.
    pub decoded: Vec<u32>,
    /// Index of the chunk's first token among the window's sampled tokens.
    pub offset: usize,
    /// The chunk was cut by the decoding limit instead of a closing timestamp.
    pub unfinished: bool,
    /// Last token recovered after the decoding limit, if any.
    pub fallback: Option<u32>,
    pub last_token_reliable: bool,
}

/// Token Accumulator.
///
/// `chunk[0]` is the token carried over from the previous chunk (or the last
/// prompt token); every token fed since follows. `attention[k]` belongs to the
/// step fed with `chunk[k]`, so it predicted `chunk[k + 1]`.
pub(crate) struct TokenAccumulator {
    special: SpecialTokens,
    trusted: bool,
    max_sample_len: usize,
    n_text_ctx: usize,
    chunk: Vec<u32>,
    attention: Vec<StepAttention>,
    saw_consecutive: bool,
    window: Option<WindowBuffer>,
}

impl TokenAccumulator {
    pub(crate) fn new(special: SpecialTokens, config: &AlignerConfig) -> Self {
        Self {
            special,
            trusted: config.is_trusted(),
            max_sample_len: config.dims.max_sample_len(),
            n_text_ctx: config.dims.n_text_ctx,
            chunk: Vec::new(),
            attention: Vec::new(),
            saw_consecutive: false,
            window: None,
        }
    }

    /// A full prompt, or a lone start-of-transcript token, opens a window.
    /// The end of the stream (`None`) closes the last one the same way.
    pub(crate) fn is_window_start(&self, input: Option<&[u32]>) -> bool {
        match input {
            None => true,
            Some(input) => input.len() > 1 || input.first() == Some(&self.special.sot),
        }
    }

    pub(crate) fn started(&self) -> bool {
        self.window.is_some()
    }

    pub(crate) fn window(&self) -> Option<&WindowBuffer> {
        self.window.as_ref()
    }

    pub(crate) fn take_window(&mut self) -> Option<WindowBuffer> {
        self.window.take()
    }

    pub(crate) fn chunk_attention(&self) -> &[StepAttention] {
        &self.attention
    }

    pub(crate) fn reached_decoding_limit(&self, window: &WindowBuffer) -> bool {
        window.reached_decoding_limit(self.max_sample_len, self.n_text_ctx)
    }

    /// Whether the tokens collected so far close a chunk, given the next input.
    ///
    /// At a window start, a trusted run drops a residual that cannot be
    /// flushed: the decoder re-decodes it from the next window.
    pub(crate) fn must_flush(&mut self, input: Option<&[u32]>) -> bool {
        let ends_with_timestamp = self
            .chunk
            .last()
            .is_some_and(|&t| self.special.is_timestamp(t));
        match input {
            Some(input) if !self.is_window_start(Some(input)) => {
                let is_timestamp = input.first().is_some_and(|&t| self.special.is_timestamp(t));
                let consecutive = is_timestamp && ends_with_timestamp;
                if consecutive {
                    self.saw_consecutive = true;
                }
                let sampled = self.window.as_ref().map_or(0, |w| w.tokens.len());
                consecutive || (is_timestamp && sampled + 2 == self.max_sample_len)
            }
            _ => {
                let flush = (self.chunk.len() > 1 && !self.saw_consecutive)
                    || (self.chunk.len() > 2 && ends_with_timestamp);
                if !flush && self.trusted && !self.chunk.is_empty() {
                    tracing::debug!(
                        tokens = self.chunk.len(),
                        "accumulator: dropping unterminated end of window"
                    );
                    self.chunk.clear();
                    self.attention.clear();
                }
                self.saw_consecutive = false;
                flush
            }
        }
    }

    /// Cut the current chunk for alignment without consuming it.
    ///
    /// A chunk that does not end with a timestamp was stopped by the decoding
    /// limit: its last token is recovered from `next_prompt` when that prompt
    /// repeats the previous text, otherwise from the last step's arg-max,
    /// which is only trustworthy for greedy decoding.
    pub(crate) fn take_chunk(
        &self,
        next_prompt: Option<&[u32]>,
        temperature: f64,
    ) -> Result<Option<ChunkReady>, AlignmentError> {
        if self.chunk.is_empty() {
            return Ok(None);
        }
        let window = self.window.as_ref().ok_or_else(|| {
            AlignmentError::inconsistency("token stream", "tokens collected outside a decoding window")
        })?;
        let offset = (window.tokens.len() + 1)
            .checked_sub(self.chunk.len())
            .ok_or_else(|| {
                AlignmentError::inconsistency(
                    "token stream",
                    format!(
                        "chunk of {} tokens in a window of {} sampled tokens",
                        self.chunk.len(),
                        window.tokens.len()
                    ),
                )
            })?;

        let mut tokens = self.chunk[1..].to_vec();
        let unfinished = tokens.last().is_some_and(|&t| !self.special.is_timestamp(t));
        let mut fallback = None;
        let mut last_token_reliable = true;
        if unfinished {
            let token = match next_prompt {
                Some(prompt) if prompt.first() == Some(&self.special.sot_prev) => {
                    self.token_before_sot(prompt)?
                }
                _ => {
                    last_token_reliable = temperature == 0.0;
                    window.greedy_next()?
                }
            };
            tracing::warn!(
                tokens = tokens.len(),
                fallback = token,
                reliable = last_token_reliable,
                "accumulator: decoding hit the token limit, recovered the last token"
            );
            tokens.push(token);
            fallback = Some(token);
        }
        let decoded = tokens.clone();

        if !unfinished && tokens.len() > 1 {
            let (start, end) = (tokens[0], tokens[tokens.len() - 1]);
            if self.special.is_timestamp(start) && end <= start {
                let repredicted = self.repredict_end(window, start)?;
                tracing::warn!(
                    start,
                    end,
                    repredicted,
                    "accumulator: end timestamp before start, predicted it again"
                );
                let last = tokens.len() - 1;
                tokens[last] = repredicted;
            }
        }

        Ok(Some(ChunkReady {
            tokens,
            decoded,
            offset,
            unfinished,
            fallback,
            last_token_reliable,
        }))
    }

    /// Prompts repeating previous text end with `… last <|startoftranscript|> …`.
    fn token_before_sot(&self, prompt: &[u32]) -> Result<u32, AlignmentError> {
        match prompt.iter().position(|&t| t == self.special.sot) {
            Some(i) if i > 1 => Ok(prompt[i - 1]),
            _ => Err(AlignmentError::inconsistency(
                "window prompt",
                format!("previous-text prompt without text before start of transcript: {prompt:?}"),
            )),
        }
    }

    /// Best timestamp after `start` at the step that produced the chunk's end.
    fn repredict_end(&self, window: &WindowBuffer, start: u32) -> Result<u32, AlignmentError> {
        let from = start as usize + 1;
        window
            .logprobs
            .len()
            .checked_sub(2)
            .and_then(|i| window.logprobs.get(i))
            .and_then(|row| row.get(from..))
            .and_then(argmax)
            .map(|i| (from + i) as u32)
            .ok_or_else(|| {
                AlignmentError::inconsistency(
                    "token logprobs",
                    format!("no distribution to predict an end timestamp after {start}"),
                )
            })
    }

    /// Start the next chunk, carrying the closing timestamp over when the
    /// stream continues in the same window.
    pub(crate) fn commit(&mut self, keep_last: bool) {
        let carried = match (keep_last, self.chunk.last().copied(), self.attention.pop()) {
            (true, Some(token), Some(row)) => Some((token, row)),
            _ => None,
        };
        self.chunk.clear();
        self.attention.clear();
        if let Some((token, row)) = carried {
            self.chunk.push(token);
            self.attention.push(row);
        }
    }

    pub(crate) fn discard_chunk(&mut self) {
        self.chunk.clear();
        self.attention.clear();
    }

    /// Record one forward pass. Steps before the first window are ignored.
    pub(crate) fn push_step(
        &mut self,
        step: DecodeStep,
        logprobs: Vec<f32>,
    ) -> Result<(), AlignmentError> {
        step.attention.check_shape()?;
        let Some(&token) = step.input_tokens.last() else {
            return Err(AlignmentError::inconsistency(
                "decode step",
                "forward pass without input tokens",
            ));
        };
        if self.is_window_start(Some(&step.input_tokens)) {
            self.window = Some(WindowBuffer {
                prompt: step.input_tokens,
                tokens: Vec::new(),
                logprobs: vec![logprobs],
                no_speech_prob: step.no_speech_prob,
                features: step.features,
            });
        } else {
            let Some(window) = self.window.as_mut() else {
                return Ok(());
            };
            window.tokens.push(token);
            window.logprobs.push(logprobs);
        }
        self.chunk.push(token);
        self.attention.push(step.attention);
        Ok(())
    }
}
