//! Streaming state machine fed by the decoder, one forward pass at a time.

use crate::alignment::confidence::{gather_token_logprobs, log_softmax};
use crate::alignment::engine::{align_chunk, ChunkContext};
use crate::alignment::AlignedWord;
use crate::config::AlignerConfig;
use crate::error::AlignmentError;
use crate::pipeline::accumulator::TokenAccumulator;
use crate::pipeline::filter::{retract, SegmentFilter};
use crate::pipeline::resegment::align_window;
use crate::pipeline::traits::{SequenceAligner, StepObserver, Vocabulary, WordSplitter};
use crate::types::{DecodeStep, FeatureWindow, StepAttention};

/// An aligned chunk waiting to be matched with the decoder's own segment.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PendingSegment {
    /// Decoded tokens, bounding timestamps included.
    pub tokens: Vec<u32>,
    /// Index of `tokens[0]` among the window's sampled tokens.
    pub offset: usize,
    pub unfinished: bool,
    pub words: Vec<AlignedWord>,
    /// Log-probabilities of the text tokens, in order.
    pub logprobs: Option<Vec<f64>>,
    /// Mean token log-probability of the whole window.
    pub avg_logprob: Option<f64>,
}

impl PendingSegment {
    pub(crate) fn new(tokens: Vec<u32>, offset: usize, unfinished: bool, words: Vec<AlignedWord>) -> Self {
        Self {
            tokens,
            offset,
            unfinished,
            words,
            logprobs: None,
            avg_logprob: None,
        }
    }
}

/// How the last chunk of a window ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct FlushOutcome {
    pub unfinished: bool,
    pub fallback: Option<u32>,
    pub last_token_reliable: bool,
}

impl FlushOutcome {
    pub(crate) fn finished() -> Self {
        Self {
            unfinished: false,
            fallback: None,
            last_token_reliable: true,
        }
    }
}

/// What a run leaves behind once the decoder is done.
pub(crate) struct SessionOutput {
    pub segments: Vec<PendingSegment>,
    pub language: Option<String>,
}

pub(crate) struct StreamingAligner<'a> {
    config: &'a AlignerConfig,
    vocab: &'a dyn Vocabulary,
    splitter: &'a dyn WordSplitter,
    aligner: &'a dyn SequenceAligner,
    filter: SegmentFilter,
    accumulator: TokenAccumulator,
    language: Option<String>,
    segments: Vec<PendingSegment>,
    /// First segment of the current decoding window.
    window_start: usize,
}

impl<'a> StreamingAligner<'a> {
    pub(crate) fn new(
        config: &'a AlignerConfig,
        vocab: &'a dyn Vocabulary,
        splitter: &'a dyn WordSplitter,
        aligner: &'a dyn SequenceAligner,
    ) -> Self {
        Self {
            config,
            vocab,
            splitter,
            aligner,
            filter: SegmentFilter::from_config(config),
            accumulator: TokenAccumulator::new(vocab.special_tokens(), config),
            language: config.language.clone(),
            segments: Vec::new(),
            window_start: 0,
        }
    }

    /// Close the last window and hand over everything that was kept.
    pub(crate) fn finish(mut self) -> Result<SessionOutput, AlignmentError> {
        self.may_flush(None)?;
        tracing::debug!(segments = self.segments.len(), "session: decoder finished");
        Ok(SessionOutput {
            segments: self.segments,
            language: self.language,
        })
    }

    fn context<'s>(&'s self, features: Option<&'s FeatureWindow>) -> ChunkContext<'s> {
        ChunkContext {
            config: self.config,
            vocab: self.vocab,
            splitter: self.splitter,
            aligner: self.aligner,
            language: self.language.as_deref(),
            features,
        }
    }

    /// The token before the task token of a window prompt names the language.
    fn detect_language(&mut self, prompt: &[u32]) {
        if prompt.len() < 2 {
            return;
        }
        let decoded = self.vocab.decode_with_timestamps(&prompt[prompt.len() - 2..prompt.len() - 1]);
        let language = decoded
            .strip_prefix("<|")
            .and_then(|rest| rest.strip_suffix("|>"))
            .filter(|code| !code.is_empty());
        if let Some(language) = language {
            tracing::debug!(language, "session: language taken from window prompt");
            self.language = Some(language.to_string());
        }
    }

    fn may_flush(&mut self, input: Option<&[u32]>) -> Result<(), AlignmentError> {
        let mut outcome = FlushOutcome::finished();
        if self.accumulator.must_flush(input) && self.config.is_trusted() {
            outcome = self.align_current(input)?;
        }
        if self.accumulator.is_window_start(input) && self.accumulator.started() {
            self.finalize_window(outcome)?;
        }
        Ok(())
    }

    /// Align the chunk that just closed and start the next one.
    fn align_current(&mut self, next_prompt: Option<&[u32]>) -> Result<FlushOutcome, AlignmentError> {
        let keep_last = !self.accumulator.is_window_start(next_prompt);
        let Some(ready) = self
            .accumulator
            .take_chunk(next_prompt, self.config.temperature)?
        else {
            return Ok(FlushOutcome::finished());
        };

        let rows: Vec<&StepAttention> = self
            .accumulator
            .chunk_attention()
            .iter()
            .take(ready.tokens.len())
            .collect();
        let features = self.accumulator.window().and_then(|w| w.features.as_ref());
        let ctx = self.context(features);
        let mut words = align_chunk(&ctx, &ready.tokens, &rows, ready.unfinished)?;

        if words.is_empty() {
            tracing::debug!(
                text = %self.vocab.decode_with_timestamps(&ready.decoded),
                "session: chunk produced no words"
            );
        } else {
            if ready.unfinished {
                if let Some(word) = words.last_mut() {
                    word.logprob_reliable = ready.last_token_reliable;
                }
            }
            tracing::debug!(
                segment = self.segments.len(),
                words = words.len(),
                "session: chunk aligned"
            );
            self.segments.push(PendingSegment::new(
                ready.decoded,
                ready.offset,
                ready.unfinished,
                words,
            ));
        }
        self.accumulator.commit(keep_last);

        Ok(FlushOutcome {
            unfinished: ready.unfinished,
            fallback: ready.fallback,
            last_token_reliable: ready.last_token_reliable,
        })
    }

    /// Every chunk of the window is known: drop it if it was silence,
    /// otherwise attribute token log-probabilities to its segments.
    fn finalize_window(&mut self, outcome: FlushOutcome) -> Result<(), AlignmentError> {
        let Some(window) = self.accumulator.take_window() else {
            return Ok(());
        };
        let i_start = self.window_start;
        let mut outcome = outcome;
        if !self.config.is_trusted() {
            let ctx = self.context(window.features.as_ref());
            let (segments, window_outcome) =
                align_window(&ctx, &window, self.accumulator.chunk_attention())?;
            self.segments.extend(segments);
            outcome = window_outcome;
            self.accumulator.discard_chunk();
        }

        let reached_limit = self.accumulator.reached_decoding_limit(&window);
        let gather = self.config.compute_word_confidence || self.filter.needs_logprobs(window.no_speech_prob);
        let mut scored = None;
        if gather {
            let last = if outcome.unfinished {
                outcome.fallback.ok_or_else(|| {
                    AlignmentError::inconsistency("token stream", "unfinished window without a recovered token")
                })?
            } else if reached_limit {
                let reliable = self.config.temperature == 0.0;
                if let Some(word) = self.segments[i_start..]
                    .last_mut()
                    .and_then(|s| s.words.last_mut())
                {
                    word.logprob_reliable = reliable;
                }
                window.greedy_next()?
            } else {
                self.vocab.special_tokens().eot
            };
            let mut chosen = window.tokens.clone();
            chosen.push(last);
            let logprobs = gather_token_logprobs(&window.logprobs, &chosen)?;
            let avg = window_avg_logprob(&logprobs, outcome.unfinished);
            scored = Some((chosen, logprobs, avg));
        }

        let avg_logprob = scored.as_ref().and_then(|(_, _, avg)| *avg);
        if self.filter.should_skip(window.no_speech_prob, avg_logprob) {
            let removed = retract(&mut self.segments, i_start);
            tracing::debug!(
                removed,
                no_speech_prob = ?window.no_speech_prob,
                avg_logprob = ?avg_logprob,
                "filter: skipping silent window"
            );
        } else if self.config.compute_word_confidence {
            if let Some((chosen, logprobs, avg)) = &scored {
                for segment in &mut self.segments[i_start..] {
                    attribute_logprobs(segment, chosen, logprobs, *avg, self.vocab)?;
                }
            }
        }

        tracing::debug!(
            first_segment = i_start,
            segments = self.segments.len() - i_start.min(self.segments.len()),
            sampled = window.tokens.len(),
            reached_limit,
            "session: window finalized"
        );
        self.window_start = self.segments.len();
        Ok(())
    }
}

impl StepObserver for StreamingAligner<'_> {
    fn on_step(&mut self, step: DecodeStep) -> Result<(), AlignmentError> {
        let opening = self.accumulator.is_window_start(Some(&step.input_tokens));
        if !opening && !self.accumulator.started() {
            return Ok(());
        }
        if opening && self.language.is_none() {
            self.detect_language(&step.input_tokens);
        }
        self.may_flush(Some(&step.input_tokens))?;
        let logprobs = log_softmax(&step.logits);
        self.accumulator.push_step(step, logprobs)
    }
}

/// Mean log-probability of a window's tokens. A window cut by the decoding
/// limit also counts its recovered token in the denominator.
fn window_avg_logprob(logprobs: &[f64], unfinished: bool) -> Option<f64> {
    if logprobs.is_empty() {
        return None;
    }
    let count = logprobs.len() + usize::from(unfinished);
    Some(logprobs.iter().sum::<f64>() / count as f64)
}

/// Give a segment the log-probabilities of its text tokens. Timestamps and
/// control tokens inside the segment are left out.
fn attribute_logprobs(
    segment: &mut PendingSegment,
    chosen: &[u32],
    logprobs: &[f64],
    avg_logprob: Option<f64>,
    vocab: &dyn Vocabulary,
) -> Result<(), AlignmentError> {
    let end = segment.offset + segment.tokens.len();
    let Some(window_tokens) = chosen.get(segment.offset..end) else {
        return Err(AlignmentError::inconsistency(
            "segment tokens",
            format!(
                "segment tokens {}..{end} outside {} window tokens",
                segment.offset,
                chosen.len()
            ),
        ));
    };
    if window_tokens != segment.tokens.as_slice() {
        return Err(AlignmentError::inconsistency(
            "segment tokens",
            format!(
                "{:?} != {:?}",
                vocab.decode_with_timestamps(window_tokens),
                vocab.decode_with_timestamps(&segment.tokens)
            ),
        ));
    }
    let from = segment.offset + 1;
    let to = if segment.unfinished { end } else { end - 1 }.max(from);
    let special = vocab.special_tokens();
    segment.logprobs = Some(
        (from..to)
            .filter(|&i| !special.is_special(chosen[i]))
            .map(|i| logprobs[i])
            .collect(),
    );
    segment.avg_logprob = avg_logprob;
    Ok(())
}
