use crate::alignment::confidence::score_words;
use crate::alignment::AlignedWord;
use crate::alignment::repair::{ensure_increasing_positions, remove_trailing_null_words, PlacedWord};
use crate::config::{AlignerConfig, MEL_FRAME_SECONDS};
use crate::error::AlignmentError;
use crate::pipeline::session::{PendingSegment, SessionOutput, StreamingAligner};
use crate::pipeline::traits::{SequenceAligner, SpeechDecoder, Vocabulary, WordSplitter};
use crate::types::{DecodedSegment, Segment, TimestampedTranscript, Transcription};

/// Recomputed and reported average log-probabilities may differ by this much.
const AVG_LOGPROB_TOLERANCE: f64 = 1e-2;

pub struct TimestampedTranscriber {
    config: AlignerConfig,
    vocab: Box<dyn Vocabulary>,
    word_splitter: Box<dyn WordSplitter>,
    sequence_aligner: Box<dyn SequenceAligner>,
}

pub(crate) struct TimestampedTranscriberParts {
    pub config: AlignerConfig,
    pub vocab: Box<dyn Vocabulary>,
    pub word_splitter: Box<dyn WordSplitter>,
    pub sequence_aligner: Box<dyn SequenceAligner>,
}

impl TimestampedTranscriber {
    pub(crate) fn from_parts(parts: TimestampedTranscriberParts) -> Self {
        Self {
            config: parts.config,
            vocab: parts.vocab,
            word_splitter: parts.word_splitter,
            sequence_aligner: parts.sequence_aligner,
        }
    }

    pub fn config(&self) -> &AlignerConfig {
        &self.config
    }

    /// Run `decoder` with the aligner attached and return its transcript with
    /// word timestamps.
    pub fn transcribe(
        &self,
        decoder: &mut dyn SpeechDecoder,
    ) -> Result<TimestampedTranscript, AlignmentError> {
        let mut session = StreamingAligner::new(
            &self.config,
            self.vocab.as_ref(),
            self.word_splitter.as_ref(),
            self.sequence_aligner.as_ref(),
        );
        let transcription = decoder.transcribe(&mut session)?;
        let output = session.finish()?;
        compile(&self.config, self.vocab.as_ref(), transcription, output)
    }
}

/// Match aligned segments with the decoder's own, then repair the timeline.
fn compile(
    config: &AlignerConfig,
    vocab: &dyn Vocabulary,
    transcription: Transcription,
    output: SessionOutput,
) -> Result<TimestampedTranscript, AlignmentError> {
    let language = transcription.language.or(output.language);
    let decoded = transcription.segments;
    let pending = output.segments;
    if decoded.is_empty() {
        tracing::debug!(aligned = pending.len(), "compile: decoder reported no segments");
        return Ok(TimestampedTranscript {
            text: String::new(),
            language,
            segments: Vec::new(),
        });
    }
    if decoded.len() != pending.len() {
        return Err(AlignmentError::inconsistency(
            "segment count",
            format!(
                "decoder returned {} segments, aligner kept {}",
                decoded.len(),
                pending.len()
            ),
        ));
    }

    let mut segments = Vec::with_capacity(decoded.len());
    let mut words: Vec<PlacedWord> = Vec::new();
    for (i, (decoded, pending)) in decoded.into_iter().zip(pending).enumerate() {
        let (segment, segment_words) = compile_segment(config, vocab, i, decoded, pending)?;
        segments.push(segment);
        words.extend(
            segment_words
                .into_iter()
                .map(|word| PlacedWord { segment: i, word }),
        );
    }

    remove_trailing_null_words(&mut segments, &mut words)?;
    ensure_increasing_positions(&mut words, config.min_word_duration)?;

    let refine = config.refine_whisper_precision > 0.0;
    for placed in words {
        let Some(segment) = segments.get_mut(placed.segment) else {
            return Err(AlignmentError::inconsistency(
                "word placement",
                format!("word refers to missing segment {}", placed.segment),
            ));
        };
        if refine {
            if segment.words.is_empty() {
                segment.start = placed.word.start;
            }
            segment.end = placed.word.end;
        }
        segment.words.push(placed.word.into_word());
    }
    ensure_increasing_positions(&mut segments, 0.0)?;

    for (id, segment) in segments.iter_mut().enumerate() {
        segment.id = id;
    }
    let text = segments.iter().map(|s| s.text.as_str()).collect();
    tracing::debug!(
        segments = segments.len(),
        words = segments.iter().map(|s| s.words.len()).sum::<usize>(),
        language = ?language,
        "compile: transcript ready"
    );
    Ok(TimestampedTranscript {
        text,
        language,
        segments,
    })
}

fn compile_segment(
    config: &AlignerConfig,
    vocab: &dyn Vocabulary,
    index: usize,
    decoded: DecodedSegment,
    pending: PendingSegment,
) -> Result<(Segment, Vec<AlignedWord>), AlignmentError> {
    let lowest = vocab.special_tokens().lowest_control();
    let PendingSegment {
        tokens,
        mut words,
        logprobs,
        avg_logprob,
        ..
    } = pending;

    let aligned = strip_control_tokens(&tokens, lowest);
    let expected = strip_control_tokens(&decoded.tokens, lowest);
    if aligned != expected {
        if aligned.len() == expected.len() + 1 {
            tracing::warn!(segment = index, "compile: an additional token was added to the segment");
        } else if aligned.len() < expected.len() && expected.starts_with(aligned) {
            tracing::warn!(
                segment = index,
                aligned = %vocab.decode_with_timestamps(aligned),
                decoded = %vocab.decode_with_timestamps(expected),
                "compile: segment text had to be shortened"
            );
        } else {
            return Err(AlignmentError::inconsistency(
                "segment tokens",
                format!(
                    "segment {index}: aligned {:?} != decoded {:?}",
                    vocab.decode_with_timestamps(aligned),
                    vocab.decode_with_timestamps(expected)
                ),
            ));
        }
        if let Some(word) = words.last_mut() {
            word.logprob_reliable = false;
        }
    }

    let offset = decoded.seek as f64 * MEL_FRAME_SECONDS;
    for word in &mut words {
        word.start += offset;
        word.end += offset;
    }

    let mut confidence = None;
    if config.compute_word_confidence {
        let reliable = words.last().map_or(true, |w| w.logprob_reliable);
        if let (true, Some(reported), Some(recomputed)) = (reliable, decoded.avg_logprob, avg_logprob) {
            if (reported - recomputed).abs() >= AVG_LOGPROB_TOLERANCE {
                tracing::warn!(
                    segment = index,
                    recomputed,
                    reported,
                    "compile: recomputed a different average logprob"
                );
            }
        }
        if let Some(logprobs) = &logprobs {
            confidence = score_words(
                &mut words,
                logprobs,
                config.include_punctuation_in_confidence,
                vocab,
            )?;
        }
    }

    let segment = Segment {
        id: index,
        seek: decoded.seek,
        start: decoded.start,
        end: decoded.end,
        text: decoded.text,
        tokens: decoded.tokens,
        avg_logprob: decoded.avg_logprob.or(avg_logprob),
        no_speech_prob: decoded.no_speech_prob,
        confidence,
        words: Vec::new(),
    };
    Ok((segment, words))
}

/// Strip control tokens (and timestamps) from both ends.
fn strip_control_tokens(tokens: &[u32], lowest: u32) -> &[u32] {
    let start = tokens.iter().position(|&t| t < lowest).unwrap_or(tokens.len());
    let end = tokens.iter().rposition(|&t| t < lowest).map_or(start, |i| i + 1);
    &tokens[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{vocabulary, EOT, TS_BEGIN};

    fn word(text: &str, tokens: &[u32], start: f64, end: f64) -> AlignedWord {
        AlignedWord {
            text: text.to_string(),
            raw_text: format!(" {text}"),
            tokens: tokens.to_vec(),
            start,
            end,
            confidence: None,
            is_disfluency: false,
            logprob_reliable: true,
        }
    }

    fn decoded(seek: usize, start: f64, end: f64, text: &str, tokens: &[u32]) -> DecodedSegment {
        DecodedSegment {
            seek,
            start,
            end,
            text: text.to_string(),
            tokens: tokens.to_vec(),
            avg_logprob: Some(-0.2),
            no_speech_prob: Some(0.05),
        }
    }

    fn pending(tokens: &[u32], words: Vec<AlignedWord>, logprobs: Vec<f64>) -> PendingSegment {
        PendingSegment {
            logprobs: Some(logprobs),
            avg_logprob: Some(-0.2),
            ..PendingSegment::new(tokens.to_vec(), 0, false, words)
        }
    }

    #[test]
    fn strips_control_tokens_at_both_ends() {
        assert_eq!(strip_control_tokens(&[TS_BEGIN, 0, 1, TS_BEGIN + 4, EOT], EOT), &[0, 1]);
        assert!(strip_control_tokens(&[TS_BEGIN, EOT], EOT).is_empty());
    }

    #[test]
    fn words_move_to_the_window_offset_and_get_confidence() {
        let vocab = vocabulary(&[" one", " two"]);
        let config = AlignerConfig::default();
        let transcription = Transcription {
            segments: vec![decoded(3000, 30.0, 31.0, " one two", &[TS_BEGIN, 0, 1, TS_BEGIN + 50])],
            language: Some("en".into()),
        };
        let output = SessionOutput {
            segments: vec![pending(
                &[TS_BEGIN, 0, 1, TS_BEGIN + 50],
                vec![word("one", &[0], 0.0, 0.4), word("two", &[1], 0.4, 1.0)],
                vec![-0.1, -0.3],
            )],
            language: None,
        };
        let transcript = compile(&config, &vocab, transcription, output).expect("compiled");
        assert_eq!(transcript.text, " one two");
        let segment = &transcript.segments[0];
        assert_eq!((segment.start, segment.end), (30.0, 31.0));
        assert_eq!(segment.words[0].start, 30.0);
        assert_eq!(segment.words[1].end, 31.0);
        assert_eq!(segment.words[0].confidence, Some(0.905));
        assert!(segment.confidence.is_some());
        assert_eq!(transcript.language.as_deref(), Some("en"));
    }

    #[test]
    fn segment_count_mismatch_is_fatal() {
        let vocab = vocabulary(&[" one"]);
        let transcription = Transcription {
            segments: vec![
                decoded(0, 0.0, 1.0, " one", &[TS_BEGIN, 0, TS_BEGIN + 50]),
                decoded(0, 1.0, 2.0, " one", &[TS_BEGIN + 50, 0, TS_BEGIN + 100]),
            ],
            language: None,
        };
        let output = SessionOutput {
            segments: vec![pending(&[TS_BEGIN, 0, TS_BEGIN + 50], vec![word("one", &[0], 0.0, 1.0)], vec![-0.1])],
            language: None,
        };
        let err = compile(&AlignerConfig::default(), &vocab, transcription, output).unwrap_err();
        assert!(err.is_inconsistency());
    }

    #[test]
    fn no_decoder_segments_give_an_empty_transcript() {
        let vocab = vocabulary(&[" one"]);
        let output = SessionOutput {
            segments: vec![pending(&[TS_BEGIN, 0, TS_BEGIN + 50], vec![word("one", &[0], 0.0, 1.0)], vec![-0.1])],
            language: Some("en".into()),
        };
        let transcript = compile(&AlignerConfig::default(), &vocab, Transcription::default(), output)
            .expect("compiled");
        assert!(transcript.segments.is_empty());
        assert_eq!(transcript.language.as_deref(), Some("en"));
    }

    #[test]
    fn extra_recovered_token_marks_last_word_unreliable() {
        let vocab = vocabulary(&[" one", " two"]);
        let transcription = Transcription {
            segments: vec![decoded(0, 0.0, 1.0, " one", &[TS_BEGIN, 0])],
            language: None,
        };
        let output = SessionOutput {
            segments: vec![PendingSegment {
                unfinished: true,
                ..pending(
                    &[TS_BEGIN, 0, 1],
                    vec![word("one", &[0], 0.0, 0.5), word("two", &[1], 0.5, 1.0)],
                    vec![-0.1, -0.2],
                )
            }],
            language: None,
        };
        let transcript = compile(&AlignerConfig::default(), &vocab, transcription, output).expect("compiled");
        let words = &transcript.segments[0].words;
        assert!(words[0].logprob_reliable);
        assert!(!words[1].logprob_reliable);
    }

    #[test]
    fn diverging_tokens_are_fatal() {
        let vocab = vocabulary(&[" one", " two"]);
        let transcription = Transcription {
            segments: vec![decoded(0, 0.0, 1.0, " two", &[TS_BEGIN, 1, TS_BEGIN + 50])],
            language: None,
        };
        let output = SessionOutput {
            segments: vec![pending(&[TS_BEGIN, 0, TS_BEGIN + 50], vec![word("one", &[0], 0.0, 1.0)], vec![-0.1])],
            language: None,
        };
        let err = compile(&AlignerConfig::default(), &vocab, transcription, output).unwrap_err();
        assert!(err.is_inconsistency());
    }

    #[test]
    fn overlapping_segments_are_repaired() {
        let vocab = vocabulary(&[" one", " two"]);
        let config = AlignerConfig::default();
        let transcription = Transcription {
            segments: vec![
                decoded(0, 0.0, 1.2, " one", &[TS_BEGIN, 0, TS_BEGIN + 60]),
                decoded(0, 1.0, 2.0, " two", &[TS_BEGIN + 50, 1, TS_BEGIN + 100]),
            ],
            language: None,
        };
        let output = SessionOutput {
            segments: vec![
                pending(&[TS_BEGIN, 0, TS_BEGIN + 60], vec![word("one", &[0], 0.0, 1.2)], vec![-0.1]),
                pending(&[TS_BEGIN + 50, 1, TS_BEGIN + 100], vec![word("two", &[1], 0.8, 2.0)], vec![-0.1]),
            ],
            language: None,
        };
        let transcript = compile(&config, &vocab, transcription, output).expect("compiled");
        let segments = &transcript.segments;
        assert_eq!(segments[1].id, 1);
        assert!(segments[0].end <= segments[1].start);
        assert!(segments.iter().all(|s| s.end > s.start));
        assert_eq!(segments[0].words[0].end, segments[1].words[0].start);
    }
}
