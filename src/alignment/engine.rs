use std::collections::BTreeMap;

use super::attention::{attention_cost_matrix, AttentionMatrix, AttentionParams};
use super::confidence::round_to;
use super::disfluency::{self, DisfluencyScan};
use super::dtw::StepPattern;
use super::padding::find_start_padding;
use super::words::{TokenGroup, PUNCTUATION};
use super::AlignedWord;
use crate::config::{AlignerConfig, PunctuationTiming, AUDIO_TIME_PER_FRAME};
use crate::error::AlignmentError;
use crate::pipeline::traits::{SequenceAligner, SplitOptions, Vocabulary, WordSplitter};
use crate::types::{FeatureWindow, StepAttention};

/// Cost given to cells the path should avoid. Real costs are negative.
const WORST_COST: f64 = 0.0;

/// Collaborators and settings shared by every chunk of a run.
pub(crate) struct ChunkContext<'a> {
    pub config: &'a AlignerConfig,
    pub vocab: &'a dyn Vocabulary,
    pub splitter: &'a dyn WordSplitter,
    pub aligner: &'a dyn SequenceAligner,
    pub language: Option<&'a str>,
    pub features: Option<&'a FeatureWindow>,
}

struct TimedEntry {
    group: Option<TokenGroup>,
    begin: usize,
    end: usize,
}

/// Place the words of one chunk in time.
///
/// `tokens` starts with the chunk's opening timestamp and normally ends with
/// its closing one; `attention[k]` is the step that predicted `tokens[k]`.
/// The bounding timestamps are dropped from the result, and so is the last
/// word unless `unfinished` says the chunk was cut before its closing
/// timestamp.
pub(crate) fn align_chunk(
    ctx: &ChunkContext<'_>,
    tokens: &[u32],
    attention: &[&StepAttention],
    unfinished: bool,
) -> Result<Vec<AlignedWord>, AlignmentError> {
    if attention.len() != tokens.len() {
        return Err(AlignmentError::inconsistency(
            "attention shape",
            format!(
                "{} attention rows for {} chunk tokens",
                attention.len(),
                tokens.len()
            ),
        ));
    }
    if tokens.len() <= 1 {
        tracing::debug!(tokens = tokens.len(), "alignment: chunk too short, no words");
        return Ok(Vec::new());
    }

    let special = ctx.vocab.special_tokens();
    let frame_limit = ctx.config.dims.n_audio_ctx.min(attention[0].frames);
    let refine = ctx.config.refine_frames();

    let Some(first) = special.timestamp_frame(tokens[0]) else {
        return Err(AlignmentError::inconsistency(
            "chunk window",
            format!(
                "missing start timestamp in {:?}",
                ctx.vocab.decode_with_timestamps(tokens)
            ),
        ));
    };
    let last = tokens
        .last()
        .and_then(|&t| special.timestamp_frame(t))
        .unwrap_or(frame_limit);
    if last <= first {
        tracing::debug!(first, last, "alignment: chunk window is empty, no words");
        return Ok(Vec::new());
    }

    let (start, end) = if refine > 0 {
        (first.saturating_sub(refine), (last + refine).min(frame_limit))
    } else {
        (first, last)
    };
    if end <= start {
        return Err(AlignmentError::inconsistency(
            "chunk window",
            format!(
                "non-positive window [{start}, {end}) for {:?}",
                ctx.vocab.decode_with_timestamps(tokens)
            ),
        ));
    }

    let num_frames = end - start;
    let mut tokens = tokens.to_vec();
    let mut rows: Vec<&StepAttention> = attention.to_vec();
    let mut unfinished = unfinished;
    while tokens.len() > num_frames {
        tracing::warn!(
            tokens = tokens.len(),
            frames = num_frames,
            text = %ctx.vocab.decode_with_timestamps(&tokens),
            "alignment: more tokens than frames, dropping the end of the chunk"
        );
        let keep = num_frames.saturating_sub(1);
        let (last_token, last_row) = (tokens[tokens.len() - 1], rows[rows.len() - 1]);
        tokens.truncate(keep);
        tokens.push(last_token);
        rows.truncate(keep);
        rows.push(last_row);
        unfinished = true;
    }
    if tokens.len() <= 1 {
        return Ok(Vec::new());
    }

    let options = SplitOptions {
        language: ctx.language,
        remove_punctuation: ctx.config.remove_punctuation_from_words,
    };
    let groups = ctx.splitter.split(&tokens, ctx.vocab, &options);
    let grouped: usize = groups.iter().map(TokenGroup::token_count).sum();
    if grouped != tokens.len() {
        return Err(AlignmentError::inconsistency(
            "word split",
            format!("words cover {grouped} of {} tokens", tokens.len()),
        ));
    }

    let params = AttentionParams {
        head_selection: &ctx.config.head_selection,
        medfilt_width: ctx.config.medfilt_width,
        qk_scale: ctx.config.qk_scale,
    };
    let mut cost = attention_cost_matrix(&rows, start, end, &params)?;
    if let Some(features) = ctx.features {
        suppress_padding(&mut cost, features, start);
    }
    encourage_early_start(&mut cost, refine);

    let pattern = if ctx.config.subwords_can_be_empty {
        StepPattern::Symmetric1
    } else {
        StepPattern::NoSharedFrames
    };
    let path = ctx.aligner.align_path(&cost, pattern)?;
    let boundaries = path.token_boundaries();
    if boundaries.len() != tokens.len() + 1 {
        return Err(AlignmentError::inconsistency(
            "alignment path",
            format!(
                "path gives {} boundaries for {} tokens",
                boundaries.len(),
                tokens.len()
            ),
        ));
    }

    let scan = if ctx.config.detect_disfluencies {
        disfluency::scan(&cost, &boundaries, &tokens, ctx.vocab)
    } else {
        DisfluencyScan {
            starts: boundaries.clone(),
            markers: BTreeMap::new(),
        }
    };

    let mut entries = timed_entries(groups, &scan, &boundaries, ctx.config.punctuation_timing);

    if refine == 0 && entries.len() >= 2 {
        entries[1].begin = entries[0].begin;
        let n = entries.len();
        entries[n - 2].end = entries[n - 1].end;
    }

    let keep = if unfinished {
        entries.len()
    } else {
        entries.len().saturating_sub(1)
    };
    let start_time = start as f64 * AUDIO_TIME_PER_FRAME;
    let words: Vec<AlignedWord> = entries
        .into_iter()
        .take(keep)
        .skip(1)
        .filter_map(|entry| {
            let begin = round_to(entry.begin as f64 * AUDIO_TIME_PER_FRAME + start_time, 2);
            let end = round_to(entry.end as f64 * AUDIO_TIME_PER_FRAME + start_time, 2);
            match entry.group {
                None => Some(AlignedWord::disfluency(begin, end)),
                Some(group) if group.text.starts_with("<|") => None,
                Some(group) => Some(AlignedWord {
                    raw_text: group.raw_text(),
                    tokens: group.tokens(),
                    text: group.text,
                    start: begin,
                    end,
                    confidence: None,
                    is_disfluency: false,
                    logprob_reliable: true,
                }),
            }
        })
        .collect();

    tracing::debug!(
        tokens = tokens.len(),
        start_frame = start,
        end_frame = end,
        words = words.len(),
        unfinished,
        "alignment: chunk aligned"
    );
    Ok(words)
}

/// Frame span of every word, with disfluency markers inserted before the
/// words they precede.
fn timed_entries(
    groups: Vec<TokenGroup>,
    scan: &DisfluencyScan,
    boundaries: &[usize],
    timing: PunctuationTiming,
) -> Vec<TimedEntry> {
    let n_groups = groups.len();
    let mut entries = Vec::with_capacity(n_groups + scan.markers.len());
    let mut cursor = 0usize;
    for (i_word, group) in groups.into_iter().enumerate() {
        let count = group.token_count();
        if i_word > 0 && i_word + 1 < n_groups {
            if let Some(&(begin, end)) = scan.markers.get(&cursor) {
                entries.push(TimedEntry {
                    group: None,
                    begin,
                    end,
                });
            }
        }
        let trailing = match timing {
            PunctuationTiming::Attached if i_word + 2 < n_groups => 0,
            _ => trailing_punctuation_tokens(&group),
        };
        entries.push(TimedEntry {
            begin: scan.starts[cursor],
            end: boundaries[cursor + count - trailing],
            group: Some(group),
        });
        cursor += count;
    }
    entries
}

/// Tokens of a final punctuation piece, when the word has more than one piece.
fn trailing_punctuation_tokens(group: &TokenGroup) -> usize {
    match group.pieces.as_slice() {
        [_, .., last] if PUNCTUATION.contains(last.text.as_str()) => last.tokens.len(),
        _ => 0,
    }
}

/// Make every token but the last avoid frames past the feature padding.
fn suppress_padding(cost: &mut AttentionMatrix, features: &FeatureWindow, start: usize) {
    let Some(limit) = find_start_padding(features).map(|mel_frame| mel_frame / 2) else {
        return;
    };
    if limit == 0 {
        return;
    }
    if start >= limit {
        tracing::warn!(start, limit, "alignment: chunk starts inside feature padding");
        return;
    }
    let from = limit - start;
    for t in 0..cost.rows().saturating_sub(1) {
        for f in from..cost.cols() {
            cost.set(t, f, WORST_COST);
        }
    }
}

/// Pin the first token to the first frame and forbid it from starting late.
fn encourage_early_start(cost: &mut AttentionMatrix, refine: usize) {
    if cost.rows() == 0 || cost.cols() == 0 {
        return;
    }
    let min = cost.min_value();
    cost.set(0, 0, min);
    for f in (2 * refine).min(cost.cols())..cost.cols() {
        cost.set(0, f, WORST_COST);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecoderDims;
    use crate::pipeline::defaults::{DtwSequenceAligner, LanguageWordSplitter};
    use crate::test_support::{vocabulary, TS_BEGIN};

    const FRAMES: usize = 150;

    fn config(refine: f64) -> AlignerConfig {
        AlignerConfig {
            refine_whisper_precision: refine,
            dims: DecoderDims {
                n_text_ctx: 448,
                n_audio_ctx: FRAMES,
                sample_len: None,
            },
            ..AlignerConfig::default()
        }
    }

    fn bump_row(ranges: &[std::ops::Range<usize>]) -> StepAttention {
        let weights = (0..FRAMES)
            .map(|f| if ranges.iter().any(|r| r.contains(&f)) { 1.0 } else { 0.0 })
            .collect();
        StepAttention::new(1, 1, FRAMES, weights).expect("shape")
    }

    fn levels_row(levels: &[(std::ops::Range<usize>, f32)]) -> StepAttention {
        let weights = (0..FRAMES)
            .map(|f| {
                levels
                    .iter()
                    .find(|(r, _)| r.contains(&f))
                    .map_or(0.0, |(_, v)| *v)
            })
            .collect();
        StepAttention::new(1, 1, FRAMES, weights).expect("shape")
    }

    fn uniform_row() -> StepAttention {
        StepAttention::new(1, 1, FRAMES, vec![1.0 / FRAMES as f32; FRAMES]).expect("shape")
    }

    fn align(
        config: &AlignerConfig,
        pieces: &[&str],
        tokens: &[u32],
        attention: &[StepAttention],
        unfinished: bool,
    ) -> Result<Vec<AlignedWord>, AlignmentError> {
        let vocab = vocabulary(pieces);
        let ctx = ChunkContext {
            config,
            vocab: &vocab,
            splitter: &LanguageWordSplitter,
            aligner: &DtwSequenceAligner,
            language: Some("en"),
            features: None,
        };
        let rows: Vec<&StepAttention> = attention.iter().collect();
        align_chunk(&ctx, tokens, &rows, unfinished)
    }

    #[test]
    fn uniform_attention_spans_the_whole_window() {
        let config = config(0.0);
        let tokens = [TS_BEGIN, 0, 1, TS_BEGIN + 50];
        let rows = vec![uniform_row(); 4];
        let words = align(&config, &[" hel", "lo"], &tokens, &rows, false).expect("aligned");
        assert_eq!(words.len(), 1);
        assert_eq!(words[0].text, "hello");
        assert_eq!(words[0].tokens, vec![0, 1]);
        assert_eq!(words[0].start, 0.0);
        assert_eq!(words[0].end, 1.0);
    }

    #[test]
    fn single_token_chunk_has_no_words() {
        let config = config(0.5);
        let words = align(&config, &[], &[TS_BEGIN], &[uniform_row()], false).expect("degenerate");
        assert!(words.is_empty());
    }

    #[test]
    fn reversed_timestamps_give_no_words() {
        let config = config(0.5);
        let tokens = [TS_BEGIN + 40, 0, TS_BEGIN + 40];
        let rows = vec![uniform_row(); 3];
        let words = align(&config, &[" a"], &tokens, &rows, false).expect("degenerate");
        assert!(words.is_empty());
    }

    #[test]
    fn missing_start_timestamp_is_fatal() {
        let config = config(0.5);
        let rows = vec![uniform_row(); 2];
        let err = align(&config, &[" a"], &[0, TS_BEGIN + 10], &rows, false).unwrap_err();
        assert!(err.is_inconsistency());
    }

    #[test]
    fn attention_row_count_must_match_tokens() {
        let config = config(0.5);
        let rows = vec![uniform_row(); 2];
        let err = align(&config, &[" a"], &[TS_BEGIN, 0, TS_BEGIN + 10], &rows, false).unwrap_err();
        assert!(err.is_inconsistency());
    }

    #[test]
    fn window_past_the_audio_context_is_fatal() {
        let config = config(0.5);
        let tokens = [TS_BEGIN + 200, 0, TS_BEGIN + 220];
        let rows = vec![uniform_row(); 3];
        let err = align(&config, &[" a"], &tokens, &rows, false).unwrap_err();
        assert!(err.is_inconsistency());
    }

    #[test]
    fn peaked_attention_orders_words() {
        let config = config(0.1);
        let tokens = [TS_BEGIN + 10, 0, 1, TS_BEGIN + 60];
        let rows = vec![
            bump_row(&[6..14]),
            bump_row(&[12..26]),
            bump_row(&[30..56]),
            bump_row(&[56..64]),
        ];
        let words = align(&config, &[" one", " two"], &tokens, &rows, false).expect("aligned");
        let texts: Vec<&str> = words.iter().map(|w| w.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two"]);
        assert!(words[0].start >= 0.1);
        assert!(words[0].start < words[1].start);
        assert!(words[0].end <= words[1].start);
        assert!(words[1].end <= 1.3);
        assert!(words.iter().all(|w| w.start <= w.end));
    }

    #[test]
    fn too_many_tokens_truncates_and_keeps_last_word() {
        let config = config(0.0);
        let tokens = [TS_BEGIN, 0, 1, 2, 3, TS_BEGIN + 3];
        let rows = vec![uniform_row(); 6];
        let words = align(&config, &[" a", " b", " c", " d"], &tokens, &rows, false).expect("aligned");
        let texts: Vec<&str> = words.iter().map(|w| w.text.as_str()).collect();
        assert_eq!(texts, vec!["a"]);
    }

    #[test]
    fn unfinished_chunk_keeps_its_last_word() {
        let config = config(0.0);
        let tokens = [TS_BEGIN, 0, 1];
        let rows = vec![uniform_row(); 3];
        let words = align(&config, &[" a", " b"], &tokens, &rows, true).expect("aligned");
        let texts: Vec<&str> = words.iter().map(|w| w.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b"]);
        assert_eq!(words[1].end, 3.0);
    }

    #[test]
    fn two_attention_bumps_insert_a_disfluency_marker() {
        let config = AlignerConfig {
            detect_disfluencies: true,
            ..config(0.0)
        };
        let tokens = [TS_BEGIN, 0, 1, TS_BEGIN + 100];
        let rows = vec![
            bump_row(&[0..6]),
            bump_row(&[5..16]),
            levels_row(&[
                (20..30, 0.5),
                (30..41, 1.0),
                (41..60, 0.5),
                (60..76, 1.0),
                (76..85, 0.5),
            ]),
            bump_row(&[90..100]),
        ];
        let words = align(&config, &[" I", " went"], &tokens, &rows, false).expect("aligned");
        let texts: Vec<&str> = words.iter().map(|w| w.text.as_str()).collect();
        assert_eq!(texts, vec!["I", "[*]", "went"]);
        let (i, marker, went) = (&words[0], &words[1], &words[2]);
        assert!(marker.is_disfluency);
        assert!(marker.tokens.is_empty());
        assert_eq!(i.end, marker.start);
        assert_eq!(marker.end, went.start);
        assert!(marker.start <= 0.6);
        assert!(went.start >= 1.18 && went.start <= 1.2);
        assert_eq!(went.end, 2.0);
    }

    #[test]
    fn separate_punctuation_timing_ends_word_before_punctuation() {
        let groups = vec![
            TokenGroup {
                text: "<|0.00|>".into(),
                pieces: vec![piece("<|0.00|>", &[TS_BEGIN])],
            },
            TokenGroup {
                text: "yes,".into(),
                pieces: vec![piece(" yes", &[0]), piece(",", &[1])],
            },
            TokenGroup {
                text: "no".into(),
                pieces: vec![piece(" no", &[2])],
            },
            TokenGroup {
                text: "<|1.00|>".into(),
                pieces: vec![piece("<|1.00|>", &[TS_BEGIN + 50])],
            },
        ];
        let boundaries = vec![0, 5, 20, 25, 40, 50];
        let scan = DisfluencyScan {
            starts: boundaries.clone(),
            markers: BTreeMap::new(),
        };
        let separate = timed_entries(groups.clone(), &scan, &boundaries, PunctuationTiming::Separate);
        assert_eq!((separate[1].begin, separate[1].end), (5, 20));
        let attached = timed_entries(groups, &scan, &boundaries, PunctuationTiming::Attached);
        assert_eq!((attached[1].begin, attached[1].end), (5, 25));
    }

    fn piece(text: &str, tokens: &[u32]) -> crate::alignment::words::TokenPiece {
        crate::alignment::words::TokenPiece {
            text: text.to_string(),
            tokens: tokens.to_vec(),
        }
    }

    #[test]
    fn padding_is_suppressed_for_all_but_the_last_token() {
        let mut cost = AttentionMatrix::from_rows(&[vec![-0.5; 10], vec![-0.5; 10], vec![-0.5; 10]])
            .expect("rectangular");
        // 30 mel frames of signal then zero padding: padding starts at encoder frame 15.
        let frames = 40;
        let values: Vec<f32> = (0..frames).map(|f| if f < 30 { 0.7 } else { 0.0 }).collect();
        let features = FeatureWindow {
            n_mels: 1,
            frames,
            values,
        };
        suppress_padding(&mut cost, &features, 10);
        assert_eq!(cost.get(0, 4), -0.5);
        assert_eq!(cost.get(0, 5), WORST_COST);
        assert_eq!(cost.get(1, 9), WORST_COST);
        assert_eq!(cost.get(2, 9), -0.5);
    }

    #[test]
    fn early_start_pins_first_token() {
        let mut cost = AttentionMatrix::from_rows(&[vec![-0.2, -0.3, -0.4, -0.1], vec![-0.9, -0.1, -0.1, -0.1]])
            .expect("rectangular");
        encourage_early_start(&mut cost, 1);
        assert_eq!(cost.get(0, 0), -0.9);
        assert_eq!(cost.get(0, 1), -0.3);
        assert_eq!(cost.get(0, 2), WORST_COST);
        assert_eq!(cost.get(0, 3), WORST_COST);
    }
}
