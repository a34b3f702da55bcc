//! Whole-window alignment: one DTW pass per decoding window, then the words
//! are dealt back to the segments the decoder's timestamp pairs delimit.

use std::collections::VecDeque;

use crate::alignment::engine::{align_chunk, ChunkContext};
use crate::alignment::AlignedWord;
use crate::error::AlignmentError;
use crate::pipeline::accumulator::WindowBuffer;
use crate::pipeline::session::{FlushOutcome, PendingSegment};
use crate::types::StepAttention;

/// Align a whole window at once.
///
/// `attention[k]` is the step that predicted `window.tokens[k]`; the extra
/// last row predicted whatever followed the window. The window is stretched
/// to the full audio context, and interior timestamps are only kept as
/// anchors when `use_timestamps_for_alignment` is set.
pub(crate) fn align_window(
    ctx: &ChunkContext<'_>,
    window: &WindowBuffer,
    attention: &[StepAttention],
) -> Result<(Vec<PendingSegment>, FlushOutcome), AlignmentError> {
    let special = ctx.vocab.special_tokens();
    let sampled = &window.tokens;
    let n = sampled.len();
    if n == 0 {
        return Ok((Vec::new(), FlushOutcome::finished()));
    }
    if attention.len() != n + 1 {
        return Err(AlignmentError::inconsistency(
            "attention shape",
            format!("{} attention rows for a window of {n} sampled tokens", attention.len()),
        ));
    }

    let is_timestamp: Vec<bool> = sampled.iter().map(|&t| special.is_timestamp(t)).collect();
    let mut ends: Vec<usize> = (0..n - 1)
        .filter(|&k| is_timestamp[k] && is_timestamp[k + 1])
        .collect();
    if n >= 2 && is_timestamp[n - 1] && !is_timestamp[n - 2] {
        ends.push(n - 1);
    }
    let last_is_timestamp = !ends.is_empty() || is_timestamp[n - 1];
    let last_kept = ends.last().copied().unwrap_or(n - 1);

    let keep: Vec<bool> = (0..n)
        .map(|k| {
            if k == 0 || k == last_kept {
                return k == 0 || last_is_timestamp || !special.is_special(sampled[k]);
            }
            if k > last_kept {
                return false;
            }
            !special.is_special(sampled[k])
                || (ctx.config.use_timestamps_for_alignment && !ends.is_empty())
        })
        .collect();

    let mut decoded: Vec<u32> = Vec::with_capacity(n + 1);
    let mut rows: Vec<&StepAttention> = Vec::with_capacity(n + 1);
    for k in (0..n).filter(|&k| keep[k]) {
        decoded.push(sampled[k]);
        rows.push(&attention[k]);
    }

    let unfinished = !last_is_timestamp;
    let mut outcome = FlushOutcome::finished();
    if unfinished {
        let token = window.greedy_next()?;
        outcome = FlushOutcome {
            unfinished: true,
            fallback: Some(token),
            last_token_reliable: ctx.config.temperature == 0.0,
        };
        tracing::warn!(
            tokens = decoded.len(),
            fallback = token,
            "resegment: decoding hit the token limit, recovered the last token"
        );
        decoded.push(token);
        rows.push(&attention[n]);
    }

    let mut tokens = decoded.clone();
    tokens[0] = special.timestamp_token(0);
    if last_is_timestamp {
        let last = tokens.len() - 1;
        tokens[last] = special.timestamp_token(ctx.config.dims.n_audio_ctx);
    }

    let mut words = align_chunk(ctx, &tokens, &rows, unfinished)?;
    if words.is_empty() {
        tracing::debug!(
            text = %ctx.vocab.decode_with_timestamps(&decoded),
            "resegment: window produced no words"
        );
        return Ok((Vec::new(), outcome));
    }
    if unfinished {
        if let Some(word) = words.last_mut() {
            word.logprob_reliable = outcome.last_token_reliable;
        }
    }

    let segments = if ends.len() > 1 {
        split_at_timestamp_pairs(ctx, words, sampled, &ends)?
    } else {
        let mut tokens = sampled[..=last_kept].to_vec();
        tokens.extend(outcome.fallback);
        vec![PendingSegment::new(tokens, 0, unfinished, words)]
    };
    tracing::debug!(
        segments = segments.len(),
        sampled = n,
        unfinished,
        "resegment: window aligned"
    );
    Ok((segments, outcome))
}

/// Deal words out to the segments ending at each index of `ends`, counting
/// text tokens. Without timestamp anchors a word may straddle two segments;
/// its tail becomes a zero-length word at the start of the next one.
fn split_at_timestamp_pairs(
    ctx: &ChunkContext<'_>,
    words: Vec<AlignedWord>,
    sampled: &[u32],
    ends: &[usize],
) -> Result<Vec<PendingSegment>, AlignmentError> {
    let anchored = ctx.config.use_timestamps_for_alignment;
    let mut queue: VecDeque<AlignedWord> = words.into();
    let mut segments = Vec::with_capacity(ends.len());
    let mut start = 0usize;

    for (i, &end) in ends.iter().enumerate() {
        let expected = end.saturating_sub(start + 1);
        let mut length = 0usize;
        let mut segment_words = Vec::new();
        while length < expected {
            let Some(word) = queue.pop_front() else {
                // A lone punctuation segment already glued to the previous word.
                if !anchored && expected == 1 && i + 1 == ends.len() {
                    break;
                }
                return Err(AlignmentError::inconsistency(
                    "window resegmentation",
                    format!("ran out of words for segment {i} ({length} of {expected} tokens)"),
                ));
            };
            length += word.tokens.len();
            segment_words.push(word);
        }

        if length > expected {
            if anchored {
                return Err(AlignmentError::inconsistency(
                    "window resegmentation",
                    format!("segment {i} words cover {length} tokens, expected {expected}"),
                ));
            }
            if let Some(word) = segment_words.last_mut() {
                let tail = split_word_tail(ctx, word, length - expected);
                queue.push_front(tail);
            }
        }

        if segment_words.is_empty() {
            tracing::debug!(segment = i, "resegment: no words between timestamps");
        } else {
            segments.push(PendingSegment::new(
                sampled[start..=end].to_vec(),
                start,
                false,
                segment_words,
            ));
        }
        start = end + 1;
    }

    if !queue.is_empty() {
        return Err(AlignmentError::inconsistency(
            "window resegmentation",
            format!("{} words left after the last segment", queue.len()),
        ));
    }
    Ok(segments)
}

/// Cut the last `count` tokens off `word` into a new zero-length word placed
/// at its end.
fn split_word_tail(ctx: &ChunkContext<'_>, word: &mut AlignedWord, count: usize) -> AlignedWord {
    let keep = word.tokens.len().saturating_sub(count);
    let tail_tokens = word.tokens.split_off(keep);
    word.raw_text = ctx.vocab.decode_with_timestamps(&word.tokens);
    word.text = word.raw_text.trim().to_string();
    let raw_text = ctx.vocab.decode_with_timestamps(&tail_tokens);
    AlignedWord {
        text: raw_text.trim().to_string(),
        raw_text,
        tokens: tail_tokens,
        start: word.end,
        end: word.end,
        confidence: None,
        is_disfluency: false,
        logprob_reliable: true,
    }
}
