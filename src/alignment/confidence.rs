use super::words::ends_with_punctuation;
use super::AlignedWord;
use crate::error::AlignmentError;
use crate::pipeline::traits::Vocabulary;

/// Log-softmax of one logit row. Entries at negative infinity stay there.
pub(crate) fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return vec![f32::NAN; logits.len()];
    }
    let sum: f64 = logits
        .iter()
        .map(|&v| f64::from(v - max).exp())
        .sum();
    let log_sum = sum.ln() as f32;
    logits.iter().map(|&v| v - max - log_sum).collect()
}

/// Index of the first maximal entry.
pub(crate) fn argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in values.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

/// Pick the log-probability of each chosen token from its step's distribution.
pub(crate) fn gather_token_logprobs(
    step_logprobs: &[Vec<f32>],
    chosen: &[u32],
) -> Result<Vec<f64>, AlignmentError> {
    if step_logprobs.len() != chosen.len() {
        return Err(AlignmentError::inconsistency(
            "token logprobs",
            format!(
                "{} distributions for {} chosen tokens",
                step_logprobs.len(),
                chosen.len()
            ),
        ));
    }
    step_logprobs
        .iter()
        .zip(chosen)
        .enumerate()
        .map(|(step, (row, &token))| {
            let value = row.get(token as usize).copied().ok_or_else(|| {
                AlignmentError::inconsistency(
                    "token logprobs",
                    format!("token {token} outside a {}-entry distribution", row.len()),
                )
            })?;
            if !value.is_finite() {
                return Err(AlignmentError::inconsistency(
                    "token logprobs",
                    format!("non-finite logprob {value} for token {token} at step {step}"),
                ));
            }
            Ok(f64::from(value))
        })
        .collect()
}

/// `exp(mean(logprobs))` rounded to three decimals, or `None` for no tokens.
pub fn mean_confidence(logprobs: &[f64]) -> Option<f64> {
    if logprobs.is_empty() {
        return None;
    }
    let mean = logprobs.iter().sum::<f64>() / logprobs.len() as f64;
    Some(round_to(mean.exp().clamp(0.0, 1.0), 3))
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

/// Attribute a segment's token logprobs to its words in order, set each word's
/// confidence, and return the segment confidence.
///
/// Trailing punctuation tokens are left out of a word's score unless
/// `include_punctuation` is set; a word always keeps at least one token.
pub(crate) fn score_words(
    words: &mut [AlignedWord],
    logprobs: &[f64],
    include_punctuation: bool,
    vocab: &dyn Vocabulary,
) -> Result<Option<f64>, AlignmentError> {
    let mut cursor = 0usize;
    let mut scored = Vec::with_capacity(logprobs.len());
    for word in words.iter_mut() {
        let count = word.tokens.len();
        let end = cursor + count;
        let Some(word_logprobs) = logprobs.get(cursor..end) else {
            return Err(AlignmentError::inconsistency(
                "word confidence",
                format!(
                    "word {:?} needs logprobs {cursor}..{end} of {}",
                    word.text,
                    logprobs.len()
                ),
            ));
        };
        let kept = if include_punctuation {
            count
        } else {
            let mut kept = count;
            while kept > 1 && ends_with_punctuation(&vocab.decode_with_timestamps(&word.tokens[kept - 1..kept])) {
                kept -= 1;
            }
            kept
        };
        word.confidence = mean_confidence(&word_logprobs[..kept]);
        if !include_punctuation {
            scored.extend_from_slice(&word_logprobs[..kept]);
        }
        cursor = end;
    }
    if cursor != logprobs.len() {
        tracing::warn!(
            word_tokens = cursor,
            logprobs = logprobs.len(),
            "confidence: word tokens do not cover segment logprobs"
        );
    }
    Ok(if include_punctuation {
        mean_confidence(logprobs)
    } else {
        mean_confidence(&scored)
    })
}
