use std::collections::BTreeMap;

use super::attention::AttentionMatrix;
use super::peaks::find_peaks;
use super::words::is_punctuation_piece;
use crate::pipeline::traits::Vocabulary;

/// Frames a bump must span at half prominence to count as a separate utterance.
const MIN_PEAK_WIDTH: f64 = 3.0;
const MIN_PEAK_PROMINENCE: f64 = 0.02;

/// Token start frames corrected for hesitations, plus the spans where a
/// disfluency marker should be inserted, keyed by the token it precedes.
#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct DisfluencyScan {
    pub starts: Vec<usize>,
    pub markers: BTreeMap<usize, (usize, usize)>,
}

/// Look for several attention bumps inside each token's DTW span.
///
/// When a token's span holds more than one bump, the token is moved to the
/// last bump and the frames before it become a marker. A punctuation token
/// cannot start a hesitation, so its span is reported ahead of the next token.
pub(crate) fn scan(
    cost: &AttentionMatrix,
    boundaries: &[usize],
    tokens: &[u32],
    vocab: &dyn Vocabulary,
) -> DisfluencyScan {
    let mut scan = DisfluencyScan {
        starts: boundaries.to_vec(),
        markers: BTreeMap::new(),
    };
    for (i, &token) in tokens.iter().enumerate() {
        let (Some(&begin), Some(&end)) = (boundaries.get(i), boundaries.get(i + 1)) else {
            break;
        };
        if end <= begin || i >= cost.rows() {
            continue;
        }
        let curve: Vec<f64> = (begin..end.min(cost.cols()))
            .map(|frame| -cost.get(i, frame))
            .collect();
        let peaks = find_peaks(&curve, MIN_PEAK_WIDTH, MIN_PEAK_PROMINENCE);
        if peaks.len() <= 1 {
            continue;
        }
        let Some(last) = peaks.last() else {
            continue;
        };
        let new_begin = begin + last.left_ip.round_ties_even() as usize;
        scan.starts[i] = new_begin;
        if new_begin == begin {
            continue;
        }
        let text = vocab.decode_with_timestamps(&[token]);
        if is_punctuation_piece(&text) {
            scan.markers.insert(i + 1, (begin, end));
        } else {
            scan.markers.insert(i, (begin, new_begin));
        }
        tracing::debug!(
            token_index = i,
            begin,
            new_begin,
            peaks = peaks.len(),
            "disfluency: hesitation before token"
        );
    }
    scan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::vocabulary;

    fn two_bump_row(width: usize, first: std::ops::Range<usize>, second: std::ops::Range<usize>) -> Vec<f64> {
        (0..width)
            .map(|f| {
                if first.contains(&f) || second.contains(&f) {
                    -0.9
                } else {
                    -0.1
                }
            })
            .collect()
    }

    #[test]
    fn single_bump_leaves_tokens_untouched() {
        let cost = AttentionMatrix::from_rows(&[
            (0..10).map(|f| if (2..6).contains(&f) { -0.9 } else { -0.1 }).collect(),
            vec![-0.5; 10],
        ])
        .expect("rectangular");
        let vocab = vocabulary(&[" so", " yes"]);
        let scan = scan(&cost, &[0, 9, 10], &[0, 1], &vocab);
        assert_eq!(scan.starts, vec![0, 9, 10]);
        assert!(scan.markers.is_empty());
    }

    #[test]
    fn second_bump_moves_word_start_and_records_marker() {
        let row = two_bump_row(20, 2..6, 12..17);
        let cost = AttentionMatrix::from_rows(&[row, vec![-0.5; 20]]).expect("rectangular");
        let vocab = vocabulary(&[" um", " yes"]);
        let scan = scan(&cost, &[0, 19, 20], &[0, 1], &vocab);
        // Half prominence is crossed halfway between frames 11 and 12.
        assert_eq!(scan.starts[0], 12);
        assert_eq!(scan.markers.get(&0), Some(&(0, 12)));
    }

    #[test]
    fn punctuation_hesitation_is_reported_before_next_token() {
        let row = two_bump_row(20, 2..6, 12..17);
        let cost = AttentionMatrix::from_rows(&[row, vec![-0.5; 20]]).expect("rectangular");
        let vocab = vocabulary(&[",", " yes"]);
        let scan = scan(&cost, &[0, 19, 20], &[0, 1], &vocab);
        assert_eq!(scan.markers.get(&1), Some(&(0, 19)));
        assert!(!scan.markers.contains_key(&0));
    }

    #[test]
    fn spaced_punctuation_piece_counts_as_a_word_start() {
        let row = two_bump_row(20, 2..6, 12..17);
        let cost = AttentionMatrix::from_rows(&[row, vec![-0.5; 20]]).expect("rectangular");
        let vocab = vocabulary(&[" ,", " yes"]);
        let scan = scan(&cost, &[0, 19, 20], &[0, 1], &vocab);
        assert_eq!(scan.markers.get(&0), Some(&(0, 12)));
        assert!(!scan.markers.contains_key(&1));
    }
}
