//! Final clean-up of word and segment time spans.

use super::confidence::round_to;
use super::AlignedWord;
use crate::error::AlignmentError;
use crate::types::{Segment, Word};

/// Output precision in seconds. Durations never fall below it.
const TIME_RESOLUTION: f64 = 0.01;
/// Repair passes allowed to move earlier boundaries before overlaps are
/// resolved forward only.
const MAX_BACKWARD_PASSES: usize = 64;

/// Something with a start and an end on the audio timeline.
pub trait TimeSpan {
    fn start(&self) -> f64;
    fn end(&self) -> f64;
    fn set_start(&mut self, value: f64);
    fn set_end(&mut self, value: f64);
}

impl TimeSpan for Word {
    fn start(&self) -> f64 {
        self.start
    }
    fn end(&self) -> f64 {
        self.end
    }
    fn set_start(&mut self, value: f64) {
        self.start = value;
    }
    fn set_end(&mut self, value: f64) {
        self.end = value;
    }
}

impl TimeSpan for Segment {
    fn start(&self) -> f64 {
        self.start
    }
    fn end(&self) -> f64 {
        self.end
    }
    fn set_start(&mut self, value: f64) {
        self.start = value;
    }
    fn set_end(&mut self, value: f64) {
        self.end = value;
    }
}

/// A word together with the index of the segment that owns it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PlacedWord {
    pub segment: usize,
    pub word: AlignedWord,
}

impl TimeSpan for PlacedWord {
    fn start(&self) -> f64 {
        self.word.start
    }
    fn end(&self) -> f64 {
        self.word.end
    }
    fn set_start(&mut self, value: f64) {
        self.word.start = value;
    }
    fn set_end(&mut self, value: f64) {
        self.word.end = value;
    }
}

/// Make spans non-overlapping and strictly positive, in place.
///
/// Boundaries are first rounded to [`TIME_RESOLUTION`] and stay on that grid.
/// An overlap is split at the midpoint when the earlier span keeps at least
/// `min_duration` (rounded up to the grid); otherwise the later span starts
/// where the earlier one ends. Passes repeat until no earlier boundary moves.
pub fn ensure_increasing_positions<T: TimeSpan>(
    items: &mut [T],
    min_duration: f64,
) -> Result<(), AlignmentError> {
    let floor = snap_up(min_duration.max(TIME_RESOLUTION));
    for item in items.iter_mut() {
        item.set_start(round_to(item.start(), 2));
        item.set_end(round_to(item.end(), 2));
    }
    let mut passes = 0;
    while forward_pass(items, floor, passes < MAX_BACKWARD_PASSES) {
        passes += 1;
    }
    if passes >= MAX_BACKWARD_PASSES {
        tracing::warn!(passes, "repair: overlaps resolved forward only");
    }

    let mut previous_end = 0.0;
    for (i, item) in items.iter().enumerate() {
        if item.start() < previous_end || item.end() <= item.start() {
            return Err(AlignmentError::inconsistency(
                "timeline repair",
                format!(
                    "span {i} [{}, {}] after previous end {previous_end}",
                    item.start(),
                    item.end()
                ),
            ));
        }
        previous_end = item.end();
    }
    Ok(())
}

/// Smallest multiple of [`TIME_RESOLUTION`] not below `value`.
fn snap_up(value: f64) -> f64 {
    let steps = (value / TIME_RESOLUTION - 1e-6).ceil().max(1.0);
    round_to(steps * TIME_RESOLUTION, 2)
}

/// One forward sweep. Returns whether an earlier span was shortened.
fn forward_pass<T: TimeSpan>(items: &mut [T], floor: f64, allow_backward: bool) -> bool {
    let mut moved_backward = false;
    let mut previous_end = 0.0;
    for i in 0..items.len() {
        let start = items[i].start();
        if start < previous_end {
            let midpoint = round_to((previous_end + start) / 2.0, 2);
            let keeps_floor = i > 0 && midpoint >= round_to(items[i - 1].start() + floor, 2);
            let new_start = if allow_backward && keeps_floor {
                items[i - 1].set_end(midpoint);
                moved_backward |= midpoint < previous_end;
                midpoint
            } else {
                previous_end
            };
            items[i].set_start(new_start);
        }
        if items[i].end() < round_to(items[i].start() + floor, 2) {
            let end = round_to(items[i].start() + floor, 2);
            items[i].set_end(end);
        }
        previous_end = items[i].end();
    }
    moved_backward
}

/// Drop zero-duration words at the end of each decoding window, shortening the
/// owning segment's text and removing segments left without words.
///
/// Returns whether anything was removed.
pub(crate) fn remove_trailing_null_words(
    segments: &mut Vec<Segment>,
    words: &mut Vec<PlacedWord>,
) -> Result<bool, AlignmentError> {
    let mut window_of_segment = Vec::with_capacity(segments.len());
    let mut previous_seek = None;
    let mut window = 0usize;
    for segment in segments.iter() {
        if previous_seek.is_some() && previous_seek != Some(segment.seek) {
            window += 1;
        }
        previous_seek = Some(segment.seek);
        window_of_segment.push(window);
    }

    let mut current_window = None;
    let mut trailing_empty = false;
    let mut removed = Vec::new();
    for i in (0..words.len()).rev() {
        let empty = words[i].word.start == words[i].word.end;
        let idx = words[i].segment;
        let Some(&window) = window_of_segment.get(idx) else {
            return Err(AlignmentError::inconsistency(
                "word placement",
                format!("word {i} refers to missing segment {idx}"),
            ));
        };
        if current_window != Some(window) {
            trailing_empty = empty;
            current_window = Some(window);
        } else if !empty {
            trailing_empty = false;
        }
        if !trailing_empty {
            continue;
        }

        removed.push(i);
        tracing::debug!(
            word = %words[i].word.raw_text,
            segment = idx,
            "repair: dropping zero-duration word at window end"
        );
        let shortened = shorten_text(&segments[idx].text, &words[i].word.raw_text)?;
        if i > 0 && words[i - 1].segment == idx {
            segments[idx].text = shortened;
        } else {
            tracing::debug!(segment = idx, "repair: dropping segment left without words");
            segments.remove(idx);
            for later in words.iter_mut().skip(i + 1) {
                later.segment -= 1;
            }
        }
    }

    for &i in &removed {
        words.remove(i);
    }
    Ok(!removed.is_empty())
}

/// Remove `word` from the end of `text`, tolerating one stray trailing
/// character on either side.
fn shorten_text(text: &str, word: &str) -> Result<String, AlignmentError> {
    if let Some(rest) = text.strip_suffix(word) {
        return Ok(rest.to_string());
    }
    if let Some(rest) = text.strip_suffix(drop_last_char(word)) {
        return Ok(rest.to_string());
    }
    if let Some(rest) = drop_last_char(text).strip_suffix(word) {
        return Ok(rest.to_string());
    }
    Err(AlignmentError::inconsistency(
        "segment text",
        format!("{text:?} does not end with {word:?}"),
    ))
}

fn drop_last_char(text: &str) -> &str {
    match text.char_indices().last() {
        Some((i, _)) => &text[..i],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Span(f64, f64);

    impl TimeSpan for Span {
        fn start(&self) -> f64 {
            self.0
        }
        fn end(&self) -> f64 {
            self.1
        }
        fn set_start(&mut self, value: f64) {
            self.0 = value;
        }
        fn set_end(&mut self, value: f64) {
            self.1 = value;
        }
    }

    fn segment(seek: usize, text: &str) -> Segment {
        Segment {
            id: 0,
            seek,
            start: 0.0,
            end: 0.0,
            text: text.to_string(),
            tokens: Vec::new(),
            avg_logprob: None,
            no_speech_prob: None,
            confidence: None,
            words: Vec::new(),
        }
    }

    fn placed(segment: usize, raw: &str, start: f64, end: f64) -> PlacedWord {
        PlacedWord {
            segment,
            word: AlignedWord {
                text: raw.trim().to_string(),
                raw_text: raw.to_string(),
                tokens: vec![1],
                start,
                end,
                confidence: None,
                is_disfluency: false,
                logprob_reliable: true,
            },
        }
    }

    #[test]
    fn overlap_is_split_at_midpoint() {
        let mut spans = vec![Span(0.0, 2.0), Span(1.6, 3.0)];
        ensure_increasing_positions(&mut spans, 0.02).expect("repairable");
        assert_eq!(spans, vec![Span(0.0, 1.8), Span(1.8, 3.0)]);
    }

    #[test]
    fn short_previous_span_keeps_its_end() {
        let mut spans = vec![Span(1.0, 1.1), Span(0.9, 2.0)];
        ensure_increasing_positions(&mut spans, 0.2).expect("repairable");
        assert_eq!(spans, vec![Span(1.0, 1.2), Span(1.2, 2.0)]);
    }

    #[test]
    fn zero_duration_spans_get_the_floor() {
        let mut spans = vec![Span(0.5, 0.5), Span(0.5, 0.5), Span(3.0, 2.0)];
        ensure_increasing_positions(&mut spans, 0.02).expect("repairable");
        assert_eq!(spans, vec![Span(0.5, 0.52), Span(0.52, 0.54), Span(3.0, 3.02)]);
    }

    #[test]
    fn zero_floor_still_keeps_spans_positive() {
        let mut spans = vec![Span(0.4, 0.4), Span(0.4, 0.6)];
        ensure_increasing_positions(&mut spans, 0.0).expect("repairable");
        for s in &spans {
            assert!(s.1 > s.0);
        }
        assert!(spans[0].1 <= spans[1].0);
    }

    #[test]
    fn half_hundredth_boundaries_are_repaired() {
        let mut spans = vec![Span(3.655, 3.655), Span(3.655, 3.658), Span(3.656, 3.657)];
        ensure_increasing_positions(&mut spans, 0.0).expect("repairable");
        for pair in spans.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "{spans:?}");
        }
        assert!(spans.iter().all(|s| s.1 > s.0), "{spans:?}");
    }

    #[test]
    fn floor_is_rounded_up_to_the_output_precision() {
        let mut spans = vec![Span(1.0, 1.0)];
        ensure_increasing_positions(&mut spans, 0.015).expect("repairable");
        assert_eq!(spans, vec![Span(1.0, 1.02)]);
    }

    #[test]
    fn repair_is_idempotent() {
        let mut spans = vec![
            Span(0.0, 0.4),
            Span(0.3, 0.35),
            Span(0.32, 1.0),
            Span(0.9, 0.9),
            Span(2.0, 2.5),
        ];
        ensure_increasing_positions(&mut spans, 0.02).expect("repairable");
        let once = spans.clone();
        ensure_increasing_positions(&mut spans, 0.02).expect("repairable");
        assert_eq!(spans, once);
        for pair in spans.windows(2) {
            assert!(pair[0].1 <= pair[1].0);
        }
        assert!(spans.iter().all(|s| s.1 > s.0));
    }

    #[test]
    fn trailing_zero_duration_words_are_removed_per_window() {
        let mut segments = vec![segment(0, " hello there"), segment(3000, " bye now")];
        let mut words = vec![
            placed(0, " hello", 0.0, 0.5),
            placed(0, " there", 1.0, 1.0),
            placed(1, " bye", 30.0, 30.4),
            placed(1, " now", 30.4, 30.4),
        ];
        let changed = remove_trailing_null_words(&mut segments, &mut words).expect("consistent");
        assert!(changed);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].text, " hello");
        assert_eq!(segments[1].text, " bye");
        let texts: Vec<&str> = words.iter().map(|w| w.word.text.as_str()).collect();
        assert_eq!(texts, vec!["hello", "bye"]);
    }

    #[test]
    fn segment_left_without_words_is_removed() {
        let mut segments = vec![segment(0, " hello"), segment(0, " uh"), segment(3000, " next")];
        let mut words = vec![
            placed(0, " hello", 0.0, 0.5),
            placed(1, " uh", 1.0, 1.0),
            placed(2, " next", 30.0, 30.5),
        ];
        remove_trailing_null_words(&mut segments, &mut words).expect("consistent");
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].text, " next");
        assert_eq!(words.len(), 2);
        assert_eq!(words[1].segment, 1);
    }

    #[test]
    fn zero_duration_word_in_the_middle_is_kept() {
        let mut segments = vec![segment(0, " a b c")];
        let mut words = vec![
            placed(0, " a", 0.0, 0.2),
            placed(0, " b", 0.2, 0.2),
            placed(0, " c", 0.3, 0.5),
        ];
        let changed = remove_trailing_null_words(&mut segments, &mut words).expect("consistent");
        assert!(!changed);
        assert_eq!(words.len(), 3);
    }

    #[test]
    fn shorten_text_tolerates_one_stray_character() {
        assert_eq!(shorten_text(" hi there", " there").expect("suffix"), " hi");
        assert_eq!(shorten_text(" hi ther", " there").expect("suffix"), " hi");
        assert_eq!(shorten_text(" hi there.", " there").expect("suffix"), " hi");
        assert!(shorten_text(" hi", " there").is_err());
    }
}
