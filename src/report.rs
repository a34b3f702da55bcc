//! Structural diagnostics over a finished transcript.

use serde::Serialize;

use crate::types::{TimestampedTranscript, Word};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SpanMetrics {
    pub count: u32,
    pub overlap_count: u32,
    pub non_monotonic_count: u32,
    pub non_positive_duration_count: u32,
    /// Seconds of audio between consecutive spans.
    pub total_gap_sec: f64,
    pub total_overlap_sec: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConfidenceMetrics {
    pub scored_word_count: u32,
    pub out_of_range_count: u32,
    /// Exactly 0 or 1: legal, but usually a sign of a degenerate distribution.
    pub suspicious_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TranscriptReport {
    pub segments: SpanMetrics,
    pub words: SpanMetrics,
    pub disfluency_count: u32,
    pub unreliable_word_count: u32,
    pub confidence: ConfidenceMetrics,
}

impl TranscriptReport {
    pub fn from_transcript(transcript: &TimestampedTranscript) -> Self {
        let segment_spans: Vec<(f64, f64)> =
            transcript.segments.iter().map(|s| (s.start, s.end)).collect();
        let words: Vec<&Word> = transcript.words().collect();
        let word_spans: Vec<(f64, f64)> = words.iter().map(|w| (w.start, w.end)).collect();

        let report = Self {
            segments: span_metrics(&segment_spans),
            words: span_metrics(&word_spans),
            disfluency_count: words.iter().filter(|w| w.is_disfluency).count() as u32,
            unreliable_word_count: words.iter().filter(|w| !w.logprob_reliable).count() as u32,
            confidence: confidence_metrics(&words),
        };
        if report.confidence.suspicious_count > 0 || report.confidence.out_of_range_count > 0 {
            tracing::warn!(
                suspicious = report.confidence.suspicious_count,
                out_of_range = report.confidence.out_of_range_count,
                "report: unusual word confidence values"
            );
        }
        tracing::debug!(
            segments = report.segments.count,
            words = report.words.count,
            overlaps = report.words.overlap_count,
            "report: transcript checked"
        );
        report
    }

    /// Segments and words are strictly positive and never overlap.
    pub fn is_well_formed(&self) -> bool {
        [&self.segments, &self.words].iter().all(|m| {
            m.overlap_count == 0 && m.non_monotonic_count == 0 && m.non_positive_duration_count == 0
        }) && self.confidence.out_of_range_count == 0
    }
}

fn span_metrics(spans: &[(f64, f64)]) -> SpanMetrics {
    let mut metrics = SpanMetrics {
        count: spans.len() as u32,
        non_positive_duration_count: spans.iter().filter(|(start, end)| end <= start).count() as u32,
        ..SpanMetrics::default()
    };
    for pair in spans.windows(2) {
        let (current, next) = (pair[0], pair[1]);
        if current.1 > next.0 {
            metrics.overlap_count += 1;
            metrics.total_overlap_sec += current.1 - next.0;
        } else {
            metrics.total_gap_sec += next.0 - current.1;
        }
        if current.0 > next.0 {
            metrics.non_monotonic_count += 1;
        }
    }
    metrics
}

fn confidence_metrics(words: &[&Word]) -> ConfidenceMetrics {
    let scores: Vec<f64> = words.iter().filter_map(|w| w.confidence).collect();
    let mut metrics = ConfidenceMetrics {
        scored_word_count: scores.len() as u32,
        out_of_range_count: scores.iter().filter(|c| !(0.0..=1.0).contains(*c)).count() as u32,
        suspicious_count: scores.iter().filter(|&&c| c == 0.0 || c == 1.0).count() as u32,
        ..ConfidenceMetrics::default()
    };
    if !scores.is_empty() {
        metrics.mean = Some(scores.iter().sum::<f64>() / scores.len() as f64);
        metrics.min = scores.iter().copied().reduce(f64::min);
    }
    metrics
}
