use crate::config::AlignerConfig;

/// Segment Filter: decides whether a finished decoding window was silence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct SegmentFilter {
    pub no_speech_threshold: Option<f64>,
    pub logprob_threshold: Option<f64>,
}

impl SegmentFilter {
    pub(crate) fn from_config(config: &AlignerConfig) -> Self {
        Self {
            no_speech_threshold: config.no_speech_threshold,
            logprob_threshold: config.logprob_threshold,
        }
    }

    /// The decoder thinks the window holds no speech.
    pub(crate) fn is_silent(&self, no_speech_prob: Option<f64>) -> bool {
        match (self.no_speech_threshold, no_speech_prob) {
            (Some(threshold), Some(prob)) => prob > threshold,
            _ => false,
        }
    }

    /// Whether token log-probabilities are needed to reach a decision.
    pub(crate) fn needs_logprobs(&self, no_speech_prob: Option<f64>) -> bool {
        self.logprob_threshold.is_some() && self.is_silent(no_speech_prob)
    }

    /// A silent window is kept anyway when its tokens were confident enough.
    pub(crate) fn should_skip(&self, no_speech_prob: Option<f64>, avg_logprob: Option<f64>) -> bool {
        if !self.is_silent(no_speech_prob) {
            return false;
        }
        match (self.logprob_threshold, avg_logprob) {
            (Some(threshold), Some(avg)) => avg <= threshold,
            _ => true,
        }
    }
}

/// Drop every segment recorded since `window_start`. Returns how many went.
pub(crate) fn retract<T>(segments: &mut Vec<T>, window_start: usize) -> usize {
    let removed = segments.len().saturating_sub(window_start);
    segments.truncate(window_start);
    removed
}
