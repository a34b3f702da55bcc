pub mod attention;
pub(crate) mod confidence;
pub(crate) mod disfluency;
pub mod dtw;
pub(crate) mod engine;
pub(crate) mod padding;
pub(crate) mod peaks;
pub mod repair;
pub mod words;

use crate::config::DISFLUENCY_MARK;
use crate::types::Word;

/// A word placed in time by the chunk engine, before segment assembly.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AlignedWord {
    pub text: String,
    /// Decoded pieces as they appear in the segment text, spaces included.
    pub raw_text: String,
    pub tokens: Vec<u32>,
    pub start: f64,
    pub end: f64,
    pub confidence: Option<f64>,
    pub is_disfluency: bool,
    pub logprob_reliable: bool,
}

impl AlignedWord {
    pub(crate) fn disfluency(start: f64, end: f64) -> Self {
        Self {
            text: DISFLUENCY_MARK.to_string(),
            raw_text: String::new(),
            tokens: Vec::new(),
            start,
            end,
            confidence: None,
            is_disfluency: true,
            logprob_reliable: true,
        }
    }

    pub(crate) fn into_word(self) -> Word {
        Word {
            text: self.text,
            start: self.start,
            end: self.end,
            confidence: self.confidence,
            is_disfluency: self.is_disfluency,
            tokens: self.tokens,
            logprob_reliable: self.logprob_reliable,
        }
    }
}
