use serde::{Deserialize, Serialize};

use crate::alignment::attention::AttentionMatrix;
use crate::alignment::dtw::{AlignmentPath, StepPattern};
use crate::alignment::words::TokenGroup;
use crate::error::AlignmentError;
use crate::types::{DecodeStep, Transcription};

/// Reserved token ids of the decoder vocabulary. Every id at or above `eot`
/// is special; every id at or above `timestamp_begin` is a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialTokens {
    pub eot: u32,
    pub sot: u32,
    pub sot_prev: u32,
    pub timestamp_begin: u32,
}

impl SpecialTokens {
    pub fn is_special(&self, token: u32) -> bool {
        token >= self.eot
    }

    pub fn is_timestamp(&self, token: u32) -> bool {
        token >= self.timestamp_begin
    }

    /// Encoder frame a timestamp token points at.
    pub fn timestamp_frame(&self, token: u32) -> Option<usize> {
        token
            .checked_sub(self.timestamp_begin)
            .map(|frame| frame as usize)
    }

    pub fn timestamp_token(&self, frame: usize) -> u32 {
        self.timestamp_begin + frame as u32
    }

    /// Lowest id stripped when comparing token lists with the decoder's.
    pub(crate) fn lowest_control(&self) -> u32 {
        self.eot.min(self.sot)
    }
}

pub trait Vocabulary: Send + Sync {
    fn special_tokens(&self) -> SpecialTokens;

    /// Decode tokens to text. Timestamps render as `<|1.24|>`, other special
    /// tokens as `<|name|>`, and incomplete UTF-8 as U+FFFD.
    fn decode_with_timestamps(&self, tokens: &[u32]) -> String;
}

pub struct SplitOptions<'a> {
    pub language: Option<&'a str>,
    pub remove_punctuation: bool,
}

pub trait WordSplitter: Send + Sync {
    fn split(
        &self,
        tokens: &[u32],
        vocab: &dyn Vocabulary,
        options: &SplitOptions<'_>,
    ) -> Vec<TokenGroup>;
}

pub trait SequenceAligner: Send + Sync {
    fn align_path(
        &self,
        cost: &AttentionMatrix,
        pattern: StepPattern,
    ) -> Result<AlignmentPath, AlignmentError>;
}

/// Receives every forward pass of a running decoder, in order.
pub trait StepObserver {
    fn on_step(&mut self, step: DecodeStep) -> Result<(), AlignmentError>;
}

/// A Whisper-style decoder that reports its forward passes while transcribing.
///
/// Implementations must call [`StepObserver::on_step`] for every forward pass
/// that contributes a token to the transcript, including the pass that feeds
/// each window's prompt, and must not report language-detection passes.
pub trait SpeechDecoder {
    fn transcribe(
        &mut self,
        observer: &mut dyn StepObserver,
    ) -> Result<Transcription, AlignmentError>;
}
