pub mod alignment;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod report;
pub mod types;

#[cfg(test)]
mod test_support;

pub use config::{AlignerConfig, AlignmentHeads, DecoderDims, HeadSelection, PunctuationTiming, TimestampMode};
pub use error::AlignmentError;
pub use pipeline::builder::TranscriberBuilder;
pub use pipeline::defaults::PieceVocabulary;
pub use pipeline::runtime::TimestampedTranscriber;
pub use pipeline::traits::{
    SequenceAligner, SpecialTokens, SpeechDecoder, StepObserver, Vocabulary, WordSplitter,
};
pub use report::TranscriptReport;
pub use types::{
    DecodeStep, DecodedSegment, FeatureWindow, Segment, StepAttention, TimestampedTranscript,
    Transcription, Word,
};
