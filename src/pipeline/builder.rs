use std::path::{Path, PathBuf};

use crate::config::{AlignerConfig, AlignmentHeads, HeadSelection};
use crate::error::AlignmentError;
use crate::pipeline::defaults::{DtwSequenceAligner, LanguageWordSplitter, PieceVocabulary};
use crate::pipeline::runtime::{TimestampedTranscriber, TimestampedTranscriberParts};
use crate::pipeline::traits::{SequenceAligner, Vocabulary, WordSplitter};

pub struct TranscriberBuilder {
    config: AlignerConfig,
    vocabulary: Option<Box<dyn Vocabulary>>,
    vocabulary_path: Option<PathBuf>,
    alignment_heads_path: Option<PathBuf>,
    word_splitter: Option<Box<dyn WordSplitter>>,
    sequence_aligner: Option<Box<dyn SequenceAligner>>,
}

impl TranscriberBuilder {
    pub fn new(config: AlignerConfig) -> Self {
        Self {
            config,
            vocabulary: None,
            vocabulary_path: None,
            alignment_heads_path: None,
            word_splitter: None,
            sequence_aligner: None,
        }
    }

    pub fn with_vocabulary(mut self, vocabulary: Box<dyn Vocabulary>) -> Self {
        self.vocabulary = Some(vocabulary);
        self
    }

    /// Load a [`PieceVocabulary`] at build time. Ignored when a vocabulary
    /// object is given.
    pub fn with_vocabulary_file(mut self, path: impl AsRef<Path>) -> Self {
        self.vocabulary_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Replace the configured head selection with a mask loaded at build time.
    pub fn with_alignment_heads_file(mut self, path: impl AsRef<Path>) -> Self {
        self.alignment_heads_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_word_splitter(mut self, word_splitter: Box<dyn WordSplitter>) -> Self {
        self.word_splitter = Some(word_splitter);
        self
    }

    pub fn with_sequence_aligner(mut self, sequence_aligner: Box<dyn SequenceAligner>) -> Self {
        self.sequence_aligner = Some(sequence_aligner);
        self
    }

    pub fn build(self) -> Result<TimestampedTranscriber, AlignmentError> {
        let mut config = self.config;
        if let Some(path) = &self.alignment_heads_path {
            let heads = AlignmentHeads::load(path)?;
            tracing::debug!(
                heads = heads.heads.len(),
                layers = heads.num_layers,
                "builder: alignment heads loaded"
            );
            config.head_selection = HeadSelection::Mask(heads);
        }
        config.validate()?;

        let vocab: Box<dyn Vocabulary> = match (self.vocabulary, self.vocabulary_path) {
            (Some(vocab), _) => vocab,
            (None, Some(path)) => Box::new(PieceVocabulary::load(&path)?),
            (None, None) => {
                return Err(AlignmentError::invalid_input(
                    "a vocabulary or vocabulary file is required",
                ))
            }
        };

        Ok(TimestampedTranscriber::from_parts(TimestampedTranscriberParts {
            config,
            vocab,
            word_splitter: self
                .word_splitter
                .unwrap_or_else(|| Box::new(LanguageWordSplitter)),
            sequence_aligner: self
                .sequence_aligner
                .unwrap_or_else(|| Box::new(DtwSequenceAligner)),
        }))
    }
}
