use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::alignment::attention::AttentionMatrix;
use crate::alignment::dtw::{dtw, AlignmentPath, StepPattern};
use crate::alignment::words::{split_on_glyphs, split_on_spaces, uses_space_separators, TokenGroup};
use crate::error::AlignmentError;
use crate::pipeline::traits::{SequenceAligner, SpecialTokens, SplitOptions, Vocabulary, WordSplitter};

/// Byte-level vocabulary: every text token maps to a run of UTF-8 bytes that
/// may stop in the middle of a character.
#[derive(Debug, Clone)]
pub struct PieceVocabulary {
    special: SpecialTokens,
    pieces: HashMap<u32, Vec<u8>>,
    special_names: HashMap<u32, String>,
}

#[derive(Deserialize)]
struct VocabularyFile {
    special: SpecialTokens,
    #[serde(default)]
    pieces: HashMap<u32, String>,
    /// Pieces that are not valid UTF-8 on their own.
    #[serde(default)]
    byte_pieces: HashMap<u32, Vec<u8>>,
    #[serde(default)]
    special_names: HashMap<u32, String>,
}

impl PieceVocabulary {
    pub fn new(special: SpecialTokens, pieces: impl IntoIterator<Item = (u32, Vec<u8>)>) -> Self {
        Self {
            special,
            pieces: pieces.into_iter().collect(),
            special_names: HashMap::new(),
        }
    }

    pub fn with_special_name(mut self, token: u32, name: impl Into<String>) -> Self {
        self.special_names.insert(token, name.into());
        self
    }

    pub fn load(path: &Path) -> Result<Self, AlignmentError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| AlignmentError::io("read vocabulary", e))?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> Result<Self, AlignmentError> {
        let file: VocabularyFile = serde_json::from_str(data)
            .map_err(|e| AlignmentError::json("parse vocabulary", e))?;
        let mut pieces: HashMap<u32, Vec<u8>> = file
            .pieces
            .into_iter()
            .map(|(id, text)| (id, text.into_bytes()))
            .collect();
        pieces.extend(file.byte_pieces);
        if let Some(id) = pieces.keys().copied().find(|&id| id >= file.special.eot) {
            return Err(AlignmentError::invalid_input(format!(
                "text piece {id} collides with special token range starting at {}",
                file.special.eot
            )));
        }
        Ok(Self {
            special: file.special,
            pieces,
            special_names: file.special_names,
        })
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }
}

impl Vocabulary for PieceVocabulary {
    fn special_tokens(&self) -> SpecialTokens {
        self.special
    }

    fn decode_with_timestamps(&self, tokens: &[u32]) -> String {
        let mut out = String::new();
        let mut pending: Vec<u8> = Vec::new();
        for &token in tokens {
            if let Some(frame) = self.special.timestamp_frame(token) {
                out.push_str(&String::from_utf8_lossy(&pending));
                pending.clear();
                out.push_str(&format!("<|{:.2}|>", frame as f64 * 0.02));
            } else if self.special.is_special(token) {
                out.push_str(&String::from_utf8_lossy(&pending));
                pending.clear();
                match self.special_names.get(&token) {
                    Some(name) => out.push_str(&format!("<|{name}|>")),
                    None => out.push_str(&format!("<|{token}|>")),
                }
            } else if let Some(bytes) = self.pieces.get(&token) {
                pending.extend_from_slice(bytes);
            }
        }
        out.push_str(&String::from_utf8_lossy(&pending));
        out
    }
}

/// Words start at leading spaces.
pub struct SpaceWordSplitter;

impl WordSplitter for SpaceWordSplitter {
    fn split(
        &self,
        tokens: &[u32],
        vocab: &dyn Vocabulary,
        options: &SplitOptions<'_>,
    ) -> Vec<TokenGroup> {
        split_on_spaces(tokens, vocab, options.remove_punctuation)
    }
}

/// Words end at every complete character.
pub struct GlyphWordSplitter;

impl WordSplitter for GlyphWordSplitter {
    fn split(
        &self,
        tokens: &[u32],
        vocab: &dyn Vocabulary,
        options: &SplitOptions<'_>,
    ) -> Vec<TokenGroup> {
        split_on_glyphs(tokens, vocab, options.remove_punctuation)
    }
}

/// Picks the space or glyph policy from the transcription language.
pub struct LanguageWordSplitter;

impl WordSplitter for LanguageWordSplitter {
    fn split(
        &self,
        tokens: &[u32],
        vocab: &dyn Vocabulary,
        options: &SplitOptions<'_>,
    ) -> Vec<TokenGroup> {
        if uses_space_separators(options.language) {
            SpaceWordSplitter.split(tokens, vocab, options)
        } else {
            GlyphWordSplitter.split(tokens, vocab, options)
        }
    }
}

pub struct DtwSequenceAligner;

impl SequenceAligner for DtwSequenceAligner {
    fn align_path(
        &self,
        cost: &AttentionMatrix,
        pattern: StepPattern,
    ) -> Result<AlignmentPath, AlignmentError> {
        dtw(cost, pattern).ok_or_else(|| {
            AlignmentError::inconsistency(
                "alignment path",
                format!(
                    "no {pattern:?} path through {} tokens x {} frames",
                    cost.rows(),
                    cost.cols()
                ),
            )
        })
    }
}
