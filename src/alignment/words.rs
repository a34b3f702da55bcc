//! Grouping of decoder tokens into display words.

use crate::pipeline::traits::Vocabulary;

/// Characters treated as punctuation when grouping and scoring words.
/// Hyphen and apostrophe are deliberately absent: they belong to words.
pub const PUNCTUATION: &str = "!\"#$%&()*+,./:;<=>?@[\\]^_`{|}~。，！？：”、…";

/// Languages written without spaces between words.
const GLYPH_LANGUAGES: [&str; 5] = ["zh", "ja", "th", "lo", "my"];

/// Smallest run of tokens that decodes to complete characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPiece {
    pub text: String,
    pub tokens: Vec<u32>,
}

/// One word: its display text and the pieces it was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGroup {
    pub text: String,
    pub pieces: Vec<TokenPiece>,
}

impl TokenGroup {
    fn from_piece(piece: TokenPiece) -> Self {
        Self {
            text: piece.text.clone(),
            pieces: vec![piece],
        }
    }

    pub fn token_count(&self) -> usize {
        self.pieces.iter().map(|p| p.tokens.len()).sum()
    }

    pub fn tokens(&self) -> Vec<u32> {
        self.pieces.iter().flat_map(|p| p.tokens.iter().copied()).collect()
    }

    /// Concatenated decoded pieces, including spaces and any stripped punctuation.
    pub fn raw_text(&self) -> String {
        self.pieces.iter().map(|p| p.text.as_str()).collect()
    }

    fn first_token(&self) -> Option<u32> {
        self.pieces.first().and_then(|p| p.tokens.first()).copied()
    }

    fn last_token(&self) -> Option<u32> {
        self.pieces.last().and_then(|p| p.tokens.last()).copied()
    }
}

/// Whole trimmed text is a contiguous run of [`PUNCTUATION`].
pub fn is_punctuation(text: &str) -> bool {
    let trimmed = text.trim();
    !trimmed.is_empty() && PUNCTUATION.contains(trimmed)
}

/// Decoded piece, leading space included, is a contiguous run of [`PUNCTUATION`].
/// `" ,"` is not: the space makes it a word start.
pub(crate) fn is_punctuation_piece(text: &str) -> bool {
    PUNCTUATION.contains(text)
}

pub(crate) fn ends_with_punctuation(text: &str) -> bool {
    text.chars().last().is_some_and(|c| PUNCTUATION.contains(c))
}

/// Whether words in `language` are separated by spaces. Unknown or missing
/// languages are assumed to be.
pub fn uses_space_separators(language: Option<&str>) -> bool {
    let Some(language) = language else {
        return true;
    };
    let lowered = language.trim().to_lowercase();
    let code = match lowered.as_str() {
        "chinese" | "mandarin" => "zh",
        "japanese" => "ja",
        "thai" => "th",
        "lao" => "lo",
        "myanmar" | "burmese" => "my",
        other => other,
    };
    !GLYPH_LANGUAGES.contains(&code)
}

/// Split at every boundary where the accumulated tokens decode to complete
/// characters. Punctuation pieces attach to the previous word unless that word
/// ends with a special token.
pub fn split_on_glyphs(
    tokens: &[u32],
    vocab: &dyn Vocabulary,
    remove_punctuation: bool,
) -> Vec<TokenGroup> {
    let eot = vocab.special_tokens().eot;
    let mut groups: Vec<TokenGroup> = Vec::new();
    let mut current = Vec::new();

    for &token in tokens {
        current.push(token);
        let decoded = vocab.decode_with_timestamps(&current);
        if decoded.contains('\u{FFFD}') {
            continue;
        }
        let punctuation = is_punctuation(&decoded);
        let previous_special = groups
            .last()
            .and_then(TokenGroup::last_token)
            .is_some_and(|t| t >= eot);
        let piece = TokenPiece {
            text: decoded,
            tokens: std::mem::take(&mut current),
        };
        if punctuation && !previous_special {
            if groups.is_empty() {
                groups.push(TokenGroup {
                    text: String::new(),
                    pieces: Vec::new(),
                });
            }
            if let Some(group) = groups.last_mut() {
                if !remove_punctuation {
                    group.text.push_str(&piece.text);
                }
                group.pieces.push(piece);
            }
        } else {
            groups.push(TokenGroup::from_piece(piece));
        }
    }

    if !current.is_empty() {
        let text = vocab.decode_with_timestamps(&current);
        tracing::debug!(tokens = current.len(), "words: trailing tokens do not decode to complete characters");
        groups.push(TokenGroup::from_piece(TokenPiece {
            text,
            tokens: current,
        }));
    }
    groups
}

/// Split at leading spaces. Special tokens always stand alone.
pub fn split_on_spaces(
    tokens: &[u32],
    vocab: &dyn Vocabulary,
    remove_punctuation: bool,
) -> Vec<TokenGroup> {
    let eot = vocab.special_tokens().eot;
    let mut words: Vec<TokenGroup> = Vec::new();
    let mut previous_special = false;

    for glyph in split_on_glyphs(tokens, vocab, remove_punctuation) {
        let special = glyph.first_token().is_some_and(|t| t >= eot);
        let with_space = glyph.text.starts_with(' ');
        let trimmed = glyph.text.trim();
        let punctuation = trimmed.is_empty() || PUNCTUATION.contains(trimmed);
        let starts_word = special || (with_space && !punctuation) || previous_special;
        match words.last_mut() {
            Some(word) if !starts_word => {
                word.text.push_str(trimmed);
                word.pieces.extend(glyph.pieces);
            }
            _ => words.push(TokenGroup {
                text: trimmed.to_string(),
                pieces: glyph.pieces,
            }),
        }
        previous_special = special;
    }
    words
}
