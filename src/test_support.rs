//! Shared fixtures for unit tests.

use crate::pipeline::defaults::PieceVocabulary;
use crate::pipeline::traits::SpecialTokens;

pub(crate) const EOT: u32 = 100;
pub(crate) const SOT: u32 = 101;
pub(crate) const SOT_PREV: u32 = 102;
pub(crate) const NO_SPEECH: u32 = 103;
pub(crate) const TRANSCRIBE: u32 = 104;
pub(crate) const LANG_EN: u32 = 105;
pub(crate) const LANG_JA: u32 = 106;
pub(crate) const TS_BEGIN: u32 = 110;

pub(crate) fn special_tokens() -> SpecialTokens {
    SpecialTokens {
        eot: EOT,
        sot: SOT,
        sot_prev: SOT_PREV,
        timestamp_begin: TS_BEGIN,
    }
}

/// Vocabulary whose text token `i` decodes to `pieces[i]`.
pub(crate) fn vocabulary(pieces: &[&str]) -> PieceVocabulary {
    let bytes: Vec<&[u8]> = pieces.iter().map(|p| p.as_bytes()).collect();
    byte_vocabulary(&bytes)
}

pub(crate) fn byte_vocabulary(pieces: &[&[u8]]) -> PieceVocabulary {
    PieceVocabulary::new(
        special_tokens(),
        pieces
            .iter()
            .enumerate()
            .map(|(id, bytes)| (id as u32, bytes.to_vec())),
    )
    .with_special_name(EOT, "endoftext")
    .with_special_name(SOT, "startoftranscript")
    .with_special_name(SOT_PREV, "startofprev")
    .with_special_name(NO_SPEECH, "nospeech")
    .with_special_name(TRANSCRIBE, "transcribe")
    .with_special_name(LANG_EN, "en")
    .with_special_name(LANG_JA, "ja")
}
