use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::AlignmentError;

/// Duration of one encoder output frame (two mel hops at 16 kHz).
pub const AUDIO_TIME_PER_FRAME: f64 = 0.02;
/// Duration of one mel frame. Decoder `seek` positions are expressed in mel frames.
pub const MEL_FRAME_SECONDS: f64 = 0.01;
/// Text of the standalone word emitted for a detected disfluency.
pub const DISFLUENCY_MARK: &str = "[*]";

/// How decoder timestamp tokens are used to cut the token stream into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampMode {
    /// Every consecutive timestamp pair closes a chunk that is aligned on its own.
    #[default]
    Trusted,
    /// One alignment per decoding window, re-split into segments afterwards.
    WholeWindow,
}

/// Whether a word's span extends over its trailing punctuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PunctuationTiming {
    /// Trailing punctuation extends the word, except for the last word of a chunk.
    #[default]
    Attached,
    /// Words end where their last non-punctuation token ends.
    Separate,
}

/// Which cross-attention heads are averaged before DTW.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum HeadSelection {
    /// Every head of every layer the decoder reports.
    #[default]
    All,
    /// Every head of the last `n` reported layers.
    TopLayers(usize),
    /// Heads known to correlate with word timing for a given model.
    Mask(AlignmentHeads),
}

/// Boolean (layer, head) mask published per model, passed in as a config artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignmentHeads {
    pub num_layers: usize,
    pub num_heads: usize,
    /// `(layer, head)` pairs selected for alignment.
    pub heads: Vec<(usize, usize)>,
}

impl AlignmentHeads {
    pub fn load(path: &Path) -> Result<Self, AlignmentError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| AlignmentError::io("read alignment heads", e))?;
        let heads: Self = serde_json::from_str(&data)
            .map_err(|e| AlignmentError::json("parse alignment heads", e))?;
        heads.validate()?;
        Ok(heads)
    }

    pub fn validate(&self) -> Result<(), AlignmentError> {
        if self.heads.is_empty() {
            return Err(AlignmentError::invalid_input(
                "alignment head mask selects no heads",
            ));
        }
        if let Some(&(layer, head)) = self
            .heads
            .iter()
            .find(|&&(layer, head)| layer >= self.num_layers || head >= self.num_heads)
        {
            return Err(AlignmentError::invalid_input(format!(
                "alignment head ({layer}, {head}) outside a {}x{} mask",
                self.num_layers, self.num_heads
            )));
        }
        Ok(())
    }
}

/// Geometry of the decoder the aligner is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderDims {
    /// Text context length (prompt plus generated tokens).
    pub n_text_ctx: usize,
    /// Encoder output frames per decoding window.
    pub n_audio_ctx: usize,
    /// Maximum number of sampled tokens per window; defaults to half the text context.
    pub sample_len: Option<usize>,
}

impl DecoderDims {
    pub fn max_sample_len(&self) -> usize {
        self.sample_len.unwrap_or(self.n_text_ctx / 2)
    }
}

impl Default for DecoderDims {
    fn default() -> Self {
        Self {
            n_text_ctx: 448,
            n_audio_ctx: 1500,
            sample_len: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignerConfig {
    /// Language code or name. `None` picks up the language from the window prompt.
    pub language: Option<String>,
    pub remove_punctuation_from_words: bool,
    pub compute_word_confidence: bool,
    pub include_punctuation_in_confidence: bool,
    pub punctuation_timing: PunctuationTiming,
    /// Seconds by which chunk boundaries may move past the decoder's own timestamps.
    /// Must be a multiple of [`AUDIO_TIME_PER_FRAME`].
    pub refine_whisper_precision: f64,
    /// Floor applied by timeline repair, in seconds.
    pub min_word_duration: f64,
    pub detect_disfluencies: bool,
    pub timestamp_mode: TimestampMode,
    /// Whole-window mode only: keep interior timestamps as alignment anchors.
    pub use_timestamps_for_alignment: bool,
    pub head_selection: HeadSelection,
    pub medfilt_width: usize,
    pub qk_scale: f64,
    /// Allow two tokens to start on the same frame during DTW.
    pub subwords_can_be_empty: bool,
    /// Sampling temperature of the decoder. Arg-max fallbacks are only reliable at zero.
    pub temperature: f64,
    pub no_speech_threshold: Option<f64>,
    pub logprob_threshold: Option<f64>,
    pub dims: DecoderDims,
}

impl AlignerConfig {
    pub const DEFAULT_REFINE_PRECISION_SEC: f64 = 0.5;
    pub const DEFAULT_MIN_WORD_DURATION_SEC: f64 = 0.02;
    pub const DEFAULT_MEDFILT_WIDTH: usize = 9;

    pub fn load(path: &Path) -> Result<Self, AlignmentError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| AlignmentError::io("read aligner config", e))?;
        let config: Self = serde_json::from_str(&data)
            .map_err(|e| AlignmentError::json("parse aligner config", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AlignmentError> {
        let refine = self.refine_whisper_precision;
        let ratio = refine / AUDIO_TIME_PER_FRAME;
        if !refine.is_finite() || refine < 0.0 || (ratio - ratio.round()).abs() > 1e-6 {
            return Err(AlignmentError::invalid_input(format!(
                "refine_whisper_precision must be a non-negative multiple of {AUDIO_TIME_PER_FRAME}, got {refine}"
            )));
        }
        if !self.min_word_duration.is_finite() || self.min_word_duration < 0.0 {
            return Err(AlignmentError::invalid_input(format!(
                "min_word_duration must be non-negative, got {}",
                self.min_word_duration
            )));
        }
        if self.medfilt_width == 0 || self.medfilt_width % 2 == 0 {
            return Err(AlignmentError::invalid_input(format!(
                "medfilt_width must be odd, got {}",
                self.medfilt_width
            )));
        }
        if !self.qk_scale.is_finite() || self.qk_scale <= 0.0 {
            return Err(AlignmentError::invalid_input(format!(
                "qk_scale must be positive, got {}",
                self.qk_scale
            )));
        }
        match &self.head_selection {
            HeadSelection::TopLayers(0) => {
                return Err(AlignmentError::invalid_input(
                    "head_selection top_layers must be strictly positive",
                ));
            }
            HeadSelection::Mask(heads) => heads.validate()?,
            _ => {}
        }
        if self.dims.n_audio_ctx == 0 || self.dims.max_sample_len() < 2 {
            return Err(AlignmentError::invalid_input(format!(
                "decoder dims too small: {:?}",
                self.dims
            )));
        }
        Ok(())
    }

    /// Refinement margin expressed in encoder frames.
    pub fn refine_frames(&self) -> usize {
        (self.refine_whisper_precision / AUDIO_TIME_PER_FRAME).round() as usize
    }

    pub fn is_trusted(&self) -> bool {
        self.timestamp_mode == TimestampMode::Trusted
    }
}

impl Default for AlignerConfig {
    fn default() -> Self {
        Self {
            language: None,
            remove_punctuation_from_words: false,
            compute_word_confidence: true,
            include_punctuation_in_confidence: false,
            punctuation_timing: PunctuationTiming::Attached,
            refine_whisper_precision: Self::DEFAULT_REFINE_PRECISION_SEC,
            min_word_duration: Self::DEFAULT_MIN_WORD_DURATION_SEC,
            detect_disfluencies: false,
            timestamp_mode: TimestampMode::Trusted,
            use_timestamps_for_alignment: true,
            head_selection: HeadSelection::All,
            medfilt_width: Self::DEFAULT_MEDFILT_WIDTH,
            qk_scale: 1.0,
            subwords_can_be_empty: true,
            temperature: 0.0,
            no_speech_threshold: Some(0.6),
            logprob_threshold: Some(-1.0),
            dims: DecoderDims::default(),
        }
    }
}
