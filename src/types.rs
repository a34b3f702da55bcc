use serde::{Deserialize, Serialize};

use crate::error::AlignmentError;

/// Cross-attention of the newest decoder position for one forward pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepAttention {
    pub layers: usize,
    pub heads: usize,
    pub frames: usize,
    /// Row-major `[layer][head][frame]`.
    pub weights: Vec<f32>,
}

impl StepAttention {
    pub fn new(
        layers: usize,
        heads: usize,
        frames: usize,
        weights: Vec<f32>,
    ) -> Result<Self, AlignmentError> {
        let attention = Self {
            layers,
            heads,
            frames,
            weights,
        };
        attention.check_shape()?;
        Ok(attention)
    }

    pub(crate) fn check_shape(&self) -> Result<(), AlignmentError> {
        let expected = self.layers * self.heads * self.frames;
        if self.weights.len() != expected || expected == 0 {
            return Err(AlignmentError::inconsistency(
                "attention shape",
                format!(
                    "{} weights for {} layers x {} heads x {} frames",
                    self.weights.len(),
                    self.layers,
                    self.heads,
                    self.frames
                ),
            ));
        }
        Ok(())
    }

    pub fn head(&self, layer: usize, head: usize) -> &[f32] {
        let offset = (layer * self.heads + head) * self.frames;
        &self.weights[offset..offset + self.frames]
    }
}

/// Log-mel features of the current decoding window, row-major `[mel][frame]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureWindow {
    pub n_mels: usize,
    pub frames: usize,
    pub values: Vec<f32>,
}

impl FeatureWindow {
    pub(crate) fn value(&self, mel: usize, frame: usize) -> f32 {
        self.values[mel * self.frames + frame]
    }

    pub(crate) fn is_well_formed(&self) -> bool {
        self.n_mels > 0 && self.values.len() == self.n_mels * self.frames
    }
}

/// One decoder forward pass, as observed by the aligner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodeStep {
    /// Tokens fed at this step. A full prompt opens a window; later steps feed one token.
    pub input_tokens: Vec<u32>,
    pub attention: StepAttention,
    /// Unnormalized scores for the next token.
    pub logits: Vec<f32>,
    /// Only reported on the step that opens a window.
    #[serde(default)]
    pub no_speech_prob: Option<f64>,
    /// Only reported on the step that opens a window.
    #[serde(default)]
    pub features: Option<FeatureWindow>,
}

/// A segment as finalized by the decoder itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedSegment {
    /// Window offset in mel frames.
    pub seek: usize,
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub tokens: Vec<u32>,
    #[serde(default)]
    pub avg_logprob: Option<f64>,
    #[serde(default)]
    pub no_speech_prob: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Transcription {
    pub segments: Vec<DecodedSegment>,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    pub text: String,
    /// Seconds from the start of the audio.
    pub start: f64,
    pub end: f64,
    /// `exp` of the mean token log-probability, in [0, 1]. `None` for disfluency
    /// markers or when confidence is disabled.
    pub confidence: Option<f64>,
    pub is_disfluency: bool,
    pub tokens: Vec<u32>,
    /// False when the word's last token was chosen by fallback rather than sampled.
    pub logprob_reliable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: usize,
    pub seek: usize,
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub tokens: Vec<u32>,
    pub avg_logprob: Option<f64>,
    pub no_speech_prob: Option<f64>,
    pub confidence: Option<f64>,
    pub words: Vec<Word>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TimestampedTranscript {
    pub text: String,
    pub language: Option<String>,
    pub segments: Vec<Segment>,
}

impl TimestampedTranscript {
    pub fn words(&self) -> impl Iterator<Item = &Word> {
        self.segments.iter().flat_map(|segment| segment.words.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_attention_rejects_wrong_length() {
        assert!(StepAttention::new(2, 3, 4, vec![0.0; 23]).is_err());
        assert!(StepAttention::new(0, 3, 4, Vec::new()).is_err());
        let attention = StepAttention::new(2, 3, 4, (0..24).map(|v| v as f32).collect())
            .expect("shape matches");
        assert_eq!(attention.head(1, 2), &[20.0, 21.0, 22.0, 23.0]);
    }

    #[test]
    fn decode_step_optional_fields_default_to_none() {
        let json = r#"{
            "input_tokens": [5],
            "attention": { "layers": 1, "heads": 1, "frames": 2, "weights": [0.5, 0.5] },
            "logits": [0.0, 1.0]
        }"#;
        let step: DecodeStep = serde_json::from_str(json).expect("valid step json");
        assert_eq!(step.no_speech_prob, None);
        assert!(step.features.is_none());
    }
}
