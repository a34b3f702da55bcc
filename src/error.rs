use thiserror::Error;

#[derive(Debug, Error)]
pub enum AlignmentError {
    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON parse error while {context}: {source}")]
    Json {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    /// The decoder collaborator violated its contract; the current run cannot
    /// be recovered locally.
    #[error("inconsistent decoder output ({context}): {message}")]
    Inconsistency {
        context: &'static str,
        message: String,
    },
    #[error("decoder failure: {message}")]
    Decoder { message: String },
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
}

impl AlignmentError {
    pub(crate) fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    pub(crate) fn json(context: &'static str, source: serde_json::Error) -> Self {
        Self::Json { context, source }
    }

    pub(crate) fn inconsistency(context: &'static str, message: impl Into<String>) -> Self {
        Self::Inconsistency {
            context,
            message: message.into(),
        }
    }

    pub fn decoder(err: impl std::fmt::Display) -> Self {
        Self::Decoder {
            message: err.to_string(),
        }
    }

    pub(crate) fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn is_inconsistency(&self) -> bool {
        matches!(self, Self::Inconsistency { .. })
    }
}
