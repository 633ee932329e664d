use std::fmt;

/// Result alias used across the crate.
pub type MontageResult<T> = Result<T, MontageError>;

/// Lifecycle state of an encoder or decoder, reported in codec diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CodecState {
    /// Created but `configure` has not succeeded yet.
    Unconfigured,
    /// Accepting input.
    Configured,
    /// Closed; every further call fails.
    Closed,
}

impl fmt::Display for CodecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unconfigured => "unconfigured",
            Self::Configured => "configured",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Context attached to every codec failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodecDiagnostics {
    /// Codec string of the failing encoder/decoder.
    pub codec: String,
    /// State of the codec when the failure happened.
    pub state: CodecState,
    /// Number of inputs queued but not yet processed.
    pub queue_size: usize,
    /// Timestamp (microseconds) of the input that failed, when known.
    pub timestamp: Option<i64>,
}

impl fmt::Display for CodecDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "codec={} state={} queue_size={}",
            self.codec, self.state, self.queue_size
        )?;
        match self.timestamp {
            Some(ts) => write!(f, " timestamp={ts}us"),
            None => write!(f, " timestamp=n/a"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum MontageError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("sequencing error: {0}")]
    Sequence(String),

    #[error("codec error: {message} ({diagnostics})")]
    Codec {
        message: String,
        diagnostics: CodecDiagnostics,
    },

    #[error("container error: {0}")]
    Container(String),

    #[error("composition cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MontageError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn sequence(msg: impl Into<String>) -> Self {
        Self::Sequence(msg.into())
    }

    pub fn codec(msg: impl Into<String>, diagnostics: CodecDiagnostics) -> Self {
        Self::Codec {
            message: msg.into(),
            diagnostics,
        }
    }

    pub fn container(msg: impl Into<String>) -> Self {
        Self::Container(msg.into())
    }

    /// `true` for errors that only report that the composition was stopped from outside.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
#[path = "../../tests/unit/foundation/error.rs"]
mod tests;
