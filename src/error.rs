use thiserror::Error;

pub type KeyResult<T> = Result<T, KeyError>;

/// Failures surfaced to callers of the keying engine.
///
/// Per-pixel classification and compositing never fail; transient states
/// (source not sized yet, background still decoding) are reported through
/// status values instead of errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// Capture device denied or absent, or a file that cannot be decoded.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// A paused or ended source that could not be restarted.
    #[error("source stalled: {0}")]
    StalledSource(String),

    #[error("recorder failure: {0}")]
    Recorder(String),

    #[error("export failure: {0}")]
    Export(String),

    #[error("invalid key config: {0}")]
    InvalidConfig(String),
}

impl KeyError {
    pub fn source_unavailable(msg: impl Into<String>) -> Self {
        Self::SourceUnavailable(msg.into())
    }

    pub fn stalled(msg: impl Into<String>) -> Self {
        Self::StalledSource(msg.into())
    }

    pub fn recorder(msg: impl Into<String>) -> Self {
        Self::Recorder(msg.into())
    }

    pub fn export(msg: impl Into<String>) -> Self {
        Self::Export(msg.into())
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes_are_stable() {
        assert!(KeyError::source_unavailable("x")
            .to_string()
            .starts_with("source unavailable:"));
        assert!(KeyError::stalled("x")
            .to_string()
            .starts_with("source stalled:"));
        assert!(KeyError::recorder("x")
            .to_string()
            .starts_with("recorder failure:"));
        assert!(KeyError::export("x")
            .to_string()
            .starts_with("export failure:"));
        assert!(KeyError::invalid_config("x")
            .to_string()
            .starts_with("invalid key config:"));
    }

    #[test]
    fn kinds_are_distinguishable() {
        assert_ne!(KeyError::recorder("boom"), KeyError::export("boom"));
        assert!(matches!(
            KeyError::stalled("clip"),
            KeyError::StalledSource(msg) if msg == "clip"
        ));
    }
}
