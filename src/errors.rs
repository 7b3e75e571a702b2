use thiserror::Error;

/// Failures that can surface while driving a connection through the
/// handler pipeline.
///
/// `Timeout` is special: intermediate recovery sites re-raise it untouched
/// so that the per-event dispatch loop is the only place that converts it
/// into an event outcome.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("timeout at {site}")]
    Timeout { site: String },

    #[error("handler {handler} failed: {message}")]
    Handler { handler: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

impl PipelineError {
    pub fn timeout(site: impl Into<String>) -> Self {
        PipelineError::Timeout { site: site.into() }
    }

    pub fn handler(handler: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Handler {
            handler: handler.into(),
            message: message.into(),
        }
    }

    /// True when this failure carries the timeout tag and must unwind the
    /// current event instead of being recovered in place.
    pub fn is_timeout(&self) -> bool {
        matches!(self, PipelineError::Timeout { .. })
    }
}
