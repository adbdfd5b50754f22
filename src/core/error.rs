use thiserror::Error;

/// Failure classes the orchestrator distinguishes between.
///
/// Most code propagates `anyhow::Error`; these variants are attached at the
/// point of failure so callers can `downcast_ref` when the class matters.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{service} call failed: {message}")]
    TransientExternal { service: String, message: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("missing dependency: {0}")]
    MissingDependency(String),

    #[error("project not found: {0}")]
    NotFound(String),

    #[error("not authorized to access project {0}")]
    Forbidden(String),

    #[error("media tool {tool} failed: {message}")]
    Media { tool: String, message: String },
}

impl PipelineError {
    pub fn external(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientExternal {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Failures another attempt cannot fix.
    pub fn is_permanent(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<PipelineError>(),
            Some(
                PipelineError::Validation(_)
                    | PipelineError::MissingDependency(_)
                    | PipelineError::NotFound(_)
                    | PipelineError::Forbidden(_)
            )
        )
    }
}
