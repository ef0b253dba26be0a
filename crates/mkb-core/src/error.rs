//! Error types shared across the gateway.
//!
//! [`ClientError`] describes a failed call to an external collaborator
//! (knowledge base, model endpoint, object storage, agent). [`ServiceError`]
//! is what the operations return to the HTTP layer, which maps each variant
//! to a status code.

/// Failure of an outbound call to an external service.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    /// The service answered, but reported a non-zero application code.
    #[error("service returned code {code}: {message}")]
    Application { code: i64, message: String },

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("agent error: {0}")]
    Agent(String),

    #[error("client not configured: {0}")]
    Config(String),
}

/// Error returned by the gateway operations.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The request was missing a required field or was malformed.
    #[error("{0}")]
    Validation(String),

    /// A referenced resource (session, knowledge base, file) does not exist.
    #[error("{0}")]
    NotFound(String),

    /// An external dependency failed.
    #[error("{context}: {source}")]
    Upstream {
        context: String,
        #[source]
        source: ClientError,
    },
}

impl ServiceError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn upstream(context: impl Into<String>, source: ClientError) -> Self {
        Self::Upstream {
            context: context.into(),
            source,
        }
    }
}

/// Reject an empty (or whitespace-only) required field.
pub(crate) fn require(value: &str, field: &str) -> Result<(), ServiceError> {
    if value.trim().is_empty() {
        return Err(ServiceError::validation(format!("{field} is required")));
    }
    Ok(())
}
