use thiserror::Error;

use crate::events::Envelope;

#[derive(Debug, Error)]
pub enum CreditError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("usage query failed: {0}")]
    UsageQuery(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("{failed} of {total} entitlements failed, narrowed retry batch prepared")]
    PartialBatch {
        failed: usize,
        total: usize,
        retry: Vec<Envelope>,
    },
    #[error("{}", join_messages(.0))]
    Multiple(Vec<CreditError>),
}

impl CreditError {
    pub fn validation(message: impl Into<String>) -> Self {
        CreditError::Validation(message.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        CreditError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether the outer router should redeliver the message that produced this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            CreditError::Validation(_) | CreditError::NotFound { .. } | CreditError::Serde(_) => {
                false
            }
            CreditError::Db(sqlx::Error::RowNotFound) => false,
            CreditError::Db(_)
            | CreditError::UsageQuery(_)
            | CreditError::Publish(_)
            | CreditError::Cancelled
            | CreditError::PartialBatch { .. } => true,
            CreditError::Multiple(errors) => errors.iter().any(CreditError::is_retryable),
        }
    }

    /// Collapses collected errors: `None` when empty, the error itself when alone.
    pub fn join(mut errors: Vec<CreditError>) -> Option<CreditError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(CreditError::Multiple(errors)),
        }
    }
}

fn join_messages(errors: &[CreditError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type CreditResult<T> = Result<T, CreditError>;
