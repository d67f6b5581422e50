//! Relay error taxonomy and its mapping onto wire error codes.

use crate::chat_history::ChatHistoryError;
use crate::protocol::{ErrorCode, ErrorPayload};
use crate::provider::ProviderError;
use crate::router_client::RouteError;
use crate::routing::RoutingError;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No usable provider: {0}")]
    NoUsableProvider(String),

    #[error("Unsupported task: {message}")]
    UnsupportedTask {
        category: String,
        message: String,
        alternatives: Vec<String>,
    },

    #[error("Adapter construction failed: {0}")]
    AdapterConstruction(#[from] ProviderError),

    #[error("Provider stream failed: {0}")]
    Stream(String),

    #[error("All providers failed: {0}")]
    AllAttemptsFailed(String),

    #[error("Persistence failed: {0}")]
    Persistence(#[from] ChatHistoryError),

    #[error("Router unavailable: {0}")]
    Router(#[from] RouteError),
}

impl From<RoutingError> for RelayError {
    fn from(err: RoutingError) -> Self {
        RelayError::NoUsableProvider(err.to_string())
    }
}

impl RelayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RelayError::Validation(_) | RelayError::NotFound(_) => ErrorCode::ValidationError,
            RelayError::NoUsableProvider(_) => ErrorCode::NoUsableProvider,
            RelayError::UnsupportedTask { .. } => ErrorCode::UnsupportedTask,
            RelayError::AdapterConstruction(_) | RelayError::Stream(_) => ErrorCode::ProviderError,
            RelayError::AllAttemptsFailed(_) => ErrorCode::AllProvidersFailed,
            RelayError::Persistence(_) => ErrorCode::PersistenceError,
            RelayError::Router(_) => ErrorCode::RouterError,
        }
    }

    /// HTTP status used when the error is reported before the stream opens.
    pub fn status(&self) -> http::StatusCode {
        match self {
            RelayError::Validation(_) => http::StatusCode::BAD_REQUEST,
            RelayError::NotFound(_) => http::StatusCode::NOT_FOUND,
            RelayError::NoUsableProvider(_) | RelayError::Router(_) => {
                http::StatusCode::SERVICE_UNAVAILABLE
            }
            RelayError::UnsupportedTask { .. } => http::StatusCode::UNPROCESSABLE_ENTITY,
            RelayError::AdapterConstruction(_)
            | RelayError::Stream(_)
            | RelayError::AllAttemptsFailed(_) => http::StatusCode::BAD_GATEWAY,
            RelayError::Persistence(_) => http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error record payload for the outward stream.
    pub fn to_payload(&self) -> ErrorPayload {
        let mut payload = ErrorPayload::new(self.code(), self.to_string());
        if let RelayError::UnsupportedTask {
            category,
            message,
            alternatives,
        } = self
        {
            payload.message = message.clone();
            payload.category = Some(category.clone());
            payload.alternatives = Some(alternatives.clone());
        }
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(
            RelayError::Validation("empty".into()).code(),
            ErrorCode::ValidationError
        );
        assert_eq!(
            RelayError::from(RoutingError::NoUsableProvider).code(),
            ErrorCode::NoUsableProvider
        );
        assert_eq!(
            RelayError::from(ProviderError::MissingCredential("openai".into())).code(),
            ErrorCode::ProviderError
        );
        assert_eq!(
            RelayError::from(RouteError::Timeout("2s".into())).code(),
            ErrorCode::RouterError
        );
        assert_eq!(
            RelayError::NotFound("conversation".into()).status(),
            http::StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_unsupported_payload_carries_alternatives() {
        let err = RelayError::UnsupportedTask {
            category: "video".into(),
            message: "Video generation is not supported".into(),
            alternatives: vec!["text".into(), "image".into()],
        };
        let payload = err.to_payload();
        assert_eq!(payload.code, ErrorCode::UnsupportedTask);
        assert_eq!(payload.message, "Video generation is not supported");
        assert_eq!(payload.category.as_deref(), Some("video"));
        assert_eq!(payload.alternatives.map(|a| a.len()), Some(2));
    }
}
