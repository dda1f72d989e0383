use axum::http::StatusCode;

#[derive(Debug, Clone)]
pub enum SnsError {
    TopicNotFound(String),
    SubscriptionNotFound(String),
    InvalidParameterValue(String),
    EmptyBatchRequest(String),
    TooManyEntriesInBatchRequest(String),
    BatchEntryIdsNotDistinct(String),
    ValidationError(String),
    InvalidAction(String),
}

impl SnsError {
    pub fn error_code(&self) -> &str {
        match self {
            SnsError::TopicNotFound(_) => "TopicNotFound",
            SnsError::SubscriptionNotFound(_) => "SubscriptionNotFound",
            SnsError::InvalidParameterValue(_) => "InvalidParameterValue",
            SnsError::EmptyBatchRequest(_) => "EmptyBatchRequest",
            SnsError::TooManyEntriesInBatchRequest(_) => "TooManyEntriesInBatchRequest",
            SnsError::BatchEntryIdsNotDistinct(_) => "BatchEntryIdsNotDistinct",
            SnsError::ValidationError(_) => "ValidationError",
            SnsError::InvalidAction(_) => "InvalidAction",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            SnsError::TopicNotFound(_) | SnsError::SubscriptionNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            _ => StatusCode::BAD_REQUEST,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            SnsError::TopicNotFound(m)
            | SnsError::SubscriptionNotFound(m)
            | SnsError::InvalidParameterValue(m)
            | SnsError::EmptyBatchRequest(m)
            | SnsError::TooManyEntriesInBatchRequest(m)
            | SnsError::BatchEntryIdsNotDistinct(m)
            | SnsError::ValidationError(m)
            | SnsError::InvalidAction(m) => m,
        }
    }
}
