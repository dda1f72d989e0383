use axum::http::StatusCode;

#[derive(Debug, Clone)]
pub enum SqsError {
    QueueNotFound(String),
    MessageTooBig(String),
    MessageDoesNotExist(String),
    MessageNotInFlight(String),
    InvalidParameterValue(String),
    InvalidAttributeValue(String),
    EmptyBatchRequest(String),
    TooManyEntriesInBatchRequest(String),
    BatchEntryIdsNotDistinct(String),
    ValidationError(String),
    InvalidAction(String),
}

impl SqsError {
    pub fn error_code(&self) -> &str {
        match self {
            SqsError::QueueNotFound(_) => "QueueNotFound",
            SqsError::MessageTooBig(_) => "MessageTooBig",
            SqsError::MessageDoesNotExist(_) => "MessageDoesNotExist",
            SqsError::MessageNotInFlight(_) => "MessageNotInFlight",
            SqsError::InvalidParameterValue(_) => "InvalidParameterValue",
            SqsError::InvalidAttributeValue(_) => "InvalidAttributeValue",
            SqsError::EmptyBatchRequest(_) => "EmptyBatchRequest",
            SqsError::TooManyEntriesInBatchRequest(_) => "TooManyEntriesInBatchRequest",
            SqsError::BatchEntryIdsNotDistinct(_) => "BatchEntryIdsNotDistinct",
            SqsError::ValidationError(_) => "ValidationError",
            SqsError::InvalidAction(_) => "InvalidAction",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            SqsError::MessageDoesNotExist(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            SqsError::QueueNotFound(m)
            | SqsError::MessageTooBig(m)
            | SqsError::MessageDoesNotExist(m)
            | SqsError::MessageNotInFlight(m)
            | SqsError::InvalidParameterValue(m)
            | SqsError::InvalidAttributeValue(m)
            | SqsError::EmptyBatchRequest(m)
            | SqsError::TooManyEntriesInBatchRequest(m)
            | SqsError::BatchEntryIdsNotDistinct(m)
            | SqsError::ValidationError(m)
            | SqsError::InvalidAction(m) => m,
        }
    }
}
