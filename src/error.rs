use thiserror::Error;

use crate::models::StudentId;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SourceError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("request rejected: {0}")]
    Rejected(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SourceError::Decode(err.to_string())
        } else {
            SourceError::Transport(err.to_string())
        }
    }
}

impl From<sqlx::Error> for SourceError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                SourceError::Decode(err.to_string())
            }
            other => SourceError::Transport(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("student name must not be empty")]
    EmptyName,

    #[error("grade {0} is outside the 0-10 range")]
    GradeOutOfRange(f64),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum MutationError {
    #[error("student {0} not found")]
    NotFound(StudentId),

    #[error("failed to write student {student_id}: {reason}")]
    WriteFailed { student_id: StudentId, reason: String },

    #[error("could not reach the roster service: {0}")]
    Transport(String),

    #[error("invalid mutation: {0}")]
    Invalid(String),

    #[error("superseded by a newer request of the same kind")]
    Superseded,

    #[error("mutation coordinator is shut down")]
    Closed,

    #[error("mutation panicked: {0}")]
    Panicked(String),
}

impl From<ValidationError> for MutationError {
    fn from(err: ValidationError) -> Self {
        MutationError::Invalid(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("scheduler has been shut down")]
    Terminated,
}
