use std::time::Duration;

use tonic::{Code, Status};

use super::ValidateDescriptorError;

/// Failures to set up, run or capture a process.
/// A process exiting with a non-zero code is not one of them.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to materialize inputs: {0}")]
    Materialization(String),

    #[error("executable {0:?} not found")]
    MissingExecutable(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to capture outputs: {0}")]
    Capture(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote executor could not be reached, even after retrying.
    #[error("remote executor unavailable: {0}")]
    Unavailable(String),
}

impl From<ValidateDescriptorError> for ExecutionError {
    fn from(value: ValidateDescriptorError) -> Self {
        Self::InvalidRequest(value.to_string())
    }
}

impl From<ExecutionError> for Status {
    fn from(value: ExecutionError) -> Self {
        match value {
            ExecutionError::InvalidRequest(msg) => Status::invalid_argument(msg),
            ExecutionError::Materialization(msg) => Status::failed_precondition(msg),
            ExecutionError::MissingExecutable(exe) => Status::not_found(exe),
            ExecutionError::Timeout(after) => {
                Status::deadline_exceeded(after.as_millis().to_string())
            }
            ExecutionError::Capture(msg) => Status::data_loss(msg),
            ExecutionError::Io(e) => Status::internal(e.to_string()),
            ExecutionError::Unavailable(msg) => Status::unavailable(msg),
        }
    }
}

impl From<Status> for ExecutionError {
    fn from(status: Status) -> Self {
        let msg = status.message().to_string();
        match status.code() {
            Code::InvalidArgument => Self::InvalidRequest(msg),
            Code::FailedPrecondition => Self::Materialization(msg),
            Code::NotFound => Self::MissingExecutable(msg),
            Code::DeadlineExceeded => {
                Self::Timeout(Duration::from_millis(msg.parse().unwrap_or_default()))
            }
            Code::DataLoss => Self::Capture(msg),
            Code::Unavailable => Self::Unavailable(msg),
            _ => Self::Io(std::io::Error::other(msg)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;

    use super::ExecutionError;

    #[rstest]
    #[case::invalid(ExecutionError::InvalidRequest("argv".into()))]
    #[case::materialization(ExecutionError::Materialization("gone".into()))]
    #[case::missing(ExecutionError::MissingExecutable("/bin/nope".into()))]
    #[case::timeout(ExecutionError::Timeout(Duration::from_millis(1500)))]
    #[case::capture(ExecutionError::Capture("out".into()))]
    fn status_roundtrip(#[case] error: ExecutionError) {
        let expected = error.to_string();
        let status: tonic::Status = error.into();
        assert_eq!(expected, ExecutionError::from(status).to_string());
    }
}
