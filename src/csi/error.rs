use thiserror::Error;
use tonic::Status;

pub type CsiResult<T> = Result<T, CsiError>;

/// Error kinds surfaced by the controller and node services.
///
/// Every layer below the RPC handlers either returns this type directly or an `anyhow::Error`
/// that is folded into [`CsiError::Internal`].
#[derive(Error, Debug)]
pub enum CsiError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl CsiError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(anyhow::anyhow!("{}", msg))
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }
}

impl From<CsiError> for Status {
    fn from(err: CsiError) -> Self {
        match err {
            CsiError::InvalidArgument(msg) => Status::invalid_argument(msg),
            CsiError::AlreadyExists(msg) => Status::already_exists(msg),
            CsiError::Internal(e) => Status::internal(format!("{:#}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use tonic::Code;

    #[test]
    fn test_invalid_argument_status() {
        let status: Status = CsiError::invalid_argument("Volume Name cannot be empty").into();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(status.message(), "Volume Name cannot be empty");
    }

    #[test]
    fn test_already_exists_status() {
        let status: Status = CsiError::already_exists("pvc-1").into();
        assert_eq!(status.code(), Code::AlreadyExists);
    }

    #[test]
    fn test_internal_status_keeps_context_chain() {
        let err: anyhow::Result<()> =
            Err(anyhow::anyhow!("exit status 1")).context("rbd create failed");
        let status: Status = CsiError::from(err.unwrap_err()).into();

        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), "rbd create failed: exit status 1");
    }

    #[test]
    fn test_error_display() {
        let err = CsiError::invalid_argument("missing monitors");
        assert_eq!(err.to_string(), "invalid argument: missing monitors");
        assert!(err.is_invalid_argument());
    }
}
