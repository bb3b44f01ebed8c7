use thiserror::Error;

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("internal error: {0}")]
    InternalError(String),
    #[error("error in Kubernetes API: {0}")]
    KubernetesError(#[from] kube::Error),
    #[error(transparent)]
    CommonError(#[from] keel_common::error::CommonError),
}
