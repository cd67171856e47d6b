use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    Usage(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("permission denied: cannot {verb} pods/log in namespace {namespace}")]
    Forbidden { verb: String, namespace: String },

    #[error("csrf validation failed: {0}")]
    Csrf(String),

    #[error("source {source_id} failed: {message}")]
    Source { source_id: String, message: String },

    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("rpc failed: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("aggregate stream is closed")]
    Closed,
}

/// Coarse classification used by callers that only care about who is at fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Usage,
    Authentication,
    Authorization,
    Transport,
    Closed,
}

impl Error {
    pub fn usage(msg: impl Into<String>) -> Self {
        Error::Usage(msg.into())
    }

    pub fn source_failed(source_id: impl ToString, message: impl ToString) -> Self {
        Error::Source {
            source_id: source_id.to_string(),
            message: message.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Usage(_) => ErrorKind::Usage,
            Error::Unauthenticated(_) => ErrorKind::Authentication,
            Error::Forbidden { .. } | Error::Csrf(_) => ErrorKind::Authorization,
            Error::Rpc(status) => match status.code() {
                tonic::Code::Unauthenticated => ErrorKind::Authentication,
                tonic::Code::PermissionDenied => ErrorKind::Authorization,
                tonic::Code::InvalidArgument => ErrorKind::Usage,
                _ => ErrorKind::Transport,
            },
            Error::Source { .. } | Error::Kube(_) | Error::Io(_) => ErrorKind::Transport,
            Error::Closed => ErrorKind::Closed,
        }
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Rpc(status) => status,
            err => {
                let msg = err.to_string();
                match err.kind() {
                    ErrorKind::Usage => tonic::Status::invalid_argument(msg),
                    ErrorKind::Authentication => tonic::Status::unauthenticated(msg),
                    ErrorKind::Authorization => tonic::Status::permission_denied(msg),
                    ErrorKind::Closed => tonic::Status::cancelled(msg),
                    ErrorKind::Transport => tonic::Status::unavailable(msg),
                }
            }
        }
    }
}
