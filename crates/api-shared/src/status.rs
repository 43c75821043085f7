//! Mapping of core errors onto gRPC status codes.

use clinic_core::{ClinicError, ErrorKind};
use tonic::{Code, Status};

pub fn code_for(kind: ErrorKind) -> Code {
    match kind {
        ErrorKind::NotAuthenticated => Code::Unauthenticated,
        ErrorKind::Forbidden => Code::PermissionDenied,
        ErrorKind::NotFound => Code::NotFound,
        ErrorKind::InvalidState => Code::FailedPrecondition,
        ErrorKind::InvalidInput => Code::InvalidArgument,
        ErrorKind::PersistenceFailure => Code::Internal,
    }
}

/// Converts a core error into a status.
///
/// Persistence failures are logged in full and reported without detail.
pub fn to_status(err: ClinicError) -> Status {
    let kind = err.kind();
    if kind == ErrorKind::PersistenceFailure {
        tracing::error!("request failed: {}", err);
        return Status::internal("Internal error");
    }
    Status::new(code_for(kind), err.to_string())
}
