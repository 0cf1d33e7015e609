use core::error::Error;

use poem::http::StatusCode;
use registry::RegistryError;

/// API errors
#[derive(Debug, derive_more::Display)]
pub enum ApiError {
    #[display("Server error: {message}")]
    ServerError { message: String },
}

impl Error for ApiError {}

/// Maps a registry failure onto an HTTP error.
///
/// Lock contention is reported as temporary unavailability.
pub fn registry_error(error: RegistryError) -> poem::Error {
    let status = if error.is_transient() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    poem::Error::from_string(error.to_string(), status)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use api_types::Eid;

    use super::*;

    #[test]
    fn lock_timeout_is_service_unavailable() {
        let error = registry_error(RegistryError::LockTimeout {
            waited: Duration::from_secs(1),
        });
        assert_eq!(error.status(), StatusCode::SERVICE_UNAVAILABLE);

        let error = registry_error(RegistryError::CorruptRecord {
            eid: Some(Eid::from("e1")),
            reason: "bad".to_string(),
        });
        assert_eq!(error.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn server_error_display() {
        let error = ApiError::ServerError {
            message: "bind failed".to_string(),
        };
        assert_eq!(error.to_string(), "Server error: bind failed");
    }
}
