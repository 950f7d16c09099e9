use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Internal error taxonomy. Variants map onto the wire `__type` codes;
/// `InvalidPassword` deliberately serializes as `NotAuthorizedException`
/// to match the upstream service.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CognitoError {
    #[error("{0}")]
    NotAuthorized(String),
    #[error("Incorrect username or password.")]
    InvalidPassword,
    #[error("User does not exist: {0}")]
    UserNotFound(String),
    #[error("User is not confirmed.")]
    UserNotConfirmed,
    #[error("Password reset required for the user")]
    PasswordResetRequired,
    #[error("{0}")]
    CodeMismatch(String),
    #[error("Invalid code provided, please request a code again.")]
    ExpiredCode,
    #[error("{0}")]
    InvalidParameter(String),
    #[error("Password did not conform with policy: {0}")]
    PasswordPolicyViolation(String),
    #[error("User already exists: {0}")]
    UsernameExists(String),
    #[error("Group already exists: {0}")]
    GroupExists(String),
    #[error("{0}")]
    ResourceNotFound(String),
    #[error("Unsupported: {0}")]
    Unsupported(String),
    /// A trigger handler reported a failure; the wire code is whatever the
    /// handler reported, or InternalErrorException when it reported none.
    #[error("{message}")]
    Trigger {
        code: Option<String>,
        message: String,
    },
    #[error("{0}")]
    InternalError(String),
}

impl CognitoError {
    pub fn error_code(&self) -> &str {
        match self {
            CognitoError::NotAuthorized(_) | CognitoError::InvalidPassword => {
                "NotAuthorizedException"
            }
            CognitoError::UserNotFound(_) => "UserNotFoundException",
            CognitoError::UserNotConfirmed => "UserNotConfirmedException",
            CognitoError::PasswordResetRequired => "PasswordResetRequiredException",
            CognitoError::CodeMismatch(_) => "CodeMismatchException",
            CognitoError::ExpiredCode => "ExpiredCodeException",
            CognitoError::InvalidParameter(_) => "InvalidParameterException",
            CognitoError::PasswordPolicyViolation(_) => "InvalidPasswordException",
            CognitoError::UsernameExists(_) => "UsernameExistsException",
            CognitoError::GroupExists(_) => "GroupExistsException",
            CognitoError::ResourceNotFound(_) => "ResourceNotFoundException",
            CognitoError::Unsupported(_) => "UnsupportedOperationException",
            CognitoError::Trigger { code, .. } => {
                code.as_deref().unwrap_or("InternalErrorException")
            }
            CognitoError::InternalError(_) => "InternalErrorException",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            CognitoError::InternalError(_) | CognitoError::Trigger { code: None, .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for CognitoError {
    fn into_response(self) -> Response {
        let body = json!({
            "__type": self.error_code(),
            "message": self.to_string(),
        });
        (self.status_code(), axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_password_maps_to_not_authorized_on_the_wire() {
        assert_eq!(
            CognitoError::InvalidPassword.error_code(),
            "NotAuthorizedException"
        );
    }

    #[test]
    fn trigger_failure_uses_reported_code() {
        let err = CognitoError::Trigger {
            code: Some("UserLambdaValidationException".into()),
            message: "rejected".into(),
        };
        assert_eq!(err.error_code(), "UserLambdaValidationException");

        let err = CognitoError::Trigger {
            code: None,
            message: "boom".into(),
        };
        assert_eq!(err.error_code(), "InternalErrorException");
    }
}
