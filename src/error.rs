//! Error types for the CloudFormation extension runtime.
//!
//! Handler code and the runtime itself report failures through
//! [`ExtensionError`]. Every variant maps onto a wire-level
//! [`HandlerErrorCode`], so an error can always be turned into a
//! FAILED [`ProgressEvent`] at the entry point.

use thiserror::Error;

use crate::interface::{HandlerErrorCode, ProgressEvent};

/// Result alias used throughout the runtime.
pub type ExtensionResult<T> = Result<T, ExtensionError>;

/// The main error type for the extension runtime.
#[derive(Debug, Error)]
pub enum ExtensionError {
    /// A failure that belongs to the CloudFormation handler error taxonomy.
    #[error("{message}")]
    Handler {
        /// The wire error code reported to CloudFormation
        code: HandlerErrorCode,
        /// Human readable description
        message: String,
    },

    /// Credentials could not be decrypted.
    #[error("Failed to decrypt credentials. {message}")]
    Encryption {
        /// Error message describing what went wrong
        message: String,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {message}")]
    SerDes {
        /// Error message describing the serialization failure
        message: String,
    },

    /// Validation error for invalid arguments.
    #[error("Validation error: {message}")]
    Validation {
        /// Error message describing the validation failure
        message: String,
    },

    /// An AWS API call made by the runtime failed.
    #[error("{service} returned {code}: {message}")]
    Service {
        /// Service signing name, e.g. `events` or `logs`
        service: String,
        /// The AWS error code, e.g. `ResourceNotFoundException`
        code: String,
        /// The AWS error message
        message: String,
        /// HTTP status, absent for transport failures
        status: Option<u16>,
    },

    /// A write handler did not return before its deadline.
    #[error("Handler timed out: {message}")]
    Timeout {
        /// Error message describing the timeout
        message: String,
    },
}

impl ExtensionError {
    /// Creates a taxonomy error with an explicit code.
    pub fn handler(code: HandlerErrorCode, message: impl Into<String>) -> Self {
        Self::Handler {
            code,
            message: message.into(),
        }
    }

    /// Creates an `InvalidRequest` error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::handler(HandlerErrorCode::InvalidRequest, message)
    }

    /// Creates an `InternalFailure` error.
    pub fn internal_failure(message: impl Into<String>) -> Self {
        Self::handler(HandlerErrorCode::InternalFailure, message)
    }

    /// Creates an `AccessDenied` error.
    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::handler(HandlerErrorCode::AccessDenied, message)
    }

    /// Creates a `NotUpdatable` error.
    pub fn not_updatable(message: impl Into<String>) -> Self {
        Self::handler(HandlerErrorCode::NotUpdatable, message)
    }

    /// Creates a `ResourceConflict` error.
    pub fn resource_conflict(message: impl Into<String>) -> Self {
        Self::handler(HandlerErrorCode::ResourceConflict, message)
    }

    /// Creates a `Throttling` error.
    pub fn throttling(message: impl Into<String>) -> Self {
        Self::handler(HandlerErrorCode::Throttling, message)
    }

    /// Creates a `NotStabilized` error.
    pub fn not_stabilized(message: impl Into<String>) -> Self {
        Self::handler(HandlerErrorCode::NotStabilized, message)
    }

    /// Creates a `NonCompliant` error, used by Hooks to reject a change.
    pub fn non_compliant(message: impl Into<String>) -> Self {
        Self::handler(HandlerErrorCode::NonCompliant, message)
    }

    /// Creates a `NotFound` error with the standard message.
    ///
    /// # Examples
    ///
    /// ```
    /// use cfn_extension_runtime::ExtensionError;
    ///
    /// let err = ExtensionError::not_found("AWS::Test::Thing", "thing-1");
    /// assert_eq!(
    ///     err.to_string(),
    ///     "Resource of type 'AWS::Test::Thing' with identifier 'thing-1' was not found."
    /// );
    /// ```
    pub fn not_found(type_name: &str, identifier: &str) -> Self {
        Self::handler(
            HandlerErrorCode::NotFound,
            format!(
                "Resource of type '{}' with identifier '{}' was not found.",
                type_name, identifier
            ),
        )
    }

    /// Creates an `AlreadyExists` error with the standard message.
    pub fn already_exists(type_name: &str, identifier: &str) -> Self {
        Self::handler(
            HandlerErrorCode::AlreadyExists,
            format!(
                "Resource of type '{}' with identifier '{}' already exists.",
                type_name, identifier
            ),
        )
    }

    /// Creates a new Encryption error.
    pub fn encryption(message: impl Into<String>) -> Self {
        Self::Encryption {
            message: message.into(),
        }
    }

    /// Creates a new SerDes error.
    pub fn serdes(message: impl Into<String>) -> Self {
        Self::SerDes {
            message: message.into(),
        }
    }

    /// Creates a new Validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a new Timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Creates an error for a failed AWS API call.
    pub fn service(
        service: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
        status: Option<u16>,
    ) -> Self {
        Self::Service {
            service: service.into(),
            code: code.into(),
            message: message.into(),
            status,
        }
    }

    /// Returns the wire error code this error is reported as.
    pub fn error_code(&self) -> HandlerErrorCode {
        match self {
            Self::Handler { code, .. } => *code,
            Self::Encryption { .. } => HandlerErrorCode::AccessDenied,
            Self::Timeout { .. } => HandlerErrorCode::ServiceTimeout,
            Self::Service { code, status, .. } => classify_service_error(code, *status),
            Self::SerDes { .. } | Self::Validation { .. } => HandlerErrorCode::InternalFailure,
        }
    }

    /// Returns a short name for the kind of error, used as a metric dimension.
    pub fn kind_name(&self) -> String {
        match self {
            Self::Handler { code, .. } => code.to_string(),
            Self::Encryption { .. } => "EncryptionError".to_string(),
            Self::SerDes { .. } => "SerDesError".to_string(),
            Self::Validation { .. } => "ValidationError".to_string(),
            Self::Service { code, .. } => code.clone(),
            Self::Timeout { .. } => "TimeoutError".to_string(),
        }
    }

    /// Returns the AWS error code if this is a Service error.
    pub fn service_code(&self) -> Option<&str> {
        match self {
            Self::Service { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }

    /// Returns true if an AWS API reported that the target resource does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self.service_code(), Some("ResourceNotFoundException"))
    }

    /// Returns true if an AWS API reported that the target resource already exists.
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self.service_code(),
            Some("ResourceAlreadyExistsException")
        )
    }

    /// Returns true if this is a handler deadline timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Converts this error into a FAILED progress event.
    pub fn to_progress_event<M>(&self) -> ProgressEvent<M> {
        ProgressEvent::failed(self.error_code(), self.to_string())
    }
}

/// Maps an AWS error code onto the handler error taxonomy so the control
/// plane's own retry policy can act on it.
fn classify_service_error(code: &str, status: Option<u16>) -> HandlerErrorCode {
    match code {
        "Throttling" | "ThrottlingException" | "ThrottledException" | "TooManyRequestsException"
        | "RequestLimitExceeded" | "RequestThrottled" | "RequestThrottledException" => {
            HandlerErrorCode::Throttling
        }
        "AccessDenied" | "AccessDeniedException" | "UnauthorizedOperation" => {
            HandlerErrorCode::AccessDenied
        }
        "InvalidClientTokenId" | "UnrecognizedClientException" | "ExpiredToken"
        | "ExpiredTokenException" | "InvalidSignatureException" => {
            HandlerErrorCode::InvalidCredentials
        }
        "LimitExceededException" | "ServiceQuotaExceededException" => {
            HandlerErrorCode::ServiceLimitExceeded
        }
        "ResourceNotFoundException" => HandlerErrorCode::NotFound,
        "ResourceAlreadyExistsException" => HandlerErrorCode::AlreadyExists,
        _ => match status {
            None => HandlerErrorCode::NetworkFailure,
            Some(s) if s >= 500 => HandlerErrorCode::ServiceInternalError,
            Some(_) => HandlerErrorCode::GeneralServiceException,
        },
    }
}

impl From<serde_json::Error> for ExtensionError {
    fn from(error: serde_json::Error) -> Self {
        Self::SerDes {
            message: error.to_string(),
        }
    }
}
