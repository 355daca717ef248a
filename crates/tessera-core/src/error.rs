//! Exchange error taxonomy
//!
//! Every failure that can cross an instance boundary carries one of the
//! wire-visible [`ErrorCode`]s. Internally errors propagate as
//! [`ExchangeError`]; at the public call surface they are folded into a
//! [`ServiceCallResult`], which never fails itself.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire-visible error codes shared by every instance on the substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Unclassified communication failure.
    #[serde(rename = "E_COM_GENERAL_ERROR")]
    GeneralError,
    /// The outbound pipeline has no usable connection.
    #[serde(rename = "E_COM_MESSAGE_SENDER_UNAVAILABLE")]
    MessageSenderUnavailable,
    /// The inbound pipeline has no usable connection.
    #[serde(rename = "E_COM_MESSAGE_RECEIVER_UNAVAILABLE")]
    MessageReceiverUnavailable,
    /// The exchange could not deliver a message after exhausting retries.
    #[serde(rename = "E_COM_MESSAGE_EXCHANGE_BROKEN")]
    MessageExchangeBroken,
    /// A service call did not complete within its execution deadline.
    #[serde(rename = "E_COM_SERVICE_EXEC_TIMEOUT")]
    ServiceExecTimeout,
    /// The destination service alias is not in the domain's registry set.
    #[serde(rename = "E_COM_SERVICE_NOT_REGISTERED")]
    ServiceNotRegistered,
    /// No service with the requested alias exists on the provider.
    #[serde(rename = "E_COM_SERVICE_NOT_FOUND")]
    ServiceNotFound,
    /// The alias exists but no handler matches the requested version.
    #[serde(rename = "E_COM_SERVICE_HANDLER_NOT_FOUND")]
    ServiceHandlerNotFound,
    /// A retried operation failed on its final permitted attempt.
    #[serde(rename = "E_COM_RETRY_ATTEMPTS_EXCEEDED")]
    RetryAttemptsExceeded,
    /// A received envelope failed keyed-hash verification.
    #[serde(rename = "E_SEC_MESSAGE_TAMPERING_DETECTED")]
    MessageTamperingDetected,
    /// The provider's access verifier rejected the call.
    #[serde(rename = "E_SEC_UNAUTHORIZED_ACCESS")]
    UnauthorizedAccess,
    /// The system cache is not operational.
    #[serde(rename = "E_GEN_SYSTEM_CACHE_UNAVAILABLE")]
    SystemCacheUnavailable,
}

impl ErrorCode {
    /// The wire representation of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::GeneralError => "E_COM_GENERAL_ERROR",
            ErrorCode::MessageSenderUnavailable => "E_COM_MESSAGE_SENDER_UNAVAILABLE",
            ErrorCode::MessageReceiverUnavailable => "E_COM_MESSAGE_RECEIVER_UNAVAILABLE",
            ErrorCode::MessageExchangeBroken => "E_COM_MESSAGE_EXCHANGE_BROKEN",
            ErrorCode::ServiceExecTimeout => "E_COM_SERVICE_EXEC_TIMEOUT",
            ErrorCode::ServiceNotRegistered => "E_COM_SERVICE_NOT_REGISTERED",
            ErrorCode::ServiceNotFound => "E_COM_SERVICE_NOT_FOUND",
            ErrorCode::ServiceHandlerNotFound => "E_COM_SERVICE_HANDLER_NOT_FOUND",
            ErrorCode::RetryAttemptsExceeded => "E_COM_RETRY_ATTEMPTS_EXCEEDED",
            ErrorCode::MessageTamperingDetected => "E_SEC_MESSAGE_TAMPERING_DETECTED",
            ErrorCode::UnauthorizedAccess => "E_SEC_UNAUTHORIZED_ACCESS",
            ErrorCode::SystemCacheUnavailable => "E_GEN_SYSTEM_CACHE_UNAVAILABLE",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for every fallible operation in the exchange.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct ExchangeError {
    code: ErrorCode,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ExchangeError {
    /// Create an error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Create a general communication error.
    pub fn general(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::GeneralError, message)
    }

    /// Attach the underlying cause.
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// The wire-visible code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// The human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The wire form of this error.
    pub fn to_exception(&self) -> ExceptionInfo {
        ExceptionInfo {
            code: self.code,
            message: self.message.clone(),
        }
    }
}

impl From<redis::RedisError> for ExchangeError {
    fn from(err: redis::RedisError) -> Self {
        ExchangeError::new(ErrorCode::GeneralError, "broker command failed").with_source(err)
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        ExchangeError::new(ErrorCode::GeneralError, "envelope serialization failed")
            .with_source(err)
    }
}

/// Result alias used throughout the crate.
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Wire representation of a failure, carried inside a service call envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionInfo {
    /// The wire-visible code.
    pub code: ErrorCode,
    /// The human-readable message.
    pub message: String,
}

impl ExceptionInfo {
    /// Create an exception record.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<&ExchangeError> for ExceptionInfo {
    fn from(err: &ExchangeError) -> Self {
        err.to_exception()
    }
}

/// Outcome of a service call as observed by the caller.
///
/// The call completion function always resolves to one of these; transport
/// and semantic failures are carried in `exception`, never thrown.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCallResult {
    /// Whether the call completed successfully.
    pub is_successful: bool,
    /// The failure description when unsuccessful.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionInfo>,
    /// The handler's response payload when successful.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl ServiceCallResult {
    /// A successful result carrying the handler's payload.
    pub fn success(payload: Option<serde_json::Value>) -> Self {
        Self {
            is_successful: true,
            exception: None,
            payload,
        }
    }

    /// A failed result derived from an error.
    pub fn failure(error: &ExchangeError) -> Self {
        Self {
            is_successful: false,
            exception: Some(error.to_exception()),
            payload: None,
        }
    }

    /// The exception code when the call failed.
    pub fn exception_code(&self) -> Option<ErrorCode> {
        self.exception.as_ref().map(|e| e.code)
    }
}
