//! # Operation Results
//!
//! Every cache call returns an `OperationResult` by value. Misses, CAS
//! conflicts and unreachable nodes are ordinary data here, not errors: the
//! caller inspects `success` and `status` instead of unwinding.

use crate::status::Status;
use crate::types::Cas;

/// Outcome of one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult<T> {
    /// True only when `status` is `NoError`.
    pub success: bool,
    pub status: Status,
    /// CAS returned by the server (zero when none was returned).
    pub cas: Cas,
    pub value: Option<T>,
    /// Detail for failures: server message or local error text.
    pub message: Option<String>,
}

impl<T> OperationResult<T> {
    /// Successful result carrying a value.
    pub fn ok(value: T, cas: Cas) -> Self {
        OperationResult {
            success: true,
            status: Status::NoError,
            cas,
            value: Some(value),
            message: None,
        }
    }

    /// Failed result.
    pub fn fail(status: Status, message: impl Into<Option<String>>) -> Self {
        debug_assert!(!status.is_success());
        OperationResult {
            success: false,
            status,
            cas: Cas::NONE,
            value: None,
            message: message.into(),
        }
    }

    /// Failure for operations that never reached a server.
    pub fn not_attempted(reason: &str) -> Self {
        Self::fail(Status::NotAttempted, Some(reason.to_string()))
    }

    /// Maps the carried value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> OperationResult<U> {
        OperationResult {
            success: self.success,
            status: self.status,
            cas: self.cas,
            value: self.value.map(f),
            message: self.message,
        }
    }

    /// Keeps status and CAS, drops the value.
    pub fn discard(self) -> OperationResult<()> {
        self.map(|_| ())
    }

    /// Consumes the result, returning the value on success.
    pub fn into_value(self) -> Option<T> {
        if self.success {
            self.value
        } else {
            None
        }
    }
}
