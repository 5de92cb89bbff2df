//! Error codes and the error type returned by store capabilities.
//!
//! [`StoreError`] is the only error a [`Store`](crate::Store) implementation
//! reports. The mapping layer classifies it into its own taxonomy; see
//! [`ErrorCode`] for the stable numeric catalog shared by both.

use snafu::Snafu;

/// Machine-readable error codes for programmatic error handling.
///
/// Codes are organized into ranges:
///
/// | Range     | Domain    | Examples                                          |
/// |-----------|-----------|---------------------------------------------------|
/// | 1000–1099 | Schema    | Invalid declarations, configuration               |
/// | 2000–2099 | Request   | Validation, index resolution, clause misuse       |
/// | 3000–3099 | Data      | Key or cursor decoding                            |
/// | 4000–4099 | Store     | Conditional failures, partial batches, transport  |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    /// Schema declaration could not be compiled.
    Schema = 1000,
    /// Configuration value out of range.
    Config = 1001,
    /// Attribute value failed required, type, or custom validation.
    Validation = 2000,
    /// No index accepts the supplied facets.
    IndexResolution = 2001,
    /// Builder used out of order.
    InvalidClause = 2002,
    /// Stored key or row does not match the expected schema.
    Decode = 3000,
    /// Pagination cursor rejected.
    Cursor = 3001,
    /// Conditional write lost to a concurrent writer.
    ConditionalCheckFailed = 4000,
    /// Some batch items were never applied.
    PartialBatchFailure = 4001,
    /// Store reported throttling.
    Throttled = 4002,
    /// Store rejected or failed the request.
    StoreTransport = 4003,
    /// Operation cancelled by the caller.
    Cancelled = 4004,
}

impl ErrorCode {
    /// Returns the numeric code value.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Converts a numeric code to an `ErrorCode`, returning `None` for unknown values.
    #[must_use]
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            1000 => Some(Self::Schema),
            1001 => Some(Self::Config),
            2000 => Some(Self::Validation),
            2001 => Some(Self::IndexResolution),
            2002 => Some(Self::InvalidClause),
            3000 => Some(Self::Decode),
            3001 => Some(Self::Cursor),
            4000 => Some(Self::ConditionalCheckFailed),
            4001 => Some(Self::PartialBatchFailure),
            4002 => Some(Self::Throttled),
            4003 => Some(Self::StoreTransport),
            4004 => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Whether an operation failing with this code may succeed when retried unchanged.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Throttled | Self::StoreTransport | Self::PartialBatchFailure)
    }
}

/// Failure reported by a store capability.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    /// A condition expression evaluated to false.
    #[snafu(display("conditional check failed: {message}"))]
    ConditionalCheckFailed {
        /// Store-supplied detail.
        message: String,
    },

    /// Provisioned throughput or request rate exceeded.
    #[snafu(display("throttled: {message}"))]
    Throttled {
        /// Store-supplied detail.
        message: String,
    },

    /// The request was malformed or exceeded a store limit.
    #[snafu(display("request rejected: {message}"))]
    Validation {
        /// Store-supplied detail.
        message: String,
    },

    /// Any other failure reaching or inside the store.
    #[snafu(display("transport failure: {message}"))]
    Transport {
        /// Store-supplied detail.
        message: String,
    },
}

impl StoreError {
    /// Returns true if the request can be retried unchanged.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Throttled { .. } | Self::Transport { .. })
    }

    /// Returns the error code for this failure.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ConditionalCheckFailed { .. } => ErrorCode::ConditionalCheckFailed,
            Self::Throttled { .. } => ErrorCode::Throttled,
            Self::Validation { .. } | Self::Transport { .. } => ErrorCode::StoreTransport,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_roundtrip() {
        let codes = [
            ErrorCode::Schema,
            ErrorCode::Config,
            ErrorCode::Validation,
            ErrorCode::IndexResolution,
            ErrorCode::InvalidClause,
            ErrorCode::Decode,
            ErrorCode::Cursor,
            ErrorCode::ConditionalCheckFailed,
            ErrorCode::PartialBatchFailure,
            ErrorCode::Throttled,
            ErrorCode::StoreTransport,
            ErrorCode::Cancelled,
        ];
        for code in codes {
            assert_eq!(ErrorCode::from_u16(code.as_u16()), Some(code));
        }
        assert_eq!(ErrorCode::from_u16(9999), None);
    }

    #[test]
    fn test_store_error_retryability() {
        assert!(StoreError::Throttled { message: "slow down".to_owned() }.is_retryable());
        assert!(StoreError::Transport { message: "reset".to_owned() }.is_retryable());
        assert!(!StoreError::Validation { message: "too large".to_owned() }.is_retryable());
        assert!(
            !StoreError::ConditionalCheckFailed { message: "lost".to_owned() }.is_retryable()
        );
    }

    #[test]
    fn test_store_error_code() {
        let err = StoreError::ConditionalCheckFailed { message: "lost".to_owned() };
        assert_eq!(err.code(), ErrorCode::ConditionalCheckFailed);
        assert_eq!(err.to_string(), "conditional check failed: lost");
    }
}
