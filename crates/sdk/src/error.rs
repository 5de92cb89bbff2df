//! Error taxonomy for the mapping layer.
//!
//! Every failure a caller can observe is one [`Error`] variant. Store
//! failures arrive as [`StoreError`] and are classified here: conditional
//! failures become [`Error::ConditionalCheckFailed`], everything else
//! becomes [`Error::StoreTransport`] unless the caller asked for the
//! original error, in which case it is passed through as [`Error::Store`].

use std::fmt;

use snafu::{Location, Snafu};
use tessera_types::{ErrorCode, Item, StoreError};

use crate::pagination::CursorError;

/// Result type alias for mapping-layer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// What was wrong with a schema declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// A name is empty, too long, reserved, or contains a key delimiter.
    InvalidIdentifier,
    /// Two attributes share a name.
    DuplicateAttribute,
    /// Two attributes map to the same physical field, or an attribute maps onto a key field.
    DuplicateField,
    /// An index declares no partition key.
    MissingPartitionKey,
    /// An index names a facet that is not a declared attribute.
    MissingFacet,
    /// An index uses a map, list, or set attribute as a facet.
    NonScalarFacet,
    /// A facet appears twice in the same index.
    DuplicateFacet,
    /// There is not exactly one table index.
    TableIndexCount,
    /// Two indexes share an access-pattern or physical name.
    DuplicateIndex,
    /// Two indexes write the same physical key field.
    DuplicateKeyField,
    /// A collection is declared on an index without a sort key.
    CollectionWithoutSortKey,
    /// Collection members disagree on index, key fields, or partition facets.
    CollectionMismatch,
    /// An entity belongs to another service or table, or is registered twice.
    ServiceMismatch,
    /// A watch names an unknown attribute, watches itself, or has no set transform.
    InvalidWatch,
    /// Watch declarations form a cycle.
    WatchCycle,
    /// An enum attribute declares no values.
    InvalidEnum,
}

impl fmt::Display for SchemaErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidIdentifier => "invalid identifier",
            Self::DuplicateAttribute => "duplicate attribute",
            Self::DuplicateField => "duplicate field",
            Self::MissingPartitionKey => "missing partition key",
            Self::MissingFacet => "missing facet",
            Self::NonScalarFacet => "non-scalar facet",
            Self::DuplicateFacet => "duplicate facet",
            Self::TableIndexCount => "table index count",
            Self::DuplicateIndex => "duplicate index",
            Self::DuplicateKeyField => "duplicate key field",
            Self::CollectionWithoutSortKey => "collection without sort key",
            Self::CollectionMismatch => "collection mismatch",
            Self::ServiceMismatch => "service mismatch",
            Self::InvalidWatch => "invalid watch",
            Self::WatchCycle => "watch cycle",
            Self::InvalidEnum => "invalid enum",
        };
        f.write_str(name)
    }
}

/// Mapping-layer errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// The schema declaration is invalid. Raised once, at construction.
    #[snafu(display("Schema error ({kind}): {message}"))]
    Schema {
        /// Category of the problem.
        kind: SchemaErrorKind,
        /// Description naming the offending declaration.
        message: String,
    },

    /// An attribute value failed required, type, read-only, or custom validation.
    #[snafu(display("Validation failed for '{attribute}': {message}"))]
    Validation {
        /// Attribute name, or the operation name for item-level failures.
        attribute: String,
        /// What was wrong.
        message: String,
    },

    /// The supplied facets do not satisfy an index.
    #[snafu(display("Cannot resolve index '{index}': missing facets [{}]", missing.join(", ")))]
    IndexResolution {
        /// Access pattern that was being resolved.
        index: String,
        /// Facets that must be supplied.
        missing: Vec<String>,
    },

    /// A builder method was used out of order or with inconsistent arguments.
    #[snafu(display("Invalid clause at {location}: {message}"))]
    InvalidClause {
        /// What was wrong.
        message: String,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// A stored key or row does not match the schema that is reading it.
    #[snafu(display("Cannot decode {what}: {message}"))]
    Decode {
        /// The key or field being decoded.
        what: String,
        /// What was wrong.
        message: String,
    },

    /// A pagination cursor was rejected.
    #[snafu(display("Cursor rejected: {source}"))]
    Cursor {
        /// Why the cursor was rejected.
        source: CursorError,
    },

    /// A conditional write lost.
    #[snafu(display("Conditional check failed during {operation}: {message}"))]
    ConditionalCheckFailed {
        /// Operation that carried the condition.
        operation: String,
        /// Store-supplied detail.
        message: String,
    },

    /// Some batch items were never applied, even after retries.
    ///
    /// Also returned when a chunk failed with a non-retryable store error
    /// after other chunks were applied; that error is kept in `cause`.
    #[snafu(display(
        "Batch incomplete: {} succeeded, {} unprocessed{}{}",
        succeeded.len(),
        unprocessed.len(),
        if *cancelled { " (cancelled)" } else { "" },
        cause.as_ref().map(|e| format!(": {e}")).unwrap_or_default()
    ))]
    PartialBatchFailure {
        /// Items (or keys) that were applied or fetched.
        succeeded: Vec<Item>,
        /// Items (or keys) still unprocessed.
        unprocessed: Vec<Item>,
        /// True when cancellation stopped dispatch before retries ran out.
        cancelled: bool,
        /// Non-retryable store error that stopped the batch, if any.
        cause: Option<StoreError>,
    },

    /// The store failed the request.
    #[snafu(display("Store error during {operation}: {source}"))]
    StoreTransport {
        /// Operation that failed.
        operation: String,
        /// Store failure.
        source: StoreError,
    },

    /// Store failure passed through unchanged because the caller asked for it.
    #[snafu(display("{source}"))]
    Store {
        /// Store failure.
        source: StoreError,
    },

    /// Configuration or execution option out of range.
    #[snafu(display("Configuration error: {message}"))]
    Config {
        /// What was wrong.
        message: String,
    },

    /// The caller's cancellation token fired.
    #[snafu(display("Operation cancelled"))]
    Cancelled,
}

impl Error {
    /// Returns the stable error code.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Schema { .. } => ErrorCode::Schema,
            Self::Validation { .. } => ErrorCode::Validation,
            Self::IndexResolution { .. } => ErrorCode::IndexResolution,
            Self::InvalidClause { .. } => ErrorCode::InvalidClause,
            Self::Decode { .. } => ErrorCode::Decode,
            Self::Cursor { .. } => ErrorCode::Cursor,
            Self::ConditionalCheckFailed { .. } => ErrorCode::ConditionalCheckFailed,
            Self::PartialBatchFailure { .. } => ErrorCode::PartialBatchFailure,
            Self::StoreTransport { source, .. } | Self::Store { source } => source.code(),
            Self::Config { .. } => ErrorCode::Config,
            Self::Cancelled => ErrorCode::Cancelled,
        }
    }

    /// Returns true if retrying the same operation unchanged may succeed.
    ///
    /// Retryable errors:
    /// - Throttling and transport failures from the store
    /// - Partial batch failures (the unprocessed items can be resubmitted)
    ///
    /// Everything else describes a request that will fail the same way again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StoreTransport { source, .. } | Self::Store { source } => source.is_retryable(),
            Self::PartialBatchFailure { cause, .. } => cause.as_ref().is_none_or(StoreError::is_retryable),
            _ => false,
        }
    }

    /// Classifies a store failure for `operation`.
    pub(crate) fn from_store(operation: &str, source: StoreError, original: bool) -> Self {
        if original {
            return Self::Store { source };
        }
        match source {
            StoreError::ConditionalCheckFailed { message } => {
                Self::ConditionalCheckFailed { operation: operation.to_owned(), message }
            },
            source => Self::StoreTransport { operation: operation.to_owned(), source },
        }
    }

    pub(crate) fn schema(kind: SchemaErrorKind, message: impl Into<String>) -> Self {
        Self::Schema { kind, message: message.into() }
    }

    pub(crate) fn validation(attribute: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation { attribute: attribute.into(), message: message.into() }
    }

    pub(crate) fn decode(what: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode { what: what.into(), message: message.into() }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_conditional_failure_is_classified() {
        let err = Error::from_store(
            "update",
            StoreError::ConditionalCheckFailed { message: "lost".to_owned() },
            false,
        );
        assert!(matches!(err, Error::ConditionalCheckFailed { ref operation, .. } if operation == "update"));
        assert_eq!(err.code(), ErrorCode::ConditionalCheckFailed);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_original_error_passes_through() {
        let source = StoreError::ConditionalCheckFailed { message: "lost".to_owned() };
        let err = Error::from_store("put", source.clone(), true);
        assert!(matches!(err, Error::Store { source: ref s } if *s == source));
    }

    #[test]
    fn test_transport_retryability_follows_store() {
        let throttled = Error::from_store(
            "query",
            StoreError::Throttled { message: "slow down".to_owned() },
            false,
        );
        assert!(throttled.is_retryable());
        assert_eq!(throttled.code(), ErrorCode::Throttled);

        let rejected = Error::from_store(
            "query",
            StoreError::Validation { message: "bad".to_owned() },
            false,
        );
        assert!(!rejected.is_retryable());
        assert_eq!(rejected.code(), ErrorCode::StoreTransport);
    }

    #[test]
    fn test_partial_batch_display() {
        let err = Error::PartialBatchFailure {
            succeeded: vec![Item::new(), Item::new()],
            unprocessed: vec![Item::new()],
            cancelled: true,
            cause: None,
        };
        assert_eq!(err.to_string(), "Batch incomplete: 2 succeeded, 1 unprocessed (cancelled)");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_partial_batch_with_fatal_cause() {
        let err = Error::PartialBatchFailure {
            succeeded: vec![Item::new()],
            unprocessed: vec![Item::new(), Item::new()],
            cancelled: false,
            cause: Some(StoreError::Validation { message: "item too large".to_owned() }),
        };
        assert_eq!(err.to_string(), "Batch incomplete: 1 succeeded, 2 unprocessed: request rejected: item too large");
        assert!(!err.is_retryable());
        assert_eq!(err.code(), ErrorCode::PartialBatchFailure);
    }

    #[test]
    fn test_index_resolution_names_missing_facets() {
        let err = Error::IndexResolution {
            index: "byAccount".to_owned(),
            missing: vec!["accountId".to_owned(), "region".to_owned()],
        };
        assert_eq!(
            err.to_string(),
            "Cannot resolve index 'byAccount': missing facets [accountId, region]"
        );
        assert_eq!(err.code(), ErrorCode::IndexResolution);
    }
}
