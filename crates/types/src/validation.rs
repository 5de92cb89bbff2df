//! Identifier validation for schema declarations.
//!
//! Service, entity, collection, attribute, and field names end up inside
//! physical keys and expression placeholders, so they are restricted to a
//! character set that can never collide with key delimiters.
//!
//! ## Character Whitelists
//!
//! - Identifiers: `[a-zA-Z0-9_.-]`, 1-255 bytes.
//! - Reserved: anything starting with `__te_` belongs to the record-type tags.

use std::fmt;

/// Maximum length of any identifier in bytes.
pub const MAX_IDENTIFIER_BYTES: usize = 255;

/// Prefix reserved for internal fields.
pub const RESERVED_PREFIX: &str = "__te_";

/// Validation error with structured context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The identifier kind that failed validation (`entity`, `attribute`, ...).
    pub field: String,
    /// Description of the violated constraint.
    pub constraint: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.constraint)
    }
}

impl std::error::Error for ValidationError {}

/// Validates a schema identifier.
///
/// Identifiers must:
/// - Be non-empty
/// - Not exceed [`MAX_IDENTIFIER_BYTES`]
/// - Contain only `[a-zA-Z0-9_.-]`
/// - Not start with [`RESERVED_PREFIX`]
///
/// # Errors
///
/// Returns [`ValidationError`] naming `kind` and the violated constraint.
pub fn validate_identifier(kind: &str, name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError {
            field: kind.to_string(),
            constraint: "must not be empty".to_string(),
        });
    }
    if name.len() > MAX_IDENTIFIER_BYTES {
        return Err(ValidationError {
            field: kind.to_string(),
            constraint: format!(
                "length {} bytes exceeds maximum {MAX_IDENTIFIER_BYTES} bytes",
                name.len()
            ),
        });
    }
    if name.starts_with(RESERVED_PREFIX) {
        return Err(ValidationError {
            field: kind.to_string(),
            constraint: format!("{name:?} uses the reserved prefix {RESERVED_PREFIX:?}"),
        });
    }
    if let Some(pos) = name.find(|c: char| !is_identifier_char(c)) {
        return Err(ValidationError {
            field: kind.to_string(),
            constraint: format!(
                "{name:?} contains invalid character {:?} at byte offset {pos}; allowed: [a-zA-Z0-9_.-]",
                name[pos..].chars().next().unwrap_or('\0'),
            ),
        });
    }
    Ok(())
}

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}
