//! Attribute declarations.

use std::{fmt, sync::Arc};

use tessera_types::{AttributeValue, Item};

/// Produces a value for an absent attribute on put/create.
pub type DefaultFn = Arc<dyn Fn() -> AttributeValue + Send + Sync>;

/// Custom validation. `Err` carries the message surfaced to the caller.
pub type ValidateFn = Arc<dyn Fn(&AttributeValue) -> Result<(), String> + Send + Sync>;

/// Write-path transform. Receives the incoming value (if any) and the item
/// being written; returning `None` leaves the attribute absent.
pub type SetFn = Arc<dyn Fn(Option<&AttributeValue>, &Item) -> Option<AttributeValue> + Send + Sync>;

/// Read-path transform. Receives the stored value and the decoded row;
/// returning `None` omits the attribute from the result.
pub type GetFn = Arc<dyn Fn(&AttributeValue, &Item) -> Option<AttributeValue> + Send + Sync>;

/// Element type of a set attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetKind {
    /// Set of strings.
    String,
    /// Set of numbers.
    Number,
    /// Set of byte strings.
    Binary,
}

/// Declared type of an attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeType {
    /// UTF-8 string.
    String,
    /// Number.
    Number,
    /// Boolean.
    Boolean,
    /// Opaque bytes.
    Binary,
    /// String restricted to a fixed set of values.
    Enum(Vec<String>),
    /// Nested document.
    Map,
    /// Ordered list.
    List,
    /// Set of scalars.
    Set(SetKind),
    /// Any value; never type checked.
    Any,
}

impl AttributeType {
    /// Returns true for types that may be used as key facets.
    #[must_use]
    pub fn is_scalar(&self) -> bool {
        matches!(self, Self::String | Self::Number | Self::Boolean | Self::Binary | Self::Enum(_))
    }

    /// Checks `value` against this type, returning the coerced value.
    ///
    /// Lists of matching scalars are accepted for set types and converted.
    pub(crate) fn coerce(&self, value: &AttributeValue) -> Result<AttributeValue, String> {
        let mismatch = || format!("expected {self}, found {}", value.type_name());
        match (self, value) {
            (Self::Any, v) => Ok(v.clone()),
            (Self::Number, AttributeValue::Number(n)) if n.is_nan() => Err("NaN".to_owned()),
            (Self::String, AttributeValue::String(_))
            | (Self::Number, AttributeValue::Number(_))
            | (Self::Boolean, AttributeValue::Bool(_))
            | (Self::Binary, AttributeValue::Binary(_))
            | (Self::Map, AttributeValue::Map(_))
            | (Self::List, AttributeValue::List(_))
            | (Self::Set(SetKind::String), AttributeValue::StringSet(_))
            | (Self::Set(SetKind::Number), AttributeValue::NumberSet(_))
            | (Self::Set(SetKind::Binary), AttributeValue::BinarySet(_)) => Ok(value.clone()),
            (Self::Enum(allowed), AttributeValue::String(s)) => {
                if allowed.iter().any(|a| a == s) {
                    Ok(value.clone())
                } else {
                    Err(format!("{s:?} is not one of [{}]", allowed.join(", ")))
                }
            },
            (Self::Set(kind), AttributeValue::List(elements)) => coerce_list_to_set(*kind, elements)
                .ok_or_else(mismatch),
            _ => Err(mismatch()),
        }
    }

    /// Type check on the read path. Enum membership is not enforced so that
    /// rows written before a value was retired still decode.
    pub(crate) fn accepts_stored(&self, value: &AttributeValue) -> bool {
        match self {
            Self::Enum(_) => matches!(value, AttributeValue::String(_)),
            Self::Set(kind) => matches!(
                (kind, value),
                (SetKind::String, AttributeValue::StringSet(_))
                    | (SetKind::Number, AttributeValue::NumberSet(_))
                    | (SetKind::Binary, AttributeValue::BinarySet(_))
            ),
            other => other.coerce(value).is_ok(),
        }
    }
}

fn coerce_list_to_set(kind: SetKind, elements: &[AttributeValue]) -> Option<AttributeValue> {
    match kind {
        SetKind::String => elements
            .iter()
            .map(|e| e.as_str().map(str::to_owned))
            .collect::<Option<_>>()
            .map(AttributeValue::StringSet),
        SetKind::Number => elements
            .iter()
            .map(AttributeValue::as_number)
            .collect::<Option<Vec<_>>>()
            .map(AttributeValue::number_set),
        SetKind::Binary => elements
            .iter()
            .map(|e| match e {
                AttributeValue::Binary(b) => Some(b.clone()),
                _ => None,
            })
            .collect::<Option<_>>()
            .map(AttributeValue::BinarySet),
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => f.write_str("string"),
            Self::Number => f.write_str("number"),
            Self::Boolean => f.write_str("boolean"),
            Self::Binary => f.write_str("binary"),
            Self::Enum(values) => write!(f, "enum [{}]", values.join(", ")),
            Self::Map => f.write_str("map"),
            Self::List => f.write_str("list"),
            Self::Set(SetKind::String) => f.write_str("string set"),
            Self::Set(SetKind::Number) => f.write_str("number set"),
            Self::Set(SetKind::Binary) => f.write_str("binary set"),
            Self::Any => f.write_str("any"),
        }
    }
}

/// One attribute of an entity.
///
/// Built with a typed constructor and chained modifiers:
///
/// ```
/// use tessera::schema::Attribute;
///
/// let status = Attribute::enumeration("status", ["open", "paid"])
///     .required()
///     .default_value("open");
/// assert!(status.is_required());
/// ```
#[derive(Clone)]
pub struct Attribute {
    pub(crate) name: String,
    pub(crate) kind: AttributeType,
    pub(crate) required: bool,
    pub(crate) read_only: bool,
    pub(crate) hidden: bool,
    pub(crate) field: Option<String>,
    pub(crate) label: Option<String>,
    pub(crate) default: Option<DefaultFn>,
    pub(crate) validate: Option<ValidateFn>,
    pub(crate) set: Option<SetFn>,
    pub(crate) get: Option<GetFn>,
    pub(crate) watch: Vec<String>,
}

impl Attribute {
    /// Declares an attribute of the given type.
    pub fn new(name: impl Into<String>, kind: AttributeType) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            read_only: false,
            hidden: false,
            field: None,
            label: None,
            default: None,
            validate: None,
            set: None,
            get: None,
            watch: Vec::new(),
        }
    }

    /// Declares a string attribute.
    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, AttributeType::String)
    }

    /// Declares a number attribute.
    pub fn number(name: impl Into<String>) -> Self {
        Self::new(name, AttributeType::Number)
    }

    /// Declares a boolean attribute.
    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, AttributeType::Boolean)
    }

    /// Declares a binary attribute.
    pub fn binary(name: impl Into<String>) -> Self {
        Self::new(name, AttributeType::Binary)
    }

    /// Declares a string attribute restricted to `values`.
    pub fn enumeration<S: Into<String>>(
        name: impl Into<String>,
        values: impl IntoIterator<Item = S>,
    ) -> Self {
        Self::new(name, AttributeType::Enum(values.into_iter().map(Into::into).collect()))
    }

    /// Declares a map attribute.
    pub fn map(name: impl Into<String>) -> Self {
        Self::new(name, AttributeType::Map)
    }

    /// Declares a list attribute.
    pub fn list(name: impl Into<String>) -> Self {
        Self::new(name, AttributeType::List)
    }

    /// Declares a set attribute.
    pub fn set_of(name: impl Into<String>, kind: SetKind) -> Self {
        Self::new(name, AttributeType::Set(kind))
    }

    /// Declares an untyped attribute.
    pub fn any(name: impl Into<String>) -> Self {
        Self::new(name, AttributeType::Any)
    }

    /// Put and create fail when the attribute is absent after defaults.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Update and patch reject the attribute.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Stored but never returned from reads.
    #[must_use]
    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    /// Stores the attribute under a different physical field name.
    #[must_use]
    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// Uses `label` instead of the attribute name inside encoded keys.
    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Fills the attribute with a constant when absent on put/create.
    #[must_use]
    pub fn default_value(mut self, value: impl Into<AttributeValue>) -> Self {
        let value = value.into();
        self.default = Some(Arc::new(move || value.clone()));
        self
    }

    /// Fills the attribute by calling `f` when absent on put/create.
    #[must_use]
    pub fn default_with<F>(mut self, f: F) -> Self
    where
        F: Fn() -> AttributeValue + Send + Sync + 'static,
    {
        self.default = Some(Arc::new(f));
        self
    }

    /// Runs `f` on every written value.
    #[must_use]
    pub fn validate<F>(mut self, f: F) -> Self
    where
        F: Fn(&AttributeValue) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(f));
        self
    }

    /// Transforms the value on the write path.
    #[must_use]
    pub fn on_set<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&AttributeValue>, &Item) -> Option<AttributeValue> + Send + Sync + 'static,
    {
        self.set = Some(Arc::new(f));
        self
    }

    /// Transforms the value on the read path.
    #[must_use]
    pub fn on_get<F>(mut self, f: F) -> Self
    where
        F: Fn(&AttributeValue, &Item) -> Option<AttributeValue> + Send + Sync + 'static,
    {
        self.get = Some(Arc::new(f));
        self
    }

    /// Recomputes this attribute (through its set transform) whenever any of
    /// `attributes` is written.
    #[must_use]
    pub fn watch<S: Into<String>>(mut self, attributes: impl IntoIterator<Item = S>) -> Self {
        self.watch.extend(attributes.into_iter().map(Into::into));
        self
    }

    /// Attribute name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared type.
    #[must_use]
    pub fn kind(&self) -> &AttributeType {
        &self.kind
    }

    /// Physical field name.
    #[must_use]
    pub fn field_name(&self) -> &str {
        self.field.as_deref().unwrap_or(&self.name)
    }

    /// Label used inside encoded keys.
    #[must_use]
    pub fn key_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }

    /// Whether put/create require the attribute.
    #[must_use]
    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Whether update/patch reject the attribute.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Whether reads omit the attribute.
    #[must_use]
    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    /// Attributes this one watches.
    #[must_use]
    pub fn watched(&self) -> &[String] {
        &self.watch
    }
}

impl fmt::Debug for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attribute")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("required", &self.required)
            .field("read_only", &self.read_only)
            .field("hidden", &self.hidden)
            .field("field", &self.field)
            .field("label", &self.label)
            .field("has_default", &self.default.is_some())
            .field("has_validate", &self.validate.is_some())
            .field("has_set", &self.set.is_some())
            .field("has_get", &self.get.is_some())
            .field("watch", &self.watch)
            .finish()
    }
}
