//! Topic Metadata and Validation
//!
//! Every leaf topic carries exactly one [`Metadata`] descriptor. It names the
//! value's data type, optional discrete options, an optional numeric range,
//! presentation hints and behaviour flags. [`Metadata::validate`] is the only
//! gate through which values reach the retained store: it accepts, rejects or
//! normalizes, and never mutates anything.
//!
//! # Wire Shape
//!
//! Metadata serializes as `{dtype, brief, detail, default, options, range,
//! format, flags}` with every field but `dtype` optional:
//!
//! ```rust
//! use daq_pubsub::metadata::Metadata;
//! use serde_json::json;
//!
//! let meta = Metadata::from_json(json!({
//!     "dtype": "u8",
//!     "brief": "Gain stage",
//!     "options": [[0, "auto"], [1, "low", "lo"], [2, "high", "hi"]],
//!     "default": "auto",
//! }))?;
//! assert_eq!(meta.default, Some(json!(0)));
//! assert_eq!(meta.validate(&json!("lo")).unwrap(), json!(1));
//! # Ok::<(), daq_pubsub::error::BusError>(())
//! ```
//!
//! # Normalization Rules
//!
//! - Options map any listed alternate (display name or alias) to the option's
//!   first, canonical value, and reject everything else.
//! - Integer types coerce numbers (truncating), bools and numeric strings, and
//!   check the fixed bit width.
//! - `bool` accepts the usual on/off vocabulary (`"yes"`, `"off"`, `1`, ...).
//! - `color` normalizes `#rgb`, `#rrggbb`, `#aarrggbb` and `[r, g, b(, a)]`
//!   to lowercase `#aarrggbb`.
//! - `unique_strings` validates each element, maps it through options, and
//!   rejects duplicates.
//! - `range` is inclusive on both ends; a `step` is checked relative to `min`
//!   (integer types default to a step of 1).

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::error::{BusError, ValidationError};

/// Custom validation callback.
///
/// Receives the (option-mapped) value and returns the normalized value or a
/// rejection. Must be pure.
pub type Validator = Arc<dyn Fn(&Value) -> Result<Value, ValidationError> + Send + Sync>;

/// Closed set of value data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dtype {
    /// Any JSON value, unchecked.
    Obj,
    /// UTF-8 string (or null).
    #[serde(alias = "string")]
    Str,
    /// Byte string as an array of `0..=255` (or null).
    #[serde(alias = "bin")]
    Bytes,
    /// 64-bit float.
    #[serde(alias = "f32", alias = "f64")]
    Float,
    /// Integer limited only by the JSON number range.
    Int,
    /// Unsigned 8-bit integer.
    U8,
    /// Unsigned 16-bit integer.
    U16,
    /// Unsigned 32-bit integer.
    U32,
    /// Unsigned 64-bit integer.
    U64,
    /// Signed 8-bit integer.
    I8,
    /// Signed 16-bit integer.
    I16,
    /// Signed 32-bit integer.
    I32,
    /// Signed 64-bit integer.
    I64,
    /// Boolean.
    Bool,
    /// Font description string.
    Font,
    /// Color, normalized to `#aarrggbb`.
    Color,
    /// Valueless event; only `null` is accepted.
    None,
    /// Interior hierarchy node; cannot be published.
    Node,
    /// Ordered list of unique strings.
    UniqueStrings,
    /// Validated solely by the metadata's custom [`Validator`].
    Custom,
}

impl Dtype {
    /// Half-open bounds for fixed-width integer types.
    fn int_bounds(self) -> Option<(i128, i128)> {
        match self {
            Dtype::U8 => Some((0, 1 << 8)),
            Dtype::U16 => Some((0, 1 << 16)),
            Dtype::U32 => Some((0, 1 << 32)),
            Dtype::U64 => Some((0, 1 << 64)),
            Dtype::I8 => Some((-(1 << 7), 1 << 7)),
            Dtype::I16 => Some((-(1 << 15), 1 << 15)),
            Dtype::I32 => Some((-(1 << 31), 1 << 31)),
            Dtype::I64 => Some((-(1 << 63), 1 << 63)),
            _ => None,
        }
    }

    /// True for every integer type, including unbounded `int`.
    pub fn is_integer(self) -> bool {
        self == Dtype::Int || self.int_bounds().is_some()
    }
}

/// Behaviour flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Flag {
    /// Only the owner may update the topic.
    #[serde(rename = "ro")]
    ReadOnly,
    /// Not shown in user interfaces.
    #[serde(rename = "hide")]
    Hidden,
    /// Developer option.
    #[serde(rename = "dev")]
    Developer,
    /// Publishes are never recorded for undo.
    #[serde(rename = "skip_undo")]
    SkipUndo,
    /// Temporary value, not persisted by collaborators.
    #[serde(rename = "tmp")]
    Temporary,
    /// No initial value is applied at registration.
    #[serde(rename = "noinit")]
    NoInit,
}

/// Inclusive numeric range with optional increment.
///
/// Serialized as `[min, max]` or `[min, max, step]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct RangeSpec {
    /// Lower bound (inclusive).
    pub min: f64,
    /// Upper bound (inclusive).
    pub max: f64,
    /// Increment, relative to `min`.
    pub step: Option<f64>,
}

impl RangeSpec {
    fn check(&self) -> Result<(), String> {
        if !(self.min.is_finite() && self.max.is_finite()) || self.min > self.max {
            return Err(format!("invalid range [{}, {}]", self.min, self.max));
        }
        if let Some(step) = self.step {
            if !(step.is_finite() && step > 0.0) {
                return Err(format!("invalid range step {}", step));
            }
        }
        Ok(())
    }
}

impl TryFrom<Vec<f64>> for RangeSpec {
    type Error = String;

    fn try_from(value: Vec<f64>) -> Result<Self, Self::Error> {
        let range = match value.as_slice() {
            [min, max] => RangeSpec {
                min: *min,
                max: *max,
                step: None,
            },
            [min, max, step] => RangeSpec {
                min: *min,
                max: *max,
                step: Some(*step),
            },
            _ => return Err(format!("range needs 2 or 3 entries, got {}", value.len())),
        };
        range.check()?;
        Ok(range)
    }
}

impl From<RangeSpec> for Vec<f64> {
    fn from(value: RangeSpec) -> Self {
        match value.step {
            Some(step) => vec![value.min, value.max, step],
            None => vec![value.min, value.max],
        }
    }
}

/// Type/range/option/flag contract attached to a topic.
#[derive(Clone, Serialize, Deserialize)]
pub struct Metadata {
    /// Value data type.
    pub dtype: Dtype,
    /// One-line description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brief: Option<String>,
    /// Longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Initial value, normalized by [`Metadata::normalized`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Allowed values: `[canonical, display_name, alternates...]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<Vec<Value>>>,
    /// Numeric range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<RangeSpec>,
    /// Formatting hint (e.g. `"version"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Behaviour flags.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub flags: BTreeSet<Flag>,
    #[serde(skip)]
    validator: Option<Validator>,
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metadata")
            .field("dtype", &self.dtype)
            .field("brief", &self.brief)
            .field("default", &self.default)
            .field("options", &self.options)
            .field("range", &self.range)
            .field("flags", &self.flags)
            .field("has_validator", &self.validator.is_some())
            .finish_non_exhaustive()
    }
}

impl PartialEq for Metadata {
    fn eq(&self, other: &Self) -> bool {
        let same_validator = match (&self.validator, &other.validator) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        same_validator
            && self.dtype == other.dtype
            && self.brief == other.brief
            && self.detail == other.detail
            && self.default == other.default
            && self.options == other.options
            && self.range == other.range
            && self.format == other.format
            && self.flags == other.flags
    }
}

impl Metadata {
    /// Metadata with only a dtype.
    pub fn new(dtype: Dtype) -> Self {
        Self {
            dtype,
            brief: None,
            detail: None,
            default: None,
            options: None,
            range: None,
            format: None,
            flags: BTreeSet::new(),
            validator: None,
        }
    }

    /// Metadata for an interior hierarchy node.
    pub fn node(brief: impl Into<String>) -> Self {
        Self::new(Dtype::Node).with_brief(brief)
    }

    /// Metadata validated solely by `validator`.
    pub fn custom<F>(validator: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, ValidationError> + Send + Sync + 'static,
    {
        Self::new(Dtype::Custom).with_validator(validator)
    }

    /// Parse metadata from its JSON wire shape and normalize the default.
    pub fn from_json(value: Value) -> Result<Self, BusError> {
        let meta: Metadata =
            serde_json::from_value(value).map_err(|e| BusError::InvalidMetadata(e.to_string()))?;
        meta.normalized()
    }

    /// Set the brief description.
    pub fn with_brief(mut self, brief: impl Into<String>) -> Self {
        self.brief = Some(brief.into());
        self
    }

    /// Set the detailed description.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Set the default value (checked by [`Metadata::normalized`]).
    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// Set the allowed options.
    pub fn with_options(mut self, options: Vec<Vec<Value>>) -> Self {
        self.options = Some(options);
        self
    }

    /// Set an inclusive range.
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.range = Some(RangeSpec {
            min,
            max,
            step: None,
        });
        self
    }

    /// Set an inclusive range with increment.
    pub fn with_range_step(mut self, min: f64, max: f64, step: f64) -> Self {
        self.range = Some(RangeSpec {
            min,
            max,
            step: Some(step),
        });
        self
    }

    /// Set the formatting hint.
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    /// Add a flag.
    pub fn with_flag(mut self, flag: Flag) -> Self {
        self.flags.insert(flag);
        self
    }

    /// Add several flags.
    pub fn with_flags(mut self, flags: &[Flag]) -> Self {
        self.flags.extend(flags.iter().copied());
        self
    }

    /// Add a custom validator, run after dtype coercion.
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, ValidationError> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Check the declaration and normalize the default value.
    pub fn normalized(mut self) -> Result<Self, BusError> {
        if self.dtype == Dtype::Custom && self.validator.is_none() {
            return Err(BusError::InvalidMetadata(
                "dtype 'custom' requires a validator".into(),
            ));
        }
        if let Some(range) = &self.range {
            range.check().map_err(BusError::InvalidMetadata)?;
        }
        if let Some(options) = &self.options {
            if options.iter().any(|o| o.is_empty()) {
                return Err(BusError::InvalidMetadata("empty option entry".into()));
            }
        }
        if let Some(default) = self.default.take() {
            let value = self.validate(&default).map_err(|e| {
                BusError::InvalidMetadata(format!("default {} rejected: {}", default, e))
            })?;
            self.default = Some(value);
        }
        Ok(self)
    }

    /// True if `flag` is set.
    pub fn has_flag(&self, flag: Flag) -> bool {
        self.flags.contains(&flag)
    }

    /// True for `node` metadata.
    pub fn is_node(&self) -> bool {
        self.dtype == Dtype::Node
    }

    /// JSON wire shape of this metadata.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Validate a value, returning the normalized value.
    ///
    /// Pure: never touches state.
    pub fn validate(&self, value: &Value) -> Result<Value, ValidationError> {
        let mapped = match &self.options {
            Some(options) if self.dtype == Dtype::UniqueStrings => {
                let items = value.as_array().ok_or_else(|| {
                    ValidationError::new(format!("expected list of strings, got {}", value))
                })?;
                let mapped = items
                    .iter()
                    .map(|item| map_option(options, item))
                    .collect::<Result<Vec<_>, _>>()?;
                Value::Array(mapped)
            }
            Some(options) => map_option(options, value)?,
            None => value.clone(),
        };

        let mut normalized = self.coerce(mapped)?;

        if let Some(validator) = &self.validator {
            normalized = validator(&normalized)?;
        }

        if self.dtype == Dtype::UniqueStrings {
            check_unique(&normalized)?;
        }

        if let Some(range) = &self.range {
            self.check_range(range, &normalized)?;
        }

        Ok(normalized)
    }

    fn coerce(&self, value: Value) -> Result<Value, ValidationError> {
        match self.dtype {
            Dtype::Obj | Dtype::Custom => Ok(value),
            Dtype::Str | Dtype::Font => match value {
                Value::String(_) | Value::Null => Ok(value),
                other => Err(ValidationError::new(format!("expected string, got {}", other))),
            },
            Dtype::Bytes => coerce_bytes(value),
            Dtype::Float => coerce_float(&value),
            Dtype::Int => integer_value(to_integer(&value)?),
            Dtype::U8
            | Dtype::U16
            | Dtype::U32
            | Dtype::U64
            | Dtype::I8
            | Dtype::I16
            | Dtype::I32
            | Dtype::I64 => {
                let x = to_integer(&value)?;
                if let Some((lo, hi)) = self.dtype.int_bounds() {
                    if !(lo <= x && x < hi) {
                        return Err(ValidationError::new(format!(
                            "{} out of range [{}, {}) for {:?}",
                            x, lo, hi, self.dtype
                        )));
                    }
                }
                integer_value(x)
            }
            Dtype::Bool => coerce_bool(&value).map(Value::Bool),
            Dtype::Color => normalize_color(&value).map(Value::String),
            Dtype::None => match value {
                Value::Null => Ok(Value::Null),
                other => Err(ValidationError::new(format!("expected no value, got {}", other))),
            },
            Dtype::Node => match value {
                Value::Null => Ok(Value::Null),
                other => Err(ValidationError::new(format!(
                    "node cannot hold a value: {}",
                    other
                ))),
            },
            Dtype::UniqueStrings => match value {
                Value::Array(items) => {
                    if let Some(bad) = items.iter().find(|v| !v.is_string()) {
                        return Err(ValidationError::new(format!("expected string, got {}", bad)));
                    }
                    Ok(Value::Array(items))
                }
                other => Err(ValidationError::new(format!(
                    "expected list of strings, got {}",
                    other
                ))),
            },
        }
    }

    fn check_range(&self, range: &RangeSpec, value: &Value) -> Result<(), ValidationError> {
        let x = value
            .as_f64()
            .ok_or_else(|| ValidationError::new(format!("{} is not numeric", value)))?;
        if !(range.min <= x && x <= range.max) {
            return Err(ValidationError::new(format!(
                "{} out of range [{}, {}]",
                x, range.min, range.max
            )));
        }
        let step = match range.step {
            Some(step) => step,
            None if self.dtype.is_integer() => 1.0,
            None => return Ok(()),
        };
        let offset = (x - range.min) / step;
        if (offset - offset.round()).abs() > 1e-9 {
            return Err(ValidationError::new(format!(
                "{} not on increment {} from {}",
                x, step, range.min
            )));
        }
        Ok(())
    }
}

/// Equality that treats `1` and `1.0` as the same option.
pub(crate) fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

fn map_option(options: &[Vec<Value>], value: &Value) -> Result<Value, ValidationError> {
    options
        .iter()
        .find(|option| option.iter().any(|alt| loosely_equal(alt, value)))
        .and_then(|option| option.first().cloned())
        .ok_or_else(|| ValidationError::new(format!("value {} not in options", value)))
}

fn check_unique(value: &Value) -> Result<(), ValidationError> {
    if let Value::Array(items) = value {
        let mut seen = BTreeSet::new();
        for item in items {
            if let Some(s) = item.as_str() {
                if !seen.insert(s) {
                    return Err(ValidationError::new(format!(
                        "value {} contains duplicate {:?}",
                        value, s
                    )));
                }
            }
        }
    }
    Ok(())
}

fn to_integer(value: &Value) -> Result<i128, ValidationError> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i128::from(i))
            } else if let Some(u) = n.as_u64() {
                Ok(i128::from(u))
            } else {
                match n.as_f64() {
                    Some(f) if f.is_finite() && f.abs() < 1.7e38 => Ok(f.trunc() as i128),
                    _ => Err(ValidationError::new(format!("{} is not an integer", n))),
                }
            }
        }
        Value::Bool(b) => Ok(i128::from(*b)),
        Value::String(s) => s
            .trim()
            .parse::<i128>()
            .map_err(|_| ValidationError::new(format!("{:?} is not an integer", s))),
        other => Err(ValidationError::new(format!("{} is not an integer", other))),
    }
}

fn integer_value(x: i128) -> Result<Value, ValidationError> {
    if let Ok(i) = i64::try_from(x) {
        Ok(Value::from(i))
    } else if let Ok(u) = u64::try_from(x) {
        Ok(Value::from(u))
    } else {
        Err(ValidationError::new(format!("{} exceeds 64 bits", x)))
    }
}

fn coerce_float(value: &Value) -> Result<Value, ValidationError> {
    let x = match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    x.and_then(Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| ValidationError::new(format!("{} is not a finite float", value)))
}

fn coerce_bytes(value: Value) -> Result<Value, ValidationError> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::Array(items) => {
            for item in &items {
                match item.as_u64() {
                    Some(b) if b <= 0xff => {}
                    _ => {
                        return Err(ValidationError::new(format!(
                            "byte value {} out of range",
                            item
                        )))
                    }
                }
            }
            Ok(Value::Array(items))
        }
        other => Err(ValidationError::new(format!("expected bytes, got {}", other))),
    }
}

const FALSE_WORDS: &[&str] = &[
    "0", "no", "off", "disable", "disabled", "false", "inactive", "",
];
const TRUE_WORDS: &[&str] = &["1", "yes", "on", "enable", "enabled", "true", "active"];

fn coerce_bool(value: &Value) -> Result<bool, ValidationError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(false),
        Value::Number(n) => match n.as_f64() {
            Some(x) if x == 0.0 => Ok(false),
            Some(x) if x == 1.0 => Ok(true),
            _ => Err(ValidationError::new(format!("{} is not a bool", n))),
        },
        Value::String(s) => {
            let s = s.trim().to_lowercase();
            if FALSE_WORDS.contains(&s.as_str()) {
                Ok(false)
            } else if TRUE_WORDS.contains(&s.as_str()) {
                Ok(true)
            } else {
                Err(ValidationError::new(format!("{:?} is not a bool", s)))
            }
        }
        other => Err(ValidationError::new(format!("{} is not a bool", other))),
    }
}

fn normalize_color(value: &Value) -> Result<String, ValidationError> {
    let invalid = || ValidationError::new(format!("invalid color {}", value));
    let (r, g, b, a) = match value {
        Value::String(s) => {
            let hex = s.trim().strip_prefix('#').ok_or_else(invalid)?;
            if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            let byte = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| invalid());
            match hex.len() {
                3 => {
                    let nibble =
                        |i: usize| u8::from_str_radix(&hex[i..i + 1], 16).map_err(|_| invalid());
                    (nibble(0)? * 17, nibble(1)? * 17, nibble(2)? * 17, 0xff)
                }
                6 => (byte(0)?, byte(2)?, byte(4)?, 0xff),
                8 => (byte(2)?, byte(4)?, byte(6)?, byte(0)?),
                _ => return Err(invalid()),
            }
        }
        Value::Array(items) if items.len() == 3 || items.len() == 4 => {
            let mut channels = [0xffu8; 4];
            for (slot, item) in channels.iter_mut().zip(items) {
                *slot = item
                    .as_u64()
                    .and_then(|c| u8::try_from(c).ok())
                    .ok_or_else(invalid)?;
            }
            (channels[0], channels[1], channels[2], channels[3])
        }
        _ => return Err(invalid()),
    };
    Ok(format!("#{:02x}{:02x}{:02x}{:02x}", a, r, g, b))
}
