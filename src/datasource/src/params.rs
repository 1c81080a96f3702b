//! Render request parameter serialization.

use std::fmt;

use url::form_urlencoded;

use crate::error::Result;
use crate::targets::{QueryTarget, TargetResolver};
use crate::template::{ScopedVars, VariableLookup};
use crate::time::TimeValue;

/// Options forwarded to the backend, in wire order. Targets always come
/// first and are handled separately.
pub const FORWARDED_OPTIONS: [&str; 6] = [
    "from",
    "until",
    "rawData",
    "format",
    "maxDataPoints",
    "cacheTimeout",
];

/// Output format of a render request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderFormat {
    Json,
    /// Server-side rendered image; the request is never sent by the datasource.
    Png,
}

impl RenderFormat {
    /// Anything other than `png` is coerced to `json`.
    pub fn from_requested(requested: Option<&str>) -> Self {
        match requested {
            Some("png") => Self::Png,
            _ => Self::Json,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Png => "png",
        }
    }
}

/// Render request options after time translation.
#[derive(Debug, Clone, Default)]
pub struct GraphOptions {
    pub targets: Vec<QueryTarget>,
    pub from: Option<TimeValue>,
    pub until: Option<TimeValue>,
    pub raw_data: Option<bool>,
    /// Requested format; see [`RenderFormat::from_requested`].
    pub format: Option<String>,
    pub max_data_points: Option<u32>,
    pub cache_timeout: Option<String>,
}

impl GraphOptions {
    pub fn render_format(&self) -> RenderFormat {
        RenderFormat::from_requested(self.format.as_deref())
    }
}

/// A scalar option value as it goes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Text(String),
    Int(i64),
    Bool(bool),
}

impl ParamValue {
    /// Whether the value takes part in the request at all. Zero, the empty
    /// string and `false` are dropped, so e.g. `cacheTimeout = 0` cannot be
    /// sent.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Text(s) => !s.is_empty(),
            Self::Int(i) => *i != 0,
            Self::Bool(b) => *b,
        }
    }
}

impl From<&TimeValue> for ParamValue {
    fn from(value: &TimeValue) -> Self {
        match value {
            TimeValue::Shorthand(s) => ParamValue::Text(s.clone()),
            TimeValue::Epoch(secs) => ParamValue::Int(*secs),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => write!(f, "{s}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// Ordered `key=value` pairs with form-encoded values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestParams(Vec<String>);

impl RequestParams {
    fn push(&mut self, key: &str, value: &str) {
        let encoded: String = form_urlencoded::byte_serialize(value.as_bytes()).collect();
        self.0.push(format!("{key}={encoded}"));
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of `target=` parameters.
    pub fn target_count(&self) -> usize {
        self.0.iter().filter(|p| p.starts_with("target=")).count()
    }
}

impl fmt::Display for RequestParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("&"))
    }
}

/// Builds render request parameters.
pub struct ParamBuilder<'a> {
    lookup: &'a dyn VariableLookup,
    scoped_vars: Option<&'a ScopedVars>,
}

impl<'a> ParamBuilder<'a> {
    pub fn new(lookup: &'a dyn VariableLookup, scoped_vars: Option<&'a ScopedVars>) -> Self {
        Self {
            lookup,
            scoped_vars,
        }
    }

    /// Serialize `options`: resolved targets first, then the forwarded
    /// options in [`FORWARDED_OPTIONS`] order, skipping absent and falsy ones.
    pub fn build(&self, options: &GraphOptions) -> Result<RequestParams> {
        let mut params = RequestParams::default();

        let resolved =
            TargetResolver::new(self.lookup, self.scoped_vars).resolve(&options.targets)?;
        for target in &resolved {
            params.push("target", &target.expression);
        }

        let format = ParamValue::Text(options.render_format().as_str().to_string());
        let values = [
            options.from.as_ref().map(ParamValue::from),
            options.until.as_ref().map(ParamValue::from),
            options.raw_data.map(ParamValue::Bool),
            Some(format),
            options.max_data_points.map(|n| ParamValue::Int(i64::from(n))),
            options.cache_timeout.clone().map(ParamValue::Text),
        ];

        for (key, value) in FORWARDED_OPTIONS.iter().zip(values) {
            if let Some(value) = value.filter(ParamValue::is_truthy) {
                params.push(key, &value.to_string());
            }
        }

        Ok(params)
    }
}
