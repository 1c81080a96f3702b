//! Template variable interpolation.
//!
//! The dashboard owns variable storage; the datasource only needs a way to
//! expand `$var`, `${var}`, `${var:format}` and `[[var]]` references inside
//! target expressions. [`VariableLookup`] is that seam, [`TemplateVariables`]
//! is a map-backed implementation.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

static VARIABLE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$(\w+)|\[\[([\s\S]+?)(?::(\w+))?\]\]|\$\{(\w+)(?::(\w+))?\}")
        .expect("variable pattern is valid")
});

/// Errors raised while interpolating an expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("Unknown format '{format}' for variable '{variable}'")]
    UnknownFormat { variable: String, format: String },
}

/// The value of a template variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariableValue {
    Single(String),
    Multi(Vec<String>),
}

impl From<&str> for VariableValue {
    fn from(value: &str) -> Self {
        VariableValue::Single(value.to_string())
    }
}

impl From<Vec<String>> for VariableValue {
    fn from(values: Vec<String>) -> Self {
        VariableValue::Multi(values)
    }
}

impl VariableValue {
    fn render(&self, variable: &str, format: Option<&str>) -> Result<String, TemplateError> {
        let values: Vec<&str> = match self {
            Self::Single(value) => vec![value.as_str()],
            Self::Multi(values) => values.iter().map(String::as_str).collect(),
        };

        let rendered = match format.unwrap_or("glob") {
            "glob" if values.len() == 1 => values[0].to_string(),
            "glob" => format!("{{{}}}", values.join(",")),
            "regex" if values.len() == 1 => regex::escape(values[0]),
            "regex" => format!(
                "({})",
                values
                    .iter()
                    .map(|v| regex::escape(v))
                    .collect::<Vec<_>>()
                    .join("|")
            ),
            "pipe" => values.join("|"),
            "csv" => values.join(","),
            other => {
                return Err(TemplateError::UnknownFormat {
                    variable: variable.to_string(),
                    format: other.to_string(),
                });
            }
        };
        Ok(rendered)
    }
}

/// Per-panel variables that take precedence over dashboard variables
/// (e.g. the value a repeated panel was instantiated for).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopedVars(HashMap<String, VariableValue>);

impl ScopedVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<VariableValue>) -> Self {
        self.0.insert(name.to_string(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&VariableValue> {
        self.0.get(name)
    }
}

/// Template substitution collaborator.
pub trait VariableLookup: Send + Sync {
    /// Expand every variable reference in `expression`. Unknown variables are
    /// left untouched.
    fn replace(
        &self,
        expression: &str,
        scoped_vars: Option<&ScopedVars>,
    ) -> Result<String, TemplateError>;
}

/// Dashboard-level variables held in memory.
#[derive(Debug, Clone, Default)]
pub struct TemplateVariables {
    variables: HashMap<String, VariableValue>,
}

impl TemplateVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<VariableValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<VariableValue>) {
        self.variables.insert(name.to_string(), value.into());
    }

    fn lookup<'a>(
        &'a self,
        name: &str,
        scoped_vars: Option<&'a ScopedVars>,
    ) -> Option<&'a VariableValue> {
        scoped_vars
            .and_then(|scoped| scoped.get(name))
            .or_else(|| self.variables.get(name))
    }
}

impl VariableLookup for TemplateVariables {
    fn replace(
        &self,
        expression: &str,
        scoped_vars: Option<&ScopedVars>,
    ) -> Result<String, TemplateError> {
        let mut error = None;

        let replaced = VARIABLE_REGEX.replace_all(expression, |caps: &Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .or_else(|| caps.get(4))
                .map(|m| m.as_str())
                .unwrap_or_default();
            let format = caps.get(3).or_else(|| caps.get(5)).map(|m| m.as_str());

            match self.lookup(name, scoped_vars) {
                Some(value) => value.render(name, format).unwrap_or_else(|e| {
                    error.get_or_insert(e);
                    String::new()
                }),
                None => caps[0].to_string(),
            }
        });

        match error {
            Some(e) => Err(e),
            None => Ok(replaced.into_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variables() -> TemplateVariables {
        TemplateVariables::new()
            .with("host", "web-01")
            .with(
                "hosts",
                vec!["web-01".to_string(), "web-02".to_string()],
            )
            .with("dcs", vec!["us.east".to_string(), "eu".to_string()])
    }

    #[test]
    fn test_replace_all_syntaxes() {
        let vars = variables();
        assert_eq!(
            vars.replace("$host.cpu.idle", None).unwrap(),
            "web-01.cpu.idle"
        );
        assert_eq!(
            vars.replace("${host}.cpu.idle", None).unwrap(),
            "web-01.cpu.idle"
        );
        assert_eq!(
            vars.replace("[[host]].cpu.idle", None).unwrap(),
            "web-01.cpu.idle"
        );
    }

    #[test]
    fn test_multi_value_formats() {
        let vars = variables();
        assert_eq!(
            vars.replace("$hosts.load", None).unwrap(),
            "{web-01,web-02}.load"
        );
        assert_eq!(
            vars.replace("${hosts:pipe}", None).unwrap(),
            "web-01|web-02"
        );
        assert_eq!(
            vars.replace("${dcs:regex}", None).unwrap(),
            r"(us\.east|eu)"
        );
    }

    #[test]
    fn test_unknown_variable_is_left_alone() {
        assert_eq!(
            variables().replace("$missing.cpu", None).unwrap(),
            "$missing.cpu"
        );
    }

    #[test]
    fn test_scoped_vars_take_precedence() {
        let scoped = ScopedVars::new().with("host", "db-01");
        assert_eq!(
            variables().replace("$host.mem", Some(&scoped)).unwrap(),
            "db-01.mem"
        );
    }

    #[test]
    fn test_unknown_format_is_an_error() {
        let err = variables().replace("${host:json}", None).unwrap_err();
        assert_eq!(
            err,
            TemplateError::UnknownFormat {
                variable: "host".into(),
                format: "json".into(),
            }
        );
    }
}
