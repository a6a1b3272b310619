//! Conditional directive activation
//!
//! Most draft directives accept a `when` clause restricting when they
//! apply.  A clause is a conjunction over four conditions: `testname`,
//! `platforms`, `options`, and `parameters`; the latter three accept
//! `and`/`or`/`not` boolean expressions.  Predicates are evaluated
//! lazily during expansion and filtering.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::case::Scalar;
use crate::error::{EngineError, EngineResult};
use crate::expr::{fnmatch, ParamExpr, WordExpr};

/// Activation predicate attached to a directive
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct When {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub testname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platforms: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<String>,
}

/// Outcome of evaluating a `when` clause
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub value: bool,
    /// Which condition rejected, when `value` is false
    pub reason: Option<String>,
}

impl Evaluation {
    fn accept() -> Self {
        Self {
            value: true,
            reason: None,
        }
    }

    fn reject(reason: impl Into<String>) -> Self {
        Self {
            value: false,
            reason: Some(reason.into()),
        }
    }
}

/// Evaluation context: the candidate testname, the platform, the `-o`
/// options in effect, and the parameter bindings known so far
#[derive(Debug, Clone, Default)]
pub struct WhenContext<'a> {
    pub testname: Option<&'a str>,
    pub platform: &'a str,
    pub on_options: &'a [String],
    pub parameters: Option<&'a BTreeMap<String, Scalar>>,
}

impl When {
    /// Parse the string form: whitespace-separated `key=value` pairs
    /// where values may be single- or double-quoted, e.g.
    /// `"testname=spam platforms='linux or darwin' parameters='np>2'"`.
    pub fn parse(input: &str) -> EngineResult<Self> {
        let mut when = When::default();
        let mut rest = input.trim();
        while !rest.is_empty() {
            let eq = rest.find('=').ok_or_else(|| EngineError::InvalidExpression {
                expr: input.to_string(),
                reason: "expected key=value".to_string(),
            })?;
            let key = rest[..eq].trim();
            let after = &rest[eq + 1..];
            let (value, remainder) = take_value(after).ok_or_else(|| {
                EngineError::InvalidExpression {
                    expr: input.to_string(),
                    reason: "unterminated quote".to_string(),
                }
            })?;
            match key {
                "testname" | "name" => when.testname = Some(value),
                "platforms" | "platform" => when.platforms = Some(value),
                "options" | "option" => when.options = Some(value),
                "parameters" | "parameter" => when.parameters = Some(value),
                other => {
                    return Err(EngineError::InvalidExpression {
                        expr: input.to_string(),
                        reason: format!("unknown when condition {:?}", other),
                    })
                }
            }
            rest = remainder.trim_start();
        }
        Ok(when)
    }

    /// Evaluate all conditions against the context; conditions are
    /// conjunctive
    pub fn evaluate(&self, ctx: &WhenContext<'_>) -> EngineResult<Evaluation> {
        if let Some(pattern) = &self.testname {
            let matched = ctx
                .testname
                .map(|name| fnmatch(pattern, name))
                .unwrap_or(false);
            if !matched {
                return Ok(Evaluation::reject(format!("testname={}", pattern)));
            }
        }
        if let Some(expr) = &self.platforms {
            let mut platform = BTreeSet::new();
            platform.insert(ctx.platform.to_string());
            if !WordExpr::parse(expr)?.evaluate(&platform) {
                return Ok(Evaluation::reject(format!("platforms={:?}", expr)));
            }
        }
        if let Some(expr) = &self.options {
            let options: BTreeSet<String> = ctx.on_options.iter().cloned().collect();
            if !WordExpr::parse(expr)?.evaluate(&options) {
                return Ok(Evaluation::reject(format!("options={:?}", expr)));
            }
        }
        if let Some(expr) = &self.parameters {
            let empty = BTreeMap::new();
            let parameters = ctx.parameters.unwrap_or(&empty);
            if !ParamExpr::parse(expr)?.evaluate(parameters) {
                return Ok(Evaluation::reject(format!("parameters={:?}", expr)));
            }
        }
        Ok(Evaluation::accept())
    }
}

/// Evaluate an optional clause; `None` always applies
pub fn applies(when: &Option<When>, ctx: &WhenContext<'_>) -> EngineResult<bool> {
    match when {
        Some(w) => Ok(w.evaluate(ctx)?.value),
        None => Ok(true),
    }
}

fn take_value(input: &str) -> Option<(String, &str)> {
    let mut chars = input.char_indices();
    match chars.next() {
        Some((_, quote)) if quote == '\'' || quote == '"' => {
            for (i, c) in chars {
                if c == quote {
                    return Some((input[1..i].to_string(), &input[i + 1..]));
                }
            }
            None
        }
        _ => {
            let end = input
                .find(char::is_whitespace)
                .unwrap_or(input.len());
            Some((input[..end].to_string(), &input[end..]))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(list: &[(&str, Scalar)]) -> BTreeMap<String, Scalar> {
        list.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_when_testname() {
        let when = When::parse("testname=spam").unwrap();
        let ctx = WhenContext {
            testname: Some("spam"),
            platform: "linux",
            ..Default::default()
        };
        assert!(when.evaluate(&ctx).unwrap().value);
        let ctx = WhenContext {
            testname: Some("baz"),
            platform: "linux",
            ..Default::default()
        };
        assert!(!when.evaluate(&ctx).unwrap().value);
    }

    #[test]
    fn test_when_platform() {
        let when = When::parse("platforms=linux").unwrap();
        let ctx = WhenContext {
            platform: "linux",
            ..Default::default()
        };
        assert!(when.evaluate(&ctx).unwrap().value);

        let when = When::parse("platforms='not linux'").unwrap();
        assert!(!when.evaluate(&ctx).unwrap().value);
    }

    #[test]
    fn test_when_options() {
        let when = When::parse("options='spam and baz'").unwrap();
        let opts = vec!["spam".to_string(), "baz".to_string()];
        let ctx = WhenContext {
            platform: "linux",
            on_options: &opts,
            ..Default::default()
        };
        assert!(when.evaluate(&ctx).unwrap().value);

        let only = vec!["spam".to_string()];
        let ctx = WhenContext {
            platform: "linux",
            on_options: &only,
            ..Default::default()
        };
        assert!(!when.evaluate(&ctx).unwrap().value);
    }

    #[test]
    fn test_when_parameters() {
        let when = When::parse("parameters='np>2 and baz=spam'").unwrap();
        let p = params(&[("np", Scalar::Int(3)), ("baz", Scalar::Str("spam".into()))]);
        let ctx = WhenContext {
            platform: "linux",
            parameters: Some(&p),
            ..Default::default()
        };
        assert!(when.evaluate(&ctx).unwrap().value);

        let p = params(&[("np", Scalar::Int(3))]);
        let ctx = WhenContext {
            platform: "linux",
            parameters: Some(&p),
            ..Default::default()
        };
        assert!(!when.evaluate(&ctx).unwrap().value);
    }

    #[test]
    fn test_when_composite_is_conjunctive() {
        let when = When::parse("parameters='np>2' options='spam and baz' platforms=linux").unwrap();
        let p = params(&[("np", Scalar::Int(4))]);
        let opts = vec!["spam".to_string(), "baz".to_string()];
        let ctx = WhenContext {
            platform: "linux",
            on_options: &opts,
            parameters: Some(&p),
            ..Default::default()
        };
        assert!(when.evaluate(&ctx).unwrap().value);

        let when = When::parse("parameters='np=2' options='spam and baz' platforms=linux").unwrap();
        assert!(!when.evaluate(&ctx).unwrap().value);
    }

    #[test]
    fn test_when_rejects_unknown_condition() {
        assert!(When::parse("weather=sunny").is_err());
    }
}
