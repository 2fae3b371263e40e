// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Kubernetes label selector support
//!
//! Compiles the label filters of a resource selector into the label selector
//! string the list API understands, and evaluates namespace selector
//! expressions against namespace labels.
//!
//! ## Supported grammar
//!
//! Requirements are comma-separated and ANDed together:
//!
//! - `key=value`, `key==value`, `key!=value`
//! - `key in (a, b)`, `key notin (a, b)`
//! - `key` (label exists), `!key` (label does not exist)

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use thiserror::Error;

use super::NamespaceInfo;
use crate::policy::{LabelFilter, Operation, ResourceSelector};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LabelSelectorError {
    #[error("invalid label selector '{expr}': {reason}")]
    Invalid { expr: String, reason: String },
}

/// A single label requirement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            // Absent labels satisfy inequality, as in Kubernetes
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::In(k, values) => labels.get(k).is_some_and(|v| values.contains(v)),
            Requirement::NotIn(k, values) => !labels.get(k).is_some_and(|v| values.contains(v)),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::DoesNotExist(k) => !labels.contains_key(k),
        }
    }
}

/// Parsed label selector expression
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    /// True when every requirement holds (an empty selector matches everything)
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    #[cfg(test)]
    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }
}

impl FromStr for LabelSelector {
    type Err = LabelSelectorError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| LabelSelectorError::Invalid {
            expr: expr.to_string(),
            reason: reason.to_string(),
        };

        let mut requirements = Vec::new();
        for term in split_terms(expr).map_err(|r| invalid(r))? {
            let term = term.trim();
            if term.is_empty() {
                if expr.trim().is_empty() {
                    continue;
                }
                return Err(invalid("empty requirement"));
            }
            requirements.push(parse_requirement(term).map_err(|r| invalid(&r))?);
        }

        Ok(Self { requirements })
    }
}

/// Split on commas that are not inside a parenthesized value set
fn split_terms(expr: &str) -> Result<Vec<&str>, &'static str> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (idx, ch) in expr.char_indices() {
        match ch {
            '(' => {
                if depth > 0 {
                    return Err("nested parentheses");
                }
                depth += 1;
            }
            ')' => {
                if depth == 0 {
                    return Err("unbalanced parentheses");
                }
                depth -= 1;
            }
            ',' if depth == 0 => {
                terms.push(&expr[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err("unbalanced parentheses");
    }
    terms.push(&expr[start..]);
    Ok(terms)
}

fn parse_requirement(term: &str) -> Result<Requirement, String> {
    if let Some(key) = term.strip_prefix('!') {
        return Ok(Requirement::DoesNotExist(validate_key(key.trim())?));
    }

    if let Some(open) = term.find('(') {
        let head = term[..open].trim();
        let close = term
            .rfind(')')
            .filter(|close| *close > open)
            .ok_or_else(|| "missing ')'".to_string())?;
        if !term[close + 1..].trim().is_empty() {
            return Err(format!("unexpected text after ')' in '{}'", term));
        }
        let values = parse_value_set(&term[open + 1..close])?;

        let mut words = head.split_whitespace();
        let key = words.next().ok_or_else(|| "missing key".to_string())?;
        let op = words.next().ok_or_else(|| format!("missing operator in '{}'", term))?;
        if words.next().is_some() {
            return Err(format!("unexpected token in '{}'", term));
        }
        let key = validate_key(key)?;
        return match op {
            "in" => Ok(Requirement::In(key, values)),
            "notin" => Ok(Requirement::NotIn(key, values)),
            other => Err(format!("unknown set operator '{}'", other)),
        };
    }

    if let Some((key, value)) = term.split_once("!=") {
        return Ok(Requirement::NotEquals(
            validate_key(key.trim())?,
            validate_value(value.trim())?,
        ));
    }
    if let Some((key, value)) = term.split_once("==") {
        return Ok(Requirement::Equals(
            validate_key(key.trim())?,
            validate_value(value.trim())?,
        ));
    }
    if let Some((key, value)) = term.split_once('=') {
        return Ok(Requirement::Equals(
            validate_key(key.trim())?,
            validate_value(value.trim())?,
        ));
    }

    Ok(Requirement::Exists(validate_key(term)?))
}

fn parse_value_set(inner: &str) -> Result<BTreeSet<String>, String> {
    let mut values = BTreeSet::new();
    for value in inner.split(',') {
        values.insert(validate_value(value.trim())?);
    }
    Ok(values)
}

fn validate_key(key: &str) -> Result<String, String> {
    if key.is_empty() {
        return Err("empty label key".to_string());
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
    {
        return Err(format!("invalid label key '{}'", key));
    }
    Ok(key.to_string())
}

fn validate_value(value: &str) -> Result<String, String> {
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(format!("invalid label value '{}'", value));
    }
    Ok(value.to_string())
}

/// Label selector string for the list API, `None` when there are no filters
///
/// Examples:
/// - `[app Equal demo, tier Different prod]` → `"app=demo,tier!=prod"`
pub fn label_filter(filters: &[LabelFilter]) -> Option<String> {
    if filters.is_empty() {
        return None;
    }
    let clauses: Vec<String> = filters
        .iter()
        .map(|f| match f.operation {
            Operation::Equal => format!("{}={}", f.key, f.value),
            Operation::Different => format!("{}!={}", f.key, f.value),
        })
        .collect();
    Some(clauses.join(","))
}

/// Namespaces a selector targets
///
/// Union of the explicit namespace and every namespace whose labels satisfy
/// the namespace selector. An empty result selects no namespace.
pub fn namespace_filter(
    selector: &ResourceSelector,
    namespaces: &[NamespaceInfo],
) -> Result<BTreeSet<String>, LabelSelectorError> {
    let mut matching = BTreeSet::new();

    if let Some(expr) = selector.namespace_expression() {
        let parsed: LabelSelector = expr.parse()?;
        matching.extend(
            namespaces
                .iter()
                .filter(|ns| parsed.matches(&ns.labels))
                .map(|ns| ns.name.clone()),
        );
    }

    if let Some(ns) = selector.namespace.as_deref().filter(|s| !s.is_empty()) {
        matching.insert(ns.to_string());
    }

    Ok(matching)
}
