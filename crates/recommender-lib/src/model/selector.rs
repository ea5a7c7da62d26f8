//! Label selectors
//!
//! Supports the usual selector syntax: `k=v`, `k==v`, `k!=v`,
//! `k in (a,b)`, `k notin (a,b)`, `k` (exists) and `!k` (does not exist),
//! joined by commas. An empty selector matches every label set.

use super::labels::LabelSet;
use super::{ModelError, ModelResult};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    pub fn key(&self) -> &str {
        match self {
            Requirement::Equals(k, _)
            | Requirement::NotEquals(k, _)
            | Requirement::In(k, _)
            | Requirement::NotIn(k, _)
            | Requirement::Exists(k)
            | Requirement::DoesNotExist(k) => k,
        }
    }

    pub fn matches(&self, labels: &LabelSet) -> bool {
        match self {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::In(k, values) => labels.get(k).is_some_and(|v| values.contains(v)),
            Requirement::NotIn(k, values) => !labels.get(k).is_some_and(|v| values.contains(v)),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::DoesNotExist(k) => !labels.contains_key(k),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |values: &BTreeSet<String>| values.iter().cloned().collect::<Vec<_>>().join(",");
        match self {
            Requirement::Equals(k, v) => write!(f, "{k}={v}"),
            Requirement::NotEquals(k, v) => write!(f, "{k}!={v}"),
            Requirement::In(k, values) => write!(f, "{k} in ({})", join(values)),
            Requirement::NotIn(k, values) => write!(f, "{k} notin ({})", join(values)),
            Requirement::Exists(k) => write!(f, "{k}"),
            Requirement::DoesNotExist(k) => write!(f, "!{k}"),
        }
    }
}

/// Conjunction of label requirements, kept in canonical order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    /// Selector matching every label set
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn from_requirements(mut requirements: Vec<Requirement>) -> Self {
        requirements.sort_by(|a, b| a.key().cmp(b.key()).then_with(|| a.cmp(b)));
        requirements.dedup();
        Self { requirements }
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn matches(&self, labels: &LabelSet) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        f.write_str(&rendered.join(","))
    }
}

impl FromStr for LabelSelector {
    type Err = ModelError;

    fn from_str(input: &str) -> ModelResult<Self> {
        let requirements = split_terms(input)?
            .into_iter()
            .map(|term| parse_requirement(term, input))
            .collect::<ModelResult<Vec<_>>>()?;
        Ok(Self::from_requirements(requirements))
    }
}

/// Split on commas that are not inside a value list
fn split_terms(input: &str) -> ModelResult<Vec<&str>> {
    let mut terms = Vec::new();
    let mut depth = 0_i32;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                terms.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        if !(0..=1).contains(&depth) {
            return Err(invalid(input, "unbalanced parentheses"));
        }
    }
    if depth != 0 {
        return Err(invalid(input, "unbalanced parentheses"));
    }
    terms.push(&input[start..]);

    let terms: Vec<&str> = terms.into_iter().map(str::trim).collect();
    if terms.len() == 1 && terms[0].is_empty() {
        return Ok(Vec::new());
    }
    if terms.iter().any(|t| t.is_empty()) {
        return Err(invalid(input, "empty requirement"));
    }
    Ok(terms)
}

fn parse_requirement(term: &str, input: &str) -> ModelResult<Requirement> {
    if let Some(key) = term.strip_prefix('!') {
        return Ok(Requirement::DoesNotExist(parse_key(key, input)?));
    }
    if let Some((key, values)) = split_set_operator(term, "notin") {
        return Ok(Requirement::NotIn(
            parse_key(key, input)?,
            parse_values(values, input)?,
        ));
    }
    if let Some((key, values)) = split_set_operator(term, "in") {
        return Ok(Requirement::In(
            parse_key(key, input)?,
            parse_values(values, input)?,
        ));
    }
    if let Some((key, value)) = term.split_once("!=") {
        return Ok(Requirement::NotEquals(
            parse_key(key, input)?,
            parse_value(value, input)?,
        ));
    }
    if let Some((key, value)) = term.split_once("==").or_else(|| term.split_once('=')) {
        return Ok(Requirement::Equals(
            parse_key(key, input)?,
            parse_value(value, input)?,
        ));
    }
    Ok(Requirement::Exists(parse_key(term, input)?))
}

/// Split `key <op> (values)` on a whitespace-delimited operator
fn split_set_operator<'a>(term: &'a str, operator: &str) -> Option<(&'a str, &'a str)> {
    let open = term.find('(')?;
    let head = term[..open].trim_end();
    let key = head.strip_suffix(operator)?;
    if !key.ends_with(char::is_whitespace) {
        return None;
    }
    Some((key, &term[open..]))
}

fn parse_key(key: &str, input: &str) -> ModelResult<String> {
    let key = key.trim();
    if key.is_empty() || key.contains(|c: char| c.is_whitespace() || "=!(),".contains(c)) {
        return Err(invalid(input, &format!("invalid key {key:?}")));
    }
    Ok(key.to_string())
}

fn parse_value(value: &str, input: &str) -> ModelResult<String> {
    let value = value.trim();
    if value.contains(|c: char| c.is_whitespace() || "=!(),".contains(c)) {
        return Err(invalid(input, &format!("invalid value {value:?}")));
    }
    Ok(value.to_string())
}

fn parse_values(list: &str, input: &str) -> ModelResult<BTreeSet<String>> {
    let inner = list
        .trim()
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| invalid(input, "value list must be parenthesised"))?;
    let values = inner
        .split(',')
        .map(|v| parse_value(v, input))
        .collect::<ModelResult<BTreeSet<_>>>()?;
    if values.iter().all(|v| v.is_empty()) {
        return Err(invalid(input, "empty value list"));
    }
    Ok(values)
}

fn invalid(input: &str, reason: &str) -> ModelError {
    ModelError::InvalidSelector {
        selector: input.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_equality_selectors() {
        let selector: LabelSelector = "app=web, tier==front".parse().unwrap();
        assert!(selector.matches(&labels(&[("app", "web"), ("tier", "front"), ("x", "y")])));
        assert!(!selector.matches(&labels(&[("app", "web")])));

        let selector: LabelSelector = "app!=web".parse().unwrap();
        assert!(selector.matches(&labels(&[("app", "db")])));
        assert!(selector.matches(&labels(&[])));
        assert!(!selector.matches(&labels(&[("app", "web")])));
    }

    #[test]
    fn test_set_selectors() {
        let selector: LabelSelector = "env in (prod, staging),tier notin (batch)".parse().unwrap();
        assert!(selector.matches(&labels(&[("env", "prod")])));
        assert!(selector.matches(&labels(&[("env", "staging"), ("tier", "web")])));
        assert!(!selector.matches(&labels(&[("env", "prod"), ("tier", "batch")])));
        assert!(!selector.matches(&labels(&[("env", "dev")])));
    }

    #[test]
    fn test_existence_selectors() {
        let selector: LabelSelector = "app,!canary".parse().unwrap();
        assert!(selector.matches(&labels(&[("app", "anything")])));
        assert!(!selector.matches(&labels(&[("app", "x"), ("canary", "true")])));
        assert!(!selector.matches(&labels(&[("other", "x")])));
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let selector: LabelSelector = "".parse().unwrap();
        assert_eq!(selector, LabelSelector::everything());
        assert!(selector.matches(&labels(&[("a", "1")])));
    }

    #[test]
    fn test_canonical_form_is_order_independent() {
        let a: LabelSelector = "b=2,a=1".parse().unwrap();
        let b: LabelSelector = "a==1, b=2".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "a=1,b=2");

        let c: LabelSelector = "env in (b,a)".parse().unwrap();
        assert_eq!(c.to_string(), "env in (a,b)");
        assert_eq!(c.to_string().parse::<LabelSelector>().unwrap(), c);
    }

    #[test]
    fn test_key_named_like_operator() {
        let selector: LabelSelector = "index=1,in".parse().unwrap();
        assert!(selector.matches(&labels(&[("index", "1"), ("in", "")])));
    }

    #[test]
    fn test_invalid_selectors() {
        for input in ["a=1,,b=2", "env in (a", "env in ()", "=x", "a b=1", "env in a,b)"] {
            assert!(
                input.parse::<LabelSelector>().is_err(),
                "{input:?} should be rejected"
            );
        }
    }
}
