//! Label selectors
//!
//! Equality-based selectors of the form `app=web,tier==frontend,env!=dev`.
//! Every requirement must hold for an object to match. The empty selector
//! matches everything.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{ControllerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,
    pub value: String,
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let actual = labels.get(&self.key);
        match self.operator {
            Operator::Equals => actual == Some(&self.value),
            Operator::NotEquals => actual != Some(&self.value),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    /// Selector matching every object
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn parse(selector: &str) -> Result<Self> {
        selector.parse()
    }

    /// Add an equality requirement
    pub fn with_equals(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements.push(Requirement {
            key: key.into(),
            operator: Operator::Equals,
            value: value.into(),
        });
        self
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|req| req.matches(labels))
    }
}

impl FromStr for LabelSelector {
    type Err = ControllerError;

    fn from_str(selector: &str) -> Result<Self> {
        let invalid = |reason: String| ControllerError::InvalidSelector {
            selector: selector.to_string(),
            reason,
        };

        let mut requirements = Vec::new();

        for term in selector.split(',').map(str::trim) {
            if term.is_empty() {
                if selector.trim().is_empty() {
                    continue;
                }
                return Err(invalid("empty requirement".to_string()));
            }

            // "!=" and "==" must be tried before "="
            let (key, operator, value) = if let Some((k, v)) = term.split_once("!=") {
                (k, Operator::NotEquals, v)
            } else if let Some((k, v)) = term.split_once("==") {
                (k, Operator::Equals, v)
            } else if let Some((k, v)) = term.split_once('=') {
                (k, Operator::Equals, v)
            } else {
                return Err(invalid(format!(
                    "requirement '{}' has no operator, expected '=', '==' or '!='",
                    term
                )));
            };

            let key = key.trim();
            let value = value.trim();

            if key.is_empty() {
                return Err(invalid(format!("requirement '{}' has an empty key", term)));
            }
            if value.contains('=') || value.contains('!') {
                return Err(invalid(format!(
                    "requirement '{}' has a malformed value",
                    term
                )));
            }

            requirements.push(Requirement {
                key: key.to_string(),
                operator,
                value: value.to_string(),
            });
        }

        Ok(Self { requirements })
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms: Vec<String> = self
            .requirements
            .iter()
            .map(|req| match req.operator {
                Operator::Equals => format!("{}={}", req.key, req.value),
                Operator::NotEquals => format!("{}!={}", req.key, req.value),
            })
            .collect();
        f.write_str(&terms.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_double_equals_selector() {
        let selector = LabelSelector::parse("name==william").unwrap();
        assert!(selector.matches(&labels(&[("name", "william")])));
        assert!(!selector.matches(&labels(&[("name", "bob")])));
        assert!(!selector.matches(&labels(&[])));
    }

    #[test]
    fn test_conjunction() {
        let selector = LabelSelector::parse("app=web, tier = frontend").unwrap();
        assert_eq!(selector.requirements().len(), 2);
        assert!(selector.matches(&labels(&[("app", "web"), ("tier", "frontend")])));
        assert!(!selector.matches(&labels(&[("app", "web")])));
    }

    #[test]
    fn test_not_equals() {
        let selector = LabelSelector::parse("env!=dev").unwrap();
        assert!(selector.matches(&labels(&[("env", "prod")])));
        assert!(selector.matches(&labels(&[])));
        assert!(!selector.matches(&labels(&[("env", "dev")])));
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let selector = LabelSelector::parse("  ").unwrap();
        assert!(selector.is_empty());
        assert!(selector.matches(&labels(&[("any", "thing")])));
        assert_eq!(selector, LabelSelector::everything());
    }

    #[test]
    fn test_invalid_selectors() {
        for bad in ["app", "=web", "app=web,", "a=b=c", "app=web,,tier=x"] {
            assert!(
                matches!(
                    LabelSelector::parse(bad),
                    Err(ControllerError::InvalidSelector { .. })
                ),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_display() {
        let selector = LabelSelector::everything()
            .with_equals("app", "web")
            .with_equals("tier", "db");
        assert_eq!(selector.to_string(), "app=web,tier=db");
        assert_eq!(LabelSelector::parse("env!=dev").unwrap().to_string(), "env!=dev");
    }
}
