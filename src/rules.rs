//! Name matching for `test`, `include` and `exclude`.

use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};

use crate::error::ConfigError;

static DEFAULT_TEST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.html(\?.*)?$").expect("default test pattern is valid"));

/// A single asset name matcher.
#[derive(Debug, Clone)]
pub enum Rule {
    /// Matches names containing the string.
    Literal(String),
    /// Matches names the expression finds a match in.
    Regex(Regex),
}

impl Rule {
    pub fn literal(text: impl Into<String>) -> Self {
        Rule::Literal(text.into())
    }

    pub fn regex(pattern: &str) -> Result<Self, ConfigError> {
        Ok(Rule::Regex(Regex::new(pattern)?))
    }

    /// Compiles a pattern with JavaScript-style flags. `i`, `m`, `s` and `x`
    /// map onto their regex counterparts; `g`, `u` and `y` have no meaning
    /// for a single test and are ignored.
    pub fn regex_with_flags(pattern: &str, flags: &str) -> Result<Self, ConfigError> {
        let mut builder = RegexBuilder::new(pattern);

        for flag in flags.chars() {
            match flag {
                'i' => builder.case_insensitive(true),
                'm' => builder.multi_line(true),
                's' => builder.dot_matches_new_line(true),
                'x' => builder.ignore_whitespace(true),
                _ => &mut builder,
            };
        }

        Ok(Rule::Regex(builder.build()?))
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            Rule::Literal(text) => name.contains(text.as_str()),
            Rule::Regex(regex) => regex.is_match(name),
        }
    }
}

impl From<&str> for Rule {
    fn from(text: &str) -> Self {
        Rule::literal(text)
    }
}

impl From<String> for Rule {
    fn from(text: String) -> Self {
        Rule::Literal(text)
    }
}

impl From<Regex> for Rule {
    fn from(regex: Regex) -> Self {
        Rule::Regex(regex)
    }
}

/// A list of rules, matching when any of them does.
#[derive(Debug, Clone, Default)]
pub struct Rules(Vec<Rule>);

impl Rules {
    /// Rules matching `.html` files, optionally followed by a query string.
    pub fn default_test() -> Self {
        Rules(vec![Rule::Regex(DEFAULT_TEST.clone())])
    }

    pub fn push(&mut self, rule: impl Into<Rule>) {
        self.0.push(rule.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches_any(&self, name: &str) -> bool {
        self.0.iter().any(|rule| rule.matches(name))
    }
}

impl<R: Into<Rule>> FromIterator<R> for Rules {
    fn from_iter<I: IntoIterator<Item = R>>(iter: I) -> Self {
        Rules(iter.into_iter().map(Into::into).collect())
    }
}

impl From<Rule> for Rules {
    fn from(rule: Rule) -> Self {
        Rules(vec![rule])
    }
}

/// The selection law: an asset is processed iff it matches `test`, matches
/// `include` when one is given, and matches no `exclude`.
#[derive(Debug, Clone)]
pub struct Matcher {
    pub test: Rules,
    pub include: Option<Rules>,
    pub exclude: Option<Rules>,
}

impl Default for Matcher {
    fn default() -> Self {
        Self {
            test: Rules::default_test(),
            include: None,
            exclude: None,
        }
    }
}

impl Matcher {
    pub fn matches(&self, name: &str) -> bool {
        self.test.matches_any(name)
            && self.include.as_ref().is_none_or(|rules| rules.matches_any(name))
            && !self.exclude.as_ref().is_some_and(|rules| rules.matches_any(name))
    }
}
