use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashMap;

/// Which DSL construct a rule recognizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    /// `--<name` / `--<!name` opens a conditional block
    BlockStart,
    /// `-->` closes the current block
    BlockEnd,
    /// `#name` / `#!name` keeps or drops a single line
    LineFilter,
    /// `:name` / `$name` is substituted with a parameter value
    Replace,
}

/// A single DSL rule: a kind plus the pattern that recognizes it.
///
/// Directive patterns (block start, line filter) use capture group 1 for the
/// negation marker, group 2 for the parameter name, group 3 for the qualifier
/// and group 4 for the qualifier value. Replace patterns use group 1 for the
/// parameter name. Block end patterns need no groups.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: u32,
    pub description: String,
    pub kind: RuleKind,
    pub pattern: Regex,
}

/// A directive occurrence extracted from a template line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Directive<'a> {
    pub negated: bool,
    pub name: &'a str,
    pub qualifier: Option<&'a str>,
    pub value: Option<&'a str>,
}

impl<'a> Directive<'a> {
    fn from_captures(caps: &Captures<'a>) -> Option<Self> {
        let name = caps.get(2)?.as_str();
        Some(Directive {
            negated: caps.get(1).is_some_and(|m| m.as_str() == "!"),
            name,
            qualifier: caps.get(3).map(|m| m.as_str()),
            value: caps.get(4).map(|m| m.as_str()),
        })
    }

    /// Whether the guarded content survives: the named parameter must be
    /// present, or absent when the directive is negated. Only presence counts,
    /// a parameter bound to `false` or null is still present.
    pub fn keeps<V>(&self, params: &HashMap<String, V>) -> bool {
        params.contains_key(self.name) != self.negated
    }
}

impl Rule {
    pub fn new(
        id: u32,
        description: impl Into<String>,
        kind: RuleKind,
        pattern: &str,
    ) -> Result<Self, regex::Error> {
        Ok(Rule {
            id,
            description: description.into(),
            kind,
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn is_match(&self, line: &str) -> bool {
        self.pattern.is_match(line)
    }

    /// First directive on the line, if any
    pub fn directive<'a>(&self, line: &'a str) -> Option<Directive<'a>> {
        self.pattern
            .captures(line)
            .and_then(|caps| Directive::from_captures(&caps))
    }

    /// Every directive on the line, left to right
    pub fn directives<'a>(&'a self, line: &'a str) -> impl Iterator<Item = Directive<'a>> + 'a {
        self.pattern
            .captures_iter(line)
            .filter_map(|caps| Directive::from_captures(&caps))
    }
}

// Whitespace and word boundaries are ASCII-only: a non-ASCII letter never
// counts as a word character and U+3000 and friends are not blanks
const BLOCK_START_PATTERN: &str = r"--<(!?)([0-9A-Za-z_]+)(?:(:|!:)([^>\t\n\f\r ]+))?";
const BLOCK_END_PATTERN: &str =
    r"^[\t\n\f\r ]*--(?:[0-9A-Za-z_!:]+>|>(?:[0-9A-Za-z_!:]*))[\t\n\f\r ]*$";
const LINE_FILTER_PATTERN: &str = r"#(!?)([0-9A-Za-z_]+)(?:(:|!:)([^>\t\n\f\r ]+))?";
const REPLACE_PATTERN: &str = r"(?-u:\B)[$:]([A-Za-z_][0-9A-Za-z_]*)";

static DEFAULT_RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        Rule::new(1, "Block Logic", RuleKind::BlockStart, BLOCK_START_PATTERN).unwrap(),
        Rule::new(3, "Block End", RuleKind::BlockEnd, BLOCK_END_PATTERN).unwrap(),
        Rule::new(8, "Line Filter", RuleKind::LineFilter, LINE_FILTER_PATTERN).unwrap(),
        Rule::new(11, "Replace", RuleKind::Replace, REPLACE_PATTERN).unwrap(),
    ]
});

/// The built-in rule set, in evaluation order
pub fn default_rules() -> &'static [Rule] {
    &DEFAULT_RULES
}
