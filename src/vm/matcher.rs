//! Match dispatch tables and the four runtime matchers built from them.

use std::collections::{BTreeMap, HashMap};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::ast::MatchClass;

use super::program::{ConstantPool, LoadError};

/// One `label -> pc` entry. `label` indexes the string pool, or the regex
/// pool for `MatchClass::RegExp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchCaseDef {
    pub label: usize,
    pub pc: usize,
}

/// Static description of one `match` statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchDef {
    /// Index of the handler whose code the pcs point into.
    pub handler: usize,
    pub class: MatchClass,
    pub else_pc: usize,
    pub cases: Vec<MatchCaseDef>,
}

/// Capture groups of the most recent successful regex match; group 0 is the
/// whole match, unmatched groups are empty.
pub type Captures = Vec<String>;

#[derive(Debug, Clone)]
pub enum Matcher {
    Exact(ExactMatcher),
    Prefix(TrieMatcher),
    Suffix(TrieMatcher),
    Regex(RegexMatcher),
}

impl Matcher {
    /// Builds the matcher selected by `def.class`. Labels are resolved
    /// against `pool`; regex labels must already be compiled in `regexes`.
    pub fn compile(def: &MatchDef, pool: &ConstantPool, regexes: &[Regex]) -> Result<Matcher, LoadError> {
        let string_label = |case: &MatchCaseDef| {
            pool.strings().get(case.label).map(String::as_str).ok_or(LoadError::InvalidMatchLabel {
                handler: def.handler,
                label: case.label,
            })
        };
        Ok(match def.class {
            MatchClass::Same => {
                let mut table = HashMap::with_capacity(def.cases.len());
                for case in &def.cases {
                    // first declaration wins
                    table.entry(string_label(case)?.to_string()).or_insert(case.pc);
                }
                Matcher::Exact(ExactMatcher { table, else_pc: def.else_pc })
            }
            MatchClass::Head => {
                let mut trie = TrieMatcher::new(def.else_pc);
                for case in &def.cases {
                    trie.insert(string_label(case)?.bytes(), case.pc);
                }
                Matcher::Prefix(trie)
            }
            MatchClass::Tail => {
                let mut trie = TrieMatcher::new(def.else_pc);
                for case in &def.cases {
                    trie.insert(string_label(case)?.bytes().rev(), case.pc);
                }
                Matcher::Suffix(trie)
            }
            MatchClass::RegExp => {
                let mut cases = Vec::with_capacity(def.cases.len());
                for case in &def.cases {
                    let re = regexes
                        .get(case.label)
                        .ok_or(LoadError::InvalidMatchLabel { handler: def.handler, label: case.label })?;
                    cases.push((re.clone(), case.pc));
                }
                Matcher::Regex(RegexMatcher { cases, else_pc: def.else_pc })
            }
        })
    }

    /// Target pc for `subject`. Never fails: no match yields the else pc.
    pub fn evaluate(&self, subject: &str) -> usize {
        match self {
            Matcher::Exact(m) => m.evaluate(subject),
            Matcher::Prefix(m) => m.longest_match(subject.bytes()),
            Matcher::Suffix(m) => m.longest_match(subject.bytes().rev()),
            Matcher::Regex(m) => m.evaluate(subject, None),
        }
    }

    /// Like `evaluate`, additionally storing regex capture groups on a match.
    pub fn evaluate_with_captures(&self, subject: &str, captures: &mut Captures) -> usize {
        match self {
            Matcher::Regex(m) => m.evaluate(subject, Some(captures)),
            other => other.evaluate(subject),
        }
    }
}

// ── Exact ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ExactMatcher {
    table: HashMap<String, usize>,
    else_pc: usize,
}

impl ExactMatcher {
    pub fn evaluate(&self, subject: &str) -> usize {
        self.table.get(subject).copied().unwrap_or(self.else_pc)
    }
}

// ── Prefix / suffix ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct TrieNode {
    children: BTreeMap<u8, usize>,
    target: Option<usize>,
}

/// Byte trie returning the target of the longest stored key that is a
/// prefix of the input. Suffix matching feeds both keys and input reversed.
#[derive(Debug, Clone)]
pub struct TrieMatcher {
    nodes: Vec<TrieNode>,
    else_pc: usize,
}

impl TrieMatcher {
    fn new(else_pc: usize) -> Self {
        TrieMatcher { nodes: vec![TrieNode::default()], else_pc }
    }

    fn insert(&mut self, key: impl Iterator<Item = u8>, pc: usize) {
        let mut node = 0;
        for byte in key {
            node = match self.nodes[node].children.get(&byte) {
                Some(next) => *next,
                None => {
                    let next = self.nodes.len();
                    self.nodes.push(TrieNode::default());
                    self.nodes[node].children.insert(byte, next);
                    next
                }
            };
        }
        // first declaration wins
        self.nodes[node].target.get_or_insert(pc);
    }

    fn longest_match(&self, input: impl Iterator<Item = u8>) -> usize {
        let mut node = 0;
        let mut best = self.nodes[0].target;
        for byte in input {
            match self.nodes[node].children.get(&byte) {
                Some(next) => node = *next,
                None => break,
            }
            if let Some(pc) = self.nodes[node].target {
                best = Some(pc);
            }
        }
        best.unwrap_or(self.else_pc)
    }
}

// ── Regex ────────────────────────────────────────────────────────────

/// Cases tried in declaration order; the first matching pattern wins.
#[derive(Debug, Clone)]
pub struct RegexMatcher {
    cases: Vec<(Regex, usize)>,
    else_pc: usize,
}

impl RegexMatcher {
    fn evaluate(&self, subject: &str, captures: Option<&mut Captures>) -> usize {
        for (re, pc) in &self.cases {
            let Some(caps) = re.captures(subject) else { continue };
            if let Some(out) = captures {
                out.clear();
                out.extend(caps.iter().map(|g| g.map_or_else(String::new, |m| m.as_str().to_string())));
            }
            return *pc;
        }
        self.else_pc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ELSE: usize = 99;

    fn build(class: MatchClass, labels: &[&str]) -> Matcher {
        let mut pool = ConstantPool::default();
        let mut regexes = Vec::new();
        let cases = labels
            .iter()
            .enumerate()
            .map(|(n, label)| {
                let index = if class == MatchClass::RegExp {
                    regexes.push(Regex::new(label).unwrap());
                    pool.make_regex(label)
                } else {
                    pool.make_string(label)
                };
                MatchCaseDef { label: index, pc: 10 + n }
            })
            .collect();
        let def = MatchDef { handler: 0, class, else_pc: ELSE, cases };
        Matcher::compile(&def, &pool, &regexes).unwrap()
    }

    #[test]
    fn exact_is_case_sensitive() {
        let m = build(MatchClass::Same, &["GET", "POST"]);
        assert_eq!(m.evaluate("GET"), 10);
        assert_eq!(m.evaluate("POST"), 11);
        assert_eq!(m.evaluate("get"), ELSE);
        assert_eq!(m.evaluate(""), ELSE);
    }

    #[test]
    fn prefix_longest_wins() {
        let m = build(MatchClass::Head, &["/a", "/ab"]);
        assert_eq!(m.evaluate("/abc"), 11);
        assert_eq!(m.evaluate("/a"), 10);
        assert_eq!(m.evaluate("/ax"), 10);
        assert_eq!(m.evaluate("/x"), ELSE);
        assert_eq!(m.evaluate("/"), ELSE);
    }

    #[test]
    fn prefix_order_does_not_matter() {
        let m = build(MatchClass::Head, &["/ab", "/a"]);
        assert_eq!(m.evaluate("/abc"), 10);
        assert_eq!(m.evaluate("/ac"), 11);
    }

    #[test]
    fn suffix_longest_wins() {
        let m = build(MatchClass::Tail, &[".gz", ".tar.gz", ".html"]);
        assert_eq!(m.evaluate("x.tar.gz"), 11);
        assert_eq!(m.evaluate("x.gz"), 10);
        assert_eq!(m.evaluate("index.html"), 12);
        assert_eq!(m.evaluate("index.htm"), ELSE);
    }

    #[test]
    fn empty_label_matches_everything() {
        let m = build(MatchClass::Head, &["", "/api"]);
        assert_eq!(m.evaluate("/api/v1"), 11);
        assert_eq!(m.evaluate("/other"), 10);
    }

    #[test]
    fn regex_first_declared_wins() {
        let m = build(MatchClass::RegExp, &["^/a", "^/ab"]);
        assert_eq!(m.evaluate("/abc"), 10);
        assert_eq!(m.evaluate("/zzz"), ELSE);
    }

    #[test]
    fn regex_captures_groups() {
        let m = build(MatchClass::RegExp, &[r"^/user/(\d+)(/edit)?$"]);
        let mut caps = Captures::new();
        assert_eq!(m.evaluate_with_captures("/user/42", &mut caps), 10);
        assert_eq!(caps, vec!["/user/42".to_string(), "42".to_string(), String::new()]);

        // a miss keeps the previous captures
        assert_eq!(m.evaluate_with_captures("/nope", &mut caps), ELSE);
        assert_eq!(caps[1], "42");
    }

    #[test]
    fn bad_label_index_is_a_load_error() {
        let pool = ConstantPool::default();
        let def = MatchDef {
            handler: 0,
            class: MatchClass::Same,
            else_pc: 0,
            cases: vec![MatchCaseDef { label: 3, pc: 1 }],
        };
        let err = Matcher::compile(&def, &pool, &[]).unwrap_err();
        assert!(matches!(err, LoadError::InvalidMatchLabel { label: 3, .. }));
    }
}
