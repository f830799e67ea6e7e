//! Complexity scoring.
//!
//! Produces an integer summary of potentially expensive SQL constructs from
//! the canonical form. The score is an admission threshold, not a cost
//! model: weights are fixed and additive, and the subquery and CTE
//! penalties always stack.

use std::collections::HashMap;

use regex::Regex;
use serde::Serialize;

use crate::error::{GatewayError, Result};

const BASE_WEIGHT: u32 = 5;
const JOIN_WEIGHT: u32 = 5;
const AGGREGATE_WEIGHT: u32 = 3;
const DISTINCT_WEIGHT: u32 = 5;
const SUBQUERY_WEIGHT: u32 = 10;
const CTE_WEIGHT: u32 = 8;
const WINDOW_WEIGHT: u32 = 12;
const SELF_JOIN_WEIGHT: u32 = 15;
const LEADING_WILDCARD_WEIGHT: u32 = 10;
const EXTRA_OR_WEIGHT: u32 = 4;
const NESTING_WEIGHT: u32 = 5;

/// Top-level ORs tolerated before each further one is penalized.
const FREE_OR_COUNT: u32 = 2;
/// Subquery nesting depth tolerated before each further level is penalized.
const FREE_NESTING_DEPTH: u32 = 2;

/// Per-construct counts and the resulting score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ComplexityBreakdown {
    /// JOIN keywords.
    pub joins: u32,
    /// Aggregate function names and GROUP BY clauses.
    pub aggregates: u32,
    /// DISTINCT keywords.
    pub distinct: u32,
    /// Parenthesized subqueries.
    pub subqueries: u32,
    /// Top-level common-table-expression names.
    pub ctes: u32,
    /// Window functions.
    pub windows: u32,
    /// Pairs of FROM/JOIN entries sharing a base table name.
    pub self_join_pairs: u32,
    /// LIKE patterns with a leading wildcard.
    pub leading_wildcards: u32,
    /// OR keywords outside any parentheses.
    pub top_level_ors: u32,
    /// Deepest subquery nesting level.
    pub nesting_depth: u32,
    /// Weighted sum.
    pub score: u32,
}

/// Weighted scorer over the canonical form.
#[derive(Debug)]
pub struct ComplexityScorer {
    join:             Regex,
    aggregate:        Regex,
    distinct:         Regex,
    subquery:         Regex,
    window:           Regex,
    leading_wildcard: Regex,
}

impl ComplexityScorer {
    /// Compile the scoring patterns.
    pub fn new() -> Result<Self> {
        Ok(Self {
            join:             compile(r"\bJOIN\b")?,
            aggregate:        compile(r"\b(?:COUNT|SUM|AVG|MIN|MAX)\b|\bGROUP BY\b")?,
            distinct:         compile(r"\bDISTINCT\b")?,
            subquery:         compile(r"\(\s*SELECT\b")?,
            window:           compile(r"\)\s*OVER\s*\(")?,
            leading_wildcard: compile(r"\bLIKE\s*'%")?,
        })
    }

    /// Score a canonical statement.
    #[must_use]
    pub fn score(&self, canonical: &str) -> ComplexityBreakdown {
        let tokens = tokens_with_depth(canonical);
        let from = analyze_from(&tokens);

        let joins = count(&self.join, canonical);
        let aggregates = count(&self.aggregate, canonical);
        let distinct = count(&self.distinct, canonical);
        let subqueries = count(&self.subquery, canonical);
        let windows = count(&self.window, canonical);
        let leading_wildcards = count(&self.leading_wildcard, canonical);
        let ctes = count_top_level_ctes(&tokens);
        let top_level_ors = count_top_level_ors(&tokens);
        let self_join_pairs = count_self_join_pairs(&from.scopes);
        let nesting_depth = max_subquery_nesting(canonical);

        let score = BASE_WEIGHT
            + joins * JOIN_WEIGHT
            + aggregates * AGGREGATE_WEIGHT
            + distinct * DISTINCT_WEIGHT
            + subqueries * SUBQUERY_WEIGHT
            + ctes * CTE_WEIGHT
            + windows * WINDOW_WEIGHT
            + self_join_pairs * SELF_JOIN_WEIGHT
            + leading_wildcards * LEADING_WILDCARD_WEIGHT
            + top_level_ors.saturating_sub(FREE_OR_COUNT) * EXTRA_OR_WEIGHT
            + nesting_depth.saturating_sub(FREE_NESTING_DEPTH) * NESTING_WEIGHT;

        ComplexityBreakdown {
            joins,
            aggregates,
            distinct,
            subqueries,
            ctes,
            windows,
            self_join_pairs,
            leading_wildcards,
            top_level_ors,
            nesting_depth,
            score,
        }
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| GatewayError::internal(format!("bad scoring pattern {pattern:?}: {e}")))
}

#[allow(clippy::cast_possible_truncation)]
fn count(pattern: &Regex, canonical: &str) -> u32 {
    pattern.find_iter(canonical).count() as u32
}

/// A word token (or comma) together with its parenthesis depth.
pub(crate) struct Token<'a> {
    pub depth: u32,
    pub text:  &'a str,
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b == b'#' || b == b'.'
}

/// Split the canonical form into word tokens and commas, tracking depth.
pub(crate) fn tokens_with_depth(canonical: &str) -> Vec<Token<'_>> {
    let bytes = canonical.as_bytes();
    let mut tokens = Vec::new();
    let mut depth: u32 = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'(' => {
                depth += 1;
                i += 1;
            },
            b')' => {
                depth = depth.saturating_sub(1);
                i += 1;
            },
            b',' => {
                tokens.push(Token { depth, text: "," });
                i += 1;
            },
            b if is_word_byte(b) => {
                let start = i;
                while i < bytes.len() && is_word_byte(bytes[i]) {
                    i += 1;
                }
                tokens.push(Token {
                    depth,
                    text: &canonical[start..i],
                });
            },
            _ => i += 1,
        }
    }
    tokens
}

/// Table references grouped by FROM clause, plus comma-join evidence.
pub(crate) struct FromAnalysis {
    /// One entry per FROM clause: its table list together with the JOINs
    /// chained to that same clause. Subqueries get their own scope.
    pub scopes: Vec<Vec<String>>,
    /// A comma appeared inside the top-level FROM list.
    pub top_level_comma_join: bool,
}

impl FromAnalysis {
    /// Total table references across all clauses.
    pub(crate) fn table_count(&self) -> usize {
        self.scopes.iter().map(Vec::len).sum()
    }
}

/// Keywords that end a FROM clause at its own depth.
const SCOPE_TERMINATORS: &[&str] = &[
    "WHERE", "GROUP", "ORDER", "HAVING", "CONNECT", "START", "UNION", "INTERSECT", "MINUS",
    "EXCEPT", "FETCH", "OFFSET", "FOR",
];

/// Keywords that qualify a JOIN without naming a table.
const JOIN_MODIFIERS: &[&str] = &["INNER", "LEFT", "RIGHT", "FULL", "CROSS", "OUTER", "NATURAL"];

pub(crate) fn analyze_from(tokens: &[Token<'_>]) -> FromAnalysis {
    let mut scopes = Vec::new();
    let mut top_level_comma_join = false;

    for (i, t) in tokens.iter().enumerate() {
        if t.text != "FROM" {
            continue;
        }
        let from_depth = t.depth;
        let mut scope = Vec::new();
        let mut expect_name = true;

        for u in &tokens[i + 1..] {
            if u.depth < from_depth {
                break;
            }
            if u.depth > from_depth {
                // a subquery fills the pending table position; its own FROM
                // is scanned as a separate scope
                expect_name = false;
                continue;
            }
            if u.text == "," {
                if from_depth == 0 {
                    top_level_comma_join = true;
                }
                expect_name = true;
            } else if SCOPE_TERMINATORS.contains(&u.text) {
                break;
            } else if u.text == "JOIN" {
                expect_name = true;
            } else if u.text == "ON" || u.text == "USING" {
                expect_name = false;
            } else if JOIN_MODIFIERS.contains(&u.text) {
                // qualifier; the JOIN that follows re-arms the name slot
            } else if expect_name {
                scope.push(u.text.to_string());
                expect_name = false;
            }
        }
        scopes.push(scope);
    }

    FromAnalysis {
        scopes,
        top_level_comma_join,
    }
}

fn count_top_level_ctes(tokens: &[Token<'_>]) -> u32 {
    let mut iter = tokens.iter();
    match iter.next() {
        Some(t) if t.depth == 0 && t.text == "WITH" => {},
        _ => return 0,
    }

    let mut ctes = 0;
    for t in iter {
        if t.depth == 0 {
            match t.text {
                "SELECT" => break,
                "AS" => ctes += 1,
                _ => {},
            }
        }
    }
    ctes
}

#[allow(clippy::cast_possible_truncation)]
fn count_top_level_ors(tokens: &[Token<'_>]) -> u32 {
    tokens.iter().filter(|t| t.depth == 0 && t.text == "OR").count() as u32
}

fn base_name(table: &str) -> &str {
    table.rsplit('.').next().unwrap_or(table)
}

/// Self-joins are pairs within one FROM clause's own table list; the same
/// base table referenced by unrelated query blocks is not a join.
fn count_self_join_pairs(scopes: &[Vec<String>]) -> u32 {
    let mut pairs = 0;
    for scope in scopes {
        let mut seen: HashMap<&str, u32> = HashMap::new();
        for table in scope {
            *seen.entry(base_name(table)).or_insert(0) += 1;
        }
        pairs += seen.values().map(|&k| k * k.saturating_sub(1) / 2).sum::<u32>();
    }
    pairs
}

/// Deepest nesting level of parenthesized subqueries.
fn max_subquery_nesting(canonical: &str) -> u32 {
    let bytes = canonical.as_bytes();
    let mut stack: Vec<bool> = Vec::new();
    let mut current: u32 = 0;
    let mut deepest: u32 = 0;

    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'(' => {
                let mut j = i + 1;
                while j < bytes.len() && bytes[j] == b' ' {
                    j += 1;
                }
                let is_subquery = bytes.len() >= j + 6
                    && &bytes[j..j + 6] == b"SELECT"
                    && !bytes.get(j + 6).copied().is_some_and(is_word_byte);
                stack.push(is_subquery);
                if is_subquery {
                    current += 1;
                    deepest = deepest.max(current);
                }
            },
            b')' => {
                if stack.pop() == Some(true) {
                    current = current.saturating_sub(1);
                }
            },
            _ => {},
        }
    }
    deepest
}
