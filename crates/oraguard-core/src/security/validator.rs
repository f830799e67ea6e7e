//! Statement validation.
//!
//! Given raw SQL, produces a [`QueryVerdict`]: admitted or rejected, with
//! warnings, a complexity score, and the effective SQL to execute. Checks
//! run in a fixed order and short-circuit on the first rejection:
//!
//! 1. non-empty after normalization
//! 2. leading verb is `SELECT` or `WITH`
//! 3. no forbidden verb as a whole word
//! 4. no set operator
//! 5. no cartesian product (comma FROM list or `CROSS JOIN`)
//! 6. complexity at or below the ceiling
//! 7. row cap rewrite when no bound is present
//!
//! Rejection rules are data - a compiled pattern and a reason - evaluated
//! by one loop, so adding a rule never touches the dispatcher.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::GatewayConfig;
use crate::error::Result;
use crate::security::complexity::{analyze_from, tokens_with_depth, ComplexityScorer};
use crate::security::normalize::canonicalize;

/// Verbs that reject a statement wherever they appear as whole words.
const FORBIDDEN_VERBS: &[&str] = &[
    "DELETE", "INSERT", "UPDATE", "MERGE", "DROP", "TRUNCATE", "ALTER", "CREATE", "GRANT",
    "REVOKE", "EXECUTE", "CALL", "COMMIT", "ROLLBACK", "SAVEPOINT", "LOCK", "RENAME",
];

/// Set operators enable exfiltration through type coercion across arbitrary
/// tables, so they reject outright.
const SET_OPERATORS: &[&str] = &["UNION", "INTERSECT", "MINUS", "EXCEPT"];

/// Outcome of validating one statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryVerdict {
    /// Whether the statement may execute.
    pub admitted: bool,

    /// First rule that rejected the statement; empty when admitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Non-fatal observations about the statement.
    pub warnings: Vec<String>,

    /// Complexity score (present even for admitted statements).
    pub complexity: u32,

    /// Row cap added by rewrite, when the statement carried no bound.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_row_cap: Option<u32>,

    /// The statement to execute; empty when rejected.
    pub effective_sql: String,
}

impl QueryVerdict {
    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            admitted:        false,
            reason:          Some(reason.into()),
            warnings:        Vec::new(),
            complexity:      0,
            applied_row_cap: None,
            effective_sql:   String::new(),
        }
    }
}

/// A named rejection pattern.
struct RejectionRule {
    pattern: Regex,
    reason:  String,
}

/// Rule-driven statement validator.
#[derive(Debug)]
pub struct QueryValidator {
    max_complexity:    u32,
    max_rows:          u32,
    allow_cross_joins: bool,
    rules:             Vec<RejectionRule>,
    scorer:            ComplexityScorer,
    leading_verb:      Regex,
    row_bound:         Regex,
    select_star:       Regex,
    where_clause:      Regex,
}

impl std::fmt::Debug for RejectionRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RejectionRule").field("reason", &self.reason).finish()
    }
}

impl QueryValidator {
    /// Build a validator from the gateway configuration.
    ///
    /// Patterns compile once here; validation itself never allocates a
    /// regex.
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let mut rules = Vec::new();

        for verb in FORBIDDEN_VERBS {
            rules.push(RejectionRule {
                pattern: word_pattern(verb)?,
                reason:  format!("forbidden verb {verb}"),
            });
        }
        for op in SET_OPERATORS {
            rules.push(RejectionRule {
                pattern: word_pattern(op)?,
                reason:  format!("set operator {op} is not allowed"),
            });
        }
        if !config.allow_cross_joins {
            rules.push(RejectionRule {
                pattern: compile(r"\bCROSS JOIN\b")?,
                reason:  "explicit cartesian product (CROSS JOIN) is not allowed".to_string(),
            });
        }

        Ok(Self {
            max_complexity: config.max_complexity,
            max_rows: config.max_rows,
            allow_cross_joins: config.allow_cross_joins,
            rules,
            scorer: ComplexityScorer::new()?,
            leading_verb: compile(r"^(?:SELECT|WITH)\b")?,
            row_bound: compile(r"\bROWNUM\b|\bFETCH (?:FIRST|NEXT)\b")?,
            select_star: compile(r"\bSELECT \*")?,
            where_clause: compile(r"\bWHERE\b")?,
        })
    }

    /// Validate raw SQL and produce a verdict.
    #[must_use]
    pub fn validate(&self, raw: &str) -> QueryVerdict {
        let canonical = canonicalize(raw);

        if canonical.is_empty() {
            return QueryVerdict::rejected("empty statement after normalization");
        }

        if !self.leading_verb.is_match(&canonical) {
            return QueryVerdict::rejected("statement must begin with SELECT or WITH");
        }

        for rule in &self.rules {
            if rule.pattern.is_match(&canonical) {
                return QueryVerdict::rejected(rule.reason.clone());
            }
        }

        let tokens = tokens_with_depth(&canonical);
        let from = analyze_from(&tokens);
        if from.top_level_comma_join && !self.allow_cross_joins {
            return QueryVerdict::rejected(
                "implicit cartesian product: comma-separated FROM list",
            );
        }

        let breakdown = self.scorer.score(&canonical);
        if breakdown.score > self.max_complexity {
            return QueryVerdict::rejected(format!(
                "complexity {} exceeds ceiling {}",
                breakdown.score, self.max_complexity
            ));
        }

        let has_where = self.where_clause.is_match(&canonical);
        let mut warnings = Vec::new();
        if from.top_level_comma_join && has_where {
            warnings.push("implicit multi-table join constrained only by WHERE".to_string());
        }
        if self.select_star.is_match(&canonical) && from.table_count() > 1 {
            warnings.push("SELECT * over more than one table".to_string());
        }
        if breakdown.distinct > 0 {
            warnings.push("DISTINCT forces a sort or hash of the full result".to_string());
        }
        if breakdown.subqueries + breakdown.ctes + breakdown.windows > 0 {
            warnings.push(format!(
                "statement uses {} subqueries, {} CTEs, {} window functions",
                breakdown.subqueries, breakdown.ctes, breakdown.windows
            ));
        }

        let (effective_sql, applied_row_cap) = self.apply_row_cap(raw, &canonical);

        QueryVerdict {
            admitted: true,
            reason: None,
            warnings,
            complexity: breakdown.score,
            applied_row_cap,
            effective_sql,
        }
    }

    /// Wrap the original text in a row-capping predicate unless it already
    /// carries a bound. Wrapping as an inline view keeps any outermost
    /// ORDER BY intact.
    fn apply_row_cap(&self, raw: &str, canonical: &str) -> (String, Option<u32>) {
        if self.row_bound.is_match(canonical) {
            return (raw.trim().to_string(), None);
        }

        let trimmed = raw.trim().trim_end_matches(';').trim_end();
        (
            format!("SELECT * FROM ({trimmed}) WHERE ROWNUM <= {}", self.max_rows),
            Some(self.max_rows),
        )
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| {
        crate::error::GatewayError::internal(format!("bad validation pattern {pattern:?}: {e}"))
    })
}

fn word_pattern(word: &str) -> Result<Regex> {
    compile(&format!(r"\b{word}\b"))
}
