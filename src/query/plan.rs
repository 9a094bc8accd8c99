//! Query plans: the algebraic form the parser produces and the executor
//! runs. The `Match` root selects records from the index; the remaining
//! stages transform the result stream.

use std::cell::OnceCell;

use regex::Regex;

use crate::fields::FieldCatalog;
use crate::index::TokenClauses;
use crate::index::segment::tokenize;
use crate::models::field::FieldType;
use crate::models::log::LogRecord;

use super::ParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// Boolean selection tree over records.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchExpr {
    /// `*` or an empty query.
    All,
    /// Unqualified token; matches `message` and all tokenized fields.
    Term(String),
    /// Quoted phrase; consecutive tokens.
    Phrase(String),
    /// Raw regex against `message` (from `isRegex` requests).
    Regex(String),
    Cmp {
        field: String,
        op: CmpOp,
        value: String,
    },
    And(Vec<MatchExpr>),
    Or(Vec<MatchExpr>),
    Not(Box<MatchExpr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggFunc {
    pub fn parse(s: &str) -> Option<AggFunc> {
        match s.to_ascii_lowercase().as_str() {
            "count" => Some(AggFunc::Count),
            "sum" => Some(AggFunc::Sum),
            "avg" => Some(AggFunc::Avg),
            "min" => Some(AggFunc::Min),
            "max" => Some(AggFunc::Max),
            _ => None,
        }
    }

    pub fn label(&self, field: Option<&str>) -> String {
        let name = match self {
            AggFunc::Count => "count",
            AggFunc::Sum => "sum",
            AggFunc::Avg => "avg",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
        };
        match field {
            Some(f) if *self != AggFunc::Count || !f.is_empty() => format!("{name}({f})"),
            _ => name.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

/// Right-hand side of `eval field = <expr>`.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalExpr {
    Field(String),
    Number(f64),
    Str(String),
    Binary {
        op: char,
        lhs: Box<EvalExpr>,
        rhs: Box<EvalExpr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Where(MatchExpr),
    Stats {
        func: AggFunc,
        field: Option<String>,
        by: Option<String>,
    },
    Sort {
        field: String,
        dir: SortDir,
    },
    Head(usize),
    Tail(usize),
    Eval {
        field: String,
        expr: EvalExpr,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub matcher: MatchExpr,
    pub stages: Vec<Stage>,
}

impl Plan {
    pub fn match_all() -> Self {
        Plan {
            matcher: MatchExpr::All,
            stages: Vec::new(),
        }
    }

    /// Plan for an `isRegex` request: the raw pattern against `message`.
    pub fn from_regex(pattern: &str) -> Result<Self, ParseError> {
        Regex::new(pattern).map_err(|e| ParseError::InvalidRegex(e.to_string()))?;
        Ok(Plan {
            matcher: MatchExpr::Regex(pattern.to_string()),
            stages: Vec::new(),
        })
    }

    /// The single source this plan pins with `source=...` at the top level,
    /// used by the shard router to prune fan-out.
    pub fn exact_source(&self) -> Option<&str> {
        fn walk(expr: &MatchExpr) -> Option<&str> {
            match expr {
                MatchExpr::Cmp { field, op: CmpOp::Eq, value } if field == "source" => {
                    Some(value.as_str())
                }
                MatchExpr::And(children) => children.iter().find_map(walk),
                _ => None,
            }
        }
        walk(&self.matcher)
    }
}

/// A `MatchExpr` with regexes compiled and token clauses precomputed for
/// segment skipping.
pub struct CompiledMatch {
    expr: CompiledExpr,
    clauses: TokenClauses,
}

enum CompiledExpr {
    All,
    Term(String),
    Phrase(Vec<String>),
    Regex(Regex),
    Cmp {
        field: String,
        op: CmpOp,
        value: String,
    },
    And(Vec<CompiledExpr>),
    Or(Vec<CompiledExpr>),
    Not(Box<CompiledExpr>),
}

impl CompiledMatch {
    pub fn compile(expr: &MatchExpr, catalog: &FieldCatalog) -> Result<Self, ParseError> {
        let compiled = compile_expr(expr)?;
        let mut clauses = Vec::new();
        collect_clauses(expr, catalog, &mut clauses);
        Ok(Self {
            expr: compiled,
            clauses,
        })
    }

    /// Conjunctive token clauses; a segment missing any clause entirely
    /// cannot contain a match.
    pub fn token_clauses(&self) -> &TokenClauses {
        &self.clauses
    }

    pub fn matches(&self, record: &LogRecord, catalog: &FieldCatalog) -> bool {
        let ctx = RecordCtx {
            record,
            catalog,
            message_tokens: OnceCell::new(),
        };
        eval(&self.expr, &ctx)
    }

    /// Evaluate against a flattened row, as produced by `LogRecord::to_row`
    /// or an earlier pipeline stage. Used by `where` after `stats`/`eval`.
    pub fn matches_row(&self, row: &serde_json::Map<String, serde_json::Value>) -> bool {
        eval_row(&self.expr, row)
    }
}

fn compile_expr(expr: &MatchExpr) -> Result<CompiledExpr, ParseError> {
    Ok(match expr {
        MatchExpr::All => CompiledExpr::All,
        MatchExpr::Term(t) => CompiledExpr::Term(t.to_lowercase()),
        MatchExpr::Phrase(p) => {
            CompiledExpr::Phrase(tokenize(p).into_iter().map(|(t, _)| t).collect())
        }
        MatchExpr::Regex(pattern) => CompiledExpr::Regex(
            Regex::new(pattern).map_err(|e| ParseError::InvalidRegex(e.to_string()))?,
        ),
        MatchExpr::Cmp { field, op, value } => CompiledExpr::Cmp {
            field: field.clone(),
            op: *op,
            value: value.clone(),
        },
        MatchExpr::And(children) => CompiledExpr::And(
            children.iter().map(compile_expr).collect::<Result<_, _>>()?,
        ),
        MatchExpr::Or(children) => CompiledExpr::Or(
            children.iter().map(compile_expr).collect::<Result<_, _>>()?,
        ),
        MatchExpr::Not(inner) => CompiledExpr::Not(Box::new(compile_expr(inner)?)),
    })
}

/// Clauses come only from the conjunctive spine of the expression; `OR`,
/// `NOT` and regex branches prune nothing.
fn collect_clauses(expr: &MatchExpr, catalog: &FieldCatalog, out: &mut TokenClauses) {
    match expr {
        MatchExpr::Term(t) => {
            let mut clause = Vec::new();
            for (token, _) in tokenize(t) {
                clause.push(("message".to_string(), token.clone()));
                for field in catalog.tokenized_fields() {
                    clause.push((field.to_string(), token.clone()));
                }
            }
            if !clause.is_empty() {
                out.push(clause);
            }
        }
        MatchExpr::Phrase(p) => {
            for (token, _) in tokenize(p) {
                let mut clause = vec![("message".to_string(), token.clone())];
                for field in catalog.tokenized_fields() {
                    clause.push((field.to_string(), token.clone()));
                }
                out.push(clause);
            }
        }
        MatchExpr::Cmp {
            field,
            op: CmpOp::Eq,
            value,
        } => {
            let options = catalog.options(field);
            let builtin_exact = matches!(field.as_str(), "level" | "source" | "host");
            // Numeric and date equality can hold between textually different
            // values, so only string-typed fields are safe to prune on.
            let exact_string = options.indexed
                && !options.tokenized
                && options.field_type == FieldType::String
                && field != "message";
            if builtin_exact || exact_string {
                out.push(vec![(field.clone(), value.to_lowercase())]);
            }
        }
        MatchExpr::And(children) => {
            for child in children {
                collect_clauses(child, catalog, out);
            }
        }
        _ => {}
    }
}

struct RecordCtx<'a> {
    record: &'a LogRecord,
    catalog: &'a FieldCatalog,
    message_tokens: OnceCell<Vec<String>>,
}

impl RecordCtx<'_> {
    fn message_tokens(&self) -> &[String] {
        self.message_tokens
            .get_or_init(|| {
                tokenize(&self.record.message)
                    .into_iter()
                    .map(|(t, _)| t)
                    .collect()
            })
            .as_slice()
    }

    fn token_match(&self, token: &str) -> bool {
        if self.message_tokens().iter().any(|t| t == token) {
            return true;
        }
        for field in self.catalog.tokenized_fields() {
            if let Some(value) = self.record.fields.get(field) {
                if tokenize(value).iter().any(|(t, _)| t == token) {
                    return true;
                }
            }
        }
        false
    }

    fn phrase_match(&self, tokens: &[String]) -> bool {
        if tokens.is_empty() {
            return true;
        }
        if contains_sequence(self.message_tokens(), tokens) {
            return true;
        }
        for field in self.catalog.tokenized_fields() {
            if let Some(value) = self.record.fields.get(field) {
                let field_tokens: Vec<String> =
                    tokenize(value).into_iter().map(|(t, _)| t).collect();
                if contains_sequence(&field_tokens, tokens) {
                    return true;
                }
            }
        }
        false
    }
}

fn contains_sequence(haystack: &[String], needle: &[String]) -> bool {
    if needle.len() > haystack.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn eval(expr: &CompiledExpr, ctx: &RecordCtx<'_>) -> bool {
    match expr {
        CompiledExpr::All => true,
        CompiledExpr::Term(token) => ctx.token_match(token),
        CompiledExpr::Phrase(tokens) => ctx.phrase_match(tokens),
        CompiledExpr::Regex(re) => re.is_match(&ctx.record.message),
        CompiledExpr::Cmp { field, op, value } => {
            // Fields configured indexed=false are stored but not searchable.
            if ctx.record.fields.contains_key(field) && !ctx.catalog.options(field).indexed {
                return false;
            }
            let Some(actual) = ctx.record.field_value(field) else {
                return false;
            };
            let field_type = ctx.catalog.options(field).field_type;
            compare(&actual, *op, value, field_type)
        }
        CompiledExpr::And(children) => children.iter().all(|c| eval(c, ctx)),
        CompiledExpr::Or(children) => children.iter().any(|c| eval(c, ctx)),
        CompiledExpr::Not(inner) => !eval(inner, ctx),
    }
}

fn eval_row(expr: &CompiledExpr, row: &serde_json::Map<String, serde_json::Value>) -> bool {
    match expr {
        CompiledExpr::All => true,
        CompiledExpr::Term(token) => row
            .get("message")
            .and_then(|v| v.as_str())
            .map(|m| tokenize(m).iter().any(|(t, _)| t == token))
            .unwrap_or(false),
        CompiledExpr::Phrase(tokens) => row
            .get("message")
            .and_then(|v| v.as_str())
            .map(|m| {
                let message_tokens: Vec<String> =
                    tokenize(m).into_iter().map(|(t, _)| t).collect();
                contains_sequence(&message_tokens, tokens)
            })
            .unwrap_or(false),
        CompiledExpr::Regex(re) => row
            .get("message")
            .and_then(|v| v.as_str())
            .map(|m| re.is_match(m))
            .unwrap_or(false),
        CompiledExpr::Cmp { field, op, value } => {
            let Some(actual) = row.get(field) else {
                return false;
            };
            let actual = match actual {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                _ => return false,
            };
            compare(&actual, *op, value, FieldType::String)
        }
        CompiledExpr::And(children) => children.iter().all(|c| eval_row(c, row)),
        CompiledExpr::Or(children) => children.iter().any(|c| eval_row(c, row)),
        CompiledExpr::Not(inner) => !eval_row(inner, row),
    }
}

/// Typed comparison. Equality is case-insensitive on strings; ordering
/// operators work on numbers and dates and are false for anything that
/// does not parse as either.
fn compare(actual: &str, op: CmpOp, expected: &str, field_type: FieldType) -> bool {
    match op {
        CmpOp::Eq => equals(actual, expected, field_type),
        CmpOp::Ne => !equals(actual, expected, field_type),
        CmpOp::Gt | CmpOp::Gte | CmpOp::Lt | CmpOp::Lte => {
            let ordering = numeric_ordering(actual, expected)
                .or_else(|| date_ordering(actual, expected));
            match ordering {
                Some(ordering) => match op {
                    CmpOp::Gt => ordering.is_gt(),
                    CmpOp::Gte => ordering.is_ge(),
                    CmpOp::Lt => ordering.is_lt(),
                    CmpOp::Lte => ordering.is_le(),
                    _ => unreachable!(),
                },
                None => false,
            }
        }
    }
}

fn equals(actual: &str, expected: &str, field_type: FieldType) -> bool {
    match field_type {
        FieldType::Number => match (actual.parse::<f64>(), expected.parse::<f64>()) {
            (Ok(a), Ok(b)) => a == b,
            _ => actual.eq_ignore_ascii_case(expected),
        },
        _ => actual.eq_ignore_ascii_case(expected),
    }
}

fn numeric_ordering(a: &str, b: &str) -> Option<std::cmp::Ordering> {
    let a = a.trim().parse::<f64>().ok()?;
    let b = b.trim().parse::<f64>().ok()?;
    a.partial_cmp(&b)
}

fn date_ordering(a: &str, b: &str) -> Option<std::cmp::Ordering> {
    let a = crate::fields::parse_date_ms(a.trim())?;
    let b = crate::fields::parse_date_ms(b.trim())?;
    Some(a.cmp(&b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::field::{FieldConfiguration, SourceField};
    use crate::models::log::LogLevel;

    fn catalog() -> FieldCatalog {
        FieldCatalog::compile(&[FieldConfiguration {
            id: "f1".into(),
            name: "status".into(),
            source_field: SourceField::Message,
            extraction_pattern: Some(r"status=(\d+)".into()),
            field_type: FieldType::Number,
            indexed: true,
            stored: true,
            tokenized: false,
            enabled: true,
        }])
    }

    fn record(message: &str, fields: &[(&str, &str)]) -> LogRecord {
        LogRecord {
            id: "r1".into(),
            timestamp: 50,
            level: LogLevel::Error,
            source: "app.log".into(),
            message: message.into(),
            raw: None,
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            host: None,
        }
    }

    fn matches(expr: MatchExpr, rec: &LogRecord) -> bool {
        let catalog = catalog();
        CompiledMatch::compile(&expr, &catalog)
            .unwrap()
            .matches(rec, &catalog)
    }

    #[test]
    fn term_matches_message_tokens() {
        let rec = record("connection refused by peer", &[]);
        assert!(matches(MatchExpr::Term("refused".into()), &rec));
        assert!(matches(MatchExpr::Term("REFUSED".into()), &rec));
        assert!(!matches(MatchExpr::Term("accepted".into()), &rec));
    }

    #[test]
    fn phrase_requires_adjacency() {
        let rec = record("connection refused by peer", &[]);
        assert!(matches(MatchExpr::Phrase("refused by".into()), &rec));
        assert!(!matches(MatchExpr::Phrase("connection peer".into()), &rec));
    }

    #[test]
    fn level_comparison_is_case_insensitive() {
        let rec = record("boom", &[]);
        assert!(matches(
            MatchExpr::Cmp {
                field: "level".into(),
                op: CmpOp::Eq,
                value: "error".into()
            },
            &rec
        ));
    }

    #[test]
    fn numeric_comparison_on_typed_field() {
        let rec = record("status=404", &[("status", "404")]);
        assert!(matches(
            MatchExpr::Cmp {
                field: "status".into(),
                op: CmpOp::Gt,
                value: "400".into()
            },
            &rec
        ));
        assert!(!matches(
            MatchExpr::Cmp {
                field: "status".into(),
                op: CmpOp::Lt,
                value: "400".into()
            },
            &rec
        ));
    }

    #[test]
    fn unknown_field_comparisons_are_false() {
        let rec = record("boom", &[]);
        assert!(!matches(
            MatchExpr::Cmp {
                field: "nope".into(),
                op: CmpOp::Gt,
                value: "1".into()
            },
            &rec
        ));
        assert!(!matches(
            MatchExpr::Cmp {
                field: "nope".into(),
                op: CmpOp::Ne,
                value: "1".into()
            },
            &rec
        ));
    }

    #[test]
    fn wrong_typed_ordering_is_false() {
        let rec = record("x", &[("status", "404")]);
        assert!(!matches(
            MatchExpr::Cmp {
                field: "message".into(),
                op: CmpOp::Gt,
                value: "a".into()
            },
            &rec
        ));
    }

    #[test]
    fn boolean_combinators() {
        let rec = record("timeout talking to db", &[]);
        let expr = MatchExpr::And(vec![
            MatchExpr::Term("timeout".into()),
            MatchExpr::Not(Box::new(MatchExpr::Term("cache".into()))),
        ]);
        assert!(matches(expr, &rec));
        let expr = MatchExpr::Or(vec![
            MatchExpr::Term("cache".into()),
            MatchExpr::Term("db".into()),
        ]);
        assert!(matches(expr, &rec));
    }

    #[test]
    fn exact_source_extraction() {
        let plan = Plan {
            matcher: MatchExpr::And(vec![
                MatchExpr::Term("boom".into()),
                MatchExpr::Cmp {
                    field: "source".into(),
                    op: CmpOp::Eq,
                    value: "app.log".into(),
                },
            ]),
            stages: Vec::new(),
        };
        assert_eq!(plan.exact_source(), Some("app.log"));
        assert_eq!(Plan::match_all().exact_source(), None);
    }

    #[test]
    fn token_clauses_cover_conjunctions_only() {
        let catalog = catalog();
        let expr = MatchExpr::And(vec![
            MatchExpr::Term("boom".into()),
            MatchExpr::Or(vec![
                MatchExpr::Term("a".into()),
                MatchExpr::Term("b".into()),
            ]),
        ]);
        let compiled = CompiledMatch::compile(&expr, &catalog).unwrap();
        // Only the conjunctive term produces a clause.
        assert_eq!(compiled.token_clauses().len(), 1);
        assert!(compiled.token_clauses()[0]
            .iter()
            .any(|(f, t)| f == "message" && t == "boom"));
    }

    #[test]
    fn invalid_regex_reports() {
        assert!(matches!(
            Plan::from_regex("(unclosed"),
            Err(ParseError::InvalidRegex(_))
        ));
    }
}
