//! Parser for the pipe-style search language.
//!
//! Supports:
//!   - Free text, quoted phrases, `field=value`, `field!=value`,
//!     `field>value` / `field>=value` / `field<value` / `field<=value`
//!   - `AND` / `OR` / `NOT` (case-insensitive), parenthesized groups,
//!     `*` or an empty query for match-all
//!   - Commands: `where <predicate>`, `stats <agg>(field) [by field]`,
//!     `sort <field> [asc|desc]`, `head <n>`, `tail <n>`,
//!     `eval <field>=<expr>`

pub mod plan;

use thiserror::Error;

pub use plan::{
    AggFunc, CmpOp, CompiledMatch, EvalExpr, MatchExpr, Plan, SortDir, Stage,
};

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("invalid regex: {0}")]
    InvalidRegex(String),
    #[error("mismatched parentheses")]
    Parens,
}

/// Parse a full query string into a plan.
pub fn parse(input: &str) -> Result<Plan, ParseError> {
    let segments = split_pipes(input);
    let matcher = parse_match(segments.first().map(String::as_str).unwrap_or(""))?;
    let mut stages = Vec::with_capacity(segments.len().saturating_sub(1));
    for segment in segments.iter().skip(1) {
        stages.push(parse_command(segment)?);
    }
    Ok(Plan { matcher, stages })
}

/// Parse just a boolean match expression (also used for `where`).
pub fn parse_match(text: &str) -> Result<MatchExpr, ParseError> {
    let tokens = lex(text)?;
    if tokens.is_empty() {
        return Ok(MatchExpr::All);
    }
    let mut parser = ExprParser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    match parser.peek() {
        None => Ok(expr),
        Some(Token::RParen) => Err(ParseError::Parens),
        Some(t) => Err(ParseError::Syntax(format!("unexpected {t:?}"))),
    }
}

/// Split at top-level `|`, honoring quotes and parentheses.
fn split_pipes(input: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut in_quote = false;
    for ch in input.chars() {
        match ch {
            '"' => {
                in_quote = !in_quote;
                current.push(ch);
            }
            '(' if !in_quote => {
                depth += 1;
                current.push(ch);
            }
            ')' if !in_quote => {
                depth -= 1;
                current.push(ch);
            }
            '|' if !in_quote && depth == 0 => {
                segments.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    segments.push(current);
    segments
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    /// A standalone quoted string.
    Phrase(String),
    /// Everything else, quotes around an embedded value already stripped.
    Word(String),
}

fn lex(text: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&ch) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '"' => {
                chars.next();
                tokens.push(Token::Phrase(read_quoted(&mut chars)?));
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    match c {
                        c if c.is_whitespace() => break,
                        '(' | ')' => break,
                        '"' => {
                            // field="some value"
                            chars.next();
                            word.push_str(&read_quoted(&mut chars)?);
                        }
                        _ => {
                            word.push(c);
                            chars.next();
                        }
                    }
                }
                tokens.push(Token::Word(word));
            }
        }
    }
    Ok(tokens)
}

fn read_quoted(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Result<String, ParseError> {
    let mut out = String::new();
    for ch in chars.by_ref() {
        match ch {
            '"' => return Ok(out),
            _ => out.push(ch),
        }
    }
    Err(ParseError::Syntax("unterminated quote".to_string()))
}

struct ExprParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl ExprParser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn parse_or(&mut self) -> Result<MatchExpr, ParseError> {
        let mut children = vec![self.parse_and()?];
        while self.peek_keyword("OR") {
            self.next();
            children.push(self.parse_and()?);
        }
        Ok(if children.len() == 1 {
            children.pop().unwrap()
        } else {
            MatchExpr::Or(children)
        })
    }

    /// Adjacency is an implicit AND, the explicit keyword optional.
    fn parse_and(&mut self) -> Result<MatchExpr, ParseError> {
        let mut children = vec![self.parse_unary()?];
        loop {
            if self.peek_keyword("AND") {
                self.next();
                children.push(self.parse_unary()?);
                continue;
            }
            match self.peek() {
                Some(Token::RParen) | None => break,
                Some(Token::Word(w)) if w.eq_ignore_ascii_case("OR") => break,
                Some(_) => children.push(self.parse_unary()?),
            }
        }
        Ok(if children.len() == 1 {
            children.pop().unwrap()
        } else {
            MatchExpr::And(children)
        })
    }

    fn parse_unary(&mut self) -> Result<MatchExpr, ParseError> {
        if self.peek_keyword("NOT") {
            self.next();
            return Ok(MatchExpr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<MatchExpr, ParseError> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ParseError::Parens),
                }
            }
            Some(Token::RParen) => Err(ParseError::Parens),
            Some(Token::Phrase(p)) => Ok(MatchExpr::Phrase(p)),
            Some(Token::Word(w)) => Ok(word_to_expr(&w)),
            None => Err(ParseError::Syntax("expected expression".to_string())),
        }
    }
}

fn word_to_expr(word: &str) -> MatchExpr {
    if word == "*" {
        return MatchExpr::All;
    }
    // Two-char operators first so `!=` does not read as a term and `>=`
    // does not read as `>` with a `=`-prefixed value.
    for (op_text, op) in [
        ("!=", CmpOp::Ne),
        (">=", CmpOp::Gte),
        ("<=", CmpOp::Lte),
        ("=", CmpOp::Eq),
        (">", CmpOp::Gt),
        ("<", CmpOp::Lt),
    ] {
        if let Some(idx) = word.find(op_text) {
            let field = &word[..idx];
            let value = &word[idx + op_text.len()..];
            if !field.is_empty() {
                return MatchExpr::Cmp {
                    field: field.to_string(),
                    op,
                    value: value.to_string(),
                };
            }
        }
    }
    MatchExpr::Term(word.to_string())
}

fn parse_command(segment: &str) -> Result<Stage, ParseError> {
    let text = segment.trim();
    let (command, rest) = match text.split_once(char::is_whitespace) {
        Some((c, r)) => (c, r.trim()),
        None => (text, ""),
    };
    match command.to_ascii_lowercase().as_str() {
        "where" => Ok(Stage::Where(parse_match(rest)?)),
        "stats" => parse_stats(rest),
        "sort" => parse_sort(rest),
        "head" => parse_limit(rest, true),
        "tail" => parse_limit(rest, false),
        "eval" => parse_eval(rest),
        "" => Err(ParseError::Syntax("empty command".to_string())),
        other => Err(ParseError::UnknownCommand(other.to_string())),
    }
}

/// `stats <agg>(field) [by field]`; `count` may omit the argument.
fn parse_stats(rest: &str) -> Result<Stage, ParseError> {
    let rest = rest.trim();
    if rest.is_empty() {
        return Err(ParseError::Syntax("stats needs an aggregate".to_string()));
    }

    let (call, after) = match rest.find(')') {
        Some(end) => (&rest[..=end], rest[end + 1..].trim()),
        None => match rest.split_once(char::is_whitespace) {
            Some((c, r)) => (c, r.trim()),
            None => (rest, ""),
        },
    };

    let (func_name, field) = match call.split_once('(') {
        Some((name, args)) => {
            let args = args
                .strip_suffix(')')
                .ok_or(ParseError::Parens)?
                .trim();
            (
                name.trim(),
                if args.is_empty() {
                    None
                } else {
                    Some(args.to_string())
                },
            )
        }
        None => (call.trim(), None),
    };

    let func = AggFunc::parse(func_name)
        .ok_or_else(|| ParseError::Syntax(format!("unknown aggregate: {func_name}")))?;
    if func != AggFunc::Count && field.is_none() {
        return Err(ParseError::Syntax(format!(
            "{func_name} needs a field argument"
        )));
    }

    let by = match after.split_once(char::is_whitespace) {
        Some((kw, f)) if kw.eq_ignore_ascii_case("by") => Some(f.trim().to_string()),
        None if after.is_empty() => None,
        _ => {
            return Err(ParseError::Syntax(format!(
                "unexpected trailing input: {after}"
            )));
        }
    };
    Ok(Stage::Stats { func, field, by })
}

fn parse_sort(rest: &str) -> Result<Stage, ParseError> {
    let mut parts = rest.split_whitespace();
    let field = parts
        .next()
        .ok_or_else(|| ParseError::Syntax("sort needs a field".to_string()))?;
    let dir = match parts.next() {
        None => SortDir::Desc,
        Some(d) if d.eq_ignore_ascii_case("asc") => SortDir::Asc,
        Some(d) if d.eq_ignore_ascii_case("desc") => SortDir::Desc,
        Some(d) => return Err(ParseError::Syntax(format!("bad sort direction: {d}"))),
    };
    Ok(Stage::Sort {
        field: field.to_string(),
        dir,
    })
}

fn parse_limit(rest: &str, head: bool) -> Result<Stage, ParseError> {
    let n: usize = rest
        .trim()
        .parse()
        .map_err(|_| ParseError::Syntax(format!("bad limit: {rest}")))?;
    Ok(if head { Stage::Head(n) } else { Stage::Tail(n) })
}

fn parse_eval(rest: &str) -> Result<Stage, ParseError> {
    let (field, expr_text) = rest
        .split_once('=')
        .ok_or_else(|| ParseError::Syntax("eval needs field=<expr>".to_string()))?;
    let field = field.trim();
    if field.is_empty() {
        return Err(ParseError::Syntax("eval needs a field name".to_string()));
    }
    Ok(Stage::Eval {
        field: field.to_string(),
        expr: parse_eval_expr(expr_text)?,
    })
}

/// Small arithmetic/concat grammar for `eval`: `+ - * /` over field
/// references, numbers and quoted strings.
fn parse_eval_expr(text: &str) -> Result<EvalExpr, ParseError> {
    let tokens = lex_eval(text)?;
    let mut parser = EvalParser { tokens, pos: 0 };
    let expr = parser.parse_sum()?;
    if parser.pos != parser.tokens.len() {
        return Err(ParseError::Syntax("trailing input in eval".to_string()));
    }
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum EvalToken {
    Num(f64),
    Str(String),
    Ident(String),
    Op(char),
    LParen,
    RParen,
}

fn lex_eval(text: &str) -> Result<Vec<EvalToken>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&ch) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(EvalToken::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(EvalToken::RParen);
            }
            '+' | '-' | '*' | '/' => {
                chars.next();
                tokens.push(EvalToken::Op(ch));
            }
            '"' => {
                chars.next();
                tokens.push(EvalToken::Str(read_quoted(&mut chars)?));
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut num = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        num.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(EvalToken::Num(num.parse().map_err(|_| {
                    ParseError::Syntax(format!("bad number: {num}"))
                })?));
            }
            c if c.is_alphanumeric() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(EvalToken::Ident(ident));
            }
            c => return Err(ParseError::Syntax(format!("unexpected character: {c}"))),
        }
    }
    Ok(tokens)
}

struct EvalParser {
    tokens: Vec<EvalToken>,
    pos: usize,
}

impl EvalParser {
    fn parse_sum(&mut self) -> Result<EvalExpr, ParseError> {
        let mut lhs = self.parse_product()?;
        while let Some(EvalToken::Op(op @ ('+' | '-'))) = self.tokens.get(self.pos).cloned() {
            self.pos += 1;
            let rhs = self.parse_product()?;
            lhs = EvalExpr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_product(&mut self) -> Result<EvalExpr, ParseError> {
        let mut lhs = self.parse_atom()?;
        while let Some(EvalToken::Op(op @ ('*' | '/'))) = self.tokens.get(self.pos).cloned() {
            self.pos += 1;
            let rhs = self.parse_atom()?;
            lhs = EvalExpr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_atom(&mut self) -> Result<EvalExpr, ParseError> {
        match self.tokens.get(self.pos).cloned() {
            Some(EvalToken::Num(n)) => {
                self.pos += 1;
                Ok(EvalExpr::Number(n))
            }
            Some(EvalToken::Str(s)) => {
                self.pos += 1;
                Ok(EvalExpr::Str(s))
            }
            Some(EvalToken::Ident(name)) => {
                self.pos += 1;
                Ok(EvalExpr::Field(name))
            }
            Some(EvalToken::LParen) => {
                self.pos += 1;
                let inner = self.parse_sum()?;
                match self.tokens.get(self.pos) {
                    Some(EvalToken::RParen) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err(ParseError::Parens),
                }
            }
            _ => Err(ParseError::Syntax("expected eval operand".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_star_match_all() {
        assert_eq!(parse("").unwrap().matcher, MatchExpr::All);
        assert_eq!(parse("  ").unwrap().matcher, MatchExpr::All);
        assert_eq!(parse("*").unwrap().matcher, MatchExpr::All);
    }

    #[test]
    fn bare_terms_and_implicit_and() {
        let plan = parse("connection refused").unwrap();
        assert_eq!(
            plan.matcher,
            MatchExpr::And(vec![
                MatchExpr::Term("connection".into()),
                MatchExpr::Term("refused".into()),
            ])
        );
    }

    #[test]
    fn field_operators() {
        assert_eq!(
            parse("level=ERROR").unwrap().matcher,
            MatchExpr::Cmp {
                field: "level".into(),
                op: CmpOp::Eq,
                value: "ERROR".into()
            }
        );
        assert_eq!(
            parse("status!=200").unwrap().matcher,
            MatchExpr::Cmp {
                field: "status".into(),
                op: CmpOp::Ne,
                value: "200".into()
            }
        );
        assert_eq!(
            parse("latency>=1.5").unwrap().matcher,
            MatchExpr::Cmp {
                field: "latency".into(),
                op: CmpOp::Gte,
                value: "1.5".into()
            }
        );
    }

    #[test]
    fn quoted_value_keeps_spaces() {
        let plan = parse(r#"message="not found""#).unwrap();
        assert_eq!(
            plan.matcher,
            MatchExpr::Cmp {
                field: "message".into(),
                op: CmpOp::Eq,
                value: "not found".into()
            }
        );
    }

    #[test]
    fn quoted_phrase() {
        assert_eq!(
            parse(r#""connection refused""#).unwrap().matcher,
            MatchExpr::Phrase("connection refused".into())
        );
    }

    #[test]
    fn boolean_grouping_and_precedence() {
        let plan = parse("(timeout OR refused) AND NOT debug").unwrap();
        assert_eq!(
            plan.matcher,
            MatchExpr::And(vec![
                MatchExpr::Or(vec![
                    MatchExpr::Term("timeout".into()),
                    MatchExpr::Term("refused".into()),
                ]),
                MatchExpr::Not(Box::new(MatchExpr::Term("debug".into()))),
            ])
        );
    }

    #[test]
    fn or_binds_looser_than_adjacency() {
        let plan = parse("a b OR c").unwrap();
        assert_eq!(
            plan.matcher,
            MatchExpr::Or(vec![
                MatchExpr::And(vec![
                    MatchExpr::Term("a".into()),
                    MatchExpr::Term("b".into()),
                ]),
                MatchExpr::Term("c".into()),
            ])
        );
    }

    #[test]
    fn mismatched_parens_error() {
        assert_eq!(parse("(a OR b").unwrap_err(), ParseError::Parens);
        assert_eq!(parse("a) b").unwrap_err(), ParseError::Parens);
    }

    #[test]
    fn where_command() {
        let plan = parse("error | where status=500").unwrap();
        assert_eq!(plan.stages.len(), 1);
        assert_eq!(
            plan.stages[0],
            Stage::Where(MatchExpr::Cmp {
                field: "status".into(),
                op: CmpOp::Eq,
                value: "500".into()
            })
        );
    }

    #[test]
    fn stats_variants() {
        assert_eq!(
            parse("* | stats count").unwrap().stages[0],
            Stage::Stats {
                func: AggFunc::Count,
                field: None,
                by: None
            }
        );
        assert_eq!(
            parse("* | stats count() by level").unwrap().stages[0],
            Stage::Stats {
                func: AggFunc::Count,
                field: None,
                by: Some("level".into())
            }
        );
        assert_eq!(
            parse("* | stats avg(latency) by source").unwrap().stages[0],
            Stage::Stats {
                func: AggFunc::Avg,
                field: Some("latency".into()),
                by: Some("source".into())
            }
        );
        assert!(matches!(
            parse("* | stats sum"),
            Err(ParseError::Syntax(_))
        ));
        assert!(matches!(
            parse("* | stats median(x)"),
            Err(ParseError::Syntax(_))
        ));
    }

    #[test]
    fn sort_head_tail() {
        assert_eq!(
            parse("* | sort timestamp asc").unwrap().stages[0],
            Stage::Sort {
                field: "timestamp".into(),
                dir: SortDir::Asc
            }
        );
        assert_eq!(
            parse("* | sort latency").unwrap().stages[0],
            Stage::Sort {
                field: "latency".into(),
                dir: SortDir::Desc
            }
        );
        assert_eq!(parse("* | head 10").unwrap().stages[0], Stage::Head(10));
        assert_eq!(parse("* | tail 5").unwrap().stages[0], Stage::Tail(5));
        assert!(matches!(parse("* | head x"), Err(ParseError::Syntax(_))));
    }

    #[test]
    fn eval_arithmetic() {
        let plan = parse("* | eval latency_ms=latency*1000").unwrap();
        assert_eq!(
            plan.stages[0],
            Stage::Eval {
                field: "latency_ms".into(),
                expr: EvalExpr::Binary {
                    op: '*',
                    lhs: Box::new(EvalExpr::Field("latency".into())),
                    rhs: Box::new(EvalExpr::Number(1000.0)),
                }
            }
        );
    }

    #[test]
    fn eval_precedence() {
        let plan = parse("* | eval x=1+2*3").unwrap();
        match &plan.stages[0] {
            Stage::Eval { expr, .. } => match expr {
                EvalExpr::Binary { op: '+', rhs, .. } => {
                    assert!(matches!(**rhs, EvalExpr::Binary { op: '*', .. }));
                }
                other => panic!("unexpected expr: {other:?}"),
            },
            other => panic!("unexpected stage: {other:?}"),
        }
    }

    #[test]
    fn unknown_command_error() {
        assert_eq!(
            parse("* | explode").unwrap_err(),
            ParseError::UnknownCommand("explode".into())
        );
    }

    #[test]
    fn chained_pipeline() {
        let plan = parse("level=ERROR | where source=app.log | stats count by source | head 3")
            .unwrap();
        assert_eq!(plan.stages.len(), 3);
    }
}
