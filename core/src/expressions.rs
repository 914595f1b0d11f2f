// ==============================================================================
// expressions.rs - Sample Selection Expressions
// ==============================================================================
// Description: Parser and SQL rendering for Boolean sample-selection
//              expressions (clauses over samples and groups)
// Author: Matt Barham
// Created: 2025-12-05
// Modified: 2026-01-15
// Version: 1.1.0
// ==============================================================================
// Grammar:
//   expr   := or
//   or     := and ('or' and)*
//   and    := unary ('and' unary)*
//   unary  := 'not' unary | primary
//   primary:= '*' | '(' expr ')' | clause
//   clause := ('sample' | 'group') ':' value
// Precedence is not > and > or, left-associative. Clause values are bare
// integer ids or resource URIs whose last path segment is the id.
// ==============================================================================

use std::fmt;

use thiserror::Error;

/// Expression errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SelectionError {
    #[error("Parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },

    #[error("Unknown clause field: {0}")]
    UnknownField(String),

    #[error("Invalid id in clause value: {0}")]
    InvalidId(String),

    #[error("Unbounded selection: negating the tautology requires at least one positive clause")]
    InvalidSelection,
}

/// Selection expression AST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// `*`: every active sample with a coverage profile.
    Tautology,
    Sample(i64),
    Group(i64),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

/// A selection rendered as a SQL predicate over the `sample` alias.
/// Placeholders are numbered from `first_param`; `params` binds in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionSql {
    pub sql: String,
    pub params: Vec<i64>,
    /// Samples named by a non-negated `sample:` clause. These contribute
    /// their pool size to coverage denominators unconditionally.
    pub explicit_samples: Vec<i64>,
}

impl Expr {
    /// Parse and validate a selection expression.
    pub fn parse(input: &str) -> Result<Expr, SelectionError> {
        let mut parser = Parser {
            input: input.as_bytes(),
            pos: 0,
        };
        let expr = parser.parse_or()?;
        parser.skip_ws();
        if parser.pos < parser.input.len() {
            return Err(parser.error("trailing input"));
        }
        expr.validate()?;
        Ok(expr)
    }

    /// Reject selections whose only reach is a negated tautology. Such an
    /// expression would select an unbounded sample set by accident.
    fn validate(&self) -> Result<(), SelectionError> {
        let mut negated_tautology = false;
        let mut positive_clause = false;
        self.scan(false, &mut negated_tautology, &mut positive_clause);
        if negated_tautology && !positive_clause {
            return Err(SelectionError::InvalidSelection);
        }
        Ok(())
    }

    fn scan(&self, negated: bool, negated_tautology: &mut bool, positive_clause: &mut bool) {
        match self {
            Expr::Tautology => {
                if negated {
                    *negated_tautology = true;
                }
            }
            Expr::Sample(_) | Expr::Group(_) => {
                if !negated {
                    *positive_clause = true;
                }
            }
            Expr::Not(inner) => inner.scan(!negated, negated_tautology, positive_clause),
            Expr::And(l, r) | Expr::Or(l, r) => {
                l.scan(negated, negated_tautology, positive_clause);
                r.scan(negated, negated_tautology, positive_clause);
            }
        }
    }

    /// Render the expression as a SQL predicate over the `sample` table
    /// alias, numbering placeholders from `first_param`.
    pub fn to_sql(&self, first_param: usize) -> SelectionSql {
        let mut sql = String::new();
        let mut params = Vec::new();
        self.render(&mut sql, &mut params, first_param);
        SelectionSql {
            sql,
            params,
            explicit_samples: self.explicit_samples(),
        }
    }

    fn render(&self, sql: &mut String, params: &mut Vec<i64>, first_param: usize) {
        match self {
            Expr::Tautology => {
                sql.push_str("(sample.active AND sample.coverage_profile)");
            }
            Expr::Sample(id) => {
                params.push(*id);
                sql.push_str(&format!("sample.id = ${}", first_param + params.len() - 1));
            }
            Expr::Group(id) => {
                params.push(*id);
                sql.push_str(&format!(
                    "EXISTS (SELECT 1 FROM group_membership gm \
                     WHERE gm.sample_id = sample.id AND gm.group_id = ${})",
                    first_param + params.len() - 1
                ));
            }
            Expr::Not(inner) => {
                sql.push_str("NOT (");
                inner.render(sql, params, first_param);
                sql.push(')');
            }
            Expr::And(l, r) => {
                sql.push('(');
                l.render(sql, params, first_param);
                sql.push_str(" AND ");
                r.render(sql, params, first_param);
                sql.push(')');
            }
            Expr::Or(l, r) => {
                sql.push('(');
                l.render(sql, params, first_param);
                sql.push_str(" OR ");
                r.render(sql, params, first_param);
                sql.push(')');
            }
        }
    }

    /// Sample ids named by non-negated `sample:` clauses.
    pub fn explicit_samples(&self) -> Vec<i64> {
        fn walk(expr: &Expr, negated: bool, out: &mut Vec<i64>) {
            match expr {
                Expr::Sample(id) if !negated => {
                    if !out.contains(id) {
                        out.push(*id);
                    }
                }
                Expr::Not(inner) => walk(inner, !negated, out),
                Expr::And(l, r) | Expr::Or(l, r) => {
                    walk(l, negated, out);
                    walk(r, negated, out);
                }
                _ => {}
            }
        }
        let mut out = Vec::new();
        walk(self, false, &mut out);
        out
    }

    /// True iff the expression is syntactically the bare tautology.
    pub fn is_tautology(&self) -> bool {
        matches!(self, Expr::Tautology)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn child(expr: &Expr, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            if matches!(expr, Expr::And(..) | Expr::Or(..)) {
                write!(f, "({})", expr)
            } else {
                write!(f, "{}", expr)
            }
        }
        match self {
            Expr::Tautology => write!(f, "*"),
            Expr::Sample(id) => write!(f, "sample:{}", id),
            Expr::Group(id) => write!(f, "group:{}", id),
            Expr::Not(inner) => {
                write!(f, "not ")?;
                child(inner, f)
            }
            Expr::And(l, r) => {
                child(l, f)?;
                write!(f, " and ")?;
                child(r, f)
            }
            Expr::Or(l, r) => {
                child(l, f)?;
                write!(f, " or ")?;
                child(r, f)
            }
        }
    }
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

const KEYWORDS: [&str; 3] = ["not", "and", "or"];

impl<'a> Parser<'a> {
    fn error(&self, message: &str) -> SelectionError {
        SelectionError::Parse {
            offset: self.pos,
            message: message.to_string(),
        }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.input.len() && self.input[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    /// Consume the given keyword if it is next, respecting word boundaries.
    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let saved = self.pos;
        self.skip_ws();
        let word = self.read_word();
        if word == keyword {
            true
        } else {
            self.pos = saved;
            false
        }
    }

    /// Read a field word: characters up to whitespace, parentheses, or a
    /// colon.
    fn read_word(&mut self) -> String {
        let start = self.pos;
        while self.pos < self.input.len() {
            let c = self.input[self.pos];
            if c.is_ascii_whitespace() || c == b'(' || c == b')' || c == b':' || c == b'*' {
                break;
            }
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    /// Read a clause value: characters up to whitespace or parentheses.
    /// Colons are allowed so URI values survive.
    fn read_value(&mut self) -> String {
        let start = self.pos;
        while self.pos < self.input.len() {
            let c = self.input[self.pos];
            if c.is_ascii_whitespace() || c == b'(' || c == b')' {
                break;
            }
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    fn parse_or(&mut self) -> Result<Expr, SelectionError> {
        let mut left = self.parse_and()?;
        while self.eat_keyword("or") {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, SelectionError> {
        let mut left = self.parse_unary()?;
        while self.eat_keyword("and") {
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, SelectionError> {
        if self.eat_keyword("not") {
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, SelectionError> {
        self.skip_ws();
        match self.peek() {
            Some(b'*') => {
                self.pos += 1;
                Ok(Expr::Tautology)
            }
            Some(b'(') => {
                self.pos += 1;
                let expr = self.parse_or()?;
                self.skip_ws();
                if self.peek() != Some(b')') {
                    return Err(self.error("expected ')'"));
                }
                self.pos += 1;
                Ok(expr)
            }
            Some(_) => self.parse_clause(),
            None => Err(self.error("unexpected end of expression")),
        }
    }

    fn parse_clause(&mut self) -> Result<Expr, SelectionError> {
        let field = self.read_word();
        if field.is_empty() {
            return Err(self.error("expected a clause"));
        }
        if KEYWORDS.contains(&field.as_str()) {
            return Err(self.error("keyword cannot start a clause"));
        }
        self.skip_ws();
        if self.peek() != Some(b':') {
            return Err(self.error("expected ':' in clause"));
        }
        self.pos += 1;
        self.skip_ws();
        let value = self.read_value();
        if value.is_empty() {
            return Err(self.error("expected a clause value"));
        }

        let id = parse_clause_id(&value)?;
        match field.as_str() {
            "sample" => Ok(Expr::Sample(id)),
            "group" => Ok(Expr::Group(id)),
            _ => Err(SelectionError::UnknownField(field)),
        }
    }
}

/// Extract the numeric id from a clause value, which may be a bare
/// integer or a resource URI ending in the id.
fn parse_clause_id(value: &str) -> Result<i64, SelectionError> {
    let tail = value.trim_end_matches('/').rsplit('/').next().unwrap_or("");
    tail.parse::<i64>()
        .map_err(|_| SelectionError::InvalidId(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_clauses() {
        assert_eq!(Expr::parse("sample:3").unwrap(), Expr::Sample(3));
        assert_eq!(Expr::parse("group:12").unwrap(), Expr::Group(12));
        assert_eq!(Expr::parse("*").unwrap(), Expr::Tautology);
        assert_eq!(Expr::parse("(*)").unwrap(), Expr::Tautology);
        assert_eq!(Expr::parse("  sample : 3 ").unwrap(), Expr::Sample(3));
    }

    #[test]
    fn test_parse_uri_values() {
        assert_eq!(Expr::parse("sample:/samples/7").unwrap(), Expr::Sample(7));
        assert_eq!(
            Expr::parse("sample:https://localhost:8080/samples/3").unwrap(),
            Expr::Sample(3)
        );
        assert_eq!(Expr::parse("group:/groups/4/").unwrap(), Expr::Group(4));
    }

    #[test]
    fn test_precedence_not_and_or() {
        // not > and > or
        let expr = Expr::parse("sample:1 and sample:2 or sample:3").unwrap();
        assert_eq!(
            expr,
            Expr::Or(
                Box::new(Expr::And(
                    Box::new(Expr::Sample(1)),
                    Box::new(Expr::Sample(2))
                )),
                Box::new(Expr::Sample(3))
            )
        );

        let expr = Expr::parse("not sample:1 and sample:2").unwrap();
        assert_eq!(
            expr,
            Expr::And(
                Box::new(Expr::Not(Box::new(Expr::Sample(1)))),
                Box::new(Expr::Sample(2))
            )
        );
    }

    #[test]
    fn test_left_associativity() {
        let expr = Expr::parse("sample:1 or sample:2 or sample:3").unwrap();
        assert_eq!(
            expr,
            Expr::Or(
                Box::new(Expr::Or(
                    Box::new(Expr::Sample(1)),
                    Box::new(Expr::Sample(2))
                )),
                Box::new(Expr::Sample(3))
            )
        );
    }

    #[test]
    fn test_parentheses_override() {
        let expr = Expr::parse("sample:1 and (sample:2 or sample:3)").unwrap();
        assert_eq!(
            expr,
            Expr::And(
                Box::new(Expr::Sample(1)),
                Box::new(Expr::Or(
                    Box::new(Expr::Sample(2)),
                    Box::new(Expr::Sample(3))
                ))
            )
        );
    }

    #[test]
    fn test_invalid_expressions() {
        for input in [
            "",
            "       ",
            "not",
            "sample",
            ":",
            "::",
            "or : bla",
            "* ()",
            "()",
            "* : *",
            "x:()",
            "sample:3 sample:4",
            "sample:3 and",
        ] {
            assert!(Expr::parse(input).is_err(), "accepted: {:?}", input);
        }
    }

    #[test]
    fn test_unknown_field_and_bad_id() {
        assert_eq!(
            Expr::parse("donor:3"),
            Err(SelectionError::UnknownField("donor".to_string()))
        );
        assert_eq!(
            Expr::parse("sample:abc"),
            Err(SelectionError::InvalidId("abc".to_string()))
        );
    }

    #[test]
    fn test_negated_tautology_rejected() {
        assert_eq!(Expr::parse("not *"), Err(SelectionError::InvalidSelection));
        assert_eq!(
            Expr::parse("not (*)"),
            Err(SelectionError::InvalidSelection)
        );
        assert_eq!(
            Expr::parse("not * and not sample:3"),
            Err(SelectionError::InvalidSelection)
        );
        // A positive clause anchors the selection.
        assert!(Expr::parse("not * and sample:3").is_ok());
        assert!(Expr::parse("not not *").is_ok());
    }

    #[test]
    fn test_sql_rendering() {
        let sel = Expr::parse("sample:3").unwrap().to_sql(1);
        assert_eq!(sel.sql, "sample.id = $1");
        assert_eq!(sel.params, vec![3]);
        assert_eq!(sel.explicit_samples, vec![3]);

        let sel = Expr::parse("*").unwrap().to_sql(1);
        assert_eq!(sel.sql, "(sample.active AND sample.coverage_profile)");
        assert!(sel.params.is_empty());
        assert!(sel.explicit_samples.is_empty());

        let sel = Expr::parse("not sample:4").unwrap().to_sql(2);
        assert_eq!(sel.sql, "NOT (sample.id = $2)");
        assert_eq!(sel.params, vec![4]);
        assert!(sel.explicit_samples.is_empty());
    }

    #[test]
    fn test_sql_rendering_compound() {
        let sel = Expr::parse("sample:1 and (group:2 or sample:3)")
            .unwrap()
            .to_sql(1);
        assert_eq!(
            sel.sql,
            "(sample.id = $1 AND (EXISTS (SELECT 1 FROM group_membership gm \
             WHERE gm.sample_id = sample.id AND gm.group_id = $2) OR sample.id = $3))"
        );
        assert_eq!(sel.params, vec![1, 2, 3]);
        assert_eq!(sel.explicit_samples, vec![1, 3]);
    }

    #[test]
    fn test_display_round_trip() {
        for input in [
            "sample:3",
            "not sample:4",
            "sample:1 and (group:2 or sample:3)",
            "* or sample:9",
        ] {
            let expr = Expr::parse(input).unwrap();
            let printed = expr.to_string();
            assert_eq!(Expr::parse(&printed).unwrap(), expr, "from {:?}", input);
        }
    }
}
