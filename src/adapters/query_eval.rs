//! Query evaluation over named tags.
//!
//! The in-memory engine understands a small query language:
//!
//! ```text
//! SELECT *                | field, ...  | COUNT(*) | SUM(f) | MIN(f) | MAX(f) | AVG(f)
//! DELETE
//!   [WHERE field op value [AND field op value ...]]
//!   [GROUP BY field, ...]
//!   [ORDER BY field [ASC|DESC], ...]
//! ```
//!
//! `op` is one of `= != <> < <= > >=`; `value` is a `?name` parameter or a
//! literal (`'text'`, number, `true`, `false`, `null`). Fields name item
//! tags; `$key` is the item key.

use std::cmp::Ordering;

use serde_json::Value;

use crate::domain::item::NamedTags;
use crate::domain::query::{
    compare_values, AggregateFunction, AggregateValue, OrderByColumn, QueryParams,
    ReaderDescriptor, ReaderRow, SortDirection,
};
use crate::error::{Error, Result};

const KEY_FIELD: &str = "$key";

/// Statement kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statement {
    Select,
    Delete,
}

/// What a select returns.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    All,
    Fields(Vec<String>),
    Aggregate(AggregateFunction, Option<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Param(String),
    Literal(Value),
}

#[derive(Debug, Clone, PartialEq)]
struct Condition {
    field: String,
    op: CompareOp,
    operand: Operand,
}

/// A parsed query.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedQuery {
    pub statement: Statement,
    pub projection: Projection,
    conditions: Vec<Condition>,
    pub group_by: Vec<String>,
    pub order_by: Vec<(String, SortDirection)>,
}

fn invalid(query: &str, reason: impl std::fmt::Display) -> Error {
    Error::InvalidArgument(format!("invalid query '{}': {}", query, reason))
}

/// Split into words, quoted strings and punctuation.
fn tokenize(query: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut chars = query.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '\'' => {
                chars.next();
                let mut text = String::from("'");
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => text.push(ch),
                        None => return Err(invalid(query, "unterminated string")),
                    }
                }
                text.push('\'');
                tokens.push(text);
            }
            '(' | ')' | ',' | '*' => {
                chars.next();
                tokens.push(c.to_string());
            }
            '=' | '!' | '<' | '>' => {
                chars.next();
                let mut op = c.to_string();
                if let Some(&next) = chars.peek() {
                    if next == '=' || (c == '<' && next == '>') {
                        op.push(next);
                        chars.next();
                    }
                }
                tokens.push(op);
            }
            _ => {
                let mut word = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_whitespace() || "(),*=!<>'".contains(ch) {
                        break;
                    }
                    word.push(ch);
                    chars.next();
                }
                tokens.push(word);
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    query: &'a str,
    tokens: Vec<String>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&str> {
        self.tokens.get(self.pos).map(String::as_str)
    }

    fn next(&mut self) -> Result<String> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| invalid(self.query, "unexpected end"))?;
        self.pos += 1;
        Ok(token)
    }

    fn keyword(&mut self, word: &str) -> bool {
        if self.peek().is_some_and(|t| t.eq_ignore_ascii_case(word)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &str) -> Result<()> {
        let got = self.next()?;
        if got.eq_ignore_ascii_case(token) {
            Ok(())
        } else {
            Err(invalid(self.query, format!("expected '{}', found '{}'", token, got)))
        }
    }

    fn field_list(&mut self) -> Result<Vec<String>> {
        let mut fields = vec![self.next()?];
        while self.peek() == Some(",") {
            self.pos += 1;
            fields.push(self.next()?);
        }
        Ok(fields)
    }

    fn projection(&mut self) -> Result<Projection> {
        if self.peek() == Some("*") {
            self.pos += 1;
            return Ok(Projection::All);
        }
        let function = match self.peek().map(str::to_ascii_uppercase).as_deref() {
            Some("COUNT") => Some(AggregateFunction::Count),
            Some("SUM") => Some(AggregateFunction::Sum),
            Some("MIN") => Some(AggregateFunction::Min),
            Some("MAX") => Some(AggregateFunction::Max),
            Some("AVG") => Some(AggregateFunction::Average),
            _ => None,
        };
        if let Some(function) = function {
            if self.tokens.get(self.pos + 1).map(String::as_str) == Some("(") {
                self.pos += 2;
                let arg = self.next()?;
                self.expect(")")?;
                let field = (arg != "*").then_some(arg);
                if field.is_none() && function != AggregateFunction::Count {
                    return Err(invalid(self.query, "aggregate needs a field"));
                }
                return Ok(Projection::Aggregate(function, field));
            }
        }
        Ok(Projection::Fields(self.field_list()?))
    }

    fn operand(&mut self) -> Result<Operand> {
        let token = self.next()?;
        if let Some(name) = token.strip_prefix('?') {
            if name.is_empty() {
                return Err(invalid(self.query, "parameters must be named (?name)"));
            }
            return Ok(Operand::Param(name.to_string()));
        }
        if token.len() >= 2 && token.starts_with('\'') && token.ends_with('\'') {
            return Ok(Operand::Literal(Value::String(token[1..token.len() - 1].to_string())));
        }
        let literal = match token.to_ascii_lowercase().as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            "null" => Value::Null,
            _ => serde_json::from_str::<serde_json::Number>(&token)
                .map(Value::Number)
                .map_err(|_| invalid(self.query, format!("bad literal '{}'", token)))?,
        };
        Ok(Operand::Literal(literal))
    }

    fn condition(&mut self) -> Result<Condition> {
        let field = self.next()?;
        let op = match self.next()?.as_str() {
            "=" | "==" => CompareOp::Eq,
            "!=" | "<>" => CompareOp::Ne,
            "<" => CompareOp::Lt,
            "<=" => CompareOp::Le,
            ">" => CompareOp::Gt,
            ">=" => CompareOp::Ge,
            other => return Err(invalid(self.query, format!("unknown operator '{}'", other))),
        };
        Ok(Condition {
            field,
            op,
            operand: self.operand()?,
        })
    }
}

impl ParsedQuery {
    pub fn parse(query: &str) -> Result<Self> {
        let mut p = Parser {
            query,
            tokens: tokenize(query)?,
            pos: 0,
        };

        let (statement, projection) = if p.keyword("SELECT") {
            (Statement::Select, p.projection()?)
        } else if p.keyword("DELETE") {
            (Statement::Delete, Projection::All)
        } else {
            return Err(invalid(query, "expected SELECT or DELETE"));
        };

        let mut conditions = Vec::new();
        if p.keyword("WHERE") {
            conditions.push(p.condition()?);
            while p.keyword("AND") {
                conditions.push(p.condition()?);
            }
        }

        let mut group_by = Vec::new();
        if p.keyword("GROUP") {
            p.expect("BY")?;
            group_by = p.field_list()?;
        }

        let mut order_by = Vec::new();
        if p.keyword("ORDER") {
            p.expect("BY")?;
            loop {
                let field = p.next()?;
                let direction = if p.keyword("DESC") {
                    SortDirection::Descending
                } else {
                    p.keyword("ASC");
                    SortDirection::Ascending
                };
                order_by.push((field, direction));
                if p.peek() != Some(",") {
                    break;
                }
                p.pos += 1;
            }
        }

        if let Some(extra) = p.peek() {
            return Err(invalid(query, format!("unexpected '{}'", extra)));
        }

        Ok(Self {
            statement,
            projection,
            conditions,
            group_by,
            order_by,
        })
    }

    /// Whether an item satisfies every condition.
    pub fn matches(&self, key: &str, tags: &NamedTags, params: &QueryParams) -> Result<bool> {
        for condition in &self.conditions {
            let operand = match &condition.operand {
                Operand::Literal(v) => v,
                Operand::Param(name) => params
                    .get(name)
                    .ok_or_else(|| Error::InvalidArgument(format!("missing query parameter '{}'", name)))?,
            };
            let value = field_value(key, tags, &condition.field);
            let ord = compare_values(Some(&value), Some(operand));
            let pass = match condition.op {
                CompareOp::Eq => ord == Ordering::Equal,
                CompareOp::Ne => ord != Ordering::Equal,
                CompareOp::Lt => ord == Ordering::Less,
                CompareOp::Le => ord != Ordering::Greater,
                CompareOp::Gt => ord == Ordering::Greater,
                CompareOp::Ge => ord != Ordering::Less,
            };
            if !pass {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Column layout of reader rows: projected fields, then any group-by and
    /// order-by fields not already projected.
    pub fn descriptor(&self) -> ReaderDescriptor {
        let mut columns = match &self.projection {
            Projection::Fields(fields) => fields.clone(),
            _ => Vec::new(),
        };
        let mut position = |field: &str, columns: &mut Vec<String>| {
            columns.iter().position(|c| c == field).unwrap_or_else(|| {
                columns.push(field.to_string());
                columns.len() - 1
            })
        };
        let group_by = self
            .group_by
            .iter()
            .map(|f| position(f, &mut columns))
            .collect();
        let order_by = self
            .order_by
            .iter()
            .map(|(f, direction)| OrderByColumn {
                column: position(f, &mut columns),
                direction: *direction,
            })
            .collect();
        ReaderDescriptor {
            columns,
            order_by,
            group_by,
        }
    }

    /// Reader row for an item under `descriptor`.
    pub fn row(descriptor: &ReaderDescriptor, key: &str, tags: &NamedTags) -> ReaderRow {
        let values = descriptor
            .columns
            .iter()
            .map(|c| field_value(key, tags, c))
            .collect();
        ReaderRow::new(Some(key.to_string()), values)
    }

    /// Aggregate over matching items, if the projection is an aggregate.
    pub fn aggregate<'a, I>(&self, items: I) -> Option<AggregateValue>
    where
        I: Iterator<Item = (&'a str, &'a NamedTags)>,
    {
        let Projection::Aggregate(function, field) = &self.projection else {
            return None;
        };
        let mut count = 0u64;
        let mut acc: Option<f64> = None;
        for (key, tags) in items {
            count += 1;
            let Some(field) = field else {
                continue;
            };
            let Some(x) = field_value(key, tags, field).as_f64() else {
                continue;
            };
            acc = Some(match (function, acc) {
                (_, None) => x,
                (AggregateFunction::Min, Some(a)) => a.min(x),
                (AggregateFunction::Max, Some(a)) => a.max(x),
                (_, Some(a)) => a + x,
            });
        }
        let value = match function {
            AggregateFunction::Count => count as f64,
            AggregateFunction::Average if count > 0 => acc.unwrap_or(0.0) / count as f64,
            _ => acc.unwrap_or(0.0),
        };
        Some(AggregateValue {
            function: *function,
            value,
            count,
        })
    }
}

fn field_value(key: &str, tags: &NamedTags, field: &str) -> Value {
    if field.eq_ignore_ascii_case(KEY_FIELD) {
        return Value::String(key.to_string());
    }
    tags.get(field).cloned().unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn tags(price: i64, region: &str) -> NamedTags {
        NamedTags::from([
            ("price".to_string(), json!(price)),
            ("region".to_string(), json!(region)),
        ])
    }

    #[test]
    fn test_where_with_params_and_literals() {
        let q = ParsedQuery::parse("SELECT * WHERE price >= ?min AND region = 'eu'").unwrap();
        let params = QueryParams::from([("min".to_string(), json!(10))]);

        assert!(q.matches("a", &tags(10, "eu"), &params).unwrap());
        assert!(!q.matches("b", &tags(9, "eu"), &params).unwrap());
        assert!(!q.matches("c", &tags(50, "us"), &params).unwrap());
        assert_matches!(
            q.matches("d", &tags(1, "eu"), &QueryParams::new()),
            Err(Error::InvalidArgument(_))
        );
    }

    #[test]
    fn test_descriptor_appends_sort_columns() {
        let q = ParsedQuery::parse("SELECT region GROUP BY region ORDER BY price DESC").unwrap();
        let d = q.descriptor();
        assert_eq!(d.columns, vec!["region", "price"]);
        assert_eq!(d.group_by, vec![0]);
        assert_eq!(d.order_by[0].column, 1);
        assert_eq!(d.order_by[0].direction, SortDirection::Descending);
    }

    #[test]
    fn test_aggregates() {
        let a = tags(10, "eu");
        let b = tags(30, "eu");
        let items = || vec![("a", &a), ("b", &b)].into_iter();

        let sum = ParsedQuery::parse("SELECT SUM(price)").unwrap();
        assert_eq!(sum.aggregate(items()).unwrap().value, 40.0);

        let avg = ParsedQuery::parse("select avg(price)").unwrap();
        assert_eq!(avg.aggregate(items()).unwrap().value, 20.0);

        let count = ParsedQuery::parse("SELECT COUNT(*) WHERE price > 15").unwrap();
        assert_eq!(count.projection, Projection::Aggregate(AggregateFunction::Count, None));
    }

    #[test]
    fn test_rejects_malformed_queries() {
        assert!(ParsedQuery::parse("UPDATE x").is_err());
        assert!(ParsedQuery::parse("SELECT * WHERE price ~ 3").is_err());
        assert!(ParsedQuery::parse("SELECT * WHERE name = 'open").is_err());
        assert!(ParsedQuery::parse("SELECT * WHERE price > ?").is_err());
        assert!(ParsedQuery::parse("SELECT * ORDER price").is_err());
    }

    #[test]
    fn test_key_field() {
        let q = ParsedQuery::parse("DELETE WHERE $key = 'order:1'").unwrap();
        assert_eq!(q.statement, Statement::Delete);
        assert!(q.matches("order:1", &NamedTags::new(), &QueryParams::new()).unwrap());
    }
}
