//! Contextual Query Language filters
//!
//! Compiles CQL text such as
//! `status = open and (title adj "war and peace" or price.amount > 10)
//! sortBy title/sort.descending` into the same WHERE-clause contract as
//! [`Criterion`](crate::Criterion). Indexes are dotted paths into the
//! document column.
//!
//! Supported relations:
//! - `==` exact text match
//! - `=` numeric equality for numeric terms, otherwise a case-insensitive
//!   match where `*` and `?` are wildcards
//! - `<>` negation of `=`
//! - `<`, `>`, `<=`, `>=` numeric when the term is a number, text otherwise
//! - `adj` phrase contained in the value
//! - `all` / `any` every / some word of the term contained in the value
//!
//! Boolean operators `and`, `or` and `not` share one precedence level and
//! associate to the left; use parentheses to group.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{PersistError, Result};
use crate::sql::criteria::{JSONB_FIELD, checked_column, json_accessor};
use crate::sql::fragment::{QueryFilter, SqlFragment, paging_clause};
use crate::sql::sanitize::quote_literal;

static NUMBER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?[0-9]+(\.[0-9]+)?$").expect("number pattern compiles"));

const ALL_RECORDS_INDEX: &str = "cql.allrecords";

/// A CQL query plus paging, targeting one document column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CqlWrapper {
    query: String,
    column: String,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl CqlWrapper {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            column: JSONB_FIELD.to_string(),
            limit: None,
            offset: None,
        }
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Query a different document column; must be a plain lower-case identifier
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    fn parse(&self) -> Result<Option<ParsedQuery>> {
        if self.query.trim().is_empty() {
            return Ok(None);
        }
        let tokens = tokenize(&self.query)?;
        Parser::new(tokens).parse_query().map(Some)
    }

    fn render(&self) -> Result<String> {
        let column = checked_column(&self.column)?;
        let mut out = String::new();

        if let Some(parsed) = self.parse()? {
            out.push_str("WHERE ");
            out.push_str(&parsed.node.render(column)?);

            if !parsed.sort.is_empty() {
                let keys = parsed
                    .sort
                    .iter()
                    .map(|key| {
                        let keys = index_keys(&key.index, column)?;
                        let direction = if key.descending { "DESC" } else { "ASC" };
                        Ok(format!("{} {}", json_accessor(column, &keys, true), direction))
                    })
                    .collect::<Result<Vec<_>>>()?;
                out.push_str(" ORDER BY ");
                out.push_str(&keys.join(", "));
            }
        }

        let paging = paging_clause(self.limit, self.offset);
        if out.is_empty() {
            out.push_str(paging.trim_start());
        } else {
            out.push_str(&paging);
        }
        Ok(out)
    }
}

impl QueryFilter for CqlWrapper {
    fn to_sql(&self) -> Result<SqlFragment> {
        self.render().map(SqlFragment::new)
    }

    fn has_order_or_paging(&self) -> Result<bool> {
        if self.limit.is_some() || self.offset.is_some() {
            return Ok(true);
        }
        Ok(self.parse()?.is_some_and(|parsed| !parsed.sort.is_empty()))
    }
}

// ==================== Lexer ====================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    LParen,
    RParen,
    Slash,
    Symbol(String),
    Word(String),
    Quoted(String),
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
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
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '=' | '<' | '>' => {
                chars.next();
                let mut symbol = c.to_string();
                if let Some(&next) = chars.peek() {
                    let pair = matches!((c, next), ('=', '=') | ('<', '>') | ('<', '=') | ('>', '='));
                    if pair {
                        symbol.push(next);
                        chars.next();
                    }
                }
                tokens.push(Token::Symbol(symbol));
            }
            '"' => {
                chars.next();
                let mut text = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some('"') => text.push('"'),
                            Some(other) => {
                                text.push('\\');
                                text.push(other);
                            }
                            None => text.push('\\'),
                        },
                        other => text.push(other),
                    }
                }
                if !closed {
                    return Err(PersistError::invalid_filter(format!(
                        "Unterminated quoted term in CQL query: {}",
                        input
                    )));
                }
                tokens.push(Token::Quoted(text));
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || matches!(c, '(' | ')' | '/' | '"' | '=' | '<' | '>') {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }

    Ok(tokens)
}

// ==================== Parser ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Relation {
    Exact,
    Equal,
    NotEqual,
    Less,
    Greater,
    LessOrEqual,
    GreaterOrEqual,
    Adj,
    All,
    Any,
}

impl Relation {
    fn from_token(token: &Token) -> Option<Self> {
        match token {
            Token::Symbol(s) => match s.as_str() {
                "==" => Some(Relation::Exact),
                "=" => Some(Relation::Equal),
                "<>" => Some(Relation::NotEqual),
                "<" => Some(Relation::Less),
                ">" => Some(Relation::Greater),
                "<=" => Some(Relation::LessOrEqual),
                ">=" => Some(Relation::GreaterOrEqual),
                _ => None,
            },
            Token::Word(w) => match w.to_lowercase().as_str() {
                "adj" => Some(Relation::Adj),
                "all" => Some(Relation::All),
                "any" => Some(Relation::Any),
                _ => None,
            },
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BoolKind {
    And,
    Or,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    AllRecords,
    Clause {
        index: String,
        relation: Relation,
        term: String,
    },
    Bool {
        kind: BoolKind,
        left: Box<Node>,
        right: Box<Node>,
    },
}

#[derive(Debug)]
struct SortKey {
    index: String,
    descending: bool,
}

#[derive(Debug)]
struct ParsedQuery {
    node: Node,
    sort: Vec<SortKey>,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

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

    fn peek_word(&self) -> Option<String> {
        match self.peek() {
            Some(Token::Word(w)) => Some(w.to_lowercase()),
            _ => None,
        }
    }

    fn parse_query(mut self) -> Result<ParsedQuery> {
        let node = self.parse_scoped()?;

        let mut sort = Vec::new();
        if self.peek_word().as_deref() == Some("sortby") {
            self.next();
            while let Some(Token::Word(index)) = self.peek().cloned() {
                self.next();
                let mut descending = false;
                while self.peek() == Some(&Token::Slash) {
                    self.next();
                    match self.next() {
                        Some(Token::Word(modifier)) => match modifier.to_lowercase().as_str() {
                            "sort.descending" => descending = true,
                            "sort.ascending" => descending = false,
                            other => {
                                return Err(PersistError::invalid_filter(format!(
                                    "Unsupported sort modifier '{}'",
                                    other
                                )));
                            }
                        },
                        _ => return Err(PersistError::invalid_filter("Expected sort modifier after '/'")),
                    }
                }
                sort.push(SortKey { index, descending });
            }
            if sort.is_empty() {
                return Err(PersistError::invalid_filter("sortBy needs at least one index"));
            }
        }

        match self.peek() {
            None => Ok(ParsedQuery { node, sort }),
            Some(token) => Err(PersistError::invalid_filter(format!(
                "Unexpected token {:?} in CQL query",
                token
            ))),
        }
    }

    fn parse_scoped(&mut self) -> Result<Node> {
        let mut left = self.parse_search()?;

        loop {
            let kind = match self.peek_word().as_deref() {
                Some("and") => BoolKind::And,
                Some("or") => BoolKind::Or,
                Some("not") => BoolKind::Not,
                _ => break,
            };
            self.next();
            let right = self.parse_search()?;
            left = Node::Bool {
                kind,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_search(&mut self) -> Result<Node> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_scoped()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(PersistError::invalid_filter("Missing ')' in CQL query")),
                }
            }
            Some(Token::Word(index)) | Some(Token::Quoted(index)) => {
                let relation = self
                    .peek()
                    .and_then(Relation::from_token)
                    .ok_or_else(|| {
                        PersistError::invalid_filter(format!(
                            "Search term '{}' has no index and relation",
                            index
                        ))
                    })?;
                self.next();

                let term = match self.next() {
                    Some(Token::Word(t)) | Some(Token::Quoted(t)) => t,
                    _ => {
                        return Err(PersistError::invalid_filter(format!(
                            "Missing search term after index '{}'",
                            index
                        )));
                    }
                };

                if index.to_lowercase() == ALL_RECORDS_INDEX {
                    return Ok(Node::AllRecords);
                }
                Ok(Node::Clause {
                    index,
                    relation,
                    term,
                })
            }
            Some(token) => Err(PersistError::invalid_filter(format!(
                "Unexpected token {:?} in CQL query",
                token
            ))),
            None => Err(PersistError::invalid_filter("Unexpected end of CQL query")),
        }
    }
}

// ==================== Rendering ====================

impl Node {
    fn render(&self, column: &str) -> Result<String> {
        match self {
            Node::AllRecords => Ok("true".to_string()),
            Node::Bool { kind, left, right } => {
                let op = match kind {
                    BoolKind::And => "AND",
                    BoolKind::Or => "OR",
                    BoolKind::Not => "AND NOT",
                };
                Ok(format!("({} {} {})", left.render(column)?, op, right.render(column)?))
            }
            Node::Clause {
                index,
                relation,
                term,
            } => {
                let keys = index_keys(index, column)?;
                let text = json_accessor(column, &keys, true);
                Ok(render_clause(&text, *relation, term))
            }
        }
    }
}

fn render_clause(text: &str, relation: Relation, term: &str) -> String {
    let numeric = NUMBER_PATTERN.is_match(term);
    let comparison = |op: &str| {
        if numeric {
            format!("({})::numeric {} {}", text, op, term)
        } else {
            format!("{} {} {}", text, op, quote_literal(&unescape(term)))
        }
    };

    match relation {
        Relation::Exact => format!("{} = {}", text, quote_literal(&unescape(term))),
        Relation::Equal if numeric => comparison("="),
        Relation::Equal => format!("{} ILIKE {}", text, quote_literal(&like_pattern(term))),
        Relation::NotEqual if numeric => comparison("<>"),
        Relation::NotEqual => format!("{} NOT ILIKE {}", text, quote_literal(&like_pattern(term))),
        Relation::Less => comparison("<"),
        Relation::Greater => comparison(">"),
        Relation::LessOrEqual => comparison("<="),
        Relation::GreaterOrEqual => comparison(">="),
        Relation::Adj => {
            let phrase = term.split_whitespace().collect::<Vec<_>>().join(" ");
            format!("{} ILIKE {}", text, quote_literal(&contains_pattern(&phrase)))
        }
        Relation::All | Relation::Any => {
            let joiner = if relation == Relation::All { " AND " } else { " OR " };
            let words: Vec<String> = term
                .split_whitespace()
                .map(|w| format!("{} ILIKE {}", text, quote_literal(&contains_pattern(w))))
                .collect();
            match words.len() {
                0 => format!("{} ILIKE '%'", text),
                1 => words.join(""),
                _ => format!("({})", words.join(joiner)),
            }
        }
    }
}

/// Map a dotted index onto JSON keys, dropping a leading column name
fn index_keys(index: &str, column: &str) -> Result<Vec<String>> {
    let mut keys: Vec<&str> = index.split('.').collect();
    if keys.len() > 1 && keys[0] == column {
        keys.remove(0);
    }
    if keys.iter().any(|k| k.is_empty()) {
        return Err(PersistError::invalid_filter(format!("Invalid CQL index '{}'", index)));
    }
    Ok(keys.into_iter().map(str::to_string).collect())
}

/// Drop CQL escapes, keeping the escaped characters
fn unescape(term: &str) -> String {
    let mut out = String::new();
    let mut chars = term.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// LIKE pattern for a CQL term: `*` and `?` become wildcards, LIKE
/// metacharacters in the term are escaped
fn like_pattern(term: &str) -> String {
    let mut out = String::new();
    let mut chars = term.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    push_like_literal(&mut out, next);
                }
            }
            '*' => out.push('%'),
            '?' => out.push('_'),
            other => push_like_literal(&mut out, other),
        }
    }
    out
}

fn contains_pattern(term: &str) -> String {
    format!("%{}%", like_pattern(term))
}

fn push_like_literal(out: &mut String, c: char) {
    if matches!(c, '%' | '_' | '\\') {
        out.push('\\');
    }
    out.push(c);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sql(query: &str) -> String {
        CqlWrapper::new(query).to_sql().unwrap().as_str().to_string()
    }

    #[test]
    fn test_exact_match() {
        assert_eq!(sql("status == open"), "WHERE jsonb->>'status' = 'open'");
    }

    #[test]
    fn test_equal_on_text_is_case_insensitive() {
        assert_eq!(sql("name = Smith"), "WHERE jsonb->>'name' ILIKE 'Smith'");
    }

    #[test]
    fn test_equal_on_number_casts() {
        assert_eq!(
            sql("price.amount = 10.5"),
            "WHERE (jsonb->'price'->>'amount')::numeric = 10.5"
        );
    }

    #[test]
    fn test_only_ascii_digits_are_numbers() {
        assert_eq!(sql("qty = ١٢"), "WHERE jsonb->>'qty' ILIKE '١٢'");
        assert_eq!(sql("qty > ٣"), "WHERE jsonb->>'qty' > '٣'");
    }

    #[test]
    fn test_wildcards() {
        assert_eq!(sql("title = \"war*\""), "WHERE jsonb->>'title' ILIKE 'war%'");
        assert_eq!(sql("code = a?c"), "WHERE jsonb->>'code' ILIKE 'a_c'");
    }

    #[test]
    fn test_like_metacharacters_are_escaped() {
        assert_eq!(sql("code = 100%_off"), "WHERE jsonb->>'code' ILIKE '100\\%\\_off'");
        assert_eq!(sql("code = \"a\\*b\""), "WHERE jsonb->>'code' ILIKE 'a*b'");
    }

    #[test]
    fn test_not_equal() {
        assert_eq!(sql("status <> closed"), "WHERE jsonb->>'status' NOT ILIKE 'closed'");
        assert_eq!(sql("qty <> 3"), "WHERE (jsonb->>'qty')::numeric <> 3");
    }

    #[test]
    fn test_ordering_relations() {
        assert_eq!(sql("qty >= 3"), "WHERE (jsonb->>'qty')::numeric >= 3");
        assert_eq!(sql("date < 2020-01-01"), "WHERE jsonb->>'date' < '2020-01-01'");
    }

    #[test]
    fn test_adj_all_any() {
        assert_eq!(
            sql("title adj \"war  and peace\""),
            "WHERE jsonb->>'title' ILIKE '%war and peace%'"
        );
        assert_eq!(
            sql("title all \"war peace\""),
            "WHERE (jsonb->>'title' ILIKE '%war%' AND jsonb->>'title' ILIKE '%peace%')"
        );
        assert_eq!(
            sql("title any \"war peace\""),
            "WHERE (jsonb->>'title' ILIKE '%war%' OR jsonb->>'title' ILIKE '%peace%')"
        );
    }

    #[test]
    fn test_boolean_operators_associate_left() {
        assert_eq!(
            sql("a = 1 and b = 2 or c = 3"),
            "WHERE (((jsonb->>'a')::numeric = 1 AND (jsonb->>'b')::numeric = 2) OR (jsonb->>'c')::numeric = 3)"
        );
    }

    #[test]
    fn test_parentheses_group() {
        assert_eq!(
            sql("a == x and (b == y or c == z)"),
            "WHERE (jsonb->>'a' = 'x' AND (jsonb->>'b' = 'y' OR jsonb->>'c' = 'z'))"
        );
    }

    #[test]
    fn test_not() {
        assert_eq!(
            sql("a == x not b == y"),
            "WHERE (jsonb->>'a' = 'x' AND NOT jsonb->>'b' = 'y')"
        );
    }

    #[test]
    fn test_all_records() {
        assert_eq!(sql("cql.allRecords = 1"), "WHERE true");
        assert_eq!(
            sql("cql.allRecords=1 not status == closed"),
            "WHERE (true AND NOT jsonb->>'status' = 'closed')"
        );
    }

    #[test]
    fn test_sort_by() {
        assert_eq!(
            sql("cql.allRecords=1 sortBy meta.created/sort.descending title"),
            "WHERE true ORDER BY jsonb->'meta'->>'created' DESC, jsonb->>'title' ASC"
        );
    }

    #[test]
    fn test_leading_column_name_is_dropped() {
        assert_eq!(sql("jsonb.name == x"), "WHERE jsonb->>'name' = 'x'");
    }

    #[test]
    fn test_literal_is_escaped() {
        assert_eq!(
            sql("name == \"x' OR '1'='1\""),
            "WHERE jsonb->>'name' = 'x'' OR ''1''=''1'"
        );
    }

    #[test]
    fn test_limit_offset() {
        let filter = CqlWrapper::new("a == b").limit(10).offset(20);
        assert_eq!(
            filter.to_sql().unwrap().as_str(),
            "WHERE jsonb->>'a' = 'b' LIMIT 10 OFFSET 20"
        );
        assert!(filter.from_clause().unwrap().is_none());
    }

    #[test]
    fn test_order_or_paging_is_reported() {
        assert!(!CqlWrapper::new("a == b").has_order_or_paging().unwrap());
        assert!(!CqlWrapper::new("").has_order_or_paging().unwrap());
        assert!(CqlWrapper::new("a == b sortBy title").has_order_or_paging().unwrap());
        assert!(CqlWrapper::new("a == b").limit(1).has_order_or_paging().unwrap());
        assert!(CqlWrapper::new("").offset(2).has_order_or_paging().unwrap());
        assert!(CqlWrapper::new("a ==").has_order_or_paging().is_err());
    }

    #[test]
    fn test_column_override() {
        let filter = CqlWrapper::new("a == x sortBy b").column("doc");
        assert_eq!(
            filter.to_sql().unwrap().as_str(),
            "WHERE doc->>'a' = 'x' ORDER BY doc->>'b' ASC"
        );
    }

    #[test]
    fn test_column_override_must_be_identifier() {
        for column in ["1=1 OR jsonb", "jsonb) OR true OR (jsonb", "Doc", "order"] {
            let result = CqlWrapper::new("a == x").column(column).to_sql();
            assert!(
                matches!(result, Err(PersistError::InvalidFilter(_))),
                "column {:?} was accepted",
                column
            );
        }
    }

    #[test]
    fn test_blank_query_matches_everything() {
        assert!(CqlWrapper::new("  ").to_sql().unwrap().is_empty());
        assert_eq!(CqlWrapper::new("").limit(3).to_sql().unwrap().as_str(), "LIMIT 3");
    }

    #[test]
    fn test_malformed_queries() {
        for query in ["a ==", "(a == b", "justaterm", "a == b)", "a == \"open", "a == b sortBy"] {
            let result = CqlWrapper::new(query).to_sql();
            assert!(
                matches!(result, Err(PersistError::InvalidFilter(_))),
                "expected failure for {}",
                query
            );
        }
    }
}
