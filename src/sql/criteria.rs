//! Structured filters over JSONB documents
//!
//! A [`Criteria`] is one comparison against a path inside the document
//! column. A [`Criterion`] joins criteria with AND/OR and adds ordering and
//! paging. [`UpdateSection`] describes a partial document update.
//!
//! ```
//! use runtara_tenant_store::{Criteria, Criterion, Operator, QueryFilter};
//!
//! let filter = Criterion::new(
//!     Criteria::new()
//!         .add_field("price")
//!         .add_field("po_currency")
//!         .add_field("value")
//!         .operation(Operator::Like)
//!         .value("USD"),
//! );
//!
//! assert_eq!(
//!     filter.to_sql().unwrap().as_str(),
//!     "WHERE jsonb->'price'->'po_currency'->>'value' LIKE 'USD'"
//! );
//! ```

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::error::{PersistError, Result};
use crate::sql::fragment::{QueryFilter, SqlFragment, paging_clause};
use crate::sql::sanitize::{quote_literal, validate_identifier};

/// Name of the document column
pub const JSONB_FIELD: &str = "jsonb";

/// Path segment marking traversal into the elements of an array
pub const ARRAY_MARKER: &str = "[]";

/// Comparison operator of a single criteria
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    Like,
    NotLike,
    ILike,
    IsNull,
    IsNotNull,
    IsTrue,
    IsNotTrue,
    IsFalse,
    IsNotFalse,
}

impl Operator {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "<>",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Like => "LIKE",
            Operator::NotLike => "NOT LIKE",
            Operator::ILike => "ILIKE",
            Operator::IsNull => "IS NULL",
            Operator::IsNotNull => "IS NOT NULL",
            Operator::IsTrue => "IS TRUE",
            Operator::IsNotTrue => "IS NOT TRUE",
            Operator::IsFalse => "IS FALSE",
            Operator::IsNotFalse => "IS NOT FALSE",
        }
    }

    /// Operators that take no value
    pub fn is_unary(&self) -> bool {
        matches!(
            self,
            Operator::IsNull
                | Operator::IsNotNull
                | Operator::IsTrue
                | Operator::IsNotTrue
                | Operator::IsFalse
                | Operator::IsNotFalse
        )
    }

    fn is_pattern(&self) -> bool {
        matches!(self, Operator::Like | Operator::NotLike | Operator::ILike)
    }
}

impl FromStr for Operator {
    type Err = PersistError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
        Ok(match normalized.as_str() {
            "=" | "==" => Operator::Eq,
            "!=" | "<>" => Operator::Ne,
            "<" => Operator::Lt,
            "<=" => Operator::Lte,
            ">" => Operator::Gt,
            ">=" => Operator::Gte,
            "LIKE" => Operator::Like,
            "NOT LIKE" => Operator::NotLike,
            "ILIKE" => Operator::ILike,
            "IS NULL" => Operator::IsNull,
            "IS NOT NULL" => Operator::IsNotNull,
            "IS TRUE" => Operator::IsTrue,
            "IS NOT TRUE" => Operator::IsNotTrue,
            "IS FALSE" => Operator::IsFalse,
            "IS NOT FALSE" => Operator::IsNotFalse,
            _ => {
                return Err(PersistError::invalid_filter(format!(
                    "Unsupported operator '{}'",
                    s
                )));
            }
        })
    }
}

/// Boolean connective between criteria
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
}

impl BoolOp {
    fn as_sql(&self) -> &'static str {
        match self {
            BoolOp::And => "AND",
            BoolOp::Or => "OR",
        }
    }
}

impl FromStr for BoolOp {
    type Err = PersistError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "AND" => Ok(BoolOp::And),
            "OR" => Ok(BoolOp::Or),
            other => Err(PersistError::invalid_filter(format!(
                "Unsupported boolean operator '{}'",
                other
            ))),
        }
    }
}

/// One comparison against a path inside the document
///
/// The path lists JSON keys from the document root down to the compared key.
/// With the array flag set, the keys up to a `[]` marker (or the whole path
/// when there is none) name an array; the remaining keys are resolved against
/// each element.
#[derive(Debug, Clone, PartialEq)]
pub struct Criteria {
    path: Vec<String>,
    op: Operator,
    value: Option<Value>,
    is_array: bool,
}

impl Default for Criteria {
    fn default() -> Self {
        Self::new()
    }
}

impl Criteria {
    pub fn new() -> Self {
        Self {
            path: Vec::new(),
            op: Operator::Eq,
            value: None,
            is_array: false,
        }
    }

    /// Append a key to the field path. Surrounding single quotes are dropped,
    /// so `'price'` and `price` are the same key.
    pub fn add_field(mut self, key: impl Into<String>) -> Self {
        self.path.push(strip_key_quotes(&key.into()));
        self
    }

    pub fn operation(mut self, op: Operator) -> Self {
        self.op = op;
        self
    }

    pub fn value(mut self, value: impl Into<Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn array(mut self, is_array: bool) -> Self {
        self.is_array = is_array;
        self
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn op(&self) -> Operator {
        self.op
    }

    pub fn is_array(&self) -> bool {
        self.is_array
    }

    /// Render the condition, registering any array expansion in `from`
    fn render(&self, column: &str, from: &mut Vec<String>) -> Result<String> {
        if self.path.is_empty() {
            return Err(PersistError::invalid_filter("Criteria has no field path"));
        }

        let marker = self.path.iter().position(|k| k == ARRAY_MARKER);
        let (base, keys): (String, &[String]) = if self.is_array {
            let (container, rest) = match marker {
                Some(pos) => (&self.path[..pos], &self.path[pos + 1..]),
                None => (&self.path[..], &self.path[self.path.len()..]),
            };
            if container.is_empty() {
                return Err(PersistError::invalid_filter(
                    "Array criteria needs at least one key before the array marker",
                ));
            }
            if rest.iter().any(|k| k == ARRAY_MARKER) {
                return Err(PersistError::invalid_filter(
                    "Nested array markers are not supported",
                ));
            }
            let alias = format!("arr{}", from.len() + 1);
            from.push(format!(
                "jsonb_array_elements({}) AS {}",
                json_accessor(column, container, false),
                alias
            ));
            (alias, rest)
        } else {
            if marker.is_some() {
                return Err(PersistError::invalid_filter(
                    "Array marker used without the array flag",
                ));
            }
            (column.to_string(), &self.path[..])
        };

        let text = if keys.is_empty() {
            format!("{} #>> '{{}}'", base)
        } else {
            json_accessor(&base, keys, true)
        };

        if self.op.is_unary() {
            return Ok(match self.op {
                Operator::IsNull | Operator::IsNotNull => {
                    format!("{} {}", text, self.op.as_sql())
                }
                _ => format!("({})::boolean {}", text, self.op.as_sql()),
            });
        }

        let value = self.value.as_ref().ok_or_else(|| {
            PersistError::invalid_filter(format!(
                "Operator {} requires a value",
                self.op.as_sql()
            ))
        })?;

        match value {
            Value::Null => match self.op {
                Operator::Eq => Ok(format!("{} IS NULL", text)),
                Operator::Ne => Ok(format!("{} IS NOT NULL", text)),
                _ => Err(PersistError::invalid_filter(format!(
                    "Operator {} cannot compare against null",
                    self.op.as_sql()
                ))),
            },
            Value::String(s) => Ok(format!("{} {} {}", text, self.op.as_sql(), quote_literal(s))),
            Value::Number(n) if self.op.is_pattern() => Ok(format!(
                "{} {} {}",
                text,
                self.op.as_sql(),
                quote_literal(&n.to_string())
            )),
            Value::Number(n) => Ok(format!("({})::numeric {} {}", text, self.op.as_sql(), n)),
            Value::Bool(b) if matches!(self.op, Operator::Eq | Operator::Ne) => {
                Ok(format!("({})::boolean {} {}", text, self.op.as_sql(), b))
            }
            Value::Array(_) | Value::Object(_) if matches!(self.op, Operator::Eq | Operator::Ne) => {
                let json = if keys.is_empty() {
                    base
                } else {
                    json_accessor(&base, keys, false)
                };
                Ok(format!(
                    "{} {} {}::jsonb",
                    json,
                    self.op.as_sql(),
                    quote_literal(&value.to_string())
                ))
            }
            other => Err(PersistError::invalid_filter(format!(
                "Operator {} cannot compare against {}",
                self.op.as_sql(),
                other
            ))),
        }
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// Sort key over a document path
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    path: Vec<String>,
    direction: Direction,
}

impl Order {
    pub fn asc<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            path: path.into_iter().map(|k| strip_key_quotes(&k.into())).collect(),
            direction: Direction::Asc,
        }
    }

    pub fn desc<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            direction: Direction::Desc,
            ..Self::asc(path)
        }
    }

    fn render(&self, column: &str) -> Result<String> {
        if self.path.is_empty() {
            return Err(PersistError::invalid_filter("Sort key has no field path"));
        }
        let direction = match self.direction {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        };
        Ok(format!("{} {}", json_accessor(column, &self.path, true), direction))
    }
}

/// Criteria joined by boolean operators, plus ordering and paging
///
/// Criteria render in insertion order; the operator attached to the first
/// criteria is ignored. An empty criterion matches every row.
#[derive(Debug, Clone, PartialEq)]
pub struct Criterion {
    column: String,
    criteria: Vec<(BoolOp, Criteria)>,
    order: Vec<Order>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl Default for Criterion {
    fn default() -> Self {
        Self {
            column: JSONB_FIELD.to_string(),
            criteria: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
        }
    }
}

struct Rendered {
    tail: String,
    from: Vec<String>,
}

impl Criterion {
    pub fn new(criteria: Criteria) -> Self {
        Self::default().and(criteria)
    }

    pub fn and(mut self, criteria: Criteria) -> Self {
        self.criteria.push((BoolOp::And, criteria));
        self
    }

    pub fn or(mut self, criteria: Criteria) -> Self {
        self.criteria.push((BoolOp::Or, criteria));
        self
    }

    /// Join `criteria` with an explicit operator
    pub fn add(mut self, op: BoolOp, criteria: Criteria) -> Self {
        self.criteria.push((op, criteria));
        self
    }

    pub fn order_by(mut self, order: Order) -> Self {
        self.order.push(order);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Compare against a different document column (default: `jsonb`)
    ///
    /// The name must be a plain lower-case identifier; anything else fails
    /// when the criterion is rendered.
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    /// Build a criterion from its JSON form
    ///
    /// Each element is either a leaf
    /// `{"field": "'a'->'b'->>'c'", "value": .., "op": ".."}` or a joiner
    /// `{"op": "AND"}` / `{"op": "OR"}` that applies to every leaf. A `[]`
    /// segment in the field marks array traversal.
    pub fn from_json(json: &str) -> Result<Self> {
        let entries: Vec<serde_json::Map<String, Value>> = serde_json::from_str(json)
            .map_err(|e| PersistError::invalid_filter(format!("Invalid criterion JSON: {}", e)))?;

        let mut joiner = BoolOp::And;
        let mut leaves = Vec::new();

        for entry in entries {
            let op = entry.get("op").and_then(Value::as_str);
            match entry.get("field").and_then(Value::as_str) {
                Some(field) => {
                    let op = op.ok_or_else(|| {
                        PersistError::invalid_filter(format!("Criteria on {} has no op", field))
                    })?;
                    let mut criteria = Criteria::new().operation(op.parse()?);
                    for key in field.split("->").map(|k| k.trim_start_matches('>').trim()) {
                        if key == ARRAY_MARKER {
                            criteria = criteria.array(true);
                        }
                        criteria = criteria.add_field(key);
                    }
                    if let Some(value) = entry.get("value") {
                        criteria = criteria.value(value.clone());
                    }
                    leaves.push(criteria);
                }
                None => {
                    let op = op.ok_or_else(|| {
                        PersistError::invalid_filter("Criterion entry needs a field or an op")
                    })?;
                    joiner = op.parse()?;
                }
            }
        }

        Ok(leaves
            .into_iter()
            .fold(Self::default(), |criterion, leaf| criterion.add(joiner, leaf)))
    }

    fn render(&self) -> Result<Rendered> {
        let column = checked_column(&self.column)?;
        let mut from = Vec::new();
        let mut tail = String::new();

        for (i, (op, criteria)) in self.criteria.iter().enumerate() {
            let condition = criteria.render(column, &mut from)?;
            if i == 0 {
                tail.push_str("WHERE ");
            } else {
                tail.push(' ');
                tail.push_str(op.as_sql());
                tail.push(' ');
            }
            tail.push_str(&condition);
        }

        if !self.order.is_empty() {
            let keys = self
                .order
                .iter()
                .map(|o| o.render(column))
                .collect::<Result<Vec<_>>>()?;
            if !tail.is_empty() {
                tail.push(' ');
            }
            tail.push_str("ORDER BY ");
            tail.push_str(&keys.join(", "));
        }

        let paging = paging_clause(self.limit, self.offset);
        if tail.is_empty() {
            tail.push_str(paging.trim_start());
        } else {
            tail.push_str(&paging);
        }

        Ok(Rendered { tail, from })
    }
}

impl QueryFilter for Criterion {
    fn to_sql(&self) -> Result<SqlFragment> {
        Ok(SqlFragment::new(self.render()?.tail))
    }

    fn from_clause(&self) -> Result<Option<SqlFragment>> {
        let from = self.render()?.from;
        Ok((!from.is_empty()).then(|| SqlFragment::new(from.join(", "))))
    }

    fn has_order_or_paging(&self) -> Result<bool> {
        Ok(!self.order.is_empty() || self.limit.is_some() || self.offset.is_some())
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.render() {
            Ok(rendered) => f.write_str(&rendered.tail),
            Err(e) => write!(f, "<invalid criterion: {}>", e),
        }
    }
}

/// Partial document update
///
/// Each section replaces the value at one path. Several sections render as
/// nested `jsonb_set` calls applied in insertion order, producing a new
/// document value.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateSection {
    sets: Vec<(Vec<String>, Value)>,
    create_missing: bool,
}

impl UpdateSection {
    pub fn new<I, S>(path: I, value: impl Into<Value>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sets: Vec::new(),
            create_missing: false,
        }
        .and_set(path, value)
    }

    pub fn and_set<I, S>(mut self, path: I, value: impl Into<Value>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let path = path.into_iter().map(|k| strip_key_quotes(&k.into())).collect();
        self.sets.push((path, value.into()));
        self
    }

    /// Create keys that do not exist yet (default: false)
    pub fn create_missing(mut self, create: bool) -> Self {
        self.create_missing = create;
        self
    }

    /// Expression computing the updated value of `column`
    pub fn to_sql(&self, column: &str) -> Result<SqlFragment> {
        if self.sets.is_empty() {
            return Err(PersistError::invalid_filter("Update section has no fields"));
        }

        let mut expr = column.to_string();
        for (path, value) in &self.sets {
            if path.is_empty() {
                return Err(PersistError::invalid_filter("Update section has an empty path"));
            }
            expr = format!(
                "jsonb_set({}, {}, {}::jsonb, {})",
                expr,
                quote_literal(&pg_text_array(path)),
                quote_literal(&value.to_string()),
                self.create_missing
            );
        }
        Ok(SqlFragment::new(expr))
    }
}

fn strip_key_quotes(key: &str) -> String {
    let key = key.trim();
    key.strip_prefix('\'')
        .and_then(|k| k.strip_suffix('\''))
        .unwrap_or(key)
        .to_string()
}

/// Document column named by a filter, rendered unquoted
pub(crate) fn checked_column(column: &str) -> Result<&str> {
    validate_identifier(column, &[])
        .map(|_| column)
        .map_err(|e| PersistError::invalid_filter(format!("Invalid document column: {}", e)))
}

/// `column->'a'->'b'->>'c'`; the last hop yields text when `text` is set
pub(crate) fn json_accessor(column: &str, keys: &[String], text: bool) -> String {
    let mut out = column.to_string();
    for (i, key) in keys.iter().enumerate() {
        let arrow = if text && i == keys.len() - 1 { "->>" } else { "->" };
        out.push_str(arrow);
        out.push_str(&quote_literal(key));
    }
    out
}

/// Postgres text-array literal body, e.g. `{po_line_status,value}`
fn pg_text_array(keys: &[String]) -> String {
    let items: Vec<String> = keys
        .iter()
        .map(|k| {
            let needs_quotes = k.is_empty()
                || k.chars()
                    .any(|c| matches!(c, ',' | '{' | '}' | '"' | '\\') || c.is_whitespace());
            if needs_quotes {
                format!("\"{}\"", k.replace('\\', "\\\\").replace('"', "\\\""))
            } else {
                k.clone()
            }
        })
        .collect();
    format!("{{{}}}", items.join(","))
}
