//! Vetted SQL text and the filter capability shared by query builders

use std::fmt;

use crate::error::Result;

/// A piece of SQL produced by this crate's builders
///
/// Fragments can only be constructed inside the crate, so every fragment
/// handed to the CRUD layer went through identifier quoting and literal
/// escaping. Callers compose filters through [`Criterion`](crate::Criterion)
/// or [`CqlWrapper`](crate::CqlWrapper) instead of concatenating strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlFragment(String);

impl SqlFragment {
    pub(crate) fn new(sql: impl Into<String>) -> Self {
        Self(sql.into())
    }

    pub fn empty() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for SqlFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SqlFragment {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Anything that renders to a WHERE clause plus optional FROM items
///
/// `to_sql` yields the full tail of a statement: `WHERE ...` followed by any
/// `ORDER BY`, `LIMIT` and `OFFSET` the filter carries. It may be empty, which
/// matches every row. `from_clause` yields extra FROM items (comma separated)
/// that the WHERE clause refers to.
pub trait QueryFilter: Send + Sync {
    fn to_sql(&self) -> Result<SqlFragment>;

    fn from_clause(&self) -> Result<Option<SqlFragment>> {
        Ok(None)
    }

    /// Whether the tail carries `ORDER BY`, `LIMIT` or `OFFSET`
    fn has_order_or_paging(&self) -> Result<bool> {
        Ok(false)
    }
}

impl<F: QueryFilter + ?Sized> QueryFilter for &F {
    fn to_sql(&self) -> Result<SqlFragment> {
        (**self).to_sql()
    }

    fn from_clause(&self) -> Result<Option<SqlFragment>> {
        (**self).from_clause()
    }

    fn has_order_or_paging(&self) -> Result<bool> {
        (**self).has_order_or_paging()
    }
}

/// Filter matching every row
#[derive(Debug, Clone, Copy, Default)]
pub struct AllRecords;

impl QueryFilter for AllRecords {
    fn to_sql(&self) -> Result<SqlFragment> {
        Ok(SqlFragment::empty())
    }
}

/// Render the `LIMIT`/`OFFSET` tail shared by the builders
pub(crate) fn paging_clause(limit: Option<u64>, offset: Option<u64>) -> String {
    let mut out = String::new();
    if let Some(limit) = limit {
        out.push_str(&format!(" LIMIT {}", limit));
    }
    if let Some(offset) = offset {
        out.push_str(&format!(" OFFSET {}", offset));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_records_renders_nothing() {
        let sql = AllRecords.to_sql().unwrap();
        assert!(sql.is_empty());
        assert!(AllRecords.from_clause().unwrap().is_none());
        assert!(!AllRecords.has_order_or_paging().unwrap());
    }

    #[test]
    fn test_paging_clause() {
        assert_eq!(paging_clause(None, None), "");
        assert_eq!(paging_clause(Some(10), None), " LIMIT 10");
        assert_eq!(paging_clause(Some(10), Some(20)), " LIMIT 10 OFFSET 20");
        assert_eq!(paging_clause(None, Some(5)), " OFFSET 5");
    }

    #[test]
    fn test_fragment_display() {
        let fragment = SqlFragment::new("WHERE true");
        assert_eq!(fragment.to_string(), "WHERE true");
        assert_eq!(fragment.as_str(), "WHERE true");
    }
}
