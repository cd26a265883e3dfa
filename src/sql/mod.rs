//! SQL utilities for the tenant store
//!
//! Filter builders, identifier and literal sanitization, and DDL rendering.

pub mod cql;
pub mod criteria;
pub mod ddl;
pub mod fragment;
pub mod sanitize;

pub use cql::CqlWrapper;
pub use criteria::{BoolOp, Criteria, Criterion, Direction, Operator, Order, UpdateSection};
pub use ddl::BasicSchemaMaker;
pub use fragment::{AllRecords, QueryFilter, SqlFragment};
pub use sanitize::{
    DEFAULT_SCHEMA, POSTGRES_RESERVED_WORDS, qualified_table, quote_identifier, quote_literal,
    tenant_schema_name, validate_identifier,
};
