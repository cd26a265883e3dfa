//! # runtara-tenant-store
//!
//! Multi-tenant JSON document persistence on PostgreSQL.
//!
//! Every tenant owns a schema (the lower-cased tenant id) whose tables hold one
//! JSONB document per row. This crate turns structured filters into SQL, runs
//! CRUD against those tables, and provisions or tears down tenant schemas from
//! declarative table/view descriptors.
//!
//! ## Features
//!
//! - **Per-tenant clients**: one lazily connected pool per tenant, cached in a [`ClientRegistry`]
//! - **Filter builders**: [`Criterion`] trees and CQL queries ([`CqlWrapper`]) rendered to JSONB SQL
//! - **Document mapping**: rows mapped to typed entities through a static [`Mapping`] per type
//! - **Transactions**: [`TxHandle`] values resolved by exactly one commit or rollback
//! - **Scripts**: function-aware splitting and execution of multi-statement SQL
//! - **Tenant lifecycle**: create, upgrade and delete tenant schemas
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use runtara_tenant_store::{
//!     ClientRegistry, Criteria, Criterion, Operator, PersistConfig, TenantController,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PersistConfig::builder("mod-orders")
//!         .config_file("postgres-conf.json")?
//!         .resources_root("resources")
//!         .build();
//!     let registry = ClientRegistry::open(&config, None)?;
//!
//!     // Provision the tenant schema from the module's descriptors
//!     let tenants = TenantController::open(&registry, &config)?;
//!     tenants.post_tenant("diku", None).await;
//!
//!     let client = registry.get_or_create("diku")?;
//!     let id = client
//!         .save("po_line", &serde_json::json!({"title": "Blue Widget", "status": "open"}))
//!         .await?;
//!
//!     let filter = Criterion::new(
//!         Criteria::new()
//!             .add_field("'status'")
//!             .operation(Operator::Eq)
//!             .value("open"),
//!     )
//!     .limit(10);
//!     let (lines, total): (Vec<serde_json::Value>, i64) =
//!         client.get("po_line", &filter, true, false).await?;
//!
//!     println!("{} of {} open lines, saved {}", lines.len(), total, id);
//!     registry.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! Connection settings come from a `postgres-conf.json` document and can be
//! overridden with `DB_*` environment variables:
//!
//! ```rust
//! use runtara_tenant_store::ConnectionConfig;
//!
//! let connection = ConnectionConfig::from_json(
//!     r#"{"host": "localhost", "port": 5432, "database": "okapi",
//!         "username": "folio_admin", "password": "secret", "maxPoolSize": 8}"#,
//! ).unwrap();
//! assert_eq!(connection.max_pool_size, 8);
//! ```
//!
//! ## Multi-Tenancy
//!
//! This crate uses a schema-per-tenant strategy. Tenant `Test_Lib` lives in
//! schema `test_lib` and connects as role `test_lib`; the default tenant
//! (`public`) uses the configured credentials.

pub mod client;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod mapper;
pub mod registry;
pub mod script;
pub mod sql;
pub mod tenant;
pub mod transaction;

// Re-export main types for convenience
pub use client::{MutationResult, TenantClient};
pub use config::{ConnectionConfig, PersistConfig, PersistConfigBuilder};
pub use descriptor::{
    SchemaDescriptors, SchemaMaker, SchemaOperation, SchemaRequest, TableDescriptor, ViewDescriptor,
};
pub use error::{PersistError, Result};
pub use mapper::{Document, Mapping, RowData, TypeRegistry};
pub use registry::{ClientRegistry, PasswordDecoder};
pub use script::{ScriptRunner, split_statements};
pub use tenant::{PgCatalog, SchemaCatalog, TenantAttributes, TenantController, TenantResponse};
pub use transaction::{AsExec, TxHandle};

// Re-export filter builders
pub use sql::{
    AllRecords, BasicSchemaMaker, CqlWrapper, Criteria, Criterion, Operator, Order, QueryFilter,
    SqlFragment, UpdateSection,
};
