//! Tenant lifecycle
//!
//! A tenant is present when its schema exists. Provisioning renders the
//! module's table/view descriptors into a script, teardown runs the delete
//! template; both go through the script runner so individual statement
//! failures are reported instead of aborting the request.

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::client::TenantClient;
use crate::config::PersistConfig;
use crate::descriptor::{SchemaDescriptors, SchemaMaker, SchemaOperation, SchemaRequest};
use crate::error::{PersistError, Result};
use crate::registry::ClientRegistry;
use crate::script::ScriptRunner;
use crate::sql::ddl::BasicSchemaMaker;
use crate::sql::sanitize::{DEFAULT_SCHEMA, tenant_schema_name, validate_identifier};

/// Placeholder for the tenant schema in SQL templates
pub const TENANT_PLACEHOLDER: &str = "myuniversity";

/// Placeholder for the module name in SQL templates
pub const MODULE_PLACEHOLDER: &str = "mymodule";

static PLACEHOLDERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("{}|{}", TENANT_PLACEHOLDER, MODULE_PLACEHOLDER))
        .expect("placeholder pattern compiles")
});

/// Substitute both placeholders in one pass
///
/// Replacement text is never rescanned, so a schema or module name that
/// contains a placeholder comes through unchanged.
pub fn fill_template(template: &str, schema: &str, module_name: &str) -> String {
    PLACEHOLDERS
        .replace_all(template, |caps: &Captures| {
            if &caps[0] == TENANT_PLACEHOLDER {
                schema.to_string()
            } else {
                module_name.to_string()
            }
        })
        .into_owned()
}

/// Database access the lifecycle controller needs
pub trait SchemaCatalog: Send + Sync {
    fn schema_exists(&self, schema: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Run a script, returning the statements that failed
    fn run_script(
        &self,
        script: &str,
        stop_on_error: bool,
    ) -> impl Future<Output = Result<Vec<String>>> + Send;
}

/// Catalog backed by the default tenant's pool and a superuser script runner
#[derive(Debug, Clone)]
pub struct PgCatalog {
    client: Arc<TenantClient>,
    runner: ScriptRunner,
}

impl PgCatalog {
    pub fn new(registry: &ClientRegistry) -> Result<Self> {
        Ok(Self {
            client: registry.default_client()?,
            runner: ScriptRunner::new(registry.tenant_connection(DEFAULT_SCHEMA)?),
        })
    }
}

impl SchemaCatalog for PgCatalog {
    async fn schema_exists(&self, schema: &str) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_namespace WHERE nspname = $1)")
                .bind(schema)
                .fetch_one(self.client.pool())
                .await
                .inspect_err(|e| {
                    log::error!("Unable to look up schema {}: {}", schema, e);
                })?;
        Ok(exists)
    }

    async fn run_script(&self, script: &str, stop_on_error: bool) -> Result<Vec<String>> {
        self.runner.run(script, stop_on_error).await
    }
}

/// Body of a tenant create/upgrade request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantAttributes {
    /// Module version currently installed; set for upgrades
    #[serde(default, alias = "moduleFrom", skip_serializing_if = "Option::is_none")]
    pub module_from: Option<String>,
    #[serde(default, alias = "moduleTo", skip_serializing_if = "Option::is_none")]
    pub module_to: Option<String>,
}

impl TenantAttributes {
    pub fn upgrade(module_from: impl Into<String>, module_to: impl Into<String>) -> Self {
        Self {
            module_from: Some(module_from.into()),
            module_to: Some(module_to.into()),
        }
    }
}

/// Outcome of a lifecycle request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantResponse {
    Exists(bool),
    /// Schema provisioned; carries the (empty) failure log
    Created(String),
    /// Schema upgraded; carries the (empty) failure log
    Updated(String),
    NoContent,
    /// Request rejected or script statements failed
    BadRequest(String),
    NotFound(String),
    InternalError(String),
}

impl TenantResponse {
    /// HTTP status a web layer answers with
    pub fn status(&self) -> u16 {
        match self {
            TenantResponse::Exists(_) | TenantResponse::Updated(_) => 200,
            TenantResponse::Created(_) => 201,
            TenantResponse::NoContent => 204,
            TenantResponse::BadRequest(_) => 400,
            TenantResponse::NotFound(_) => 404,
            TenantResponse::InternalError(_) => 500,
        }
    }
}

/// Creates, upgrades and deletes tenant schemas
#[derive(Debug)]
pub struct TenantController<C, M> {
    catalog: C,
    maker: M,
    module_name: String,
    resources_root: PathBuf,
    delete_template: String,
}

impl TenantController<PgCatalog, BasicSchemaMaker> {
    /// Controller on the registry's default connection with the reference schema maker
    pub fn open(registry: &ClientRegistry, config: &PersistConfig) -> Result<Self> {
        Ok(Self::new(PgCatalog::new(registry)?, BasicSchemaMaker::new(), config))
    }
}

impl<C: SchemaCatalog, M: SchemaMaker> TenantController<C, M> {
    pub fn new(catalog: C, maker: M, config: &PersistConfig) -> Self {
        Self {
            catalog,
            maker,
            module_name: config.module_name.clone(),
            resources_root: config.resources_root.clone(),
            delete_template: config.delete_template.clone(),
        }
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub async fn exists(&self, tenant_id: &str) -> Result<bool> {
        let schema = checked_schema(tenant_id)?;
        self.catalog.schema_exists(&schema).await
    }

    /// Provision a tenant, or upgrade it when `module_from` is set
    pub async fn create(
        &self,
        tenant_id: &str,
        attributes: Option<&TenantAttributes>,
    ) -> Result<TenantResponse> {
        let schema = checked_schema(tenant_id)?;
        let exists = self.catalog.schema_exists(&schema).await?;
        let module_from = attributes.and_then(|a| a.module_from.as_deref());

        match (exists, module_from) {
            (true, None) => {
                log::info!("Tenant {} already exists, nothing to create", tenant_id);
                return Ok(TenantResponse::NoContent);
            }
            (false, Some(from)) => {
                return Err(PersistError::tenant_conflict(format!(
                    "Tenant {} does not exist, can not upgrade from {}",
                    tenant_id, from
                )));
            }
            _ => {}
        }

        let Some(descriptors) = SchemaDescriptors::load(&self.resources_root).await? else {
            return Ok(TenantResponse::NoContent);
        };

        let operation = match module_from {
            Some(from) => {
                log::info!(
                    "Upgrading tenant {} from {} to {}",
                    tenant_id,
                    from,
                    attributes
                        .and_then(|a| a.module_to.as_deref())
                        .unwrap_or("current")
                );
                SchemaOperation::Update {
                    from_version: from.to_string(),
                }
            }
            None => SchemaOperation::Create,
        };
        let upgrade = matches!(operation, SchemaOperation::Update { .. });

        let request = SchemaRequest {
            tenant_id: tenant_id.to_string(),
            module_name: self.module_name.clone(),
            operation,
            descriptors,
        };
        let script = self.maker.generate_ddl(&request)?;
        log::debug!("Schema script for tenant {}:\n{}", tenant_id, script);

        let failed = self.catalog.run_script(&script, false).await?;
        let log = serde_json::to_string_pretty(&failed)?;

        if !failed.is_empty() {
            log::error!("{} statements failed for tenant {}", failed.len(), tenant_id);
            Ok(TenantResponse::BadRequest(log))
        } else if upgrade {
            Ok(TenantResponse::Updated(log))
        } else {
            Ok(TenantResponse::Created(log))
        }
    }

    /// Tear a tenant down with the delete template
    pub async fn delete(&self, tenant_id: &str) -> Result<TenantResponse> {
        let schema = checked_schema(tenant_id)?;
        if !self.catalog.schema_exists(&schema).await? {
            log::warn!("Tenant {} does not exist, nothing to delete", tenant_id);
            return Ok(TenantResponse::NotFound(format!(
                "Tenant {} does not exist",
                tenant_id
            )));
        }

        let script = fill_template(&self.delete_template, &schema, &self.module_name);

        let failed = self.catalog.run_script(&script, false).await?;
        if failed.is_empty() {
            log::info!("Deleted tenant {}", tenant_id);
            Ok(TenantResponse::NoContent)
        } else {
            log::error!("Deleting tenant {}: {} statements failed", tenant_id, failed.len());
            Ok(TenantResponse::BadRequest(serde_json::to_string_pretty(&failed)?))
        }
    }

    /// Existence check for the web layer
    pub async fn get_tenant(&self, tenant_id: &str) -> TenantResponse {
        respond(tenant_id, self.exists(tenant_id).await.map(TenantResponse::Exists))
    }

    pub async fn post_tenant(
        &self,
        tenant_id: &str,
        attributes: Option<TenantAttributes>,
    ) -> TenantResponse {
        respond(tenant_id, self.create(tenant_id, attributes.as_ref()).await)
    }

    pub async fn delete_tenant(&self, tenant_id: &str) -> TenantResponse {
        respond(tenant_id, self.delete(tenant_id).await)
    }
}

fn checked_schema(tenant_id: &str) -> Result<String> {
    let schema = tenant_schema_name(tenant_id);
    validate_identifier(&schema, &[])
        .map_err(|e| PersistError::tenant_conflict(format!("Tenant {}: {}", tenant_id, e)))?;
    Ok(schema)
}

fn respond(tenant_id: &str, result: Result<TenantResponse>) -> TenantResponse {
    match result {
        Ok(response) => response,
        Err(PersistError::TenantConflict(msg)) => {
            log::error!("{}", msg);
            TenantResponse::BadRequest(msg)
        }
        Err(e) => {
            log::error!("Tenant {} request failed: {}", tenant_id, e);
            TenantResponse::InternalError(e.to_string())
        }
    }
}
