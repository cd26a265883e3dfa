//! Per-tenant client registry
//!
//! The registry resolves connection settings once and hands out one cached
//! [`TenantClient`] per tenant. Pools are created lazily, so asking for a
//! client never waits on the network; the first query does.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::client::TenantClient;
use crate::config::{ConnectionConfig, PersistConfig};
use crate::error::Result;
use crate::sql::sanitize::{DEFAULT_SCHEMA, tenant_schema_name};

/// Decodes the configured password of the default tenant
///
/// Deployments that keep an encrypted password in the connection
/// configuration plug their secret-key decoder in here.
pub trait PasswordDecoder: Send + Sync {
    fn decode(&self, encoded: &str) -> Result<String>;
}

/// Cache of tenant clients, created on first use and kept until [`close`](Self::close)
pub struct ClientRegistry {
    connection: ConnectionConfig,
    decoder: Option<Arc<dyn PasswordDecoder>>,
    clients: Mutex<HashMap<String, Arc<TenantClient>>>,
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("connection", &self.connection)
            .field("decoder", &self.decoder.is_some())
            .field("tenants", &self.tenants())
            .finish()
    }
}

impl ClientRegistry {
    /// Resolve connection settings and build an empty registry
    ///
    /// Fails with a configuration error when no connection settings exist
    /// and embedded mode is off. `DB_*` environment variables override the
    /// resolved settings.
    pub fn open(config: &PersistConfig, decoder: Option<Arc<dyn PasswordDecoder>>) -> Result<Self> {
        let mut connection = config.resolve_connection().inspect_err(|e| {
            log::error!("{}", e);
        })?;
        connection.apply_env()?;

        log::info!(
            "Using database {} at {}:{}",
            connection.database,
            connection.host,
            connection.port
        );

        Ok(Self {
            connection,
            decoder,
            clients: Mutex::new(HashMap::new()),
        })
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<String, Arc<TenantClient>>> {
        self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Client of the default (`public`) tenant
    pub fn default_client(&self) -> Result<Arc<TenantClient>> {
        self.get_or_create(DEFAULT_SCHEMA)
    }

    /// Cached client for `tenant_id`, created on first use
    pub fn get_or_create(&self, tenant_id: &str) -> Result<Arc<TenantClient>> {
        let mut clients = self.clients();
        if let Some(client) = clients.get(tenant_id) {
            return Ok(Arc::clone(client));
        }

        let connection = self.tenant_connection(tenant_id)?;
        let pool = connection
            .pool_options()
            .connect_lazy_with(connection.connect_options());
        let client = Arc::new(TenantClient::new(pool, tenant_id));

        log::info!(
            "Created client for tenant {} (schema {}, max pool size {})",
            tenant_id,
            client.schema(),
            connection.max_pool_size
        );
        clients.insert(tenant_id.to_string(), Arc::clone(&client));
        Ok(client)
    }

    /// Connection settings a tenant's pool is built from
    ///
    /// The default tenant uses the configured credentials; every other tenant
    /// logs in as its own role, whose name and password are the schema name.
    pub fn tenant_connection(&self, tenant_id: &str) -> Result<ConnectionConfig> {
        if tenant_id == DEFAULT_SCHEMA {
            let password = match &self.decoder {
                Some(decoder) => decoder.decode(&self.connection.password).inspect_err(|e| {
                    log::error!("Unable to decode the configured password: {}", e);
                })?,
                None => self.connection.password.clone(),
            };
            Ok(self
                .connection
                .with_credentials(self.connection.username.clone(), password))
        } else {
            let role = tenant_schema_name(tenant_id);
            Ok(self.connection.with_credentials(role.clone(), role))
        }
    }

    /// Tenant ids with a cached client
    pub fn tenants(&self) -> Vec<String> {
        let mut tenants: Vec<String> = self.clients().keys().cloned().collect();
        tenants.sort();
        tenants
    }

    /// Connection settings the registry was opened with
    pub fn connection(&self) -> &ConnectionConfig {
        &self.connection
    }

    /// Close every cached pool and forget the clients
    pub async fn close(&self) {
        let clients: Vec<(String, Arc<TenantClient>)> = self.clients().drain().collect();
        for (tenant_id, client) in clients {
            client.pool().close().await;
            log::info!("Closed client for tenant {}", tenant_id);
        }
    }
}
