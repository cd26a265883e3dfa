//! Transaction handles
//!
//! A [`TxHandle`] owns one pooled connection inside `BEGIN`. It is resolved
//! by exactly one of commit or rollback, both of which consume the handle and
//! return the connection to the pool.

use std::fmt;

use sqlx::pool::PoolConnection;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::{PersistError, Result};

/// Anything queries can run on
pub trait AsExec {
    fn as_exec(&mut self) -> &mut PgConnection;
}

impl AsExec for PgConnection {
    fn as_exec(&mut self) -> &mut PgConnection {
        self
    }
}

impl AsExec for PoolConnection<Postgres> {
    fn as_exec(&mut self) -> &mut PgConnection {
        self
    }
}

impl AsExec for TxHandle {
    fn as_exec(&mut self) -> &mut PgConnection {
        &mut self.tx
    }
}

/// Bookkeeping of one transaction; logs when dropped unresolved
#[derive(Debug)]
struct TxState {
    id: Uuid,
    tenant_id: String,
    armed: bool,
}

impl TxState {
    fn new(tenant_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            armed: true,
        }
    }

    /// Mark the transaction resolved; a transaction resolves only once
    fn resolve(&mut self, action: &str) -> Result<()> {
        if !self.armed {
            return Err(PersistError::transaction_state(format!(
                "Cannot {} transaction {}, it is already resolved",
                action, self.id
            )));
        }
        self.armed = false;
        Ok(())
    }

    fn check_tenant(&self, tenant_id: &str) -> Result<()> {
        if self.tenant_id == tenant_id {
            Ok(())
        } else {
            Err(PersistError::transaction_state(format!(
                "Transaction {} belongs to tenant {}, not {}",
                self.id, self.tenant_id, tenant_id
            )))
        }
    }
}

impl Drop for TxState {
    fn drop(&mut self) {
        if self.armed {
            log::warn!(
                "Transaction {} for tenant {} dropped without commit or rollback, rolling back",
                self.id,
                self.tenant_id
            );
        }
    }
}

/// An open transaction on one tenant's pool
pub struct TxHandle {
    tx: Transaction<'static, Postgres>,
    guard: TxState,
}

impl fmt::Debug for TxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxHandle")
            .field("id", &self.guard.id)
            .field("tenant_id", &self.guard.tenant_id)
            .finish()
    }
}

impl TxHandle {
    /// Acquire a connection and open a transaction on it
    ///
    /// If `BEGIN` fails the connection goes back to the pool before the
    /// error is returned.
    pub(crate) async fn begin(pool: &PgPool, tenant_id: &str) -> Result<Self> {
        let tx = pool.begin().await.inspect_err(|e| {
            log::error!("Unable to start transaction for tenant {}: {}", tenant_id, e);
        })?;

        let guard = TxState::new(tenant_id);
        log::debug!("Transaction {} started for tenant {}", guard.id, tenant_id);

        Ok(Self { tx, guard })
    }

    /// Correlation id used in log lines
    pub fn id(&self) -> Uuid {
        self.guard.id
    }

    pub fn tenant_id(&self) -> &str {
        &self.guard.tenant_id
    }

    pub async fn commit(self) -> Result<()> {
        let Self { tx, mut guard } = self;
        guard.resolve("commit")?;

        tx.commit().await.map_err(|e| {
            log::error!("Commit of transaction {} failed: {}", guard.id, e);
            PersistError::transaction_state(format!("Commit of transaction {} failed: {}", guard.id, e))
        })?;

        log::debug!("Transaction {} committed", guard.id);
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        let Self { tx, mut guard } = self;
        guard.resolve("roll back")?;

        tx.rollback().await.map_err(|e| {
            log::error!("Rollback of transaction {} failed: {}", guard.id, e);
            PersistError::transaction_state(format!(
                "Rollback of transaction {} failed: {}",
                guard.id, e
            ))
        })?;

        log::debug!("Transaction {} rolled back", guard.id);
        Ok(())
    }

    /// Fail unless this transaction belongs to `tenant_id`
    pub(crate) fn check_tenant(&self, tenant_id: &str) -> Result<()> {
        self.guard.check_tenant(tenant_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_is_unresolved() {
        let state = TxState::new("diku");
        assert!(state.armed);
        assert_eq!(state.tenant_id, "diku");
        assert_ne!(state.id, TxState::new("diku").id);
    }

    #[test]
    fn test_resolves_exactly_once() {
        let mut state = TxState::new("diku");
        state.resolve("roll back").unwrap();
        assert!(!state.armed);

        let second = state.resolve("commit");
        assert!(matches!(second, Err(PersistError::TransactionState(_))));
        assert!(!state.armed);
    }

    #[test]
    fn test_tenant_mismatch_is_rejected() {
        let state = TxState::new("diku");
        assert!(state.check_tenant("diku").is_ok());

        let result = state.check_tenant("test_lib");
        match result {
            Err(PersistError::TransactionState(message)) => {
                assert!(message.contains("diku"));
                assert!(message.contains("test_lib"));
            }
            other => panic!("expected a transaction state error, got {:?}", other),
        }
    }

    #[test]
    fn test_dropping_unresolved_state_only_warns() {
        drop(TxState::new("diku"));

        let mut resolved = TxState::new("diku");
        resolved.resolve("commit").unwrap();
        drop(resolved);
    }
}
