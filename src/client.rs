//! TenantClient - CRUD over JSONB document tables
//!
//! Every table a client touches lives in the tenant's schema and has the
//! shape `(_id, jsonb[, auxiliary columns])`. Entities are stored as the JSON
//! payload; the id is assigned by the database.
//!
//! Each operation runs on a connection taken from the tenant pool. The
//! `*_tx` variants run on an open [`TxHandle`] instead and leave it open.

use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};

use crate::error::{PersistError, Result};
use crate::mapper::{COUNT_FIELD, Document, ID_FIELD, RowData, TypeRegistry, map_rows};
use crate::sql::criteria::{JSONB_FIELD, UpdateSection};
use crate::sql::fragment::{QueryFilter, SqlFragment};
use crate::sql::sanitize::{qualified_table, quote_identifier, tenant_schema_name, validate_identifier};
use crate::transaction::{AsExec, TxHandle};

/// Outcome of an UPDATE or DELETE
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationResult {
    pub rows_affected: u64,
    /// Ids of the touched rows, only filled when requested
    pub ids: Vec<String>,
}

enum Param<'a> {
    Json(&'a Value),
    Text(&'a str),
}

fn build_query<'q>(sql: &'q str, params: &'q [Param<'q>]) -> Query<'q, Postgres, PgArguments> {
    params.iter().fold(sqlx::query(sql), |query, param| match param {
        Param::Json(value) => query.bind(*value),
        Param::Text(text) => query.bind(*text),
    })
}

// =========================================================================
// Statement builders
// =========================================================================

pub(crate) fn insert_sql(table: &str) -> String {
    format!(
        "INSERT INTO {} ({}) VALUES ($1::jsonb) RETURNING {}::text AS {}",
        table, JSONB_FIELD, ID_FIELD, ID_FIELD
    )
}

pub(crate) fn update_sql(table: &str, set_expr: &str, tail: &str, returning: bool) -> String {
    let mut sql = format!("UPDATE {} SET {} = {}", table, JSONB_FIELD, set_expr);
    push_tail(&mut sql, tail);
    if returning {
        sql.push_str(&format!(" RETURNING {}::text AS {}", ID_FIELD, ID_FIELD));
    }
    sql
}

pub(crate) fn delete_sql(table: &str, tail: &str) -> String {
    let mut sql = format!("DELETE FROM {}", table);
    push_tail(&mut sql, tail);
    sql
}

pub(crate) fn select_sql(
    table: &str,
    from: Option<&SqlFragment>,
    tail: &str,
    return_count: bool,
    fields: &[String],
) -> String {
    let mut columns = vec![
        JSONB_FIELD.to_string(),
        format!("{}::text AS {}", ID_FIELD, ID_FIELD),
    ];
    if return_count {
        columns.push(format!("COUNT(*) OVER() AS {}", COUNT_FIELD));
    }
    for field in fields {
        let quoted = quote_identifier(field);
        columns.push(format!("{}::text AS {}", quoted, quoted));
    }

    let mut sql = format!("SELECT {} FROM {}", columns.join(", "), table);
    if let Some(from) = from {
        sql.push_str(", ");
        sql.push_str(from.as_str());
    }
    push_tail(&mut sql, tail);
    sql
}

fn push_tail(sql: &mut String, tail: &str) {
    let tail = tail.trim();
    if !tail.is_empty() {
        sql.push(' ');
        sql.push_str(tail);
    }
}

fn id_clause(param: usize) -> String {
    format!("WHERE {}::text = ${}", ID_FIELD, param)
}

/// WHERE tail of a filter used in UPDATE or DELETE
fn mutation_tail(filter: &dyn QueryFilter) -> Result<SqlFragment> {
    if filter.from_clause()?.is_some() {
        return Err(PersistError::invalid_filter(
            "Array criteria can only be used when selecting",
        ));
    }
    if filter.has_order_or_paging()? {
        return Err(PersistError::invalid_filter(
            "Ordering and paging can only be used when selecting",
        ));
    }
    filter.to_sql()
}

fn checked_fields(fields: &[&str]) -> Result<Vec<String>> {
    fields
        .iter()
        .map(|field| {
            validate_identifier(field, &[ID_FIELD, JSONB_FIELD, COUNT_FIELD])
                .map(|_| field.to_string())
                .map_err(PersistError::invalid_filter)
        })
        .collect()
}

/// Connection pool and schema of one tenant
#[derive(Debug, Clone)]
pub struct TenantClient {
    pool: PgPool,
    tenant_id: String,
    schema: String,
}

impl TenantClient {
    pub(crate) fn new(pool: PgPool, tenant_id: impl Into<String>) -> Self {
        let tenant_id = tenant_id.into();
        Self {
            pool,
            schema: tenant_schema_name(&tenant_id),
            tenant_id,
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Schema holding the tenant's tables
    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn table(&self, table: &str) -> String {
        qualified_table(&self.schema, table)
    }

    async fn acquire(&self) -> Result<PoolConnection<Postgres>> {
        self.pool.acquire().await.map_err(|e| {
            log::error!("Unable to acquire connection for tenant {}: {}", self.tenant_id, e);
            PersistError::from(e)
        })
    }

    async fn execute_on(
        &self,
        exec: &mut impl AsExec,
        sql: &str,
        params: &[Param<'_>],
        returning: bool,
    ) -> Result<MutationResult> {
        log::debug!("[{}] {}", self.tenant_id, sql);
        let query = build_query(sql, params);

        let result = if returning {
            let rows = query.fetch_all(exec.as_exec()).await;
            let rows = rows.inspect_err(|e| log::error!("[{}] {} failed: {}", self.tenant_id, sql, e))?;
            let ids = rows
                .iter()
                .map(|row| row.try_get::<String, _>(ID_FIELD))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            MutationResult {
                rows_affected: ids.len() as u64,
                ids,
            }
        } else {
            let done = query.execute(exec.as_exec()).await;
            let done = done.inspect_err(|e| log::error!("[{}] {} failed: {}", self.tenant_id, sql, e))?;
            MutationResult {
                rows_affected: done.rows_affected(),
                ids: Vec::new(),
            }
        };

        Ok(result)
    }

    async fn fetch_on(
        &self,
        exec: &mut impl AsExec,
        sql: &str,
        params: &[Param<'_>],
    ) -> Result<Vec<RowData>> {
        log::debug!("[{}] {}", self.tenant_id, sql);
        let rows = build_query(sql, params)
            .fetch_all(exec.as_exec())
            .await
            .inspect_err(|e| log::error!("[{}] {} failed: {}", self.tenant_id, sql, e))?;
        rows.iter().map(RowData::from_pg_row).collect()
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Acquire a connection and open a transaction on it
    pub async fn start_tx(&self) -> Result<TxHandle> {
        TxHandle::begin(&self.pool, &self.tenant_id).await
    }

    /// Commit and release the connection
    pub async fn end_tx(&self, tx: TxHandle) -> Result<()> {
        tx.check_tenant(&self.tenant_id)?;
        tx.commit().await
    }

    /// Roll back and release the connection
    pub async fn rollback_tx(&self, tx: TxHandle) -> Result<()> {
        tx.check_tenant(&self.tenant_id)?;
        tx.rollback().await
    }

    // =========================================================================
    // Save
    // =========================================================================

    /// Insert an entity, returning the id assigned by the database
    pub async fn save<T: Serialize>(&self, table: &str, entity: &T) -> Result<String> {
        let mut conn = self.acquire().await?;
        self.save_on(&mut conn, table, entity).await
    }

    pub async fn save_tx<T: Serialize>(
        &self,
        tx: &mut TxHandle,
        table: &str,
        entity: &T,
    ) -> Result<String> {
        tx.check_tenant(&self.tenant_id)?;
        self.save_on(tx, table, entity).await
    }

    async fn save_on<T: Serialize>(
        &self,
        exec: &mut impl AsExec,
        table: &str,
        entity: &T,
    ) -> Result<String> {
        let document = serde_json::to_value(entity)
            .inspect_err(|e| log::error!("Unable to serialize entity for {}: {}", table, e))?;
        let sql = insert_sql(&self.table(table));

        let result = self
            .execute_on(exec, &sql, &[Param::Json(&document)], true)
            .await?;
        result
            .ids
            .into_iter()
            .next()
            .ok_or_else(|| PersistError::Query(sqlx::Error::RowNotFound))
    }

    // =========================================================================
    // Update
    // =========================================================================

    /// Replace the whole document of every row matching `filter`
    pub async fn update<T: Serialize>(
        &self,
        table: &str,
        entity: &T,
        filter: &dyn QueryFilter,
        return_ids: bool,
    ) -> Result<MutationResult> {
        let mut conn = self.acquire().await?;
        self.update_on(&mut conn, table, entity, filter, return_ids).await
    }

    pub async fn update_tx<T: Serialize>(
        &self,
        tx: &mut TxHandle,
        table: &str,
        entity: &T,
        filter: &dyn QueryFilter,
        return_ids: bool,
    ) -> Result<MutationResult> {
        tx.check_tenant(&self.tenant_id)?;
        self.update_on(tx, table, entity, filter, return_ids).await
    }

    async fn update_on<T: Serialize>(
        &self,
        exec: &mut impl AsExec,
        table: &str,
        entity: &T,
        filter: &dyn QueryFilter,
        return_ids: bool,
    ) -> Result<MutationResult> {
        let document = serde_json::to_value(entity)?;
        let tail = mutation_tail(filter)?;
        let sql = update_sql(&self.table(table), "$1::jsonb", tail.as_str(), return_ids);
        self.execute_on(exec, &sql, &[Param::Json(&document)], return_ids)
            .await
    }

    /// Replace the whole document of the row with `id`
    pub async fn update_by_id<T: Serialize>(
        &self,
        table: &str,
        entity: &T,
        id: &str,
    ) -> Result<MutationResult> {
        let mut conn = self.acquire().await?;
        self.update_by_id_on(&mut conn, table, entity, id).await
    }

    pub async fn update_by_id_tx<T: Serialize>(
        &self,
        tx: &mut TxHandle,
        table: &str,
        entity: &T,
        id: &str,
    ) -> Result<MutationResult> {
        tx.check_tenant(&self.tenant_id)?;
        self.update_by_id_on(tx, table, entity, id).await
    }

    async fn update_by_id_on<T: Serialize>(
        &self,
        exec: &mut impl AsExec,
        table: &str,
        entity: &T,
        id: &str,
    ) -> Result<MutationResult> {
        let document = serde_json::to_value(entity)?;
        let sql = update_sql(&self.table(table), "$1::jsonb", &id_clause(2), false);
        self.execute_on(exec, &sql, &[Param::Json(&document), Param::Text(id)], false)
            .await
    }

    /// Rewrite part of every document matching `filter`, keeping the other
    /// fields
    pub async fn update_section(
        &self,
        table: &str,
        section: &UpdateSection,
        filter: &dyn QueryFilter,
        return_ids: bool,
    ) -> Result<MutationResult> {
        let mut conn = self.acquire().await?;
        self.update_section_on(&mut conn, table, section, filter, return_ids)
            .await
    }

    pub async fn update_section_tx(
        &self,
        tx: &mut TxHandle,
        table: &str,
        section: &UpdateSection,
        filter: &dyn QueryFilter,
        return_ids: bool,
    ) -> Result<MutationResult> {
        tx.check_tenant(&self.tenant_id)?;
        self.update_section_on(tx, table, section, filter, return_ids)
            .await
    }

    async fn update_section_on(
        &self,
        exec: &mut impl AsExec,
        table: &str,
        section: &UpdateSection,
        filter: &dyn QueryFilter,
        return_ids: bool,
    ) -> Result<MutationResult> {
        let set_expr = section.to_sql(JSONB_FIELD)?;
        let tail = mutation_tail(filter)?;
        let sql = update_sql(&self.table(table), set_expr.as_str(), tail.as_str(), return_ids);
        self.execute_on(exec, &sql, &[], return_ids).await
    }

    // =========================================================================
    // Delete
    // =========================================================================

    pub async fn delete_by_id(&self, table: &str, id: &str) -> Result<MutationResult> {
        let mut conn = self.acquire().await?;
        self.delete_by_id_on(&mut conn, table, id).await
    }

    pub async fn delete_by_id_tx(
        &self,
        tx: &mut TxHandle,
        table: &str,
        id: &str,
    ) -> Result<MutationResult> {
        tx.check_tenant(&self.tenant_id)?;
        self.delete_by_id_on(tx, table, id).await
    }

    async fn delete_by_id_on(
        &self,
        exec: &mut impl AsExec,
        table: &str,
        id: &str,
    ) -> Result<MutationResult> {
        let sql = delete_sql(&self.table(table), &id_clause(1));
        self.execute_on(exec, &sql, &[Param::Text(id)], false).await
    }

    /// Delete every row matching `filter`
    pub async fn delete(&self, table: &str, filter: &dyn QueryFilter) -> Result<MutationResult> {
        let mut conn = self.acquire().await?;
        self.delete_on(&mut conn, table, filter).await
    }

    pub async fn delete_tx(
        &self,
        tx: &mut TxHandle,
        table: &str,
        filter: &dyn QueryFilter,
    ) -> Result<MutationResult> {
        tx.check_tenant(&self.tenant_id)?;
        self.delete_on(tx, table, filter).await
    }

    async fn delete_on(
        &self,
        exec: &mut impl AsExec,
        table: &str,
        filter: &dyn QueryFilter,
    ) -> Result<MutationResult> {
        let tail = mutation_tail(filter)?;
        let sql = delete_sql(&self.table(table), tail.as_str());
        self.execute_on(exec, &sql, &[], false).await
    }

    /// Delete every row whose document contains the serialized `example`
    pub async fn delete_matching<T: Serialize>(
        &self,
        table: &str,
        example: &T,
    ) -> Result<MutationResult> {
        let mut conn = self.acquire().await?;
        self.delete_matching_on(&mut conn, table, example).await
    }

    pub async fn delete_matching_tx<T: Serialize>(
        &self,
        tx: &mut TxHandle,
        table: &str,
        example: &T,
    ) -> Result<MutationResult> {
        tx.check_tenant(&self.tenant_id)?;
        self.delete_matching_on(tx, table, example).await
    }

    async fn delete_matching_on<T: Serialize>(
        &self,
        exec: &mut impl AsExec,
        table: &str,
        example: &T,
    ) -> Result<MutationResult> {
        let document = serde_json::to_value(example)?;
        let sql = delete_sql(&self.table(table), &containment_clause());
        self.execute_on(exec, &sql, &[Param::Json(&document)], false)
            .await
    }

    // =========================================================================
    // Get
    // =========================================================================

    /// Select the rows matching `filter` as entities plus the total count
    ///
    /// With `return_count` the total counts every matching row regardless of
    /// LIMIT/OFFSET; otherwise it is the number of rows returned. With
    /// `set_id` the row id is written into each entity after mapping.
    pub async fn get<T: Document>(
        &self,
        table: &str,
        filter: &dyn QueryFilter,
        return_count: bool,
        set_id: bool,
    ) -> Result<(Vec<T>, i64)> {
        self.get_with_fields(table, filter, &[], return_count, set_id)
            .await
    }

    pub async fn get_tx<T: Document>(
        &self,
        tx: &mut TxHandle,
        table: &str,
        filter: &dyn QueryFilter,
        return_count: bool,
        set_id: bool,
    ) -> Result<(Vec<T>, i64)> {
        tx.check_tenant(&self.tenant_id)?;
        let rows = self
            .select_rows_on(tx, table, filter, return_count, &[])
            .await?;
        map_rows(rows, set_id)
    }

    /// Like [`get`](Self::get), also selecting auxiliary columns that are
    /// mapped onto entity fields
    pub async fn get_with_fields<T: Document>(
        &self,
        table: &str,
        filter: &dyn QueryFilter,
        fields: &[&str],
        return_count: bool,
        set_id: bool,
    ) -> Result<(Vec<T>, i64)> {
        let mut conn = self.acquire().await?;
        let rows = self
            .select_rows_on(&mut conn, table, filter, return_count, fields)
            .await?;
        map_rows(rows, set_id)
    }

    async fn select_rows_on(
        &self,
        exec: &mut impl AsExec,
        table: &str,
        filter: &dyn QueryFilter,
        return_count: bool,
        fields: &[&str],
    ) -> Result<Vec<RowData>> {
        let fields = checked_fields(fields)?;
        let tail = filter.to_sql()?;
        let from = filter.from_clause()?;
        let sql = select_sql(
            &self.table(table),
            from.as_ref(),
            tail.as_str(),
            return_count,
            &fields,
        );
        self.fetch_on(exec, &sql, &[]).await
    }

    /// Select the rows whose document contains the serialized `example`
    pub async fn get_matching<T: Document, E: Serialize>(
        &self,
        table: &str,
        example: &E,
        return_count: bool,
        set_id: bool,
    ) -> Result<(Vec<T>, i64)> {
        let mut conn = self.acquire().await?;
        self.get_matching_on(&mut conn, table, example, return_count, set_id)
            .await
    }

    pub async fn get_matching_tx<T: Document, E: Serialize>(
        &self,
        tx: &mut TxHandle,
        table: &str,
        example: &E,
        return_count: bool,
        set_id: bool,
    ) -> Result<(Vec<T>, i64)> {
        tx.check_tenant(&self.tenant_id)?;
        self.get_matching_on(tx, table, example, return_count, set_id)
            .await
    }

    async fn get_matching_on<T: Document, E: Serialize>(
        &self,
        exec: &mut impl AsExec,
        table: &str,
        example: &E,
        return_count: bool,
        set_id: bool,
    ) -> Result<(Vec<T>, i64)> {
        let document = serde_json::to_value(example)?;
        let sql = select_sql(&self.table(table), None, &containment_clause(), return_count, &[]);
        let rows = self
            .fetch_on(exec, &sql, &[Param::Json(&document)])
            .await?;
        map_rows(rows, set_id)
    }

    /// Select one entity by id, with the id written into it
    pub async fn get_by_id<T: Document>(&self, table: &str, id: &str) -> Result<Option<T>> {
        let mut conn = self.acquire().await?;
        self.get_by_id_on(&mut conn, table, id).await
    }

    pub async fn get_by_id_tx<T: Document>(
        &self,
        tx: &mut TxHandle,
        table: &str,
        id: &str,
    ) -> Result<Option<T>> {
        tx.check_tenant(&self.tenant_id)?;
        self.get_by_id_on(tx, table, id).await
    }

    async fn get_by_id_on<T: Document>(
        &self,
        exec: &mut impl AsExec,
        table: &str,
        id: &str,
    ) -> Result<Option<T>> {
        let sql = select_sql(&self.table(table), None, &id_clause(1), false, &[]);
        let rows = self.fetch_on(exec, &sql, &[Param::Text(id)]).await?;
        let (entities, _) = map_rows(rows, true)?;
        Ok(entities.into_iter().next())
    }

    /// Select rows and decode them as the type registered under `tag`
    pub async fn get_tagged(
        &self,
        types: &TypeRegistry,
        tag: &str,
        table: &str,
        filter: &dyn QueryFilter,
        return_count: bool,
    ) -> Result<(Vec<Value>, i64)> {
        if !types.contains(tag) {
            return Err(PersistError::configuration(format!(
                "No type registered under tag '{}'",
                tag
            )));
        }

        let mut conn = self.acquire().await?;
        let rows = self
            .select_rows_on(&mut conn, table, filter, return_count, &[])
            .await?;

        let total = rows
            .first()
            .and_then(|row| row.count)
            .unwrap_or(rows.len() as i64);
        let decoded = rows
            .into_iter()
            .map(|row| types.decode(tag, row.payload))
            .collect::<Result<Vec<_>>>()
            .inspect_err(|e| log::error!("Unable to decode {} rows from {}: {}", tag, table, e))?;

        Ok((decoded, total))
    }

    // =========================================================================
    // Ad hoc statements
    // =========================================================================

    /// Run a trusted SELECT and return the raw rows
    pub async fn select(&self, sql: &str) -> Result<Vec<PgRow>> {
        let mut conn = self.acquire().await?;
        self.select_on(&mut conn, sql).await
    }

    pub async fn select_tx(&self, tx: &mut TxHandle, sql: &str) -> Result<Vec<PgRow>> {
        tx.check_tenant(&self.tenant_id)?;
        self.select_on(tx, sql).await
    }

    async fn select_on(&self, exec: &mut impl AsExec, sql: &str) -> Result<Vec<PgRow>> {
        log::debug!("[{}] {}", self.tenant_id, sql);
        let rows = sqlx::query(sql)
            .fetch_all(exec.as_exec())
            .await
            .inspect_err(|e| log::error!("[{}] {} failed: {}", self.tenant_id, sql, e))?;
        Ok(rows)
    }

    /// Run a trusted data-modifying statement, returning the affected row count
    pub async fn mutate(&self, sql: &str) -> Result<u64> {
        let mut conn = self.acquire().await?;
        let result = self.execute_on(&mut conn, sql, &[], false).await?;
        Ok(result.rows_affected)
    }

    pub async fn mutate_tx(&self, tx: &mut TxHandle, sql: &str) -> Result<u64> {
        tx.check_tenant(&self.tenant_id)?;
        let result = self.execute_on(tx, sql, &[], false).await?;
        Ok(result.rows_affected)
    }

    /// Bulk-load a tab-delimited file into `table` with `COPY ... FROM STDIN`
    pub async fn import_file(&self, path: impl AsRef<Path>, table: &str) -> Result<u64> {
        let mut conn = self.acquire().await?;
        self.import_file_on(&mut conn, path.as_ref(), table).await
    }

    pub async fn import_file_tx(
        &self,
        tx: &mut TxHandle,
        path: impl AsRef<Path>,
        table: &str,
    ) -> Result<u64> {
        tx.check_tenant(&self.tenant_id)?;
        self.import_file_on(tx, path.as_ref(), table).await
    }

    async fn import_file_on(&self, exec: &mut impl AsExec, path: &Path, table: &str) -> Result<u64> {
        let data = tokio::fs::read(path)
            .await
            .inspect_err(|e| log::error!("Unable to read {}: {}", path.display(), e))?;

        let statement = format!("COPY {} FROM STDIN", self.table(table));
        log::info!(
            "[{}] importing {} ({} bytes) into {}",
            self.tenant_id,
            path.display(),
            data.len(),
            table
        );

        let mut copy = exec.as_exec().copy_in_raw(&statement).await?;
        let sent = copy.send(data).await.map(|_| ());
        if let Err(e) = sent {
            log::error!("[{}] {} failed: {}", self.tenant_id, statement, e);
            copy.abort(e.to_string()).await?;
            return Err(e.into());
        }
        let rows = copy.finish().await?;

        log::info!("[{}] imported {} rows into {}", self.tenant_id, rows, table);
        Ok(rows)
    }
}

fn containment_clause() -> String {
    format!("WHERE {} @> $1::jsonb", JSONB_FIELD)
}
