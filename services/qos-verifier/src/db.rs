// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Persistent store for verification operations
//!
//! PostgreSQL via tokio-postgres (pure Rust, no libpq). Only externally
//! significant operations are ever written here; pool status and system
//! scan operations live in memory only and are reconstructed by rescans
//! after a restart.

use async_trait::async_trait;
use chrono::Utc;
use deadpool_postgres::{Config, Pool, Runtime};
use thiserror::Error;
use tokio_postgres::NoTls;
use tokio_postgres::types::ToSql;

use crate::filter::VerifyOperationFilter;
use crate::operation::VerifyOperation;
use crate::types::{PnfsId, QoSAction, VerifyOperationState};

/// Store errors
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Bad row: {0}")]
    BadRow(String),
}

impl From<tokio_postgres::Error> for DbError {
    fn from(e: tokio_postgres::Error) -> Self {
        DbError::Query(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for DbError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        DbError::Connection(e.to_string())
    }
}

/// Fields the scheduler updates in place on stored rows
#[derive(Debug, Clone, Default)]
pub struct VerifyOperationUpdate {
    pub state: Option<VerifyOperationState>,
    pub action: Option<QoSAction>,
}

/// The persistence seam of the scheduler
#[async_trait]
pub trait VerifyOperationDao: Send + Sync {
    /// Insert; false when a row for the pnfsid already exists
    async fn store(&self, op: &VerifyOperation) -> Result<bool, DbError>;

    /// Update matching rows; returns the number touched
    async fn update(
        &self,
        filter: &VerifyOperationFilter,
        update: &VerifyOperationUpdate,
    ) -> Result<u64, DbError>;

    /// Delete matching rows; returns the number removed
    async fn delete(&self, filter: &VerifyOperationFilter) -> Result<u64, DbError>;

    /// Batched delete by pnfsid, used by the reaper
    async fn delete_batch(&self, ids: &[PnfsId]) -> Result<u64, DbError>;

    /// Matching rows in fairness order `(last_update, arrived)`
    async fn get(
        &self,
        filter: &VerifyOperationFilter,
        limit: usize,
    ) -> Result<Vec<VerifyOperation>, DbError>;

    async fn count(&self, filter: &VerifyOperationFilter) -> Result<u64, DbError>;

    /// Crash recovery: persisted RUNNING/WAITING rows are demoted to READY,
    /// then all non-terminal rows are returned in fairness order.
    async fn load(&self) -> Result<Vec<VerifyOperation>, DbError>;
}

const TABLE: &str = "qos_file_verify";

const TERMINAL_STATES: &str = "('done','canceled','failed','aborted')";

/// Dynamic WHERE clause assembled from a filter
struct SqlFilter {
    clauses: Vec<String>,
    params: Vec<Box<dyn ToSql + Sync + Send>>,
}

impl SqlFilter {
    fn build(filter: &VerifyOperationFilter) -> Self {
        let mut sql = Self {
            clauses: Vec::new(),
            params: Vec::new(),
        };

        if let Some(ids) = &filter.pnfs_ids {
            let ids: Vec<String> = ids.iter().map(|i| i.to_string()).collect();
            sql.push_param(ids, |n| format!("pnfsid = ANY(${})", n));
        }
        if let Some(types) = &filter.message_types {
            let types: Vec<String> = types.iter().map(|t| t.to_string()).collect();
            sql.push_param(types, |n| format!("message_type = ANY(${})", n));
        }
        if let Some(states) = &filter.states {
            let states: Vec<String> = states.iter().map(|s| s.to_string()).collect();
            sql.push_param(states, |n| format!("state = ANY(${})", n));
        }
        if let Some(action) = filter.action {
            sql.push_param(action.to_string(), |n| format!("action = ${}", n));
        }
        if let Some(parent) = &filter.parent {
            sql.push_param(parent.clone(), |n| format!("parent = ${}", n));
        }
        if let Some(source) = &filter.source {
            sql.push_param(source.clone(), |n| format!("source = ${}", n));
        }
        if let Some(target) = &filter.target {
            sql.push_param(target.clone(), |n| format!("target = ${}", n));
        }
        if let Some(pool) = &filter.pool {
            sql.push_param(pool.clone(), |n| {
                format!("(parent = ${0} OR source = ${0} OR target = ${0})", n)
            });
        }
        if let Some(group) = &filter.pool_group {
            sql.push_param(group.clone(), |n| format!("pool_group = ${}", n));
        }
        if let Some(unit) = &filter.storage_unit {
            sql.push_param(unit.clone(), |n| format!("storage_unit = ${}", n));
        }
        if let Some(retried) = filter.retried_at_least {
            sql.push_param(retried as i32, |n| format!("retried >= ${}", n));
        }
        if let Some(before) = filter.arrived_before {
            sql.push_param(before, |n| format!("arrived < ${}", n));
        }
        if let Some(after) = filter.arrived_after {
            sql.push_param(after, |n| format!("arrived > ${}", n));
        }

        sql
    }

    fn push_param<T, F>(&mut self, value: T, clause: F)
    where
        T: ToSql + Sync + Send + 'static,
        F: FnOnce(usize) -> String,
    {
        self.params.push(Box::new(value));
        let n = self.params.len();
        self.clauses.push(clause(n));
    }

    fn where_clause(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    fn params(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect()
    }
}

fn row_to_operation(row: &tokio_postgres::Row) -> Result<VerifyOperation, DbError> {
    let pnfsid: String = row.try_get("pnfsid")?;
    let message_type: String = row.try_get("message_type")?;
    let state: String = row.try_get("state")?;
    let action: Option<String> = row.try_get("action")?;
    let previous_action: Option<String> = row.try_get("previous_action")?;
    let error: Option<serde_json::Value> = row.try_get("error")?;
    let retried: i32 = row.try_get("retried")?;
    let needed: i32 = row.try_get("needed")?;

    let parse_action = |s: &str| {
        s.parse::<QoSAction>()
            .map_err(|e| DbError::BadRow(format!("{}: {}", pnfsid, e)))
    };

    Ok(VerifyOperation {
        pnfs_id: pnfsid
            .parse::<PnfsId>()
            .map_err(|e| DbError::BadRow(e.to_string()))?,
        arrived: row.try_get("arrived")?,
        last_update: row.try_get("last_update")?,
        message_type: message_type
            .parse()
            .map_err(|e| DbError::BadRow(format!("{}: {}", pnfsid, e)))?,
        storage_unit: row.try_get("storage_unit")?,
        pool_group: row.try_get("pool_group")?,
        parent: row.try_get("parent")?,
        source: row.try_get("source")?,
        target: row.try_get("target")?,
        retried: u32::try_from(retried).unwrap_or(0),
        needed: u32::try_from(needed).unwrap_or(0),
        state: state
            .parse()
            .map_err(|e| DbError::BadRow(format!("{}: {}", pnfsid, e)))?,
        action: action.as_deref().map(&parse_action).transpose()?,
        previous_action: previous_action.as_deref().map(&parse_action).transpose()?,
        tried: Default::default(),
        error: error
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| DbError::BadRow(format!("{}: {}", pnfsid, e)))?,
    })
}

/// PostgreSQL-backed DAO
pub struct PgVerifyOperationDao {
    pool: Pool,
}

impl PgVerifyOperationDao {
    /// Create a connection pool from a connection URL and verify it
    pub async fn new(database_url: &str) -> Result<Self, DbError> {
        let pg_config: tokio_postgres::Config = database_url
            .parse()
            .map_err(|e| DbError::Connection(format!("Invalid database URL: {}", e)))?;

        let mut cfg = Config::new();
        if let Some(host) = pg_config.get_hosts().first() {
            match host {
                tokio_postgres::config::Host::Tcp(host) => {
                    cfg.host = Some(host.clone());
                }
                tokio_postgres::config::Host::Unix(path) => {
                    cfg.host = Some(path.to_string_lossy().to_string());
                }
            }
        }
        if let Some(port) = pg_config.get_ports().first() {
            cfg.port = Some(*port);
        }
        if let Some(user) = pg_config.get_user() {
            cfg.user = Some(user.to_string());
        }
        if let Some(password) = pg_config.get_password() {
            cfg.password = Some(String::from_utf8_lossy(password).to_string());
        }
        if let Some(dbname) = pg_config.get_dbname() {
            cfg.dbname = Some(dbname.to_string());
        }

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DbError::Connection(format!("Failed to create pool: {}", e)))?;

        let client = pool.get().await?;
        client
            .execute("SELECT 1", &[])
            .await
            .map_err(|e| DbError::Connection(format!("Failed to connect to database: {}", e)))?;

        Ok(Self { pool })
    }

    /// Create the backing table when it does not exist yet
    pub async fn ensure_schema(&self) -> Result<(), DbError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "CREATE TABLE IF NOT EXISTS qos_file_verify (
                    pnfsid TEXT PRIMARY KEY,
                    arrived TIMESTAMPTZ NOT NULL,
                    last_update TIMESTAMPTZ NOT NULL,
                    message_type TEXT NOT NULL,
                    storage_unit TEXT,
                    pool_group TEXT,
                    parent TEXT,
                    source TEXT,
                    target TEXT,
                    action TEXT,
                    previous_action TEXT,
                    retried INT4 NOT NULL DEFAULT 0,
                    needed INT4 NOT NULL DEFAULT 0,
                    state TEXT NOT NULL,
                    error JSONB
                )",
                &[],
            )
            .await?;
        client
            .execute(
                "CREATE INDEX IF NOT EXISTS qos_file_verify_order
                 ON qos_file_verify (last_update, arrived)",
                &[],
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl VerifyOperationDao for PgVerifyOperationDao {
    async fn store(&self, op: &VerifyOperation) -> Result<bool, DbError> {
        let client = self.pool.get().await?;
        let error = op
            .error
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| DbError::BadRow(e.to_string()))?;
        let rows = client
            .execute(
                "INSERT INTO qos_file_verify
                     (pnfsid, arrived, last_update, message_type, storage_unit,
                      pool_group, parent, source, target, action, previous_action,
                      retried, needed, state, error)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                 ON CONFLICT (pnfsid) DO NOTHING",
                &[
                    &op.pnfs_id.to_string(),
                    &op.arrived,
                    &op.last_update,
                    &op.message_type.to_string(),
                    &op.storage_unit,
                    &op.pool_group,
                    &op.parent,
                    &op.source,
                    &op.target,
                    &op.action.map(|a| a.to_string()),
                    &op.previous_action.map(|a| a.to_string()),
                    &(op.retried as i32),
                    &(op.needed as i32),
                    &op.state.to_string(),
                    &error,
                ],
            )
            .await?;
        Ok(rows == 1)
    }

    async fn update(
        &self,
        filter: &VerifyOperationFilter,
        update: &VerifyOperationUpdate,
    ) -> Result<u64, DbError> {
        let mut sets = Vec::new();
        if let Some(state) = update.state {
            sets.push(format!("state = '{}'", state));
        }
        if let Some(action) = update.action {
            sets.push(format!("action = '{}'", action));
        }
        if sets.is_empty() {
            return Ok(0);
        }
        sets.push(format!("last_update = '{}'", Utc::now().to_rfc3339()));

        let sql = SqlFilter::build(filter);
        let stmt = format!(
            "UPDATE {} SET {}{}",
            TABLE,
            sets.join(", "),
            sql.where_clause()
        );
        let client = self.pool.get().await?;
        Ok(client.execute(&stmt, &sql.params()).await?)
    }

    async fn delete(&self, filter: &VerifyOperationFilter) -> Result<u64, DbError> {
        let sql = SqlFilter::build(filter);
        let stmt = format!("DELETE FROM {}{}", TABLE, sql.where_clause());
        let client = self.pool.get().await?;
        Ok(client.execute(&stmt, &sql.params()).await?)
    }

    async fn delete_batch(&self, ids: &[PnfsId]) -> Result<u64, DbError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = ids.iter().map(|i| i.to_string()).collect();
        let client = self.pool.get().await?;
        Ok(client
            .execute(
                "DELETE FROM qos_file_verify WHERE pnfsid = ANY($1)",
                &[&ids],
            )
            .await?)
    }

    async fn get(
        &self,
        filter: &VerifyOperationFilter,
        limit: usize,
    ) -> Result<Vec<VerifyOperation>, DbError> {
        let sql = SqlFilter::build(filter);
        let stmt = format!(
            "SELECT * FROM {}{} ORDER BY last_update, arrived LIMIT {}",
            TABLE,
            sql.where_clause(),
            limit
        );
        let client = self.pool.get().await?;
        let rows = client.query(&stmt, &sql.params()).await?;
        rows.iter().map(row_to_operation).collect()
    }

    async fn count(&self, filter: &VerifyOperationFilter) -> Result<u64, DbError> {
        let sql = SqlFilter::build(filter);
        let stmt = format!("SELECT COUNT(*) FROM {}{}", TABLE, sql.where_clause());
        let client = self.pool.get().await?;
        let row = client.query_one(&stmt, &sql.params()).await?;
        let count: i64 = row.try_get(0)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn load(&self) -> Result<Vec<VerifyOperation>, DbError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE qos_file_verify SET state = 'ready'
                 WHERE state IN ('running','waiting')",
                &[],
            )
            .await?;
        let stmt = format!(
            "SELECT * FROM {} WHERE state NOT IN {} ORDER BY last_update, arrived",
            TABLE, TERMINAL_STATES
        );
        let rows = client.query(&stmt, &[]).await?;
        rows.iter().map(row_to_operation).collect()
    }
}

#[cfg(test)]
pub mod mock {
    //! In-memory DAO used by the scheduler unit tests

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockVerifyOperationDao {
        rows: Mutex<HashMap<PnfsId, VerifyOperation>>,
    }

    impl MockVerifyOperationDao {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert_raw(&self, op: VerifyOperation) {
            #[allow(clippy::unwrap_used)]
            self.rows.lock().unwrap().insert(op.pnfs_id.clone(), op);
        }

        pub fn len(&self) -> usize {
            #[allow(clippy::unwrap_used)]
            self.rows.lock().unwrap().len()
        }

        pub fn contains(&self, id: &PnfsId) -> bool {
            #[allow(clippy::unwrap_used)]
            self.rows.lock().unwrap().contains_key(id)
        }
    }

    fn ordered(mut ops: Vec<VerifyOperation>) -> Vec<VerifyOperation> {
        ops.sort_by(|a, b| {
            a.last_update
                .cmp(&b.last_update)
                .then(a.arrived.cmp(&b.arrived))
        });
        ops
    }

    #[async_trait]
    impl VerifyOperationDao for MockVerifyOperationDao {
        async fn store(&self, op: &VerifyOperation) -> Result<bool, DbError> {
            #[allow(clippy::unwrap_used)]
            let mut rows = self.rows.lock().unwrap();
            if rows.contains_key(&op.pnfs_id) {
                return Ok(false);
            }
            rows.insert(op.pnfs_id.clone(), op.clone());
            Ok(true)
        }

        async fn update(
            &self,
            filter: &VerifyOperationFilter,
            update: &VerifyOperationUpdate,
        ) -> Result<u64, DbError> {
            #[allow(clippy::unwrap_used)]
            let mut rows = self.rows.lock().unwrap();
            let mut touched = 0;
            for op in rows.values_mut().filter(|op| filter.matches(op)) {
                if let Some(state) = update.state {
                    op.state = state;
                }
                if let Some(action) = update.action {
                    op.action = Some(action);
                }
                op.last_update = Utc::now();
                touched += 1;
            }
            Ok(touched)
        }

        async fn delete(&self, filter: &VerifyOperationFilter) -> Result<u64, DbError> {
            #[allow(clippy::unwrap_used)]
            let mut rows = self.rows.lock().unwrap();
            let before = rows.len();
            rows.retain(|_, op| !filter.matches(op));
            Ok((before - rows.len()) as u64)
        }

        async fn delete_batch(&self, ids: &[PnfsId]) -> Result<u64, DbError> {
            #[allow(clippy::unwrap_used)]
            let mut rows = self.rows.lock().unwrap();
            let before = rows.len();
            for id in ids {
                rows.remove(id);
            }
            Ok((before - rows.len()) as u64)
        }

        async fn get(
            &self,
            filter: &VerifyOperationFilter,
            limit: usize,
        ) -> Result<Vec<VerifyOperation>, DbError> {
            #[allow(clippy::unwrap_used)]
            let rows = self.rows.lock().unwrap();
            let matched: Vec<VerifyOperation> = rows
                .values()
                .filter(|op| filter.matches(op))
                .cloned()
                .collect();
            Ok(ordered(matched).into_iter().take(limit).collect())
        }

        async fn count(&self, filter: &VerifyOperationFilter) -> Result<u64, DbError> {
            #[allow(clippy::unwrap_used)]
            let rows = self.rows.lock().unwrap();
            Ok(rows.values().filter(|op| filter.matches(op)).count() as u64)
        }

        async fn load(&self) -> Result<Vec<VerifyOperation>, DbError> {
            #[allow(clippy::unwrap_used)]
            let mut rows = self.rows.lock().unwrap();
            for op in rows.values_mut() {
                if matches!(
                    op.state,
                    VerifyOperationState::Running | VerifyOperationState::Waiting
                ) {
                    op.state = VerifyOperationState::Ready;
                }
            }
            let live: Vec<VerifyOperation> = rows
                .values()
                .filter(|op| !op.is_in_terminal_state())
                .cloned()
                .collect();
            Ok(ordered(live))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockVerifyOperationDao;
    use super::*;
    use crate::types::{FileQoSUpdate, QoSMessageType};
    use chrono::Duration;

    fn op(id: &str, minutes_ago: i64) -> VerifyOperation {
        let update = FileQoSUpdate::new(id.into(), QoSMessageType::AddCacheLocation);
        let mut op = VerifyOperation::new(&update, Utc::now() - Duration::minutes(minutes_ago));
        op.make_ready();
        op
    }

    #[tokio::test]
    async fn store_is_idempotent_per_pnfsid() {
        let dao = MockVerifyOperationDao::new();
        assert!(dao.store(&op("A", 1)).await.unwrap());
        assert!(!dao.store(&op("A", 1)).await.unwrap());
        assert_eq!(dao.len(), 1);
    }

    #[tokio::test]
    async fn get_orders_by_fairness() {
        let dao = MockVerifyOperationDao::new();
        dao.store(&op("NEW", 1)).await.unwrap();
        dao.store(&op("OLD", 10)).await.unwrap();
        dao.store(&op("MID", 5)).await.unwrap();

        let all = dao.get(&VerifyOperationFilter::default(), 10).await.unwrap();
        let ids: Vec<String> = all.iter().map(|o| o.pnfs_id.to_string()).collect();
        assert_eq!(ids, vec!["OLD", "MID", "NEW"]);
    }

    #[tokio::test]
    async fn load_demotes_running_and_waiting() {
        let dao = MockVerifyOperationDao::new();
        let mut running = op("R", 1);
        running.submit(Utc::now());
        dao.insert_raw(running);
        let mut waiting = op("W", 1);
        waiting.state = VerifyOperationState::Waiting;
        dao.insert_raw(waiting);
        let mut done = op("D", 1);
        done.state = VerifyOperationState::Done;
        dao.insert_raw(done);

        let loaded = dao.load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.iter().all(|o| o.state == VerifyOperationState::Ready));
    }

    #[tokio::test]
    async fn delete_batch_removes_only_named_rows() {
        let dao = MockVerifyOperationDao::new();
        dao.store(&op("A", 1)).await.unwrap();
        dao.store(&op("B", 1)).await.unwrap();
        dao.store(&op("C", 1)).await.unwrap();

        let removed = dao
            .delete_batch(&["A".into(), "C".into(), "X".into()])
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(dao.contains(&"B".into()));
        assert!(!dao.contains(&"A".into()));
    }

    #[tokio::test]
    async fn update_touches_only_matching_rows() {
        let dao = MockVerifyOperationDao::new();
        dao.store(&op("A", 1)).await.unwrap();
        dao.store(&op("B", 1)).await.unwrap();

        let mut filter = VerifyOperationFilter::default();
        filter.pnfs_ids = Some(["A".into()].into_iter().collect());
        let update = VerifyOperationUpdate {
            state: Some(VerifyOperationState::Canceled),
            action: Some(QoSAction::Void),
        };
        assert_eq!(dao.update(&filter, &update).await.unwrap(), 1);

        let mut canceled = VerifyOperationFilter::default();
        canceled.states = Some([VerifyOperationState::Canceled].into_iter().collect());
        assert_eq!(dao.count(&canceled).await.unwrap(), 1);
    }
}
