use std::sync::Mutex;

use rusqlite::{Connection, params};
use serde_json::Value;

use super::{Store, StoreKind, check_key_parts, storage_key};
use crate::context::OpContext;
use crate::error::BrokerError;

/// Durable backend over a single SQLite file. One `records` table keyed by
/// the namespaced `"{tenant}:{kind}:{id}"` string and one `queue_items`
/// table with a per-queue FIFO sequence.
pub struct SqliteStore {
    pub conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new(path: &str) -> Self {
        let conn = Connection::open(path).expect("Failed to open database");
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .expect("Failed to set pragmas");
        let store = SqliteStore {
            conn: Mutex::new(conn),
        };
        store.migrate();
        store
    }

    fn migrate(&self) {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                key TEXT PRIMARY KEY,
                tenant TEXT NOT NULL,
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_records_tenant_kind ON records(tenant, kind);

            CREATE TABLE IF NOT EXISTS queue_items (
                tenant TEXT NOT NULL,
                kind TEXT NOT NULL,
                queue TEXT NOT NULL,
                seq INTEGER NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (tenant, kind, queue, seq)
            );

            CREATE INDEX IF NOT EXISTS idx_queue_items_queue ON queue_items(tenant, kind, queue);",
        )
        .expect("Failed to run migrations");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Full record dump, used to warm the failover mirror at startup.
    pub(crate) fn all_records(&self) -> Result<Vec<(String, StoreKind, String, Value)>, BrokerError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT tenant, kind, id, value FROM records")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (tenant, kind, id, value) = row?;
            let Some(kind) = StoreKind::parse(&kind) else {
                continue;
            };
            out.push((tenant, kind, id, serde_json::from_str(&value)?));
        }
        Ok(out)
    }

    /// Queue dump in FIFO order, used to warm the failover mirror at startup.
    pub(crate) fn all_queue_items(
        &self,
    ) -> Result<Vec<(String, StoreKind, String, Value)>, BrokerError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT tenant, kind, queue, value FROM queue_items ORDER BY tenant, kind, queue, seq",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (tenant, kind, queue, value) = row?;
            let Some(kind) = StoreKind::parse(&kind) else {
                continue;
            };
            out.push((tenant, kind, queue, serde_json::from_str(&value)?));
        }
        Ok(out)
    }
}

impl Store for SqliteStore {
    fn get(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
        id: &str,
    ) -> Result<Option<Value>, BrokerError> {
        ctx.check()?;
        let key = storage_key(tenant, kind, id)?;
        let conn = self.lock();
        let text: Option<String> = conn
            .query_row("SELECT value FROM records WHERE key = ?1", params![&key], |r| {
                r.get(0)
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        match text {
            Some(t) => Ok(Some(serde_json::from_str(&t)?)),
            None => Ok(None),
        }
    }

    fn put(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
        id: &str,
        value: &Value,
    ) -> Result<(), BrokerError> {
        ctx.check()?;
        let key = storage_key(tenant, kind, id)?;
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO records (key, tenant, kind, id, value, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![&key, tenant, kind.as_str(), id, value.to_string(), &now],
        )?;
        Ok(())
    }

    fn delete(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
        id: &str,
    ) -> Result<bool, BrokerError> {
        ctx.check()?;
        let key = storage_key(tenant, kind, id)?;
        let conn = self.lock();
        let n = conn.execute("DELETE FROM records WHERE key = ?1", params![&key])?;
        Ok(n > 0)
    }

    fn list(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
    ) -> Result<Vec<(String, Value)>, BrokerError> {
        ctx.check()?;
        check_key_parts(tenant, "_list")?;
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, value FROM records WHERE tenant = ?1 AND kind = ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![tenant, kind.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, value) = row?;
            out.push((id, serde_json::from_str(&value)?));
        }
        Ok(out)
    }

    fn enqueue(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
        queue: &str,
        value: &Value,
    ) -> Result<usize, BrokerError> {
        ctx.check()?;
        check_key_parts(tenant, queue)?;
        let conn = self.lock();
        let next_seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM queue_items WHERE tenant = ?1 AND kind = ?2 AND queue = ?3",
            params![tenant, kind.as_str(), queue],
            |r| r.get(0),
        )?;
        conn.execute(
            "INSERT INTO queue_items (tenant, kind, queue, seq, value) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![tenant, kind.as_str(), queue, next_seq, value.to_string()],
        )?;
        let depth: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queue_items WHERE tenant = ?1 AND kind = ?2 AND queue = ?3",
            params![tenant, kind.as_str(), queue],
            |r| r.get(0),
        )?;
        Ok(depth as usize)
    }

    fn dequeue_up_to(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
        queue: &str,
        n: usize,
    ) -> Result<Vec<Value>, BrokerError> {
        ctx.check()?;
        check_key_parts(tenant, queue)?;
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT seq, value FROM queue_items WHERE tenant = ?1 AND kind = ?2 AND queue = ?3
             ORDER BY seq ASC LIMIT ?4",
        )?;
        let rows = stmt.query_map(params![tenant, kind.as_str(), queue, n as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut seqs: Vec<i64> = Vec::new();
        let mut out: Vec<Value> = Vec::new();
        for row in rows {
            let (seq, value) = row?;
            seqs.push(seq);
            out.push(serde_json::from_str(&value)?);
        }
        drop(stmt);
        if let Some(max_seq) = seqs.last() {
            conn.execute(
                "DELETE FROM queue_items WHERE tenant = ?1 AND kind = ?2 AND queue = ?3 AND seq <= ?4",
                params![tenant, kind.as_str(), queue, max_seq],
            )?;
        }
        Ok(out)
    }

    fn depth(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
        queue: &str,
    ) -> Result<usize, BrokerError> {
        ctx.check()?;
        check_key_parts(tenant, queue)?;
        let conn = self.lock();
        let depth: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queue_items WHERE tenant = ?1 AND kind = ?2 AND queue = ?3",
            params![tenant, kind.as_str(), queue],
            |r| r.get(0),
        )?;
        Ok(depth as usize)
    }

    fn peek(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
        queue: &str,
    ) -> Result<Vec<Value>, BrokerError> {
        ctx.check()?;
        check_key_parts(tenant, queue)?;
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT value FROM queue_items WHERE tenant = ?1 AND kind = ?2 AND queue = ?3 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![tenant, kind.as_str(), queue], |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    fn list_queues(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
    ) -> Result<Vec<String>, BrokerError> {
        ctx.check()?;
        check_key_parts(tenant, "_list")?;
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT queue FROM queue_items WHERE tenant = ?1 AND kind = ?2 ORDER BY queue",
        )?;
        let rows = stmt.query_map(params![tenant, kind.as_str()], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn drop_queue(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
        queue: &str,
    ) -> Result<Vec<Value>, BrokerError> {
        let drained = self.peek(ctx, tenant, kind, queue)?;
        let conn = self.lock();
        conn.execute(
            "DELETE FROM queue_items WHERE tenant = ?1 AND kind = ?2 AND queue = ?3",
            params![tenant, kind.as_str(), queue],
        )?;
        Ok(drained)
    }

    fn scan_kind(
        &self,
        ctx: &OpContext,
        kind: StoreKind,
    ) -> Result<Vec<(String, String, Value)>, BrokerError> {
        ctx.check()?;
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT tenant, id, value FROM records WHERE kind = ?1 ORDER BY tenant, id",
        )?;
        let rows = stmt.query_map(params![kind.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (tenant, id, value) = row?;
            out.push((tenant, id, serde_json::from_str(&value)?));
        }
        Ok(out)
    }
}
