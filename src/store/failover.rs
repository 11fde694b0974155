use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{MemoryStore, SqliteStore, Store, StoreKind};
use crate::context::OpContext;
use crate::error::BrokerError;
use crate::events::{BrokerEvent, EventBus};

/// Durable store with failover. While healthy, every write lands in SQLite
/// and is mirrored in memory; if the backend starts failing, the store flips
/// to degraded mode, serves reads from the warm mirror, and buffers writes.
/// On graceful shutdown buffered writes are flushed to a JSON-lines spill
/// file, which is replayed into the backend at next start.
pub struct FailoverStore {
    durable: SqliteStore,
    mirror: MemoryStore,
    degraded: AtomicBool,
    pending: Mutex<Vec<SpillOp>>,
    spill_path: String,
    events: EventBus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum SpillOp {
    Put {
        tenant: String,
        kind: String,
        id: String,
        value: Value,
    },
    Delete {
        tenant: String,
        kind: String,
        id: String,
    },
    Enqueue {
        tenant: String,
        kind: String,
        queue: String,
        value: Value,
    },
    Dequeue {
        tenant: String,
        kind: String,
        queue: String,
        n: usize,
    },
    DropQueue {
        tenant: String,
        kind: String,
        queue: String,
    },
}

impl FailoverStore {
    pub fn new(db_path: &str, spill_path: &str, events: EventBus) -> Self {
        let durable = SqliteStore::new(db_path);
        let store = FailoverStore {
            durable,
            mirror: MemoryStore::new(),
            degraded: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            spill_path: spill_path.to_string(),
            events,
        };
        store.replay_spill();
        store.warm_mirror();
        store
    }

    /// Re-apply writes spilled by a previous degraded shutdown.
    fn replay_spill(&self) {
        let path = Path::new(&self.spill_path);
        if !path.exists() {
            return;
        }
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                error!("failed to read spill file {}: {e}", self.spill_path);
                return;
            }
        };
        let ctx = OpContext::background();
        let mut replayed = 0usize;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let op: SpillOp = match serde_json::from_str(line) {
                Ok(op) => op,
                Err(e) => {
                    warn!("skipping unreadable spill entry: {e}");
                    continue;
                }
            };
            if let Err(e) = self.apply_to_durable(&ctx, &op) {
                error!("spill replay aborted: {e}");
                return;
            }
            replayed += 1;
        }
        if std::fs::remove_file(path).is_ok() {
            info!("replayed {replayed} spilled writes from {}", self.spill_path);
            self.events.publish(BrokerEvent::StoreRecovered);
        }
    }

    fn apply_to_durable(&self, ctx: &OpContext, op: &SpillOp) -> Result<(), BrokerError> {
        match op {
            SpillOp::Put {
                tenant,
                kind,
                id,
                value,
            } => {
                let kind = parse_kind(kind)?;
                self.durable.put(ctx, tenant, kind, id, value)
            }
            SpillOp::Delete { tenant, kind, id } => {
                let kind = parse_kind(kind)?;
                self.durable.delete(ctx, tenant, kind, id).map(|_| ())
            }
            SpillOp::Enqueue {
                tenant,
                kind,
                queue,
                value,
            } => {
                let kind = parse_kind(kind)?;
                self.durable.enqueue(ctx, tenant, kind, queue, value).map(|_| ())
            }
            SpillOp::Dequeue {
                tenant,
                kind,
                queue,
                n,
            } => {
                let kind = parse_kind(kind)?;
                self.durable
                    .dequeue_up_to(ctx, tenant, kind, queue, *n)
                    .map(|_| ())
            }
            SpillOp::DropQueue {
                tenant,
                kind,
                queue,
            } => {
                let kind = parse_kind(kind)?;
                self.durable.drop_queue(ctx, tenant, kind, queue).map(|_| ())
            }
        }
    }

    fn warm_mirror(&self) {
        let ctx = OpContext::background();
        match self.durable.all_records() {
            Ok(records) => {
                for (tenant, kind, id, value) in records {
                    let _ = self.mirror.put(&ctx, &tenant, kind, &id, &value);
                }
            }
            Err(e) => warn!("mirror warm-up (records) failed: {e}"),
        }
        match self.durable.all_queue_items() {
            Ok(items) => {
                for (tenant, kind, queue, value) in items {
                    let _ = self.mirror.enqueue(&ctx, &tenant, kind, &queue, &value);
                }
            }
            Err(e) => warn!("mirror warm-up (queues) failed: {e}"),
        }
    }

    /// Only backend failures flip the store; validation, isolation and
    /// cancellation errors propagate untouched.
    fn backend_failure(e: &BrokerError) -> bool {
        matches!(e, BrokerError::Internal(_))
    }

    fn enter_degraded(&self, detail: &BrokerError) {
        if self
            .degraded
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            warn!("durable store unreachable, entering degraded mode: {detail}");
            self.events.publish(BrokerEvent::StoreDegraded {
                detail: detail.to_string(),
            });
        }
    }

    fn buffer(&self, op: SpillOp) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(op);
    }

    #[cfg(test)]
    pub(crate) fn force_degraded(&self) {
        self.enter_degraded(&BrokerError::Internal("forced by test".to_string()));
    }
}

fn parse_kind(s: &str) -> Result<StoreKind, BrokerError> {
    StoreKind::parse(s).ok_or_else(|| BrokerError::Internal(format!("unknown store kind {s:?}")))
}

impl Store for FailoverStore {
    fn get(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
        id: &str,
    ) -> Result<Option<Value>, BrokerError> {
        if self.is_degraded() {
            return self.mirror.get(ctx, tenant, kind, id);
        }
        match self.durable.get(ctx, tenant, kind, id) {
            Ok(v) => Ok(v),
            Err(e) if Self::backend_failure(&e) => {
                self.enter_degraded(&e);
                self.mirror.get(ctx, tenant, kind, id)
            }
            Err(e) => Err(e),
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
        if !self.is_degraded() {
            match self.durable.put(ctx, tenant, kind, id, value) {
                Ok(()) => {
                    self.mirror
                        .put(&OpContext::background(), tenant, kind, id, value)?;
                    return Ok(());
                }
                Err(e) if Self::backend_failure(&e) => self.enter_degraded(&e),
                Err(e) => return Err(e),
            }
        }
        self.mirror.put(ctx, tenant, kind, id, value)?;
        self.buffer(SpillOp::Put {
            tenant: tenant.to_string(),
            kind: kind.as_str().to_string(),
            id: id.to_string(),
            value: value.clone(),
        });
        Ok(())
    }

    fn delete(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
        id: &str,
    ) -> Result<bool, BrokerError> {
        if !self.is_degraded() {
            match self.durable.delete(ctx, tenant, kind, id) {
                Ok(existed) => {
                    self.mirror.delete(&OpContext::background(), tenant, kind, id)?;
                    return Ok(existed);
                }
                Err(e) if Self::backend_failure(&e) => self.enter_degraded(&e),
                Err(e) => return Err(e),
            }
        }
        let existed = self.mirror.delete(ctx, tenant, kind, id)?;
        self.buffer(SpillOp::Delete {
            tenant: tenant.to_string(),
            kind: kind.as_str().to_string(),
            id: id.to_string(),
        });
        Ok(existed)
    }

    fn list(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
    ) -> Result<Vec<(String, Value)>, BrokerError> {
        if self.is_degraded() {
            return self.mirror.list(ctx, tenant, kind);
        }
        match self.durable.list(ctx, tenant, kind) {
            Ok(v) => Ok(v),
            Err(e) if Self::backend_failure(&e) => {
                self.enter_degraded(&e);
                self.mirror.list(ctx, tenant, kind)
            }
            Err(e) => Err(e),
        }
    }

    fn enqueue(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
        queue: &str,
        value: &Value,
    ) -> Result<usize, BrokerError> {
        if !self.is_degraded() {
            match self.durable.enqueue(ctx, tenant, kind, queue, value) {
                Ok(depth) => {
                    self.mirror
                        .enqueue(&OpContext::background(), tenant, kind, queue, value)?;
                    return Ok(depth);
                }
                Err(e) if Self::backend_failure(&e) => self.enter_degraded(&e),
                Err(e) => return Err(e),
            }
        }
        let depth = self.mirror.enqueue(ctx, tenant, kind, queue, value)?;
        self.buffer(SpillOp::Enqueue {
            tenant: tenant.to_string(),
            kind: kind.as_str().to_string(),
            queue: queue.to_string(),
            value: value.clone(),
        });
        Ok(depth)
    }

    fn dequeue_up_to(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
        queue: &str,
        n: usize,
    ) -> Result<Vec<Value>, BrokerError> {
        if !self.is_degraded() {
            match self.durable.dequeue_up_to(ctx, tenant, kind, queue, n) {
                Ok(items) => {
                    self.mirror
                        .dequeue_up_to(&OpContext::background(), tenant, kind, queue, n)?;
                    return Ok(items);
                }
                Err(e) if Self::backend_failure(&e) => self.enter_degraded(&e),
                Err(e) => return Err(e),
            }
        }
        let items = self.mirror.dequeue_up_to(ctx, tenant, kind, queue, n)?;
        self.buffer(SpillOp::Dequeue {
            tenant: tenant.to_string(),
            kind: kind.as_str().to_string(),
            queue: queue.to_string(),
            n,
        });
        Ok(items)
    }

    fn depth(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
        queue: &str,
    ) -> Result<usize, BrokerError> {
        if self.is_degraded() {
            return self.mirror.depth(ctx, tenant, kind, queue);
        }
        match self.durable.depth(ctx, tenant, kind, queue) {
            Ok(d) => Ok(d),
            Err(e) if Self::backend_failure(&e) => {
                self.enter_degraded(&e);
                self.mirror.depth(ctx, tenant, kind, queue)
            }
            Err(e) => Err(e),
        }
    }

    fn peek(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
        queue: &str,
    ) -> Result<Vec<Value>, BrokerError> {
        if self.is_degraded() {
            return self.mirror.peek(ctx, tenant, kind, queue);
        }
        match self.durable.peek(ctx, tenant, kind, queue) {
            Ok(v) => Ok(v),
            Err(e) if Self::backend_failure(&e) => {
                self.enter_degraded(&e);
                self.mirror.peek(ctx, tenant, kind, queue)
            }
            Err(e) => Err(e),
        }
    }

    fn list_queues(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
    ) -> Result<Vec<String>, BrokerError> {
        if self.is_degraded() {
            return self.mirror.list_queues(ctx, tenant, kind);
        }
        match self.durable.list_queues(ctx, tenant, kind) {
            Ok(v) => Ok(v),
            Err(e) if Self::backend_failure(&e) => {
                self.enter_degraded(&e);
                self.mirror.list_queues(ctx, tenant, kind)
            }
            Err(e) => Err(e),
        }
    }

    fn drop_queue(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
        queue: &str,
    ) -> Result<Vec<Value>, BrokerError> {
        if !self.is_degraded() {
            match self.durable.drop_queue(ctx, tenant, kind, queue) {
                Ok(items) => {
                    self.mirror
                        .drop_queue(&OpContext::background(), tenant, kind, queue)?;
                    return Ok(items);
                }
                Err(e) if Self::backend_failure(&e) => self.enter_degraded(&e),
                Err(e) => return Err(e),
            }
        }
        let items = self.mirror.drop_queue(ctx, tenant, kind, queue)?;
        self.buffer(SpillOp::DropQueue {
            tenant: tenant.to_string(),
            kind: kind.as_str().to_string(),
            queue: queue.to_string(),
        });
        Ok(items)
    }

    fn scan_kind(
        &self,
        ctx: &OpContext,
        kind: StoreKind,
    ) -> Result<Vec<(String, String, Value)>, BrokerError> {
        if self.is_degraded() {
            return self.mirror.scan_kind(ctx, kind);
        }
        match self.durable.scan_kind(ctx, kind) {
            Ok(v) => Ok(v),
            Err(e) if Self::backend_failure(&e) => {
                self.enter_degraded(&e);
                self.mirror.scan_kind(ctx, kind)
            }
            Err(e) => Err(e),
        }
    }

    fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn shutdown(&self) -> Result<(), BrokerError> {
        if !self.is_degraded() {
            return Ok(());
        }
        let pending = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *pending)
        };
        if pending.is_empty() {
            return Ok(());
        }
        if let Some(parent) = Path::new(&self.spill_path).parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let mut lines = String::new();
        for op in &pending {
            lines.push_str(&serde_json::to_string(op)?);
            lines.push('\n');
        }
        std::fs::write(&self.spill_path, lines)
            .map_err(|e| BrokerError::Internal(format!("spill flush failed: {e}")))?;
        info!(
            "flushed {} buffered writes to {}",
            pending.len(),
            self.spill_path
        );
        Ok(())
    }
}
