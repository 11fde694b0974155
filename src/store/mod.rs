// Storage layer decomposition — a narrow trait with an in-memory backend, a
// durable SQLite backend, and a failover wrapper that degrades to memory with
// spill-file replay. All keys are namespaced "{tenant}:{kind}:{id}".

mod failover;
mod memory;
mod sqlite;

pub use failover::FailoverStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use serde_json::Value;

use crate::context::OpContext;
use crate::error::BrokerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StoreKind {
    Tenant,
    Key,
    Protocol,
    Session,
    Message,
    Mailbox,
    Dlq,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Tenant => "tenant",
            StoreKind::Key => "key",
            StoreKind::Protocol => "protocol",
            StoreKind::Session => "session",
            StoreKind::Message => "message",
            StoreKind::Mailbox => "mailbox",
            StoreKind::Dlq => "dlq",
        }
    }

    pub fn parse(s: &str) -> Option<StoreKind> {
        match s {
            "tenant" => Some(StoreKind::Tenant),
            "key" => Some(StoreKind::Key),
            "protocol" => Some(StoreKind::Protocol),
            "session" => Some(StoreKind::Session),
            "message" => Some(StoreKind::Message),
            "mailbox" => Some(StoreKind::Mailbox),
            "dlq" => Some(StoreKind::Dlq),
            _ => None,
        }
    }
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reject tenants/ids that are empty or contain the key separator. This is
/// the isolation guard every backend routes through; a crafted id cannot
/// escape its tenant prefix.
pub(crate) fn check_key_parts(tenant: &str, id: &str) -> Result<(), BrokerError> {
    if tenant.is_empty() || tenant.contains(':') {
        return Err(BrokerError::IsolationViolation(format!(
            "invalid tenant namespace {tenant:?}"
        )));
    }
    if id.is_empty() || id.contains(':') {
        return Err(BrokerError::IsolationViolation(format!(
            "invalid record id {id:?}"
        )));
    }
    Ok(())
}

pub(crate) fn storage_key(tenant: &str, kind: StoreKind, id: &str) -> Result<String, BrokerError> {
    check_key_parts(tenant, id)?;
    Ok(format!("{tenant}:{kind}:{id}"))
}

/// Keyed CRUD plus atomic queue primitives, parameterized by
/// `(tenant, kind, id)`. Implementations enforce tenant isolation on every
/// call; `scan_kind` is the explicit system-level escape hatch used by the
/// tenant registry and shared-protocol discovery.
pub trait Store: Send + Sync {
    fn get(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
        id: &str,
    ) -> Result<Option<Value>, BrokerError>;

    fn put(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
        id: &str,
        value: &Value,
    ) -> Result<(), BrokerError>;

    fn delete(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
        id: &str,
    ) -> Result<bool, BrokerError>;

    /// All records of a kind within a tenant, sorted by id.
    fn list(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
    ) -> Result<Vec<(String, Value)>, BrokerError>;

    /// Append to a FIFO queue; returns the new depth.
    fn enqueue(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
        queue: &str,
        value: &Value,
    ) -> Result<usize, BrokerError>;

    /// Atomically remove and return up to `n` items in FIFO order.
    fn dequeue_up_to(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
        queue: &str,
        n: usize,
    ) -> Result<Vec<Value>, BrokerError>;

    fn depth(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
        queue: &str,
    ) -> Result<usize, BrokerError>;

    /// Non-destructive view of a queue in FIFO order.
    fn peek(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
        queue: &str,
    ) -> Result<Vec<Value>, BrokerError>;

    fn list_queues(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
    ) -> Result<Vec<String>, BrokerError>;

    /// Drain everything from a queue and remove it; returns the items.
    fn drop_queue(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
        queue: &str,
    ) -> Result<Vec<Value>, BrokerError>;

    /// Every record of a kind across all tenants as `(tenant, id, value)`.
    /// System components only; tenant-scoped callers use `list`.
    fn scan_kind(
        &self,
        ctx: &OpContext,
        kind: StoreKind,
    ) -> Result<Vec<(String, String, Value)>, BrokerError>;

    fn is_degraded(&self) -> bool {
        false
    }

    /// Flush whatever the backend buffers. Called once on graceful shutdown.
    fn shutdown(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}
