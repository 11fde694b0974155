use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;

use super::{Store, StoreKind, check_key_parts};
use crate::context::OpContext;
use crate::error::BrokerError;

/// In-memory backend: per-tenant record maps plus one lock per queue, so a
/// busy mailbox never blocks its neighbours.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, BTreeMap<(StoreKind, String), Value>>>,
    queues: RwLock<HashMap<String, Arc<Mutex<VecDeque<Value>>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue_key(tenant: &str, kind: StoreKind, queue: &str) -> Result<String, BrokerError> {
        check_key_parts(tenant, queue)?;
        Ok(format!("{tenant}:{kind}:{queue}"))
    }

    fn queue_handle(&self, key: &str) -> Arc<Mutex<VecDeque<Value>>> {
        if let Some(q) = self
            .queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
        {
            return q.clone();
        }
        self.queues
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key.to_string())
            .or_default()
            .clone()
    }
}

impl Store for MemoryStore {
    fn get(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
        id: &str,
    ) -> Result<Option<Value>, BrokerError> {
        ctx.check()?;
        check_key_parts(tenant, id)?;
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(records
            .get(tenant)
            .and_then(|m| m.get(&(kind, id.to_string())))
            .cloned())
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
        check_key_parts(tenant, id)?;
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records
            .entry(tenant.to_string())
            .or_default()
            .insert((kind, id.to_string()), value.clone());
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
        check_key_parts(tenant, id)?;
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        Ok(records
            .get_mut(tenant)
            .map(|m| m.remove(&(kind, id.to_string())).is_some())
            .unwrap_or(false))
    }

    fn list(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
    ) -> Result<Vec<(String, Value)>, BrokerError> {
        ctx.check()?;
        check_key_parts(tenant, "_list")?;
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(records
            .get(tenant)
            .map(|m| {
                m.iter()
                    .filter(|((k, _), _)| *k == kind)
                    .map(|((_, id), v)| (id.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
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
        let key = Self::queue_key(tenant, kind, queue)?;
        let handle = self.queue_handle(&key);
        let mut q = handle.lock().unwrap_or_else(|e| e.into_inner());
        q.push_back(value.clone());
        Ok(q.len())
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
        let key = Self::queue_key(tenant, kind, queue)?;
        let handle = self.queue_handle(&key);
        let mut q = handle.lock().unwrap_or_else(|e| e.into_inner());
        let take = n.min(q.len());
        Ok(q.drain(..take).collect())
    }

    fn depth(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
        queue: &str,
    ) -> Result<usize, BrokerError> {
        ctx.check()?;
        let key = Self::queue_key(tenant, kind, queue)?;
        let handle = self.queue_handle(&key);
        let q = handle.lock().unwrap_or_else(|e| e.into_inner());
        Ok(q.len())
    }

    fn peek(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
        queue: &str,
    ) -> Result<Vec<Value>, BrokerError> {
        ctx.check()?;
        let key = Self::queue_key(tenant, kind, queue)?;
        let handle = self.queue_handle(&key);
        let q = handle.lock().unwrap_or_else(|e| e.into_inner());
        Ok(q.iter().cloned().collect())
    }

    fn list_queues(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
    ) -> Result<Vec<String>, BrokerError> {
        ctx.check()?;
        check_key_parts(tenant, "_list")?;
        let prefix = format!("{tenant}:{kind}:");
        let queues = self.queues.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = queues
            .iter()
            .filter(|(k, q)| {
                k.starts_with(&prefix) && !q.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
            })
            .map(|(k, _)| k[prefix.len()..].to_string())
            .collect();
        names.sort();
        Ok(names)
    }

    fn drop_queue(
        &self,
        ctx: &OpContext,
        tenant: &str,
        kind: StoreKind,
        queue: &str,
    ) -> Result<Vec<Value>, BrokerError> {
        ctx.check()?;
        let key = Self::queue_key(tenant, kind, queue)?;
        let handle = {
            let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
            queues.remove(&key)
        };
        Ok(handle
            .map(|h| {
                let mut q = h.lock().unwrap_or_else(|e| e.into_inner());
                q.drain(..).collect()
            })
            .unwrap_or_default())
    }

    fn scan_kind(
        &self,
        ctx: &OpContext,
        kind: StoreKind,
    ) -> Result<Vec<(String, String, Value)>, BrokerError> {
        ctx.check()?;
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<(String, String, Value)> = records
            .iter()
            .flat_map(|(tenant, m)| {
                m.iter()
                    .filter(|((k, _), _)| *k == kind)
                    .map(|((_, id), v)| (tenant.clone(), id.clone(), v.clone()))
            })
            .collect();
        out.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        Ok(out)
    }
}
