use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::context::OpContext;
use crate::error::BrokerError;
use crate::events::{BrokerEvent, EventBus};
use crate::models::{Message, Session, SessionCapabilities, SessionStatus};
use crate::router::dead_letter;
use crate::store::{Store, StoreKind};

/// Internal entry with wall-clock state (not serialized directly).
pub(crate) struct SessionEntry {
    session_id: String,
    tenant_id: String,
    connected_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
    status: SessionStatus,
    capabilities: SessionCapabilities,
    disconnected_at: Option<DateTime<Utc>>,
    /// Edge-trigger latch for the queue_near_capacity warning.
    warned: bool,
}

impl SessionEntry {
    fn to_model(&self, include_capabilities: bool, queue_depth: usize) -> Session {
        Session {
            session_id: self.session_id.clone(),
            tenant_id: self.tenant_id.clone(),
            connected_at: self.connected_at.to_rfc3339(),
            last_heartbeat: self.last_heartbeat.to_rfc3339(),
            status: self.status,
            capabilities: include_capabilities.then(|| self.capabilities.clone()),
            queue_depth,
        }
    }
}

/// Outcome of a mailbox enqueue, as reported to the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Recipient is active; the message sits in its mailbox for the next drain.
    Delivered { depth: usize },
    /// Recipient is stale or disconnected-but-retained.
    Queued { depth: usize },
    QueueFull,
}

/// Tracks connected sessions per tenant, runs the heartbeat state machine,
/// and owns the per-session mailboxes.
///
/// State machine: `active → stale` after the stale threshold without a
/// heartbeat, `stale → disconnected` after the disconnect threshold, back to
/// `active` on heartbeat receipt. `disconnected` is terminal for the
/// identity; its mailbox survives for the retention window so a reconnect
/// can inherit it, then the backlog is dead-lettered.
pub struct SessionManager {
    store: Arc<dyn Store>,
    events: EventBus,
    config: BrokerConfig,
    inner: RwLock<HashMap<String, HashMap<String, Arc<Mutex<SessionEntry>>>>>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn Store>, events: EventBus, config: BrokerConfig) -> Self {
        Self {
            store,
            events,
            config,
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn warning_threshold(&self, capacity: usize) -> usize {
        ((capacity as f64) * self.config.mailbox_warning_ratio).ceil() as usize
    }

    /// Register a session. Reusing a live id within the tenant terminates the
    /// incumbent (`session_replaced`); reusing a disconnected-but-retained id
    /// inherits its mailbox.
    pub fn connect(
        &self,
        ctx: &OpContext,
        tenant: &str,
        requested_id: Option<String>,
        capabilities: SessionCapabilities,
        max_sessions: Option<usize>,
    ) -> Result<Session, BrokerError> {
        ctx.check()?;
        let session_id = match requested_id {
            Some(id) => {
                if id.is_empty() || id.contains(':') {
                    return Err(BrokerError::Validation(format!(
                        "invalid session id {id:?}"
                    )));
                }
                id
            }
            None => uuid::Uuid::new_v4().to_string(),
        };
        for versions in capabilities.protocols.values() {
            for v in versions {
                crate::registry::parse_version(v)?;
            }
        }

        let now = Utc::now();
        let mut replaced = false;
        {
            let mut tenants = self.inner.write().unwrap_or_else(|e| e.into_inner());
            let sessions = tenants.entry(tenant.to_string()).or_default();

            let live = sessions
                .values()
                .filter(|e| {
                    let e = e.lock().unwrap_or_else(|p| p.into_inner());
                    e.status != SessionStatus::Disconnected && e.session_id != session_id
                })
                .count();
            if let Some(max) = max_sessions
                && live >= max
            {
                return Err(BrokerError::Forbidden(format!(
                    "session quota reached ({max})"
                )));
            }

            if let Some(existing) = sessions.get(&session_id) {
                let mut entry = existing.lock().unwrap_or_else(|p| p.into_inner());
                if entry.status != SessionStatus::Disconnected {
                    replaced = true;
                }
                entry.connected_at = now;
                entry.last_heartbeat = now;
                entry.status = SessionStatus::Active;
                entry.capabilities = capabilities.clone();
                entry.disconnected_at = None;
            } else {
                sessions.insert(
                    session_id.clone(),
                    Arc::new(Mutex::new(SessionEntry {
                        session_id: session_id.clone(),
                        tenant_id: tenant.to_string(),
                        connected_at: now,
                        last_heartbeat: now,
                        status: SessionStatus::Active,
                        capabilities: capabilities.clone(),
                        disconnected_at: None,
                        warned: false,
                    })),
                );
            }
        }

        if replaced {
            info!("session {session_id} in {tenant} re-registered, terminating prior holder");
            self.events.publish(BrokerEvent::SessionReplaced {
                tenant_id: tenant.to_string(),
                session_id: session_id.clone(),
            });
        }

        let session = self.snapshot(ctx, tenant, &session_id, true)?;
        self.persist(ctx, tenant, &session_id)?;
        self.events.publish(BrokerEvent::SessionConnected {
            tenant_id: tenant.to_string(),
            session_id: session_id.clone(),
        });
        Ok(session)
    }

    /// Record a heartbeat. Updates are last-writer-wins on the timestamp:
    /// an older heartbeat never rewinds `last_heartbeat`.
    pub fn heartbeat(
        &self,
        ctx: &OpContext,
        tenant: &str,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Session, BrokerError> {
        ctx.check()?;
        {
            let entry = self.entry(tenant, session_id)?;
            let mut entry = entry.lock().unwrap_or_else(|p| p.into_inner());
            if entry.status == SessionStatus::Disconnected {
                return Err(BrokerError::NotFound(format!("session {session_id}")));
            }
            if now > entry.last_heartbeat {
                entry.last_heartbeat = now;
            }
            if entry.status == SessionStatus::Stale {
                entry.status = SessionStatus::Active;
                self.events.publish(BrokerEvent::SessionStatusChanged {
                    tenant_id: tenant.to_string(),
                    session_id: session_id.to_string(),
                    status: SessionStatus::Active,
                });
            }
        }
        self.persist(ctx, tenant, session_id)?;
        self.snapshot(ctx, tenant, session_id, false)
    }

    /// Explicit close. The mailbox follows the normal retention path.
    pub fn close(
        &self,
        ctx: &OpContext,
        tenant: &str,
        session_id: &str,
    ) -> Result<(), BrokerError> {
        ctx.check()?;
        {
            let entry = self.entry(tenant, session_id)?;
            let mut entry = entry.lock().unwrap_or_else(|p| p.into_inner());
            if entry.status == SessionStatus::Disconnected {
                return Err(BrokerError::NotFound(format!("session {session_id}")));
            }
            entry.status = SessionStatus::Disconnected;
            entry.disconnected_at = Some(Utc::now());
        }
        self.persist(ctx, tenant, session_id)?;
        self.events.publish(BrokerEvent::SessionDisconnected {
            tenant_id: tenant.to_string(),
            session_id: session_id.to_string(),
            reason: "closed".to_string(),
        });
        Ok(())
    }

    /// Mailbox enqueue. The caller resolves the effective capacity (tenant
    /// override or broker default).
    pub fn enqueue(
        &self,
        ctx: &OpContext,
        tenant: &str,
        session_id: &str,
        message: &Message,
        capacity: usize,
    ) -> Result<EnqueueOutcome, BrokerError> {
        ctx.check()?;
        let entry = self.entry(tenant, session_id)?;
        let status = {
            let entry = entry.lock().unwrap_or_else(|p| p.into_inner());
            entry.status
        };

        let depth = self.store.depth(ctx, tenant, StoreKind::Mailbox, session_id)?;
        if depth >= capacity {
            return Ok(EnqueueOutcome::QueueFull);
        }
        ctx.check()?;
        let depth = self.store.enqueue(
            ctx,
            tenant,
            StoreKind::Mailbox,
            session_id,
            &serde_json::to_value(message)?,
        )?;

        let threshold = self.warning_threshold(capacity);
        {
            let mut entry = entry.lock().unwrap_or_else(|p| p.into_inner());
            if depth >= threshold && !entry.warned {
                entry.warned = true;
                warn!(
                    "mailbox for {session_id} in {tenant} near capacity ({depth}/{capacity})"
                );
                self.events.publish(BrokerEvent::QueueNearCapacity {
                    tenant_id: tenant.to_string(),
                    session_id: session_id.to_string(),
                    depth,
                    capacity,
                });
            }
        }

        Ok(match status {
            SessionStatus::Active => EnqueueOutcome::Delivered { depth },
            _ => EnqueueOutcome::Queued { depth },
        })
    }

    /// Atomically remove and return up to `max` messages in FIFO order.
    /// Messages whose TTL has lapsed are dead-lettered instead of returned.
    pub fn drain(
        &self,
        ctx: &OpContext,
        tenant: &str,
        session_id: &str,
        max: usize,
        capacity: usize,
    ) -> Result<(Vec<Message>, usize), BrokerError> {
        ctx.check()?;
        let entry = self.entry(tenant, session_id)?;

        let items = self
            .store
            .dequeue_up_to(ctx, tenant, StoreKind::Mailbox, session_id, max)?;
        let now = Utc::now();
        let mut messages = Vec::with_capacity(items.len());
        for item in items {
            let message: Message = serde_json::from_value(item)?;
            if let Some(ttl) = message.headers.ttl_secs
                && let Ok(created) = DateTime::parse_from_rfc3339(&message.created_at)
                && now.signed_duration_since(created.with_timezone(&Utc))
                    >= Duration::seconds(ttl as i64)
            {
                dead_letter(
                    ctx,
                    self.store.as_ref(),
                    &self.events,
                    tenant,
                    message,
                    "ttl_expired",
                )?;
                continue;
            }
            messages.push(message);
        }

        let remaining = self.store.depth(ctx, tenant, StoreKind::Mailbox, session_id)?;
        {
            let mut entry = entry.lock().unwrap_or_else(|p| p.into_inner());
            if remaining < self.warning_threshold(capacity) {
                entry.warned = false;
            }
        }
        Ok((messages, remaining))
    }

    /// Sessions in the caller's tenant, sorted by id.
    pub fn list(
        &self,
        ctx: &OpContext,
        tenant: &str,
        status_filter: Option<SessionStatus>,
        include_capabilities: bool,
    ) -> Result<Vec<Session>, BrokerError> {
        ctx.check()?;
        let handles: Vec<Arc<Mutex<SessionEntry>>> = {
            let tenants = self.inner.read().unwrap_or_else(|e| e.into_inner());
            tenants
                .get(tenant)
                .map(|m| m.values().cloned().collect())
                .unwrap_or_default()
        };
        let mut out = Vec::new();
        for handle in handles {
            let (id, model) = {
                let entry = handle.lock().unwrap_or_else(|p| p.into_inner());
                if let Some(filter) = status_filter
                    && entry.status != filter
                {
                    continue;
                }
                (entry.session_id.clone(), entry.to_model(include_capabilities, 0))
            };
            let depth = self.store.depth(ctx, tenant, StoreKind::Mailbox, &id)?;
            out.push(Session {
                queue_depth: depth,
                ..model
            });
        }
        out.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(out)
    }

    /// Cross-tenant listing for administrators. Explicit and logged.
    pub fn list_all(
        &self,
        ctx: &OpContext,
        status_filter: Option<SessionStatus>,
        include_capabilities: bool,
    ) -> Result<Vec<Session>, BrokerError> {
        let tenant_ids: Vec<String> = {
            let tenants = self.inner.read().unwrap_or_else(|e| e.into_inner());
            tenants.keys().cloned().collect()
        };
        info!("administrator listing sessions across {} tenants", tenant_ids.len());
        let mut out = Vec::new();
        for tenant in tenant_ids {
            out.extend(self.list(ctx, &tenant, status_filter, include_capabilities)?);
        }
        out.sort_by(|a, b| (&a.tenant_id, &a.session_id).cmp(&(&b.tenant_id, &b.session_id)));
        Ok(out)
    }

    pub fn capabilities_of(
        &self,
        tenant: &str,
        session_id: &str,
    ) -> Option<(SessionStatus, SessionCapabilities)> {
        let tenants = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let entry = tenants.get(tenant)?.get(session_id)?;
        let entry = entry.lock().unwrap_or_else(|p| p.into_inner());
        Some((entry.status, entry.capabilities.clone()))
    }

    /// True while any non-disconnected session advertises the exact version.
    pub fn protocol_advertised(&self, tenant: &str, name: &str, version: &str) -> bool {
        let tenants = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let Some(sessions) = tenants.get(tenant) else {
            return false;
        };
        sessions.values().any(|handle| {
            let entry = handle.lock().unwrap_or_else(|p| p.into_inner());
            entry.status != SessionStatus::Disconnected
                && entry
                    .capabilities
                    .protocols
                    .get(name)
                    .is_some_and(|versions| versions.iter().any(|v| v == version))
        })
    }

    pub fn live_session_count(&self, tenant: &str) -> usize {
        let tenants = self.inner.read().unwrap_or_else(|e| e.into_inner());
        tenants
            .get(tenant)
            .map(|m| {
                m.values()
                    .filter(|h| {
                        h.lock().unwrap_or_else(|p| p.into_inner()).status
                            != SessionStatus::Disconnected
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    /// One scheduler pass at `now`: stale/disconnect transitions and retained-
    /// mailbox expiry. Exactly at a threshold counts as crossed.
    pub fn tick(&self, ctx: &OpContext, now: DateTime<Utc>) -> Result<(), BrokerError> {
        let stale_after = Duration::seconds(self.config.stale_threshold_secs);
        let disconnect_after = Duration::seconds(self.config.disconnect_threshold_secs);
        let retention = Duration::seconds(self.config.mailbox_retention_secs);

        // Per-session locks only; the map's write lock is taken just for
        // removing expired identities afterwards.
        let handles: Vec<(String, String, Arc<Mutex<SessionEntry>>)> = {
            let tenants = self.inner.read().unwrap_or_else(|e| e.into_inner());
            tenants
                .iter()
                .flat_map(|(tenant, sessions)| {
                    sessions
                        .iter()
                        .map(|(id, h)| (tenant.clone(), id.clone(), h.clone()))
                })
                .collect()
        };

        let mut changed: Vec<(String, String)> = Vec::new();
        let mut expired: Vec<(String, String)> = Vec::new();
        for (tenant, session_id, handle) in handles {
            let mut entry = handle.lock().unwrap_or_else(|p| p.into_inner());
            match entry.status {
                SessionStatus::Active => {
                    if now.signed_duration_since(entry.last_heartbeat) >= stale_after {
                        entry.status = SessionStatus::Stale;
                        debug!("session {session_id} in {tenant} is stale");
                        self.events.publish(BrokerEvent::SessionStatusChanged {
                            tenant_id: tenant.clone(),
                            session_id: session_id.clone(),
                            status: SessionStatus::Stale,
                        });
                        changed.push((tenant, session_id));
                    }
                }
                SessionStatus::Stale => {
                    if now.signed_duration_since(entry.last_heartbeat) >= disconnect_after {
                        entry.status = SessionStatus::Disconnected;
                        entry.disconnected_at = Some(now);
                        info!("session {session_id} in {tenant} disconnected (heartbeat timeout)");
                        self.events.publish(BrokerEvent::SessionDisconnected {
                            tenant_id: tenant.clone(),
                            session_id: session_id.clone(),
                            reason: "heartbeat_timeout".to_string(),
                        });
                        changed.push((tenant, session_id));
                    }
                }
                SessionStatus::Disconnected => {
                    if let Some(at) = entry.disconnected_at
                        && now.signed_duration_since(at) >= retention
                    {
                        expired.push((tenant, session_id));
                    }
                }
            }
        }

        for (tenant, session_id) in &changed {
            self.persist(ctx, tenant, session_id)?;
        }
        for (tenant, session_id) in expired {
            self.reclaim(ctx, &tenant, &session_id)?;
        }
        Ok(())
    }

    /// Drop an expired identity: backlog to the DLQ, record removed.
    fn reclaim(&self, ctx: &OpContext, tenant: &str, session_id: &str) -> Result<(), BrokerError> {
        let backlog = self
            .store
            .drop_queue(ctx, tenant, StoreKind::Mailbox, session_id)?;
        let count = backlog.len();
        for item in backlog {
            let message: Message = serde_json::from_value(item)?;
            dead_letter(ctx, self.store.as_ref(), &self.events, tenant, message, "session_expired")?;
        }
        self.store.delete(ctx, tenant, StoreKind::Session, session_id)?;
        {
            let mut tenants = self.inner.write().unwrap_or_else(|e| e.into_inner());
            if let Some(sessions) = tenants.get_mut(tenant) {
                sessions.remove(session_id);
                if sessions.is_empty() {
                    tenants.remove(tenant);
                }
            }
        }
        if count > 0 {
            info!("reclaimed session {session_id} in {tenant}, dead-lettered {count} messages");
        }
        Ok(())
    }

    fn entry(&self, tenant: &str, session_id: &str) -> Result<Arc<Mutex<SessionEntry>>, BrokerError> {
        let tenants = self.inner.read().unwrap_or_else(|e| e.into_inner());
        tenants
            .get(tenant)
            .and_then(|m| m.get(session_id))
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(format!("session {session_id}")))
    }

    fn snapshot(
        &self,
        ctx: &OpContext,
        tenant: &str,
        session_id: &str,
        include_capabilities: bool,
    ) -> Result<Session, BrokerError> {
        let entry = self.entry(tenant, session_id)?;
        let depth = self.store.depth(ctx, tenant, StoreKind::Mailbox, session_id)?;
        let entry = entry.lock().unwrap_or_else(|p| p.into_inner());
        Ok(entry.to_model(include_capabilities, depth))
    }

    fn persist(&self, ctx: &OpContext, tenant: &str, session_id: &str) -> Result<(), BrokerError> {
        let model = self.snapshot(ctx, tenant, session_id, true)?;
        self.store.put(
            ctx,
            tenant,
            StoreKind::Session,
            session_id,
            &serde_json::to_value(&model)?,
        )
    }
}
