use std::sync::Arc;

use chrono::Utc;
use log::{debug, info};
use semver::Version;

use crate::config::BrokerConfig;
use crate::context::OpContext;
use crate::error::BrokerError;
use crate::events::{BrokerEvent, EventBus};
use crate::models::{
    BroadcastRequest, BroadcastSummary, DeadLetter, DeliveryStatus, FailedDelivery, Message,
    MessageHeaders, SendMessageRequest, SendReceipt, SessionCapabilities,
};
use crate::rate_limit::RateLimiter;
use crate::registry::ProtocolRegistry;
use crate::sessions::{EnqueueOutcome, SessionManager};
use crate::store::{Store, StoreKind};
use crate::tenants::TenantRegistry;

/// Append a message to the tenant's dead-letter queue. Dead letters are
/// never retried automatically.
pub(crate) fn dead_letter(
    ctx: &OpContext,
    store: &dyn Store,
    events: &EventBus,
    tenant: &str,
    message: Message,
    reason: &str,
) -> Result<(), BrokerError> {
    let entry = DeadLetter {
        reason: reason.to_string(),
        failed_at: Utc::now().to_rfc3339(),
        sender: message.sender_session.clone(),
        intended_recipient: message.recipient_session.clone().unwrap_or_default(),
        message,
    };
    let message_id = entry.message.message_id.clone();
    store.enqueue(ctx, tenant, StoreKind::Dlq, "dlq", &serde_json::to_value(&entry)?)?;
    events.publish(BrokerEvent::MessageDeadLettered {
        tenant_id: tenant.to_string(),
        message_id,
        reason: reason.to_string(),
    });
    Ok(())
}

/// Unicast and fan-out delivery over the session mailboxes, with bounded
/// queues, dead-lettering, per-sender rate limits and the cross-tenant
/// subroutine.
pub struct MessageRouter {
    store: Arc<dyn Store>,
    registry: Arc<ProtocolRegistry>,
    sessions: Arc<SessionManager>,
    tenants: Arc<TenantRegistry>,
    events: EventBus,
    limiter: Arc<RateLimiter>,
    config: BrokerConfig,
}

impl MessageRouter {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ProtocolRegistry>,
        sessions: Arc<SessionManager>,
        tenants: Arc<TenantRegistry>,
        events: EventBus,
        limiter: Arc<RateLimiter>,
        config: BrokerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            sessions,
            tenants,
            events,
            limiter,
            config,
        }
    }

    pub fn send(
        &self,
        ctx: &OpContext,
        tenant: &str,
        req: SendMessageRequest,
    ) -> Result<SendReceipt, BrokerError> {
        ctx.check()?;
        if self.sessions.capabilities_of(tenant, &req.sender_session).is_none() {
            return Err(BrokerError::NotFound(format!(
                "session {}",
                req.sender_session
            )));
        }

        let rl = self.limiter.check_with_info(
            &format!("send:{tenant}:{}", req.sender_session),
            self.config.rate_limit_messages,
            60,
        );
        if !rl.allowed {
            return Err(BrokerError::RateLimited {
                message: format!(
                    "max {} messages per minute per session",
                    self.config.rate_limit_messages
                ),
                retry_after_secs: rl.retry_after_secs,
            });
        }

        self.check_payload_size(&req.payload)?;

        // Same-tenant by default; an explicit foreign recipient tenant takes
        // the cross-tenant subroutine, which layers its own checks on top.
        let dest_tenant = match req.recipient_tenant.as_deref() {
            Some(dest) if dest != tenant => {
                self.authorize_cross_tenant(tenant, dest, &req.protocol_name)?;
                dest.to_string()
            }
            _ => tenant.to_string(),
        };
        let cross = dest_tenant != tenant;

        let Some((_, recipient_caps)) =
            self.sessions.capabilities_of(&dest_tenant, &req.recipient_session)
        else {
            return Err(BrokerError::NotFound(format!(
                "session {}",
                req.recipient_session
            )));
        };

        let (deliver_version, payload, original_version) = self.adapt_payload(
            tenant,
            &dest_tenant,
            &recipient_caps,
            &req.protocol_name,
            &req.protocol_version,
            req.payload,
        )?;

        self.validate_payload(ctx, tenant, &dest_tenant, &req.protocol_name, &deliver_version, &payload)?;

        let message = Message {
            message_id: uuid::Uuid::new_v4().to_string(),
            tenant_id: dest_tenant.clone(),
            sender_session: req.sender_session.clone(),
            recipient_session: Some(req.recipient_session.clone()),
            protocol_name: req.protocol_name.clone(),
            protocol_version: deliver_version,
            original_version,
            payload,
            headers: MessageHeaders {
                priority: req.priority.unwrap_or_default(),
                ttl_secs: req.ttl_secs,
                origin_tenant: cross.then(|| tenant.to_string()),
                cross_tenant: cross,
            },
            created_at: Utc::now().to_rfc3339(),
        };

        if cross {
            info!(
                "cross-tenant hop {tenant} -> {dest_tenant}: {} {} from {} to {}",
                message.protocol_name,
                message.protocol_version,
                message.sender_session,
                req.recipient_session
            );
        }

        self.deliver(ctx, &dest_tenant, &req.recipient_session, message)
    }

    /// Fan out to every compatible same-tenant session. Not atomic: partial
    /// delivery is a legitimate outcome, reported in the summary.
    pub fn broadcast(
        &self,
        ctx: &OpContext,
        tenant: &str,
        req: BroadcastRequest,
    ) -> Result<BroadcastSummary, BrokerError> {
        ctx.check()?;
        if self.sessions.capabilities_of(tenant, &req.sender_session).is_none() {
            return Err(BrokerError::NotFound(format!(
                "session {}",
                req.sender_session
            )));
        }

        let rl = self.limiter.check_with_info(
            &format!("broadcast:{tenant}:{}", req.sender_session),
            self.config.rate_limit_broadcasts,
            60,
        );
        if !rl.allowed {
            return Err(BrokerError::RateLimited {
                message: format!(
                    "max {} broadcasts per minute per session",
                    self.config.rate_limit_broadcasts
                ),
                retry_after_secs: rl.retry_after_secs,
            });
        }

        self.check_payload_size(&req.payload)?;
        self.registry.validate_payload(
            ctx,
            tenant,
            &req.protocol_name,
            &req.protocol_version,
            &req.payload,
        )?;

        let mut summary = BroadcastSummary::default();
        let listed = self.sessions.list(ctx, tenant, None, true)?;
        for session in listed {
            ctx.check()?;
            let session_id = session.session_id;
            let caps = session.capabilities.unwrap_or_default();

            let is_sender = session_id == req.sender_session;
            let matches_filter = req
                .capability_filter
                .as_ref()
                .is_none_or(|filter| {
                    filter
                        .iter()
                        .all(|(feature, wanted)| caps.features.contains(feature) == *wanted)
                });
            let supports_version = caps
                .protocols
                .get(&req.protocol_name)
                .is_some_and(|vs| vs.iter().any(|v| v == &req.protocol_version));

            if is_sender || !matches_filter || !supports_version {
                summary.skipped.push(session_id);
                continue;
            }

            // Fresh envelope per recipient: exactly one fan-out per
            // compatible session, each with its own message id.
            let message = Message {
                message_id: uuid::Uuid::new_v4().to_string(),
                tenant_id: tenant.to_string(),
                sender_session: req.sender_session.clone(),
                recipient_session: Some(session_id.clone()),
                protocol_name: req.protocol_name.clone(),
                protocol_version: req.protocol_version.clone(),
                original_version: None,
                payload: req.payload.clone(),
                headers: MessageHeaders {
                    priority: req.priority.unwrap_or_default(),
                    ttl_secs: req.ttl_secs,
                    origin_tenant: None,
                    cross_tenant: false,
                },
                created_at: Utc::now().to_rfc3339(),
            };

            match self.deliver(ctx, tenant, &session_id, message) {
                Ok(receipt) if receipt.delivered => summary.delivered.push(session_id),
                Ok(receipt) if receipt.queued => summary.queued.push(session_id),
                Ok(_) => summary.failed.push(FailedDelivery {
                    session_id,
                    error: "queue_full".to_string(),
                }),
                Err(e) => summary.failed.push(FailedDelivery {
                    session_id,
                    error: e.to_string(),
                }),
            }
        }

        summary.delivered_count = summary.delivered.len();
        debug!(
            "broadcast in {tenant}: {} delivered, {} queued, {} skipped, {} failed",
            summary.delivered_count,
            summary.queued.len(),
            summary.skipped.len(),
            summary.failed.len()
        );
        Ok(summary)
    }

    /// Mailbox handoff shared by unicast and fan-out. A full queue deposits
    /// the message in the dead-letter store instead of failing the call.
    fn deliver(
        &self,
        ctx: &OpContext,
        tenant: &str,
        recipient: &str,
        message: Message,
    ) -> Result<SendReceipt, BrokerError> {
        let capacity = self
            .tenants
            .config_of(tenant)
            .mailbox_capacity
            .unwrap_or(self.config.mailbox_capacity);

        ctx.check()?;
        let message_id = message.message_id.clone();
        let outcome = self.sessions.enqueue(ctx, tenant, recipient, &message, capacity)?;

        let mut receipt = match outcome {
            EnqueueOutcome::Delivered { depth } => {
                self.events.publish(BrokerEvent::MessageDelivered {
                    tenant_id: tenant.to_string(),
                    session_id: recipient.to_string(),
                    message: Box::new(message),
                });
                let mut r = SendReceipt::new(message_id, DeliveryStatus::Delivered);
                r.at = Some(Utc::now().to_rfc3339());
                r.depth = Some(depth);
                r
            }
            EnqueueOutcome::Queued { depth } => {
                self.events.publish(BrokerEvent::MessageQueued {
                    tenant_id: tenant.to_string(),
                    session_id: recipient.to_string(),
                    message_id: message_id.clone(),
                    depth,
                });
                let mut r = SendReceipt::new(message_id, DeliveryStatus::Queued);
                r.depth = Some(depth);
                r
            }
            EnqueueOutcome::QueueFull => {
                dead_letter(
                    ctx,
                    self.store.as_ref(),
                    &self.events,
                    tenant,
                    message,
                    "queue_full",
                )?;
                let mut r = SendReceipt::new(message_id, DeliveryStatus::QueueFull);
                r.depth = Some(capacity);
                r
            }
        };
        receipt.degraded = self.store.is_degraded();
        Ok(receipt)
    }

    /// Pick the version the recipient can take. An exact match passes the
    /// payload through; otherwise a registered adapter rewrites it once and
    /// the emitted message is stamped with both versions.
    fn adapt_payload(
        &self,
        origin_tenant: &str,
        dest_tenant: &str,
        recipient_caps: &SessionCapabilities,
        name: &str,
        version: &str,
        payload: serde_json::Value,
    ) -> Result<(String, serde_json::Value, Option<String>), BrokerError> {
        let advertised = recipient_caps.protocols.get(name).cloned().unwrap_or_default();
        if advertised.iter().any(|v| v == version) {
            return Ok((version.to_string(), payload, None));
        }

        let best: Option<Version> = advertised
            .iter()
            .filter_map(|v| Version::parse(v).ok())
            .max();
        let Some(target) = best else {
            return Err(BrokerError::ProtocolIncompatible(format!(
                "recipient does not support protocol {name}"
            )));
        };
        let target = target.to_string();

        let adapter = self
            .registry
            .find_adapter(dest_tenant, name, version, &target)
            .or_else(|| {
                (origin_tenant != dest_tenant)
                    .then(|| self.registry.find_adapter(origin_tenant, name, version, &target))
                    .flatten()
            });
        let Some(adapter) = adapter else {
            return Err(BrokerError::ProtocolIncompatible(format!(
                "recipient supports {name} {target} but no adapter exists from {version}"
            )));
        };

        let transformed = adapter(&payload)
            .map_err(|e| BrokerError::ProtocolIncompatible(format!("adapter failed: {e}")))?;
        debug!("adapted {name} payload {version} -> {target}");
        Ok((target, transformed, Some(version.to_string())))
    }

    fn validate_payload(
        &self,
        ctx: &OpContext,
        origin_tenant: &str,
        dest_tenant: &str,
        name: &str,
        version: &str,
        payload: &serde_json::Value,
    ) -> Result<(), BrokerError> {
        match self
            .registry
            .validate_payload(ctx, dest_tenant, name, version, payload)
        {
            Err(BrokerError::NotFound(_)) if origin_tenant != dest_tenant => self
                .registry
                .validate_payload(ctx, origin_tenant, name, version, payload),
            other => other,
        }
    }

    fn check_payload_size(&self, payload: &serde_json::Value) -> Result<(), BrokerError> {
        let size = payload.to_string().len();
        if size > self.config.max_payload_bytes {
            return Err(BrokerError::Validation(format!(
                "payload of {size} bytes exceeds the {} byte limit",
                self.config.max_payload_bytes
            )));
        }
        Ok(())
    }

    /// Default is refusal: the hop is allowed only when both tenants have
    /// listed each other, the protocol is whitelisted on both sides, and the
    /// origin's rate budget is non-zero.
    fn authorize_cross_tenant(
        &self,
        origin: &str,
        dest: &str,
        protocol: &str,
    ) -> Result<(), BrokerError> {
        if !self.config.enable_cross_tenant {
            return Err(BrokerError::IsolationViolation(
                "cross-tenant routing is disabled".to_string(),
            ));
        }
        let outbound = self.tenants.cross_tenant_rule(origin, dest);
        let inbound = self.tenants.cross_tenant_rule(dest, origin);
        let (Some(outbound), Some(inbound)) = (outbound, inbound) else {
            return Err(BrokerError::IsolationViolation(format!(
                "no mutual cross-tenant rule between {origin} and {dest}"
            )));
        };
        // An empty whitelist allows every protocol the pair shares.
        let allows = |rule: &crate::models::CrossTenantRule| {
            rule.protocols.is_empty() || rule.protocols.iter().any(|p| p == protocol)
        };
        if !allows(&outbound) || !allows(&inbound) {
            return Err(BrokerError::IsolationViolation(format!(
                "protocol {protocol} is not whitelisted between {origin} and {dest}"
            )));
        }
        if outbound.rate_per_minute == 0 {
            return Err(BrokerError::IsolationViolation(format!(
                "cross-tenant rate budget from {origin} to {dest} is zero"
            )));
        }
        let rl = self.limiter.check_with_info(
            &format!("xt:{origin}->{dest}"),
            outbound.rate_per_minute,
            60,
        );
        if !rl.allowed {
            return Err(BrokerError::RateLimited {
                message: format!(
                    "cross-tenant budget of {} per minute to {dest} exhausted",
                    outbound.rate_per_minute
                ),
                retry_after_secs: rl.retry_after_secs,
            });
        }
        Ok(())
    }
}
