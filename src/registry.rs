use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::{debug, info};
use semver::{Version, VersionReq};
use serde_json::Value;

use crate::context::OpContext;
use crate::error::BrokerError;
use crate::models::{ProtocolDefinition, ProtocolInfo, RegisterProtocol, valid_slug};
use crate::schema::{self, SchemaCache};
use crate::sessions::SessionManager;
use crate::store::{Store, StoreKind};

/// Pure payload transformation between two versions of a protocol.
pub type AdapterFn = Arc<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>;

/// Validates and indexes protocol definitions per tenant. Definitions are
/// immutable after registration; the compiled schema is cached under the
/// same key and reused for every payload check.
pub struct ProtocolRegistry {
    store: Arc<dyn Store>,
    schemas: SchemaCache,
    adapters: RwLock<HashMap<AdapterKey, AdapterFn>>,
}

type AdapterKey = (String, String, String, String); // (tenant, name, from, to)

fn record_id(name: &str, version: &str) -> String {
    format!("{name}@{version}")
}

pub fn parse_version(version: &str) -> Result<Version, BrokerError> {
    Version::parse(version)
        .map_err(|e| BrokerError::Validation(format!("invalid semantic version {version:?}: {e}")))
}

pub fn parse_version_range(range: &str) -> Result<VersionReq, BrokerError> {
    VersionReq::parse(range)
        .map_err(|e| BrokerError::Validation(format!("invalid version range {range:?}: {e}")))
}

impl ProtocolRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            schemas: SchemaCache::new(),
            adapters: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(
        &self,
        ctx: &OpContext,
        tenant: &str,
        req: RegisterProtocol,
        max_protocols: Option<usize>,
    ) -> Result<ProtocolInfo, BrokerError> {
        ctx.check()?;
        if !valid_slug(&req.name) {
            return Err(BrokerError::Validation(format!(
                "protocol name {:?} must be a lowercase slug",
                req.name
            )));
        }
        parse_version(&req.version)?;
        let validator = schema::compile(&req.schema)?;

        let id = record_id(&req.name, &req.version);
        if self.store.get(ctx, tenant, StoreKind::Protocol, &id)?.is_some() {
            return Err(BrokerError::Conflict(format!(
                "protocol {} {} is already registered",
                req.name, req.version
            )));
        }
        if let Some(max) = max_protocols {
            let count = self.store.list(ctx, tenant, StoreKind::Protocol)?.len();
            if count >= max {
                return Err(BrokerError::Forbidden(format!(
                    "protocol quota reached ({max})"
                )));
            }
        }

        let definition = ProtocolDefinition {
            tenant_id: tenant.to_string(),
            name: req.name.clone(),
            version: req.version.clone(),
            schema: req.schema,
            capabilities: req.capabilities,
            metadata: req.metadata.unwrap_or_default(),
            shared: false,
            registered_at: chrono::Utc::now().to_rfc3339(),
        };
        // Record and compiled schema commit together; cancellation before the
        // put leaves nothing behind.
        ctx.check()?;
        self.store
            .put(ctx, tenant, StoreKind::Protocol, &id, &serde_json::to_value(&definition)?)?;
        self.schemas.insert(tenant, &req.name, &req.version, validator);
        info!("registered protocol {}@{} in {tenant}", req.name, req.version);
        Ok(definition.info(tenant))
    }

    /// Range/tag queries over owned (and optionally shared) protocols.
    /// Output is deterministic: name ascending, version descending.
    pub fn discover(
        &self,
        ctx: &OpContext,
        tenant: &str,
        name: Option<&str>,
        version_range: Option<&str>,
        tags: &[String],
        include_shared: bool,
    ) -> Result<Vec<ProtocolInfo>, BrokerError> {
        ctx.check()?;
        let range = version_range.map(parse_version_range).transpose()?;

        let mut definitions: Vec<ProtocolDefinition> = Vec::new();
        for (_, value) in self.store.list(ctx, tenant, StoreKind::Protocol)? {
            definitions.push(serde_json::from_value(value)?);
        }
        if include_shared {
            for (owner, _, value) in self.store.scan_kind(ctx, StoreKind::Protocol)? {
                if owner == tenant {
                    continue;
                }
                let def: ProtocolDefinition = serde_json::from_value(value)?;
                if def.shared {
                    definitions.push(def);
                }
            }
        }

        let mut matches: Vec<(String, Version, ProtocolInfo)> = Vec::new();
        for def in definitions {
            if let Some(n) = name
                && def.name != n
            {
                continue;
            }
            let version = parse_version(&def.version)?;
            if let Some(ref req) = range
                && !req.matches(&version)
            {
                continue;
            }
            if !tags.iter().all(|t| def.metadata.tags.contains(t)) {
                continue;
            }
            matches.push((def.name.clone(), version, def.info(tenant)));
        }

        matches.sort_by(|a, b| {
            (&a.0, Reverse(&a.1), &a.2.origin_tenant).cmp(&(&b.0, Reverse(&b.1), &b.2.origin_tenant))
        });
        Ok(matches.into_iter().map(|(_, _, info)| info).collect())
    }

    /// Owned definition, or a shared one from its origin tenant.
    pub fn get(
        &self,
        ctx: &OpContext,
        tenant: &str,
        name: &str,
        version: &str,
    ) -> Result<Option<ProtocolDefinition>, BrokerError> {
        ctx.check()?;
        let id = record_id(name, version);
        if let Some(value) = self.store.get(ctx, tenant, StoreKind::Protocol, &id)? {
            return Ok(Some(serde_json::from_value(value)?));
        }
        for (owner, rec_id, value) in self.store.scan_kind(ctx, StoreKind::Protocol)? {
            if owner != tenant && rec_id == id {
                let def: ProtocolDefinition = serde_json::from_value(value)?;
                if def.shared {
                    return Ok(Some(def));
                }
            }
        }
        Ok(None)
    }

    /// Toggle the cross-tenant sharing opt-in. Owner only; the definition
    /// itself stays immutable.
    pub fn share(
        &self,
        ctx: &OpContext,
        tenant: &str,
        name: &str,
        version: &str,
        shared: bool,
    ) -> Result<ProtocolInfo, BrokerError> {
        ctx.check()?;
        let id = record_id(name, version);
        let Some(value) = self.store.get(ctx, tenant, StoreKind::Protocol, &id)? else {
            if self.get(ctx, tenant, name, version)?.is_some() {
                return Err(BrokerError::Forbidden(format!(
                    "protocol {name} {version} is owned by another tenant"
                )));
            }
            return Err(BrokerError::NotFound(format!("protocol {name} {version}")));
        };
        let mut def: ProtocolDefinition = serde_json::from_value(value)?;
        def.shared = shared;
        self.store
            .put(ctx, tenant, StoreKind::Protocol, &id, &serde_json::to_value(&def)?)?;
        debug!("protocol {name}@{version} in {tenant} shared={shared}");
        Ok(def.info(tenant))
    }

    /// Delete an owned version. Refused while an active session advertises it
    /// or an undelivered message pins it.
    pub fn delete(
        &self,
        ctx: &OpContext,
        tenant: &str,
        name: &str,
        version: &str,
        sessions: &SessionManager,
    ) -> Result<(), BrokerError> {
        ctx.check()?;
        let id = record_id(name, version);
        if self.store.get(ctx, tenant, StoreKind::Protocol, &id)?.is_none() {
            if self.get(ctx, tenant, name, version)?.is_some() {
                return Err(BrokerError::Forbidden(format!(
                    "protocol {name} {version} is owned by another tenant"
                )));
            }
            return Err(BrokerError::NotFound(format!("protocol {name} {version}")));
        }

        if sessions.protocol_advertised(tenant, name, version) {
            return Err(BrokerError::Conflict(format!(
                "protocol {name} {version} has active references: advertised by a live session"
            )));
        }
        for queue in self.store.list_queues(ctx, tenant, StoreKind::Mailbox)? {
            for item in self.store.peek(ctx, tenant, StoreKind::Mailbox, &queue)? {
                let pinned_name = item.get("protocol_name").and_then(Value::as_str);
                let pinned_version = item.get("protocol_version").and_then(Value::as_str);
                if pinned_name == Some(name) && pinned_version == Some(version) {
                    return Err(BrokerError::Conflict(format!(
                        "protocol {name} {version} has active references: pinned by an undelivered message"
                    )));
                }
            }
        }

        self.store.delete(ctx, tenant, StoreKind::Protocol, &id)?;
        self.schemas.remove(tenant, name, version);
        info!("deleted protocol {name}@{version} from {tenant}");
        Ok(())
    }

    /// Validate a payload against the (possibly shared) protocol schema,
    /// using the compiled form cached under the owner's key.
    pub fn validate_payload(
        &self,
        ctx: &OpContext,
        tenant: &str,
        name: &str,
        version: &str,
        payload: &Value,
    ) -> Result<(), BrokerError> {
        let Some(def) = self.get(ctx, tenant, name, version)? else {
            return Err(BrokerError::NotFound(format!("protocol {name} {version}")));
        };
        let validator =
            self.schemas
                .get_or_compile(&def.tenant_id, name, version, &def.schema)?;
        schema::validate_payload(&validator, payload)
    }

    pub fn register_adapter(
        &self,
        tenant: &str,
        name: &str,
        from_version: &str,
        to_version: &str,
        adapter: AdapterFn,
    ) {
        self.adapters.write().unwrap_or_else(|e| e.into_inner()).insert(
            (
                tenant.to_string(),
                name.to_string(),
                from_version.to_string(),
                to_version.to_string(),
            ),
            adapter,
        );
    }

    pub fn find_adapter(
        &self,
        tenant: &str,
        name: &str,
        from_version: &str,
        to_version: &str,
    ) -> Option<AdapterFn> {
        self.adapters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(
                tenant.to_string(),
                name.to_string(),
                from_version.to_string(),
                to_version.to_string(),
            ))
            .cloned()
    }
}
