use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use log::{info, warn};

use crate::auth::{self, ActorKind, AuthContext};
use crate::context::OpContext;
use crate::error::BrokerError;
use crate::models::{
    ApiKey, CreateProject, CrossTenantRule, KeyStatus, KeysRotated, ProjectCreated, Tenant,
    TenantConfig, TenantStatus, valid_slug,
};
use crate::store::{Store, StoreKind};

/// Project metadata, API-key material and cross-tenant permission rules.
/// Read-mostly: lookups go through an in-memory map kept in lockstep with
/// the store. Quota limits live here but are enforced at the component
/// boundaries that own them.
pub struct TenantRegistry {
    store: Arc<dyn Store>,
    pepper: String,
    tenants: RwLock<HashMap<String, Tenant>>,
    keys: RwLock<HashMap<String, ApiKey>>,
}

impl TenantRegistry {
    pub fn new(store: Arc<dyn Store>, pepper: &str) -> Self {
        let registry = Self {
            store,
            pepper: pepper.to_string(),
            tenants: RwLock::new(HashMap::new()),
            keys: RwLock::new(HashMap::new()),
        };
        registry.load();
        registry
    }

    fn load(&self) {
        let ctx = OpContext::background();
        match self.store.scan_kind(&ctx, StoreKind::Tenant) {
            Ok(records) => {
                let mut tenants = self.tenants.write().unwrap_or_else(|e| e.into_inner());
                for (_, id, value) in records {
                    match serde_json::from_value::<Tenant>(value) {
                        Ok(tenant) => {
                            tenants.insert(id, tenant);
                        }
                        Err(e) => warn!("skipping unreadable tenant record {id}: {e}"),
                    }
                }
            }
            Err(e) => warn!("tenant bootstrap failed: {e}"),
        }
        match self.store.scan_kind(&ctx, StoreKind::Key) {
            Ok(records) => {
                let mut keys = self.keys.write().unwrap_or_else(|e| e.into_inner());
                for (_, id, value) in records {
                    match serde_json::from_value::<ApiKey>(value) {
                        Ok(key) => {
                            keys.insert(id, key);
                        }
                        Err(e) => warn!("skipping unreadable key record {id}: {e}"),
                    }
                }
            }
            Err(e) => warn!("key bootstrap failed: {e}"),
        }
    }

    pub fn create(&self, ctx: &OpContext, req: CreateProject) -> Result<ProjectCreated, BrokerError> {
        ctx.check()?;
        if !valid_slug(&req.tenant_id) {
            return Err(BrokerError::Validation(format!(
                "tenant id {:?} must be a lowercase slug",
                req.tenant_id
            )));
        }
        {
            let tenants = self.tenants.read().unwrap_or_else(|e| e.into_inner());
            if tenants.contains_key(&req.tenant_id) {
                return Err(BrokerError::Conflict(format!(
                    "project {} already exists",
                    req.tenant_id
                )));
            }
        }

        let now = Utc::now().to_rfc3339();
        let tenant = Tenant {
            tenant_id: req.tenant_id.clone(),
            display_name: req.display_name.unwrap_or_else(|| req.tenant_id.clone()),
            description: req.description,
            status: TenantStatus::Active,
            config: req.config.unwrap_or_default(),
            created_at: now.clone(),
            last_activity: now,
        };
        self.persist_tenant(ctx, &tenant)?;

        let (clear, key_id) = self.mint_key(ctx, &tenant.tenant_id, None)?;
        info!("created project {}", tenant.tenant_id);
        Ok(ProjectCreated {
            tenant,
            api_key: clear,
            key_id,
        })
    }

    /// Idempotently provision the fallback tenant for unauthenticated
    /// deployments.
    pub fn ensure_default(&self, ctx: &OpContext, tenant_id: &str) -> Result<(), BrokerError> {
        if !valid_slug(tenant_id) {
            return Err(BrokerError::Validation(format!(
                "default tenant id {tenant_id:?} must be a lowercase slug"
            )));
        }
        {
            let tenants = self.tenants.read().unwrap_or_else(|e| e.into_inner());
            if tenants.contains_key(tenant_id) {
                return Ok(());
            }
        }
        let now = Utc::now().to_rfc3339();
        let tenant = Tenant {
            tenant_id: tenant_id.to_string(),
            display_name: tenant_id.to_string(),
            description: "Default project".to_string(),
            status: TenantStatus::Active,
            config: TenantConfig::default(),
            created_at: now.clone(),
            last_activity: now,
        };
        self.persist_tenant(ctx, &tenant)?;
        Ok(())
    }

    pub fn get(&self, tenant_id: &str) -> Option<Tenant> {
        self.tenants
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(tenant_id)
            .cloned()
    }

    /// Tenants visible to the caller. Non-admin callers only see
    /// discoverable ones.
    pub fn list(&self, include_hidden: bool) -> Vec<Tenant> {
        let tenants = self.tenants.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<Tenant> = tenants
            .values()
            .filter(|t| include_hidden || t.config.discoverable)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        out
    }

    /// Issue fresh key material. Superseded keys stay valid until
    /// `now + grace`.
    pub fn rotate_keys(
        &self,
        ctx: &OpContext,
        tenant_id: &str,
        grace_secs: i64,
    ) -> Result<KeysRotated, BrokerError> {
        ctx.check()?;
        if self.get(tenant_id).is_none() {
            return Err(BrokerError::NotFound(format!("project {tenant_id}")));
        }
        let grace_until = (Utc::now() + Duration::seconds(grace_secs.max(0))).to_rfc3339();

        let superseded: Vec<ApiKey> = {
            let mut keys = self.keys.write().unwrap_or_else(|e| e.into_inner());
            keys.values_mut()
                .filter(|k| {
                    k.tenant_id == tenant_id
                        && k.status == KeyStatus::Active
                        && k.grace_until.is_none()
                })
                .map(|k| {
                    k.grace_until = Some(grace_until.clone());
                    k.clone()
                })
                .collect()
        };
        for key in &superseded {
            self.store.put(
                ctx,
                tenant_id,
                StoreKind::Key,
                &key.key_id,
                &serde_json::to_value(key)?,
            )?;
        }

        let (clear, key_id) = self.mint_key(ctx, tenant_id, None)?;
        info!(
            "rotated keys for {tenant_id}: {} superseded, grace until {grace_until}",
            superseded.len()
        );
        Ok(KeysRotated {
            tenant_id: tenant_id.to_string(),
            api_key: clear,
            key_id,
            old_keys_valid_until: grace_until,
        })
    }

    /// Deactivation is refused while the project still has live sessions or
    /// queued messages; the caller supplies both counts.
    pub fn deactivate(
        &self,
        ctx: &OpContext,
        tenant_id: &str,
        live_sessions: usize,
        pending_messages: usize,
    ) -> Result<Tenant, BrokerError> {
        ctx.check()?;
        let mut tenant = self
            .get(tenant_id)
            .ok_or_else(|| BrokerError::NotFound(format!("project {tenant_id}")))?;
        if live_sessions > 0 {
            return Err(BrokerError::Conflict(format!(
                "project {tenant_id} still has {live_sessions} active sessions"
            )));
        }
        if pending_messages > 0 {
            return Err(BrokerError::Conflict(format!(
                "project {tenant_id} still has {pending_messages} pending messages"
            )));
        }
        tenant.status = TenantStatus::Inactive;
        self.persist_tenant(ctx, &tenant)?;
        info!("deactivated project {tenant_id}");
        Ok(tenant)
    }

    /// Resolve an auth context from a clear-text key. Failures are
    /// deliberately uniform: the caller cannot distinguish an unknown tenant
    /// from a wrong key.
    pub fn authenticate(&self, ctx: &OpContext, clear: &str) -> Result<AuthContext, BrokerError> {
        ctx.check()?;
        let parsed = auth::parse_api_key(clear).ok_or(BrokerError::Unauthorized)?;
        let now = Utc::now();

        let candidate = {
            let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
            keys.values()
                .filter(|k| k.tenant_id.starts_with(&parsed.tenant_prefix))
                .find(|k| auth::verify_key(&self.pepper, clear, &k.digest))
                .cloned()
        };
        let key = candidate.ok_or(BrokerError::Unauthorized)?;

        if key.status != KeyStatus::Active {
            return Err(BrokerError::Unauthorized);
        }
        if let Some(expiry) = parse_time(key.expires_at.as_deref())
            && now >= expiry
        {
            return Err(BrokerError::Unauthorized);
        }
        if let Some(grace) = parse_time(key.grace_until.as_deref())
            && now >= grace
        {
            return Err(BrokerError::Unauthorized);
        }
        let tenant = self.get(&key.tenant_id).ok_or(BrokerError::Unauthorized)?;
        if tenant.status != TenantStatus::Active {
            return Err(BrokerError::Unauthorized);
        }

        self.touch_activity(ctx, &key.tenant_id);
        Ok(AuthContext {
            tenant_id: key.tenant_id,
            actor_id: key.key_id,
            actor_kind: ActorKind::Agent,
            capabilities: key.capabilities,
        })
    }

    pub fn config_of(&self, tenant_id: &str) -> TenantConfig {
        self.get(tenant_id).map(|t| t.config).unwrap_or_default()
    }

    /// The rule `from` declares about `to`, if any.
    pub fn cross_tenant_rule(&self, from: &str, to: &str) -> Option<CrossTenantRule> {
        self.get(from)?
            .config
            .cross_tenant
            .into_iter()
            .find(|r| r.peer == to)
    }

    fn touch_activity(&self, ctx: &OpContext, tenant_id: &str) {
        let updated = {
            let mut tenants = self.tenants.write().unwrap_or_else(|e| e.into_inner());
            tenants.get_mut(tenant_id).map(|t| {
                t.last_activity = Utc::now().to_rfc3339();
                t.clone()
            })
        };
        if let Some(tenant) = updated {
            let _ = self.persist_tenant(ctx, &tenant);
        }
    }

    fn mint_key(
        &self,
        ctx: &OpContext,
        tenant_id: &str,
        expires_at: Option<String>,
    ) -> Result<(String, String), BrokerError> {
        let (clear, key_id) = auth::generate_api_key(tenant_id);
        let key = ApiKey {
            key_id: key_id.clone(),
            tenant_id: tenant_id.to_string(),
            digest: auth::digest_key(&self.pepper, &clear),
            capabilities: Vec::new(),
            status: KeyStatus::Active,
            expires_at,
            grace_until: None,
            created_at: Utc::now().to_rfc3339(),
        };
        self.store.put(
            ctx,
            tenant_id,
            StoreKind::Key,
            &key_id,
            &serde_json::to_value(&key)?,
        )?;
        self.keys
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key_id.clone(), key);
        Ok((clear, key_id))
    }

    fn persist_tenant(&self, ctx: &OpContext, tenant: &Tenant) -> Result<(), BrokerError> {
        self.store.put(
            ctx,
            &tenant.tenant_id,
            StoreKind::Tenant,
            &tenant.tenant_id,
            &serde_json::to_value(tenant)?,
        )?;
        self.tenants
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tenant.tenant_id.clone(), tenant.clone());
        Ok(())
    }
}

fn parse_time(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}
