use std::sync::Arc;

use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, delete, get, post};

use super::{AuthedAgent, broker_err, op_ctx};
use crate::config::BrokerConfig;
use crate::models::*;
use crate::rate_limit::RateLimiter;
use crate::registry::ProtocolRegistry;
use crate::sessions::SessionManager;
use crate::tenants::TenantRegistry;

/// Register a new protocol version. The schema is validated and compiled
/// once; the definition is immutable afterwards.
#[post("/api/v1/protocols", format = "json", data = "<body>")]
pub fn register_protocol(
    auth: AuthedAgent,
    registry: &State<Arc<ProtocolRegistry>>,
    tenants: &State<Arc<TenantRegistry>>,
    rate_limiter: &State<Arc<RateLimiter>>,
    config: &State<BrokerConfig>,
    body: Json<RegisterProtocol>,
) -> Result<Json<ProtocolInfo>, (Status, Json<serde_json::Value>)> {
    let tenant = &auth.0.tenant_id;

    let rl = rate_limiter.check_with_info(
        &format!("register_protocol:{tenant}"),
        config.rate_limit_protocols,
        3600,
    );
    if !rl.allowed {
        return Err((
            Status::TooManyRequests,
            Json(serde_json::json!({
                "error": format!("Rate limited: max {} protocol registrations per hour", config.rate_limit_protocols),
                "retry_after_secs": rl.retry_after_secs,
                "limit": rl.limit,
                "remaining": 0
            })),
        ));
    }

    let max_protocols = tenants.config_of(tenant).max_protocols;
    registry
        .register(&op_ctx(), tenant, body.into_inner(), max_protocols)
        .map(Json)
        .map_err(broker_err)
}

/// Discover protocols by name, semver range (`>=1.0.0,<2.0.0` or `=1.0.0`)
/// and tags. `include_shared` adds protocols other tenants opted in to
/// share; those entries carry their origin tenant and are read-only.
#[get("/api/v1/protocols?<name>&<version_range>&<tags>&<include_shared>")]
pub fn discover_protocols(
    auth: AuthedAgent,
    registry: &State<Arc<ProtocolRegistry>>,
    name: Option<&str>,
    version_range: Option<&str>,
    tags: Option<&str>,
    include_shared: Option<bool>,
) -> Result<Json<Vec<ProtocolInfo>>, (Status, Json<serde_json::Value>)> {
    let tags: Vec<String> = tags
        .map(|t| {
            t.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    registry
        .discover(
            &op_ctx(),
            &auth.0.tenant_id,
            name,
            version_range,
            &tags,
            include_shared.unwrap_or(false),
        )
        .map(Json)
        .map_err(broker_err)
}

#[get("/api/v1/protocols/<name>/<version>")]
pub fn get_protocol(
    auth: AuthedAgent,
    registry: &State<Arc<ProtocolRegistry>>,
    name: &str,
    version: &str,
) -> Result<Json<ProtocolDefinition>, (Status, Json<serde_json::Value>)> {
    match registry.get(&op_ctx(), &auth.0.tenant_id, name, version) {
        Ok(Some(def)) => Ok(Json(def)),
        Ok(None) => Err((
            Status::NotFound,
            Json(serde_json::json!({"error": format!("protocol {name} {version} not found")})),
        )),
        Err(e) => Err(broker_err(e)),
    }
}

/// Delete an owned version. Refused while a live session advertises it or
/// an undelivered message pins it.
#[delete("/api/v1/protocols/<name>/<version>")]
pub fn delete_protocol(
    auth: AuthedAgent,
    registry: &State<Arc<ProtocolRegistry>>,
    sessions: &State<Arc<SessionManager>>,
    name: &str,
    version: &str,
) -> Result<Json<serde_json::Value>, (Status, Json<serde_json::Value>)> {
    registry
        .delete(&op_ctx(), &auth.0.tenant_id, name, version, sessions)
        .map(|_| Json(serde_json::json!({"deleted": true, "name": name, "version": version})))
        .map_err(broker_err)
}

/// Toggle the cross-tenant sharing opt-in for an owned protocol.
#[post("/api/v1/protocols/share", format = "json", data = "<body>")]
pub fn share_protocol(
    auth: AuthedAgent,
    registry: &State<Arc<ProtocolRegistry>>,
    body: Json<ShareProtocol>,
) -> Result<Json<ProtocolInfo>, (Status, Json<serde_json::Value>)> {
    registry
        .share(
            &op_ctx(),
            &auth.0.tenant_id,
            &body.name,
            &body.version,
            body.shared,
        )
        .map(Json)
        .map_err(broker_err)
}
