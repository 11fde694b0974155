use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{State, get};

use super::{AuthedAgent, broker_err, op_ctx};
use crate::models::SessionStatus;
use crate::sessions::SessionManager;
use crate::store::{Store, StoreKind};

#[get("/api/v1/health")]
pub fn health(store: &State<Arc<dyn Store>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": if store.is_degraded() { "degraded" } else { "ok" },
        "service": "agent-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "store_degraded": store.is_degraded(),
    }))
}

/// Tenant-scoped statistics. Counts never cross the caller's namespace.
#[get("/api/v1/stats")]
pub fn stats(
    auth: AuthedAgent,
    sessions: &State<Arc<SessionManager>>,
    store: &State<Arc<dyn Store>>,
) -> Result<Json<serde_json::Value>, (rocket::http::Status, Json<serde_json::Value>)> {
    let tenant = &auth.0.tenant_id;
    let ctx = op_ctx();

    let listed = sessions.list(&ctx, tenant, None, false).map_err(broker_err)?;
    let active = listed
        .iter()
        .filter(|s| s.status == SessionStatus::Active)
        .count();
    let stale = listed
        .iter()
        .filter(|s| s.status == SessionStatus::Stale)
        .count();
    let disconnected = listed
        .iter()
        .filter(|s| s.status == SessionStatus::Disconnected)
        .count();
    let queued: usize = listed.iter().map(|s| s.queue_depth).sum();

    let protocol_count = store
        .list(&ctx, tenant, StoreKind::Protocol)
        .map_err(broker_err)?
        .len();
    let dlq_depth = store
        .depth(&ctx, tenant, StoreKind::Dlq, "dlq")
        .map_err(broker_err)?;

    Ok(Json(serde_json::json!({
        "tenant_id": tenant,
        "sessions": {
            "total": listed.len(),
            "active": active,
            "stale": stale,
            "disconnected": disconnected,
        },
        "queued_messages": queued,
        "protocols": protocol_count,
        "dead_letters": dlq_depth,
        "store_degraded": store.is_degraded(),
    })))
}

#[rocket::catch(401)]
pub fn unauthorized() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "invalid or missing credentials", "kind": "unauthorized"}))
}

#[rocket::catch(403)]
pub fn forbidden() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "insufficient permissions", "kind": "forbidden"}))
}

#[rocket::catch(404)]
pub fn not_found() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "Not found", "kind": "not_found"}))
}

#[rocket::catch(429)]
pub fn too_many_requests() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "Too many requests", "kind": "rate_limited"}))
}
