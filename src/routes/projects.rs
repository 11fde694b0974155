use std::sync::Arc;

use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, get, post};

use super::{Admin, AuthedAgent, broker_err, op_ctx};
use crate::models::*;
use crate::sessions::SessionManager;
use crate::store::{Store, StoreKind};
use crate::tenants::TenantRegistry;

/// Create a project. The response carries the clear-text API key exactly
/// once; only its digest is stored.
#[post("/api/v1/projects", format = "json", data = "<body>")]
pub fn create_project(
    _admin: Admin,
    tenants: &State<Arc<TenantRegistry>>,
    body: Json<CreateProject>,
) -> Result<Json<ProjectCreated>, (Status, Json<serde_json::Value>)> {
    tenants
        .create(&op_ctx(), body.into_inner())
        .map(Json)
        .map_err(broker_err)
}

/// List projects. Administrators see everything; agent callers only see
/// projects whose `discoverable` flag is set.
#[get("/api/v1/projects?<include_stats>")]
pub fn list_projects(
    admin: Option<Admin>,
    auth: Option<AuthedAgent>,
    tenants: &State<Arc<TenantRegistry>>,
    sessions: &State<Arc<SessionManager>>,
    store: &State<Arc<dyn Store>>,
    include_stats: Option<bool>,
) -> Result<Json<serde_json::Value>, (Status, Json<serde_json::Value>)> {
    let is_admin = admin.is_some();
    if !is_admin && auth.is_none() {
        return Err((
            Status::Unauthorized,
            Json(serde_json::json!({"error": "invalid or missing credentials"})),
        ));
    }

    let listed = tenants.list(is_admin);
    let mut out = Vec::with_capacity(listed.len());
    for tenant in listed {
        let mut entry = serde_json::to_value(&tenant).unwrap_or_default();
        if include_stats.unwrap_or(false) && is_admin {
            entry["stats"] = project_stats(sessions, store, &tenant.tenant_id)?;
        }
        out.push(entry);
    }
    Ok(Json(serde_json::json!({"count": out.len(), "projects": out})))
}

#[get("/api/v1/projects/<tenant_id>")]
pub fn get_project_info(
    _admin: Admin,
    tenants: &State<Arc<TenantRegistry>>,
    sessions: &State<Arc<SessionManager>>,
    store: &State<Arc<dyn Store>>,
    tenant_id: &str,
) -> Result<Json<serde_json::Value>, (Status, Json<serde_json::Value>)> {
    let Some(tenant) = tenants.get(tenant_id) else {
        return Err((
            Status::NotFound,
            Json(serde_json::json!({"error": format!("project {tenant_id} not found")})),
        ));
    };
    let mut body = serde_json::to_value(&tenant).unwrap_or_default();
    body["stats"] = project_stats(sessions, store, tenant_id)?;
    Ok(Json(body))
}

/// Issue fresh key material. The superseded keys keep authenticating until
/// the grace deadline, so clients can roll over without a gap.
#[post("/api/v1/projects/<tenant_id>/rotate", format = "json", data = "<body>")]
pub fn rotate_project_keys(
    _admin: Admin,
    tenants: &State<Arc<TenantRegistry>>,
    tenant_id: &str,
    body: Option<Json<RotateKeys>>,
) -> Result<Json<KeysRotated>, (Status, Json<serde_json::Value>)> {
    let grace = body.map(|b| b.grace_period_secs).unwrap_or(3600);
    tenants
        .rotate_keys(&op_ctx(), tenant_id, grace)
        .map(Json)
        .map_err(broker_err)
}

/// Deactivation is refused while the project still has live sessions or
/// undrained messages.
#[post("/api/v1/projects/<tenant_id>/deactivate")]
pub fn deactivate_project(
    _admin: Admin,
    tenants: &State<Arc<TenantRegistry>>,
    sessions: &State<Arc<SessionManager>>,
    store: &State<Arc<dyn Store>>,
    tenant_id: &str,
) -> Result<Json<Tenant>, (Status, Json<serde_json::Value>)> {
    let live = sessions.live_session_count(tenant_id);
    let pending = pending_messages(store, tenant_id)?;
    tenants
        .deactivate(&op_ctx(), tenant_id, live, pending)
        .map(Json)
        .map_err(broker_err)
}

fn pending_messages(
    store: &State<Arc<dyn Store>>,
    tenant_id: &str,
) -> Result<usize, (Status, Json<serde_json::Value>)> {
    let ctx = op_ctx();
    let mut pending = 0;
    for queue in store
        .list_queues(&ctx, tenant_id, StoreKind::Mailbox)
        .map_err(broker_err)?
    {
        pending += store
            .depth(&ctx, tenant_id, StoreKind::Mailbox, &queue)
            .map_err(broker_err)?;
    }
    Ok(pending)
}

fn project_stats(
    sessions: &State<Arc<SessionManager>>,
    store: &State<Arc<dyn Store>>,
    tenant_id: &str,
) -> Result<serde_json::Value, (Status, Json<serde_json::Value>)> {
    let ctx = op_ctx();
    let protocol_count = store
        .list(&ctx, tenant_id, StoreKind::Protocol)
        .map_err(broker_err)?
        .len();
    let dlq_depth = store
        .depth(&ctx, tenant_id, StoreKind::Dlq, "dlq")
        .map_err(broker_err)?;
    Ok(serde_json::json!({
        "live_sessions": sessions.live_session_count(tenant_id),
        "protocols": protocol_count,
        "pending_messages": pending_messages(store, tenant_id)?,
        "dead_letters": dlq_depth,
    }))
}
