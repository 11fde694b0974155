use std::sync::Arc;

use chrono::Utc;
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, delete, get, post};

use super::{Admin, AuthedAgent, broker_err, op_ctx};
use crate::config::BrokerConfig;
use crate::models::*;
use crate::sessions::SessionManager;
use crate::tenants::TenantRegistry;

fn parse_status(value: Option<&str>) -> Result<Option<SessionStatus>, (Status, Json<serde_json::Value>)> {
    match value {
        None => Ok(None),
        Some("active") => Ok(Some(SessionStatus::Active)),
        Some("stale") => Ok(Some(SessionStatus::Stale)),
        Some("disconnected") => Ok(Some(SessionStatus::Disconnected)),
        Some(other) => Err((
            Status::BadRequest,
            Json(serde_json::json!({
                "error": format!("unknown status filter {other:?}, expected active|stale|disconnected")
            })),
        )),
    }
}

/// Connect a session, advertising protocol versions and feature tags.
/// Reusing a live id terminates the prior holder; reusing a recently
/// disconnected id inherits its mailbox.
#[post("/api/v1/sessions", format = "json", data = "<body>")]
pub fn connect_session(
    auth: AuthedAgent,
    sessions: &State<Arc<SessionManager>>,
    tenants: &State<Arc<TenantRegistry>>,
    body: Json<ConnectSession>,
) -> Result<Json<Session>, (Status, Json<serde_json::Value>)> {
    let tenant = &auth.0.tenant_id;
    let max_sessions = tenants.config_of(tenant).max_sessions;
    let req = body.into_inner();
    sessions
        .connect(&op_ctx(), tenant, req.session_id, req.capabilities, max_sessions)
        .map(Json)
        .map_err(broker_err)
}

#[post("/api/v1/sessions/<session_id>/heartbeat")]
pub fn session_heartbeat(
    auth: AuthedAgent,
    sessions: &State<Arc<SessionManager>>,
    session_id: &str,
) -> Result<Json<Session>, (Status, Json<serde_json::Value>)> {
    sessions
        .heartbeat(&op_ctx(), &auth.0.tenant_id, session_id, Utc::now())
        .map(Json)
        .map_err(broker_err)
}

#[delete("/api/v1/sessions/<session_id>")]
pub fn close_session(
    auth: AuthedAgent,
    sessions: &State<Arc<SessionManager>>,
    session_id: &str,
) -> Result<Json<serde_json::Value>, (Status, Json<serde_json::Value>)> {
    sessions
        .close(&op_ctx(), &auth.0.tenant_id, session_id)
        .map(|_| Json(serde_json::json!({"closed": true, "session_id": session_id})))
        .map_err(broker_err)
}

/// Sessions in the caller's tenant only; cross-tenant listing is the
/// explicit admin variant below.
#[get("/api/v1/sessions?<status>&<include_capabilities>")]
pub fn list_sessions(
    auth: AuthedAgent,
    sessions: &State<Arc<SessionManager>>,
    status: Option<&str>,
    include_capabilities: Option<bool>,
) -> Result<Json<Vec<Session>>, (Status, Json<serde_json::Value>)> {
    let filter = parse_status(status)?;
    sessions
        .list(
            &op_ctx(),
            &auth.0.tenant_id,
            filter,
            include_capabilities.unwrap_or(false),
        )
        .map(Json)
        .map_err(broker_err)
}

#[get("/api/v1/admin/sessions?<status>&<include_capabilities>")]
pub fn list_sessions_admin(
    _admin: Admin,
    sessions: &State<Arc<SessionManager>>,
    status: Option<&str>,
    include_capabilities: Option<bool>,
) -> Result<Json<Vec<Session>>, (Status, Json<serde_json::Value>)> {
    let filter = parse_status(status)?;
    sessions
        .list_all(&op_ctx(), filter, include_capabilities.unwrap_or(false))
        .map(Json)
        .map_err(broker_err)
}

/// Pull up to `max_messages` from the session's mailbox in FIFO order.
/// After a reconnect the inherited backlog comes out before anything newer.
#[post("/api/v1/sessions/<session_id>/drain", format = "json", data = "<body>")]
pub fn drain_mailbox(
    auth: AuthedAgent,
    sessions: &State<Arc<SessionManager>>,
    tenants: &State<Arc<TenantRegistry>>,
    config: &State<BrokerConfig>,
    session_id: &str,
    body: Option<Json<DrainRequest>>,
) -> Result<Json<DrainResponse>, (Status, Json<serde_json::Value>)> {
    let tenant = &auth.0.tenant_id;
    let max = body.map(|b| b.max_messages).unwrap_or(100);
    if max == 0 {
        return Err((
            Status::BadRequest,
            Json(serde_json::json!({"error": "max_messages must be at least 1"})),
        ));
    }
    let capacity = tenants
        .config_of(tenant)
        .mailbox_capacity
        .unwrap_or(config.mailbox_capacity);
    let (messages, remaining) = sessions
        .drain(&op_ctx(), tenant, session_id, max, capacity)
        .map_err(broker_err)?;
    Ok(Json(DrainResponse {
        session_id: session_id.to_string(),
        count: messages.len(),
        messages,
        remaining,
    }))
}
