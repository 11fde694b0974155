// Route module decomposition — each tool-surface area in its own file.
// Shared request guards and error mapping live here; route functions in
// submodules.

mod broadcast;
mod messages;
mod negotiate;
mod projects;
mod protocols;
mod sessions;
mod stream;
mod system;

// --- Re-exports (all route functions used by lib.rs mount) ---

pub use broadcast::broadcast_message;
pub use messages::{list_dead_letters, send_message};
pub use negotiate::negotiate_capabilities;
pub use projects::{
    create_project, deactivate_project, get_project_info, list_projects, rotate_project_keys,
};
pub use protocols::{
    delete_protocol, discover_protocols, get_protocol, register_protocol, share_protocol,
};
pub use sessions::{
    close_session, connect_session, drain_mailbox, list_sessions, list_sessions_admin,
    session_heartbeat,
};
pub use stream::event_stream;
pub use system::{forbidden, health, not_found, stats, too_many_requests, unauthorized};

// --- Shared request guards ---

use std::sync::Arc;
use std::time::Duration;

use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rocket::serde::json::Json;

use crate::auth::{self, ActorKind, AuthContext};
use crate::config::BrokerConfig;
use crate::context::OpContext;
use crate::error::BrokerError;
use crate::tenants::TenantRegistry;

/// Default per-request deadline for store-touching operations.
pub(crate) fn op_ctx() -> OpContext {
    OpContext::with_timeout(Duration::from_secs(5))
}

/// Map a broker error to the transport shape: status plus JSON body.
pub(crate) fn broker_err(e: BrokerError) -> (Status, Json<serde_json::Value>) {
    (Status::new(e.http_status()), Json(e.to_body()))
}

/// Caller identity resolved from the `Authorization: Bearer sk_agent_v1_…`
/// key. Without credentials the configured default tenant applies; if that
/// fallback is disabled the request is rejected.
pub struct AuthedAgent(pub AuthContext);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AuthedAgent {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let (Some(config), Some(tenants)) = (
            req.rocket().state::<BrokerConfig>(),
            req.rocket().state::<Arc<TenantRegistry>>(),
        ) else {
            return Outcome::Error((Status::InternalServerError, ()));
        };

        let bearer = req
            .headers()
            .get_one("Authorization")
            .and_then(|a| a.strip_prefix("Bearer "));

        if let Some(key) = bearer
            && key.starts_with(auth::KEY_PREFIX)
        {
            return match tenants.authenticate(&op_ctx(), key) {
                Ok(ctx) => Outcome::Success(AuthedAgent(ctx)),
                Err(_) => Outcome::Error((Status::Unauthorized, ())),
            };
        }

        if !config.default_tenant_id.is_empty() {
            return Outcome::Success(AuthedAgent(AuthContext {
                tenant_id: config.default_tenant_id.clone(),
                actor_id: "anonymous".to_string(),
                actor_kind: ActorKind::Agent,
                capabilities: Vec::new(),
            }));
        }

        Outcome::Error((Status::Unauthorized, ()))
    }
}

/// Administrator guard for project management and cross-tenant listings.
/// Accepts the configured admin key via `Authorization: Bearer` or
/// `X-Admin-Key`.
pub struct Admin;

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Admin {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let Some(config) = req.rocket().state::<BrokerConfig>() else {
            return Outcome::Error((Status::InternalServerError, ()));
        };
        let presented = req
            .headers()
            .get_one("Authorization")
            .and_then(|a| a.strip_prefix("Bearer "))
            .or_else(|| req.headers().get_one("X-Admin-Key"));
        match presented {
            Some(key) if key == config.admin_key => Outcome::Success(Admin),
            _ => Outcome::Error((Status::Unauthorized, ())),
        }
    }
}
