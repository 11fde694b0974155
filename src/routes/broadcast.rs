use std::sync::Arc;

use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, post};

use super::{AuthedAgent, broker_err, op_ctx};
use crate::models::*;
use crate::router::MessageRouter;

/// Fan the payload out to every compatible session in the tenant. Sessions
/// excluded by the capability filter (or lacking the protocol version) are
/// skipped, not failed; partial delivery is a legitimate outcome.
#[post("/api/v1/broadcast", format = "json", data = "<body>")]
pub fn broadcast_message(
    auth: AuthedAgent,
    router: &State<Arc<MessageRouter>>,
    body: Json<BroadcastRequest>,
) -> Result<Json<BroadcastSummary>, (Status, Json<serde_json::Value>)> {
    router
        .broadcast(&op_ctx(), &auth.0.tenant_id, body.into_inner())
        .map(Json)
        .map_err(broker_err)
}
