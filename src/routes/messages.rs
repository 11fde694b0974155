use std::sync::Arc;

use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, get, post};

use super::{AuthedAgent, broker_err, op_ctx};
use crate::models::*;
use crate::router::MessageRouter;
use crate::store::{Store, StoreKind};

/// Unicast send. Delivery lands in the recipient's mailbox; a full mailbox
/// deposits the message in the dead-letter store and reports `queue_full`.
#[post("/api/v1/messages", format = "json", data = "<body>")]
pub fn send_message(
    auth: AuthedAgent,
    router: &State<Arc<MessageRouter>>,
    body: Json<SendMessageRequest>,
) -> Result<Json<SendReceipt>, (Status, Json<serde_json::Value>)> {
    router
        .send(&op_ctx(), &auth.0.tenant_id, body.into_inner())
        .map(Json)
        .map_err(broker_err)
}

/// Inspect the tenant's dead-letter store (append-only, newest last).
#[get("/api/v1/dlq?<limit>")]
pub fn list_dead_letters(
    auth: AuthedAgent,
    store: &State<Arc<dyn Store>>,
    limit: Option<usize>,
) -> Result<Json<serde_json::Value>, (Status, Json<serde_json::Value>)> {
    let entries = store
        .peek(&op_ctx(), &auth.0.tenant_id, StoreKind::Dlq, "dlq")
        .map_err(broker_err)?;
    let total = entries.len();
    let limit = limit.unwrap_or(100);
    let start = total.saturating_sub(limit);
    Ok(Json(serde_json::json!({
        "total": total,
        "entries": &entries[start..],
    })))
}
