use std::sync::Arc;

use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, post};

use super::{AuthedAgent, broker_err};
use crate::error::BrokerError;
use crate::models::*;
use crate::negotiate;
use crate::sessions::SessionManager;

/// Compute the compatibility matrix for two or more sessions in the
/// caller's tenant. With `matrix: true` the result covers every unordered
/// pair; otherwise it is the single N-way intersection.
#[post("/api/v1/negotiate", format = "json", data = "<body>")]
pub fn negotiate_capabilities(
    auth: AuthedAgent,
    sessions: &State<Arc<SessionManager>>,
    body: Json<NegotiateRequest>,
) -> Result<Json<serde_json::Value>, (Status, Json<serde_json::Value>)> {
    let tenant = &auth.0.tenant_id;
    let req = body.into_inner();
    if req.session_ids.len() < 2 {
        return Err(broker_err(BrokerError::Validation(
            "negotiation needs at least two session_ids".to_string(),
        )));
    }

    let mut participants: Vec<(String, SessionCapabilities)> = Vec::new();
    for sid in &req.session_ids {
        let Some((_, caps)) = sessions.capabilities_of(tenant, sid) else {
            return Err(broker_err(BrokerError::NotFound(format!("session {sid}"))));
        };
        participants.push((sid.clone(), caps));
    }

    if req.matrix {
        let pairs = negotiate::matrix(&participants).map_err(broker_err)?;
        return Ok(Json(serde_json::json!({ "pairs": pairs })));
    }

    let result =
        negotiate::negotiate(&participants, &req.required_protocols).map_err(broker_err)?;
    Ok(Json(serde_json::to_value(result).unwrap_or_default()))
}
