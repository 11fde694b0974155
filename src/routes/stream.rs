use std::sync::Arc;

use rocket::response::stream::{Event, EventStream};
use rocket::{State, get};
use tokio::time::{Duration, interval};

use super::AuthedAgent;
use crate::events::{BrokerEvent, EventBus};

/// Server-side event stream for the caller's tenant: session lifecycle,
/// queue warnings, dead-letter notices, and — when `session` is given —
/// message arrivals for that session. A keepalive frame goes out every 15s.
#[get("/api/v1/events?<session>")]
pub fn event_stream(
    auth: AuthedAgent,
    events: &State<Arc<EventBus>>,
    session: Option<&str>,
) -> EventStream![] {
    let mut rx = events.subscribe();
    let tenant = auth.0.tenant_id.clone();
    let session = session.map(String::from);

    EventStream! {
        let mut heartbeat = interval(Duration::from_secs(15));

        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Ok(event) => {
                            // Tenant isolation: only the caller's tenant's
                            // events (plus broker-wide store notices).
                            match event.tenant() {
                                Some(t) if t != tenant => continue,
                                _ => {}
                            }
                            // Message payloads go only to their recipient's stream.
                            match &event {
                                BrokerEvent::MessageDelivered { session_id, .. }
                                | BrokerEvent::MessageQueued { session_id, .. } => {
                                    if session.as_deref() != Some(session_id.as_str()) {
                                        continue;
                                    }
                                }
                                _ => {}
                            }
                            yield Event::json(&event).event(event.name());
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        _ => {} // lagged
                    }
                }
                _ = heartbeat.tick() => {
                    let now = chrono::Utc::now().to_rfc3339();
                    yield Event::json(&serde_json::json!({"time": now})).event("heartbeat");
                }
            }
        }
    }
}
