use crate::common::*;
use rocket::http::{ContentType, Status};

fn broadcast(
    client: &rocket::local::blocking::Client,
    sender: &str,
    filter: serde_json::Value,
) -> serde_json::Value {
    let mut body = serde_json::json!({
        "sender_session": sender,
        "protocol_name": "chat_message",
        "protocol_version": "1.0.0",
        "payload": {"text": "fan out"}
    });
    if !filter.is_null() {
        body["capability_filter"] = filter;
    }
    let res = client
        .post("/api/v1/broadcast")
        .header(ContentType::JSON)
        .body(body.to_string())
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    res.into_json().unwrap()
}

#[test]
fn test_broadcast_reaches_compatible_sessions() {
    let client = test_client();
    register_chat_protocol(&client, None, "1.0.0");
    connect_session(&client, None, Some("a"), chat_caps(&["1.0.0"]));
    connect_session(&client, None, Some("b"), chat_caps(&["1.0.0"]));
    connect_session(&client, None, Some("c"), chat_caps(&["1.0.0"]));

    let summary = broadcast(&client, "a", serde_json::json!(null));
    assert_eq!(summary["delivered_count"], 2);
    let delivered: Vec<&str> = summary["delivered"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert!(delivered.contains(&"b"));
    assert!(delivered.contains(&"c"));
    // The sender never receives its own broadcast.
    assert!(!delivered.contains(&"a"));

    // Each recipient got its own envelope with a distinct message id.
    let mut ids = Vec::new();
    for sid in ["b", "c"] {
        let res = client
            .post(format!("/api/v1/sessions/{sid}/drain"))
            .header(ContentType::JSON)
            .body(serde_json::json!({}).to_string())
            .dispatch();
        let body: serde_json::Value = res.into_json().unwrap();
        assert_eq!(body["count"], 1);
        ids.push(body["messages"][0]["message_id"].as_str().unwrap().to_string());
    }
    assert_ne!(ids[0], ids[1]);
}

#[test]
fn test_broadcast_filter_skips_everyone() {
    // Nobody advertises encryption: all three sessions are skipped, nothing
    // fails, nothing reaches the DLQ.
    let client = test_client();
    register_chat_protocol(&client, None, "1.0.0");
    connect_session(&client, None, Some("a"), chat_caps(&["1.0.0"]));
    connect_session(&client, None, Some("b"), chat_caps(&["1.0.0"]));
    connect_session(&client, None, Some("c"), chat_caps(&["1.0.0"]));

    let summary = broadcast(&client, "a", serde_json::json!({"encryption": true}));
    assert_eq!(summary["delivered_count"], 0);
    assert_eq!(summary["delivered"], serde_json::json!([]));
    assert_eq!(summary["failed"], serde_json::json!([]));
    let skipped: Vec<&str> = summary["skipped"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert_eq!(skipped, vec!["a", "b", "c"]);

    let res = client.get("/api/v1/dlq").dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["total"], 0);
}

#[test]
fn test_broadcast_filter_selects_feature_holders() {
    let client = test_client();
    register_chat_protocol(&client, None, "1.0.0");
    connect_session(&client, None, Some("a"), chat_caps(&["1.0.0"]));
    connect_session(
        &client,
        None,
        Some("secure"),
        serde_json::json!({
            "protocols": {"chat_message": ["1.0.0"]},
            "features": ["point_to_point", "encryption"]
        }),
    );
    connect_session(&client, None, Some("plain"), chat_caps(&["1.0.0"]));

    let summary = broadcast(&client, "a", serde_json::json!({"encryption": true}));
    assert_eq!(summary["delivered"], serde_json::json!(["secure"]));
    let skipped = summary["skipped"].as_array().unwrap();
    assert_eq!(skipped.len(), 2);
}

#[test]
fn test_broadcast_skips_sessions_without_version() {
    let client = test_client();
    register_chat_protocol(&client, None, "1.0.0");
    connect_session(&client, None, Some("a"), chat_caps(&["1.0.0"]));
    connect_session(&client, None, Some("old"), chat_caps(&["0.9.0"]));
    connect_session(&client, None, Some("current"), chat_caps(&["1.0.0"]));

    let summary = broadcast(&client, "a", serde_json::json!(null));
    assert_eq!(summary["delivered"], serde_json::json!(["current"]));
    let skipped: Vec<&str> = summary["skipped"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert!(skipped.contains(&"old"));
}

#[test]
fn test_broadcast_partial_failure_on_full_mailbox() {
    let client = test_client_with(|c| c.mailbox_capacity = 1);
    register_chat_protocol(&client, None, "1.0.0");
    connect_session(&client, None, Some("a"), chat_caps(&["1.0.0"]));
    connect_session(&client, None, Some("b"), chat_caps(&["1.0.0"]));
    connect_session(&client, None, Some("c"), chat_caps(&["1.0.0"]));

    // Pre-fill b's mailbox so the fan-out to b dead-letters.
    client
        .post("/api/v1/messages")
        .header(ContentType::JSON)
        .body(
            serde_json::json!({
                "sender_session": "c",
                "recipient_session": "b",
                "protocol_name": "chat_message",
                "protocol_version": "1.0.0",
                "payload": {"text": "filler"}
            })
            .to_string(),
        )
        .dispatch();

    let summary = broadcast(&client, "a", serde_json::json!(null));
    assert_eq!(summary["delivered"], serde_json::json!(["c"]));
    assert_eq!(summary["failed"][0]["session_id"], "b");
    assert_eq!(summary["failed"][0]["error"], "queue_full");

    let res = client.get("/api/v1/dlq").dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["total"], 1);
}
