use crate::common::*;
use rocket::http::{ContentType, Status};

fn send_text(client: &rocket::local::blocking::Client, from: &str, to: &str, text: &str) {
    let res = client
        .post("/api/v1/messages")
        .header(ContentType::JSON)
        .body(
            serde_json::json!({
                "sender_session": from,
                "recipient_session": to,
                "protocol_name": "chat_message",
                "protocol_version": "1.0.0",
                "payload": {"text": text}
            })
            .to_string(),
        )
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
}

#[test]
fn test_reconnect_drains_backlog_in_order() {
    // Session disconnects with five queued messages; a reconnect within the
    // retention window inherits them, oldest first, then only newer traffic.
    let client = test_client();
    register_chat_protocol(&client, None, "1.0.0");
    connect_session(&client, None, Some("sender"), chat_caps(&["1.0.0"]));
    connect_session(&client, None, Some("flaky"), chat_caps(&["1.0.0"]));
    client.delete("/api/v1/sessions/flaky").dispatch();

    for i in 0..5 {
        send_text(&client, "sender", "flaky", &format!("while away {i}"));
    }

    let sid = connect_session(&client, None, Some("flaky"), chat_caps(&["1.0.0"]));
    assert_eq!(sid, "flaky");

    let res = client
        .post("/api/v1/sessions/flaky/drain")
        .header(ContentType::JSON)
        .body(serde_json::json!({}).to_string())
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["count"], 5);
    let texts: Vec<&str> = body["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["payload"]["text"].as_str().unwrap())
        .collect();
    assert_eq!(
        texts,
        vec!["while away 0", "while away 1", "while away 2", "while away 3", "while away 4"]
    );

    // Subsequent drains only see messages sent after reconnection.
    send_text(&client, "sender", "flaky", "fresh");
    let res = client
        .post("/api/v1/sessions/flaky/drain")
        .header(ContentType::JSON)
        .body(serde_json::json!({}).to_string())
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["count"], 1);
    assert_eq!(body["messages"][0]["payload"]["text"], "fresh");
}

#[test]
fn test_queued_message_round_trips_unchanged() {
    let client = test_client();
    register_chat_protocol(&client, None, "1.0.0");
    connect_session(&client, None, Some("sender"), chat_caps(&["1.0.0"]));
    connect_session(&client, None, Some("flaky"), chat_caps(&["1.0.0"]));
    client.delete("/api/v1/sessions/flaky").dispatch();

    let payload = serde_json::json!({"text": "exact bytes please"});
    let res = client
        .post("/api/v1/messages")
        .header(ContentType::JSON)
        .body(
            serde_json::json!({
                "sender_session": "sender",
                "recipient_session": "flaky",
                "protocol_name": "chat_message",
                "protocol_version": "1.0.0",
                "payload": payload,
                "priority": "high",
                "ttl_secs": 3600
            })
            .to_string(),
        )
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    connect_session(&client, None, Some("flaky"), chat_caps(&["1.0.0"]));
    let res = client
        .post("/api/v1/sessions/flaky/drain")
        .header(ContentType::JSON)
        .body(serde_json::json!({}).to_string())
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    let msg = &body["messages"][0];
    assert_eq!(msg["payload"], payload);
    assert_eq!(msg["protocol_name"], "chat_message");
    assert_eq!(msg["protocol_version"], "1.0.0");
    assert_eq!(msg["headers"]["priority"], "high");
    assert_eq!(msg["headers"]["ttl_secs"], 3600);
}
