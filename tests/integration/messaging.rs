use crate::common::*;
use rocket::http::{ContentType, Status};

fn send_chat(client: &rocket::local::blocking::Client, from: &str, to: &str, text: &str) -> (Status, serde_json::Value) {
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
    let status = res.status();
    let body: serde_json::Value = res.into_json().unwrap();
    (status, body)
}

#[test]
fn test_unicast_delivered_and_drained() {
    let client = test_client();
    register_chat_protocol(&client, None, "1.0.0");
    connect_session(&client, None, Some("a"), chat_caps(&["1.0.0"]));
    connect_session(&client, None, Some("b"), chat_caps(&["1.0.0"]));

    let (status, receipt) = send_chat(&client, "a", "b", "hi");
    assert_eq!(status, Status::Ok);
    assert_eq!(receipt["delivered"], true);
    assert_eq!(receipt["queued"], false);
    assert!(receipt["at"].as_str().is_some());
    let message_id = receipt["message_id"].as_str().unwrap();

    let res = client
        .post("/api/v1/sessions/b/drain")
        .header(ContentType::JSON)
        .body(serde_json::json!({}).to_string())
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["count"], 1);
    assert_eq!(body["remaining"], 0);
    let msg = &body["messages"][0];
    assert_eq!(msg["message_id"], message_id);
    assert_eq!(msg["sender_session"], "a");
    assert_eq!(msg["payload"]["text"], "hi");
    assert!(msg["created_at"].as_str().is_some());

    // Subsequent drains are empty.
    let res = client
        .post("/api/v1/sessions/b/drain")
        .header(ContentType::JSON)
        .body(serde_json::json!({}).to_string())
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["count"], 0);
}

#[test]
fn test_fifo_order_per_sender_recipient_pair() {
    let client = test_client();
    register_chat_protocol(&client, None, "1.0.0");
    connect_session(&client, None, Some("a"), chat_caps(&["1.0.0"]));
    connect_session(&client, None, Some("b"), chat_caps(&["1.0.0"]));

    for i in 0..5 {
        let (status, _) = send_chat(&client, "a", "b", &format!("msg {i}"));
        assert_eq!(status, Status::Ok);
    }
    let res = client
        .post("/api/v1/sessions/b/drain")
        .header(ContentType::JSON)
        .body(serde_json::json!({"max_messages": 3}).to_string())
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    let texts: Vec<&str> = body["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["payload"]["text"].as_str().unwrap())
        .collect();
    assert_eq!(texts, vec!["msg 0", "msg 1", "msg 2"]);
    assert_eq!(body["remaining"], 2);
}

#[test]
fn test_send_to_unknown_recipient_404() {
    let client = test_client();
    register_chat_protocol(&client, None, "1.0.0");
    connect_session(&client, None, Some("a"), chat_caps(&["1.0.0"]));
    let (status, body) = send_chat(&client, "a", "ghost", "hello?");
    assert_eq!(status, Status::NotFound);
    assert_eq!(body["kind"], "not_found");
}

#[test]
fn test_schema_violation_reports_pointer() {
    let client = test_client();
    register_chat_protocol(&client, None, "1.0.0");
    connect_session(&client, None, Some("a"), chat_caps(&["1.0.0"]));
    connect_session(&client, None, Some("b"), chat_caps(&["1.0.0"]));

    let res = client
        .post("/api/v1/messages")
        .header(ContentType::JSON)
        .body(
            serde_json::json!({
                "sender_session": "a",
                "recipient_session": "b",
                "protocol_name": "chat_message",
                "protocol_version": "1.0.0",
                "payload": {"text": 42}
            })
            .to_string(),
        )
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["kind"], "validation_error");
    assert!(body["error"].as_str().unwrap().contains("/text"));
}

#[test]
fn test_version_mismatch_without_adapter_incompatible() {
    let client = test_client();
    register_chat_protocol(&client, None, "1.0.0");
    register_chat_protocol(&client, None, "2.0.0");
    connect_session(&client, None, Some("a"), chat_caps(&["2.0.0"]));
    connect_session(&client, None, Some("b"), chat_caps(&["1.0.0"]));

    let res = client
        .post("/api/v1/messages")
        .header(ContentType::JSON)
        .body(
            serde_json::json!({
                "sender_session": "a",
                "recipient_session": "b",
                "protocol_name": "chat_message",
                "protocol_version": "2.0.0",
                "payload": {"text": "new hotness"}
            })
            .to_string(),
        )
        .dispatch();
    assert_eq!(res.status(), Status::Conflict);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["kind"], "protocol_incompatible");
}

#[test]
fn test_queue_full_goes_to_dlq() {
    // Small mailbox: Q−1 enqueues succeed, one more fills it, the next is
    // dead-lettered with reason queue_full.
    let client = test_client_with(|c| c.mailbox_capacity = 5);
    register_chat_protocol(&client, None, "1.0.0");
    connect_session(&client, None, Some("a"), chat_caps(&["1.0.0"]));
    connect_session(&client, None, Some("b"), chat_caps(&["1.0.0"]));

    for i in 0..5 {
        let (status, receipt) = send_chat(&client, "a", "b", &format!("fill {i}"));
        assert_eq!(status, Status::Ok);
        assert_eq!(receipt["queue_full"], false);
    }
    let (status, receipt) = send_chat(&client, "a", "b", "overflow");
    assert_eq!(status, Status::Ok);
    assert_eq!(receipt["queue_full"], true);
    assert_eq!(receipt["delivered"], false);

    let res = client.get("/api/v1/dlq").dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["total"], 1);
    let entry = &body["entries"][0];
    assert_eq!(entry["reason"], "queue_full");
    assert_eq!(entry["sender"], "a");
    assert_eq!(entry["intended_recipient"], "b");
    assert_eq!(entry["message"]["payload"]["text"], "overflow");
}

#[test]
fn test_payload_size_cap() {
    let client = test_client_with(|c| c.max_payload_bytes = 64);
    register_chat_protocol(&client, None, "1.0.0");
    connect_session(&client, None, Some("a"), chat_caps(&["1.0.0"]));
    connect_session(&client, None, Some("b"), chat_caps(&["1.0.0"]));

    let (status, body) = send_chat(&client, "a", "b", &"x".repeat(200));
    assert_eq!(status, Status::BadRequest);
    assert_eq!(body["kind"], "validation_error");
    assert!(body["error"].as_str().unwrap().contains("byte limit"));
}

#[test]
fn test_queued_for_stale_or_closed_recipient() {
    let client = test_client();
    register_chat_protocol(&client, None, "1.0.0");
    connect_session(&client, None, Some("a"), chat_caps(&["1.0.0"]));
    connect_session(&client, None, Some("b"), chat_caps(&["1.0.0"]));
    client.delete("/api/v1/sessions/b").dispatch();

    // Disconnected-but-retained: the message queues rather than delivers.
    let (status, receipt) = send_chat(&client, "a", "b", "catch up later");
    assert_eq!(status, Status::Ok);
    assert_eq!(receipt["queued"], true);
    assert_eq!(receipt["delivered"], false);
    assert_eq!(receipt["depth"], 1);
}

#[test]
fn test_sender_must_exist() {
    let client = test_client();
    register_chat_protocol(&client, None, "1.0.0");
    connect_session(&client, None, Some("b"), chat_caps(&["1.0.0"]));
    let (status, _) = send_chat(&client, "ghost", "b", "boo");
    assert_eq!(status, Status::NotFound);
}
