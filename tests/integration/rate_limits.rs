use crate::common::*;
use rocket::http::{ContentType, Status};

#[test]
fn test_send_rate_limit_per_session() {
    let client = test_client_with(|c| c.rate_limit_messages = 3);
    register_chat_protocol(&client, None, "1.0.0");
    connect_session(&client, None, Some("a"), chat_caps(&["1.0.0"]));
    connect_session(&client, None, Some("b"), chat_caps(&["1.0.0"]));

    let send = |from: &str| {
        client
            .post("/api/v1/messages")
            .header(ContentType::JSON)
            .body(
                serde_json::json!({
                    "sender_session": from,
                    "recipient_session": "b",
                    "protocol_name": "chat_message",
                    "protocol_version": "1.0.0",
                    "payload": {"text": "spam"}
                })
                .to_string(),
            )
            .dispatch()
    };

    for _ in 0..3 {
        assert_eq!(send("a").status(), Status::Ok);
    }
    let res = send("a");
    assert_eq!(res.status(), Status::TooManyRequests);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["kind"], "rate_limited");
    assert!(body["retry_after_secs"].as_u64().unwrap() >= 1);

    // Excess requests are rejected without enqueueing anything.
    let res = client
        .post("/api/v1/sessions/b/drain")
        .header(ContentType::JSON)
        .body(serde_json::json!({}).to_string())
        .dispatch();
    let drained: serde_json::Value = res.into_json().unwrap();
    assert_eq!(drained["count"], 3);
}

#[test]
fn test_rate_limit_is_per_sender() {
    let client = test_client_with(|c| c.rate_limit_messages = 1);
    register_chat_protocol(&client, None, "1.0.0");
    connect_session(&client, None, Some("a"), chat_caps(&["1.0.0"]));
    connect_session(&client, None, Some("b"), chat_caps(&["1.0.0"]));
    connect_session(&client, None, Some("c"), chat_caps(&["1.0.0"]));

    let send = |from: &str| {
        client
            .post("/api/v1/messages")
            .header(ContentType::JSON)
            .body(
                serde_json::json!({
                    "sender_session": from,
                    "recipient_session": "c",
                    "protocol_name": "chat_message",
                    "protocol_version": "1.0.0",
                    "payload": {"text": "hi"}
                })
                .to_string(),
            )
            .dispatch()
    };

    assert_eq!(send("a").status(), Status::Ok);
    assert_eq!(send("a").status(), Status::TooManyRequests);
    // A different sender still has budget.
    assert_eq!(send("b").status(), Status::Ok);
}

#[test]
fn test_broadcast_rate_limit() {
    let client = test_client_with(|c| c.rate_limit_broadcasts = 1);
    register_chat_protocol(&client, None, "1.0.0");
    connect_session(&client, None, Some("a"), chat_caps(&["1.0.0"]));
    connect_session(&client, None, Some("b"), chat_caps(&["1.0.0"]));

    let broadcast = || {
        client
            .post("/api/v1/broadcast")
            .header(ContentType::JSON)
            .body(
                serde_json::json!({
                    "sender_session": "a",
                    "protocol_name": "chat_message",
                    "protocol_version": "1.0.0",
                    "payload": {"text": "everyone"}
                })
                .to_string(),
            )
            .dispatch()
    };

    assert_eq!(broadcast().status(), Status::Ok);
    assert_eq!(broadcast().status(), Status::TooManyRequests);
}

#[test]
fn test_cross_tenant_rate_budget() {
    let client = test_client_with(|c| c.enable_cross_tenant = true);
    let alpha_key = create_project_with_config(
        &client,
        "alpha",
        serde_json::json!({
            "cross_tenant": [{"peer": "beta", "protocols": [], "rate_per_minute": 2}]
        }),
    );
    let beta_key = create_project_with_config(
        &client,
        "beta",
        serde_json::json!({
            "cross_tenant": [{"peer": "alpha", "protocols": [], "rate_per_minute": 2}]
        }),
    );
    register_chat_protocol(&client, Some(&alpha_key), "1.0.0");
    connect_session(&client, Some(&alpha_key), Some("a"), chat_caps(&["1.0.0"]));
    connect_session(&client, Some(&beta_key), Some("b"), chat_caps(&["1.0.0"]));

    let send = || {
        client
            .post("/api/v1/messages")
            .header(ContentType::JSON)
            .header(bearer(&alpha_key))
            .body(
                serde_json::json!({
                    "sender_session": "a",
                    "recipient_session": "b",
                    "recipient_tenant": "beta",
                    "protocol_name": "chat_message",
                    "protocol_version": "1.0.0",
                    "payload": {"text": "over the fence"}
                })
                .to_string(),
            )
            .dispatch()
    };

    assert_eq!(send().status(), Status::Ok);
    assert_eq!(send().status(), Status::Ok);
    let res = send();
    assert_eq!(res.status(), Status::TooManyRequests);
    let body: serde_json::Value = res.into_json().unwrap();
    assert!(body["error"].as_str().unwrap().contains("cross-tenant"));
}
