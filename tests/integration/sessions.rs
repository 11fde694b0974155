use crate::common::*;
use rocket::http::{ContentType, Status};

#[test]
fn test_connect_assigns_uuid_when_absent() {
    let client = test_client();
    let res = client
        .post("/api/v1/sessions")
        .header(ContentType::JSON)
        .body(serde_json::json!({}).to_string())
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    let sid = body["session_id"].as_str().unwrap();
    assert!(uuid::Uuid::parse_str(sid).is_ok());
    assert_eq!(body["status"], "active");
    assert_eq!(body["queue_depth"], 0);
    assert_eq!(body["tenant_id"], "default");
}

#[test]
fn test_connect_with_explicit_id_and_capabilities() {
    let client = test_client();
    let sid = connect_session(&client, None, Some("worker-1"), chat_caps(&["1.0.0", "1.1.0"]));
    assert_eq!(sid, "worker-1");

    let res = client
        .get("/api/v1/sessions?include_capabilities=true")
        .dispatch();
    let body: Vec<serde_json::Value> = res.into_json().unwrap();
    assert_eq!(body.len(), 1);
    assert_eq!(
        body[0]["capabilities"]["protocols"]["chat_message"],
        serde_json::json!(["1.0.0", "1.1.0"])
    );
}

#[test]
fn test_connect_rejects_bad_capability_version() {
    let client = test_client();
    let res = client
        .post("/api/v1/sessions")
        .header(ContentType::JSON)
        .body(
            serde_json::json!({
                "session_id": "s1",
                "capabilities": {"protocols": {"chat_message": ["one"]}}
            })
            .to_string(),
        )
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}

#[test]
fn test_heartbeat_updates_timestamp() {
    let client = test_client();
    connect_session(&client, None, Some("s1"), serde_json::json!({}));
    let res = client.post("/api/v1/sessions/s1/heartbeat").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["status"], "active");
    assert!(body["last_heartbeat"].as_str().is_some());
}

#[test]
fn test_heartbeat_unknown_session_404() {
    let client = test_client();
    let res = client.post("/api/v1/sessions/ghost/heartbeat").dispatch();
    assert_eq!(res.status(), Status::NotFound);
}

#[test]
fn test_close_is_terminal() {
    let client = test_client();
    connect_session(&client, None, Some("s1"), serde_json::json!({}));
    let res = client.delete("/api/v1/sessions/s1").dispatch();
    assert_eq!(res.status(), Status::Ok);

    // Heartbeats on a disconnected identity fail; the listing shows it
    // disconnected until the retention sweep reclaims it.
    let res = client.post("/api/v1/sessions/s1/heartbeat").dispatch();
    assert_eq!(res.status(), Status::NotFound);
    let res = client.get("/api/v1/sessions?status=disconnected").dispatch();
    let body: Vec<serde_json::Value> = res.into_json().unwrap();
    assert_eq!(body.len(), 1);
}

#[test]
fn test_list_status_filter_rejects_garbage() {
    let client = test_client();
    let res = client.get("/api/v1/sessions?status=zombie").dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}

#[test]
fn test_replacement_same_id_terminates_prior() {
    let client = test_client();
    connect_session(&client, None, Some("s1"), chat_caps(&["1.0.0"]));
    // Same id, new capability set: the newcomer wins.
    connect_session(&client, None, Some("s1"), chat_caps(&["2.0.0"]));

    let res = client
        .get("/api/v1/sessions?include_capabilities=true")
        .dispatch();
    let body: Vec<serde_json::Value> = res.into_json().unwrap();
    assert_eq!(body.len(), 1);
    assert_eq!(body[0]["status"], "active");
    assert_eq!(
        body[0]["capabilities"]["protocols"]["chat_message"],
        serde_json::json!(["2.0.0"])
    );
}

#[test]
fn test_session_quota() {
    let client = test_client();
    let key = create_project_with_config(
        &client,
        "alpha",
        serde_json::json!({"max_sessions": 1}),
    );
    connect_session(&client, Some(&key), Some("s1"), serde_json::json!({}));
    let res = client
        .post("/api/v1/sessions")
        .header(ContentType::JSON)
        .header(bearer(&key))
        .body(serde_json::json!({"session_id": "s2"}).to_string())
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
}

#[test]
fn test_admin_listing_requires_admin_key() {
    let client = test_client();
    connect_session(&client, None, Some("s1"), serde_json::json!({}));
    let res = client.get("/api/v1/admin/sessions").dispatch();
    assert_eq!(res.status(), Status::Unauthorized);

    let res = client
        .get("/api/v1/admin/sessions")
        .header(admin_header())
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: Vec<serde_json::Value> = res.into_json().unwrap();
    assert_eq!(body.len(), 1);
}
