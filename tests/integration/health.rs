use crate::common::test_client;
use rocket::http::Status;

#[test]
fn test_health() {
    let client = test_client();
    let res = client.get("/api/v1/health").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "agent-relay");
    assert_eq!(body["store_degraded"], false);
}

#[test]
fn test_stats_starts_empty() {
    let client = test_client();
    let res = client.get("/api/v1/stats").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["tenant_id"], "default");
    assert_eq!(body["sessions"]["total"], 0);
    assert_eq!(body["protocols"], 0);
    assert_eq!(body["dead_letters"], 0);
}

#[test]
fn test_stats_counts_sessions_and_protocols() {
    let client = test_client();
    crate::common::register_chat_protocol(&client, None, "1.0.0");
    crate::common::connect_session(&client, None, Some("s1"), crate::common::chat_caps(&["1.0.0"]));
    let res = client.get("/api/v1/stats").dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["sessions"]["total"], 1);
    assert_eq!(body["sessions"]["active"], 1);
    assert_eq!(body["protocols"], 1);
}

#[test]
fn test_unknown_route_is_404() {
    let client = test_client();
    let res = client.get("/api/v1/definitely-not-a-route").dispatch();
    assert_eq!(res.status(), Status::NotFound);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["kind"], "not_found");
}
