use crate::common::*;
use rocket::http::{ContentType, Status};

#[test]
fn test_create_project_requires_admin() {
    let client = test_client();
    let res = client
        .post("/api/v1/projects")
        .header(ContentType::JSON)
        .body(serde_json::json!({"tenant_id": "alpha"}).to_string())
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);
}

#[test]
fn test_create_project_returns_key_once() {
    let client = test_client();
    let res = client
        .post("/api/v1/projects")
        .header(ContentType::JSON)
        .header(admin_header())
        .body(serde_json::json!({"tenant_id": "alpha", "display_name": "Alpha"}).to_string())
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["tenant"]["tenant_id"], "alpha");
    assert_eq!(body["tenant"]["status"], "active");
    let key = body["api_key"].as_str().unwrap();
    assert!(key.starts_with("sk_agent_v1_alpha_"));

    // The stored record never echoes the clear text back.
    let res = client
        .get("/api/v1/projects/alpha")
        .header(admin_header())
        .dispatch();
    let info: serde_json::Value = res.into_json().unwrap();
    assert!(info.get("api_key").is_none());
}

#[test]
fn test_create_project_rejects_bad_slug() {
    let client = test_client();
    for id in ["Alpha", "1alpha", "alpha-", "a"] {
        let res = client
            .post("/api/v1/projects")
            .header(ContentType::JSON)
            .header(admin_header())
            .body(serde_json::json!({"tenant_id": id}).to_string())
            .dispatch();
        assert_eq!(res.status(), Status::BadRequest, "{id:?} should be rejected");
    }
}

#[test]
fn test_project_key_authenticates_calls() {
    let client = test_client();
    let key = create_project(&client, "alpha");
    let res = client.get("/api/v1/stats").header(bearer(&key)).dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["tenant_id"], "alpha");
}

#[test]
fn test_bogus_key_rejected() {
    let client = test_client();
    create_project(&client, "alpha");
    let res = client
        .get("/api/v1/stats")
        .header(bearer("sk_agent_v1_alpha_00000000-0000-0000-0000-000000000000_deadbeef"))
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);
}

#[test]
fn test_list_projects_hides_undiscoverable() {
    let client = test_client();
    create_project(&client, "alpha");
    create_project_with_config(&client, "shadow", serde_json::json!({"discoverable": false}));

    // Agent callers (default tenant here) only see discoverable projects.
    let res = client.get("/api/v1/projects").dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    let names: Vec<&str> = body["projects"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["tenant_id"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"alpha"));
    assert!(!names.contains(&"shadow"));

    // Administrators see everything.
    let res = client.get("/api/v1/projects").header(admin_header()).dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    let names: Vec<&str> = body["projects"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["tenant_id"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"shadow"));
}

#[test]
fn test_rotate_keys_with_grace_window() {
    let client = test_client();
    let old_key = create_project(&client, "alpha");

    let res = client
        .post("/api/v1/projects/alpha/rotate")
        .header(ContentType::JSON)
        .header(admin_header())
        .body(serde_json::json!({"grace_period_secs": 3600}).to_string())
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    let new_key = body["api_key"].as_str().unwrap();
    assert_ne!(new_key, old_key);

    // Within the grace window both keys work, with the same effect.
    for key in [old_key.as_str(), new_key] {
        let res = client.get("/api/v1/stats").header(bearer(key)).dispatch();
        assert_eq!(res.status(), Status::Ok);
        let stats: serde_json::Value = res.into_json().unwrap();
        assert_eq!(stats["tenant_id"], "alpha");
    }
}

#[test]
fn test_rotate_with_zero_grace_invalidates_old_key() {
    let client = test_client();
    let old_key = create_project(&client, "alpha");
    client
        .post("/api/v1/projects/alpha/rotate")
        .header(ContentType::JSON)
        .header(admin_header())
        .body(serde_json::json!({"grace_period_secs": 0}).to_string())
        .dispatch();
    let res = client.get("/api/v1/stats").header(bearer(&old_key)).dispatch();
    assert_eq!(res.status(), Status::Unauthorized);
}

#[test]
fn test_deactivate_refused_with_live_sessions() {
    let client = test_client();
    let key = create_project(&client, "alpha");
    connect_session(&client, Some(&key), Some("s1"), serde_json::json!({}));

    let res = client
        .post("/api/v1/projects/alpha/deactivate")
        .header(admin_header())
        .dispatch();
    assert_eq!(res.status(), Status::Conflict);

    client
        .delete("/api/v1/sessions/s1")
        .header(bearer(&key))
        .dispatch();
    let res = client
        .post("/api/v1/projects/alpha/deactivate")
        .header(admin_header())
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["status"], "inactive");

    // Keys of an inactive project stop authenticating.
    let res = client.get("/api/v1/stats").header(bearer(&key)).dispatch();
    assert_eq!(res.status(), Status::Unauthorized);
}

#[test]
fn test_project_stats_shape() {
    let client = test_client();
    let key = create_project(&client, "alpha");
    register_chat_protocol(&client, Some(&key), "1.0.0");
    connect_session(&client, Some(&key), Some("s1"), chat_caps(&["1.0.0"]));

    let res = client
        .get("/api/v1/projects/alpha")
        .header(admin_header())
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["stats"]["live_sessions"], 1);
    assert_eq!(body["stats"]["protocols"], 1);
    assert_eq!(body["stats"]["pending_messages"], 0);
}
