use rocket::http::{ContentType, Header, Status};
use rocket::local::blocking::Client;

use agent_relay::config::BrokerConfig;

pub const ADMIN_KEY: &str = "test-admin-key";

/// Wrapper around Client that auto-deletes the temp DB on drop.
/// Uses Option<Client> so we can drop the SQLite connection before deleting
/// the file (WAL mode holds it open).
pub struct TestClient {
    client: Option<Client>,
    db_path: String,
}

impl Drop for TestClient {
    fn drop(&mut self) {
        drop(self.client.take());
        let _ = std::fs::remove_file(&self.db_path);
        let _ = std::fs::remove_file(format!("{}-wal", self.db_path));
        let _ = std::fs::remove_file(format!("{}-shm", self.db_path));
        let _ = std::fs::remove_file(format!("{}.spill.jsonl", self.db_path));
    }
}

impl std::ops::Deref for TestClient {
    type Target = Client;
    fn deref(&self) -> &Client {
        self.client.as_ref().unwrap()
    }
}

fn temp_db_path() -> String {
    format!(
        "/tmp/relay_test_{}.db",
        uuid::Uuid::new_v4().to_string().split('-').next().unwrap()
    )
}

pub fn test_config(db_path: &str) -> BrokerConfig {
    BrokerConfig {
        database_path: db_path.to_string(),
        spill_path: format!("{db_path}.spill.jsonl"),
        admin_key: ADMIN_KEY.to_string(),
        key_pepper: "test-pepper".to_string(),
        ..BrokerConfig::default()
    }
}

pub fn test_client() -> TestClient {
    test_client_with(|_| {})
}

/// Test client with a tweaked configuration (rate limits, capacities,
/// cross-tenant flags) without env var races.
pub fn test_client_with(tweak: impl FnOnce(&mut BrokerConfig)) -> TestClient {
    let db_path = temp_db_path();
    let mut config = test_config(&db_path);
    tweak(&mut config);
    let rocket = agent_relay::rocket_with_config(config);
    let client = Client::tracked(rocket).expect("valid rocket instance");
    TestClient {
        client: Some(client),
        db_path,
    }
}

pub fn bearer(key: &str) -> Header<'static> {
    Header::new("Authorization", format!("Bearer {key}"))
}

pub fn admin_header() -> Header<'static> {
    Header::new("X-Admin-Key", ADMIN_KEY)
}

/// Helper: create a project and return its clear-text API key.
pub fn create_project(client: &Client, tenant_id: &str) -> String {
    create_project_with_config(client, tenant_id, serde_json::json!(null))
}

pub fn create_project_with_config(
    client: &Client,
    tenant_id: &str,
    config: serde_json::Value,
) -> String {
    let mut body = serde_json::json!({"tenant_id": tenant_id});
    if !config.is_null() {
        body["config"] = config;
    }
    let res = client
        .post("/api/v1/projects")
        .header(ContentType::JSON)
        .header(admin_header())
        .body(body.to_string())
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    body["api_key"].as_str().unwrap().to_string()
}

/// Helper: connect a session (default tenant when `key` is None) and return
/// its id.
pub fn connect_session(
    client: &Client,
    key: Option<&str>,
    session_id: Option<&str>,
    capabilities: serde_json::Value,
) -> String {
    let mut body = serde_json::json!({"capabilities": capabilities});
    if let Some(id) = session_id {
        body["session_id"] = serde_json::json!(id);
    }
    let mut req = client
        .post("/api/v1/sessions")
        .header(ContentType::JSON)
        .body(body.to_string());
    if let Some(key) = key {
        req = req.header(bearer(key));
    }
    let res = req.dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    body["session_id"].as_str().unwrap().to_string()
}

/// Helper: register the canonical chat_message protocol.
pub fn register_chat_protocol(client: &Client, key: Option<&str>, version: &str) {
    let body = serde_json::json!({
        "name": "chat_message",
        "version": version,
        "schema": {
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        },
        "capabilities": ["point_to_point", "broadcast"]
    });
    let mut req = client
        .post("/api/v1/protocols")
        .header(ContentType::JSON)
        .body(body.to_string());
    if let Some(key) = key {
        req = req.header(bearer(key));
    }
    let res = req.dispatch();
    assert_eq!(res.status(), Status::Ok);
}

/// Capabilities advertising chat_message at the given versions.
pub fn chat_caps(versions: &[&str]) -> serde_json::Value {
    serde_json::json!({
        "protocols": {"chat_message": versions},
        "features": ["point_to_point"]
    })
}
