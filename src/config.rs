use std::env;

/// Broker configuration. All values read from environment variables with
/// sensible defaults; tests inject a struct directly instead.
///
/// Environment variables:
/// - `HEARTBEAT_INTERVAL_SECS` — Scheduler tick interval (default: 1)
/// - `STALE_THRESHOLD_SECS` — Seconds without heartbeat before `stale` (default: 30)
/// - `DISCONNECT_THRESHOLD_SECS` — Seconds without heartbeat before `disconnected` (default: 60)
/// - `MAILBOX_CAPACITY` — Max queued messages per session (default: 100)
/// - `MAILBOX_WARNING_RATIO` — Depth ratio that fires `queue_near_capacity` (default: 0.9)
/// - `MAILBOX_RETENTION_SECS` — How long a disconnected session's mailbox is kept before dead-lettering (default: 300)
/// - `MAX_PAYLOAD_BYTES` — Max serialized payload size (default: 10 MiB)
/// - `STORE_BACKEND` — `sqlite` or `memory` (default: sqlite)
/// - `DATABASE_PATH` — SQLite file for the durable backend (default: data/relay.db)
/// - `SPILL_PATH` — Where degraded-mode writes are flushed on shutdown (default: data/relay.spill.jsonl)
/// - `ENABLE_CROSS_TENANT` — Allow the cross-tenant routing subroutine (default: false)
/// - `DEFAULT_TENANT_ID` — Tenant used for unauthenticated callers; empty disables the fallback (default: "default")
/// - `ADMIN_KEY` — Key for project-management operations (default: generated at startup)
/// - `KEY_PEPPER` — Server-side pepper mixed into API-key digests
/// - `RATE_LIMIT_MESSAGES` — Max sends per minute per session (default: 120)
/// - `RATE_LIMIT_BROADCASTS` — Max broadcasts per minute per session (default: 10)
/// - `RATE_LIMIT_PROTOCOLS` — Max protocol registrations per hour per tenant (default: 60)
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub heartbeat_interval_secs: u64,
    pub stale_threshold_secs: i64,
    pub disconnect_threshold_secs: i64,
    pub mailbox_capacity: usize,
    pub mailbox_warning_ratio: f64,
    pub mailbox_retention_secs: i64,
    pub max_payload_bytes: usize,
    pub store_backend: StoreBackend,
    pub database_path: String,
    pub spill_path: String,
    pub enable_cross_tenant: bool,
    /// Empty string disables the unauthenticated fallback tenant.
    pub default_tenant_id: String,
    pub admin_key: String,
    pub key_pepper: String,
    pub rate_limit_messages: usize,
    pub rate_limit_broadcasts: usize,
    pub rate_limit_protocols: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 1,
            stale_threshold_secs: 30,
            disconnect_threshold_secs: 60,
            mailbox_capacity: 100,
            mailbox_warning_ratio: 0.9,
            mailbox_retention_secs: 300,
            max_payload_bytes: 10 * 1024 * 1024,
            store_backend: StoreBackend::Sqlite,
            database_path: "data/relay.db".to_string(),
            spill_path: "data/relay.spill.jsonl".to_string(),
            enable_cross_tenant: false,
            default_tenant_id: "default".to_string(),
            admin_key: generate_admin_key(),
            key_pepper: "agent-relay-dev-pepper".to_string(),
            rate_limit_messages: 120,
            rate_limit_broadcasts: 10,
            rate_limit_protocols: 60,
        }
    }
}

/// Generate a broker admin key: `relay_<32 hex chars>`
pub fn generate_admin_key() -> String {
    format!("relay_{:032x}", uuid::Uuid::new_v4().as_u128())
}

impl BrokerConfig {
    /// Create a new BrokerConfig from environment variables, with defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = env::var("HEARTBEAT_INTERVAL_SECS")
            && let Ok(n) = val.parse::<u64>()
            && n > 0
        {
            config.heartbeat_interval_secs = n;
        }
        if let Ok(val) = env::var("STALE_THRESHOLD_SECS")
            && let Ok(n) = val.parse::<i64>()
        {
            config.stale_threshold_secs = n;
        }
        if let Ok(val) = env::var("DISCONNECT_THRESHOLD_SECS")
            && let Ok(n) = val.parse::<i64>()
        {
            config.disconnect_threshold_secs = n;
        }
        if let Ok(val) = env::var("MAILBOX_CAPACITY")
            && let Ok(n) = val.parse::<usize>()
            && n > 0
        {
            config.mailbox_capacity = n;
        }
        if let Ok(val) = env::var("MAILBOX_WARNING_RATIO")
            && let Ok(r) = val.parse::<f64>()
            && (0.0..=1.0).contains(&r)
        {
            config.mailbox_warning_ratio = r;
        }
        if let Ok(val) = env::var("MAILBOX_RETENTION_SECS")
            && let Ok(n) = val.parse::<i64>()
        {
            config.mailbox_retention_secs = n;
        }
        if let Ok(val) = env::var("MAX_PAYLOAD_BYTES")
            && let Ok(n) = val.parse::<usize>()
        {
            config.max_payload_bytes = n;
        }
        if let Ok(val) = env::var("STORE_BACKEND") {
            match val.to_lowercase().as_str() {
                "memory" => config.store_backend = StoreBackend::Memory,
                "sqlite" => config.store_backend = StoreBackend::Sqlite,
                _ => {}
            }
        }
        if let Ok(val) = env::var("DATABASE_PATH") {
            config.database_path = val;
        }
        if let Ok(val) = env::var("SPILL_PATH") {
            config.spill_path = val;
        }
        if let Ok(val) = env::var("ENABLE_CROSS_TENANT") {
            config.enable_cross_tenant = val != "0" && val.to_lowercase() != "false";
        }
        if let Ok(val) = env::var("DEFAULT_TENANT_ID") {
            config.default_tenant_id = val;
        }
        if let Ok(val) = env::var("ADMIN_KEY")
            && !val.is_empty()
        {
            config.admin_key = val;
        }
        if let Ok(val) = env::var("KEY_PEPPER")
            && !val.is_empty()
        {
            config.key_pepper = val;
        }
        if let Ok(val) = env::var("RATE_LIMIT_MESSAGES")
            && let Ok(n) = val.parse::<usize>()
        {
            config.rate_limit_messages = n;
        }
        if let Ok(val) = env::var("RATE_LIMIT_BROADCASTS")
            && let Ok(n) = val.parse::<usize>()
        {
            config.rate_limit_broadcasts = n;
        }
        if let Ok(val) = env::var("RATE_LIMIT_PROTOCOLS")
            && let Ok(n) = val.parse::<usize>()
        {
            config.rate_limit_protocols = n;
        }

        config
    }

    /// Mailbox depth at which the `queue_near_capacity` warning fires.
    pub fn warning_threshold(&self) -> usize {
        ((self.mailbox_capacity as f64) * self.mailbox_warning_ratio).ceil() as usize
    }
}
