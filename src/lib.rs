pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod models;
pub mod negotiate;
pub mod rate_limit;
pub mod registry;
pub mod router;
pub mod routes;
pub mod schema;
pub mod sessions;
pub mod store;
pub mod tenants;

use std::sync::Arc;

use config::{BrokerConfig, StoreBackend};
use context::OpContext;
use events::EventBus;
use rate_limit::RateLimiter;
use registry::ProtocolRegistry;
use rocket_cors::CorsOptions;
use router::MessageRouter;
use sessions::SessionManager;
use store::{FailoverStore, MemoryStore, Store};
use tenants::TenantRegistry;

pub fn rocket() -> rocket::Rocket<rocket::Build> {
    build_rocket(BrokerConfig::from_env())
}

pub fn rocket_with_db(db_path: &str) -> rocket::Rocket<rocket::Build> {
    let mut config = BrokerConfig::from_env();
    config.database_path = db_path.to_string();
    config.spill_path = format!("{db_path}.spill.jsonl");
    build_rocket(config)
}

pub fn rocket_with_config(config: BrokerConfig) -> rocket::Rocket<rocket::Build> {
    build_rocket(config)
}

fn build_rocket(config: BrokerConfig) -> rocket::Rocket<rocket::Build> {
    // Ensure data directory exists
    if config.store_backend == StoreBackend::Sqlite
        && let Some(parent) = std::path::Path::new(&config.database_path).parent()
    {
        std::fs::create_dir_all(parent).ok();
    }

    let events = EventBus::new();
    let store: Arc<dyn Store> = match config.store_backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Sqlite => Arc::new(FailoverStore::new(
            &config.database_path,
            &config.spill_path,
            events.clone(),
        )),
    };

    // Initialization order: store, registries, sessions, router, façade.
    let tenants = Arc::new(TenantRegistry::new(store.clone(), &config.key_pepper));
    if !config.default_tenant_id.is_empty()
        && let Err(e) = tenants.ensure_default(&OpContext::background(), &config.default_tenant_id)
    {
        eprintln!("⚠️  Failed to provision default tenant: {e}");
    }

    let protocols = Arc::new(ProtocolRegistry::new(store.clone()));
    let sessions = Arc::new(SessionManager::new(
        store.clone(),
        events.clone(),
        config.clone(),
    ));
    let rate_limiter = Arc::new(RateLimiter::new());
    let message_router = Arc::new(MessageRouter::new(
        store.clone(),
        protocols.clone(),
        sessions.clone(),
        tenants.clone(),
        events.clone(),
        rate_limiter.clone(),
        config.clone(),
    ));

    let cors = CorsOptions::default()
        .to_cors()
        .expect("Failed to create CORS");

    // JSON limit sits above the payload cap so oversize payloads reach the
    // router's own size check and get a typed error instead of a 413.
    let json_limit = (config.max_payload_bytes as u64) + 2 * 1024 * 1024;
    let figment = rocket::Config::figment().merge(("limits.json", json_limit));

    let heartbeat_sessions = sessions.clone();
    let heartbeat_interval = config.heartbeat_interval_secs;

    rocket::custom(figment)
        .manage(config)
        .manage(store)
        .manage(Arc::new(events))
        .manage(tenants)
        .manage(protocols)
        .manage(sessions)
        .manage(rate_limiter)
        .manage(message_router)
        .attach(cors)
        .register(
            "/",
            rocket::catchers![
                routes::unauthorized,
                routes::forbidden,
                routes::not_found,
                routes::too_many_requests,
            ],
        )
        .mount(
            "/",
            rocket::routes![
                routes::health,
                routes::stats,
                routes::register_protocol,
                routes::discover_protocols,
                routes::get_protocol,
                routes::delete_protocol,
                routes::share_protocol,
                routes::connect_session,
                routes::session_heartbeat,
                routes::close_session,
                routes::list_sessions,
                routes::list_sessions_admin,
                routes::drain_mailbox,
                routes::negotiate_capabilities,
                routes::send_message,
                routes::list_dead_letters,
                routes::broadcast_message,
                routes::event_stream,
                routes::create_project,
                routes::list_projects,
                routes::get_project_info,
                routes::rotate_project_keys,
                routes::deactivate_project,
            ],
        )
        .attach(rocket::fairing::AdHoc::on_liftoff(
            "Heartbeat Scheduler",
            move |_rocket| {
                Box::pin(async move {
                    heartbeat::spawn_heartbeat_task(heartbeat_sessions, heartbeat_interval);
                    println!("💓 Heartbeat scheduler started ({heartbeat_interval}s tick)");
                })
            },
        ))
        .attach(rocket::fairing::AdHoc::on_shutdown("Store Flush", |rocket| {
            Box::pin(async move {
                if let Some(store) = rocket.state::<Arc<dyn Store>>() {
                    match store.shutdown() {
                        Ok(()) => println!("💾 Store flushed"),
                        Err(e) => eprintln!("⚠️  Store flush failed: {e}"),
                    }
                }
            })
        }))
}
