use std::panic;
use std::sync::Arc;
use colabri_board::{
    auth::{AuthGate, CachedAccess, OrgScopedAccess},
    build_app,
    config::Config,
    db::{DbBoard, MemoryStore, StoreProvider},
    ws::{persist::RetryPolicy, RoomRegistry, RoomServices},
    AppState,
};
use tracing::{info, error, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() {

    // Set panic hook for better error messages
    panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
    }));

    // Load configuration first, it carries the default log level
    let loaded = Config::load();
    let config = match &loaded {
        Ok(config) => config.clone(),
        Err(_) => Config::default(),
    };

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_filter().into()))
        .init();

    match loaded {
        Ok(_) => info!("✅ Configuration loaded successfully"),
        Err(e) => {
            error!("❌ Failed to load configuration: {}", e);
            warn!("Using default configuration");
        }
    }
    info!("Starting {} ({})...", config.cloud_service_name, config.environment);

    // Initialize the record store
    let stores: Arc<dyn StoreProvider> = match &config.db_url {
        Some(db_url) => match DbBoard::new(db_url).await {
            Ok(db) => {
                info!("Database initialized successfully");
                Arc::new(db)
            }
            Err(e) => {
                error!("Failed to initialize database: {}", e);
                warn!("Rooms will not survive a restart");
                Arc::new(MemoryStore::new())
            }
        },
        None => {
            warn!("No database URL configured - rooms will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let services = RoomServices {
        gate: Arc::new(AuthGate::from_config(&config)),
        access: Arc::new(CachedAccess::new(OrgScopedAccess, config.access_cache_ttl())),
        stores,
        retry: RetryPolicy {
            limit: config.persist_retry_limit,
            base: config.persist_retry_base(),
        },
        idle: config.room_idle(),
    };

    let address = config.server_address();
    let state = Arc::new(AppState::new(config, RoomRegistry::new(services)));
    let app_routes = build_app(state);

    // Start the HTTP/API server
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .unwrap_or_else(|_| panic!("Failed to bind to {}", address));

    info!("🚀 Server running on http://{}", address);
    info!("📡 Rooms available at ws://{}/api/v1/rooms/{{room_id}}/ws", address);
    info!("📚 Swagger UI available at http://{}/swagger", address);

    axum::serve(listener, app_routes)
        .await
        .expect("Server failed to start");
}
