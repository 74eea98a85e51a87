use std::sync::Arc;
use std::time::Duration;

use ap_intake::cache::VendorCache;
use ap_intake::circuit_breaker::{self, CircuitBreakerRegistry};
use ap_intake::config::Config;
use ap_intake::health;
use ap_intake::metrics;
use ap_intake::repos::queue_repo::{self, QueueName};
use ap_intake::services::blob_store::{BlobStore, FilesystemBlobStore};
use ap_intake::services::chat_notifier::ChatNotifier;
use ap_intake::services::llm_client::LlmClient;
use ap_intake::services::mail_provider::{GraphMailProvider, MailProvider};
use ap_intake::services::rate_limiter::RateLimiter;
use ap_intake::webhook::{self, WebhookState};
use ap_intake::workers::{enricher, notification_worker, notifier, router, subscription_manager, timer_poller};
use ap_intake::db;
use axum::routing::{get, post};
use axum::Router;
use event_bus::{EventBus, InMemoryBus, NatsBus};
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "invalid configuration");
        std::process::exit(1);
    });
    let config = Arc::new(config);

    let pool = db::init_pool(&config.database_url)
        .await
        .expect("failed to connect to Postgres");

    sqlx::migrate!("./db/migrations")
        .run(&pool)
        .await
        .expect("failed to run database migrations");

    tracing::info!("database migrations applied successfully");

    let bus: Arc<dyn EventBus> = match config.bus_type.as_str() {
        "nats" => {
            tracing::info!(nats_url = %config.nats_url, "connecting to NATS");
            let client = async_nats::connect(&config.nats_url)
                .await
                .expect("failed to connect to NATS");
            Arc::new(NatsBus::new(client))
        }
        "inmemory" => {
            tracing::info!("using InMemoryBus for queue wake-up notifications");
            Arc::new(InMemoryBus::new())
        }
        other => panic!("invalid BUS_TYPE: {other}. Must be 'nats' or 'inmemory'"),
    };

    circuit_breaker::init_registry(config.breaker_failure_threshold, config.breaker_open_duration);
    let breaker: &'static CircuitBreakerRegistry = circuit_breaker::registry();

    let provider: Arc<dyn MailProvider> = Arc::new(
        GraphMailProvider::new(config.graph_api_base_url.clone(), config.graph_bearer_token.clone())
            .expect("failed to build mail provider client"),
    );
    let blob_store: Arc<dyn BlobStore> = Arc::new(FilesystemBlobStore::new(config.blob_store_root.clone()));
    let chat_notifier = Arc::new(
        ChatNotifier::new(config.chat_webhook_url.clone()).expect("failed to build chat notifier client"),
    );
    let llm: Option<Arc<LlmClient>> = match (&config.llm_endpoint, &config.llm_api_key) {
        (Some(endpoint), Some(api_key)) => Some(Arc::new(
            LlmClient::new(endpoint.clone(), api_key.clone()).expect("failed to build LLM client"),
        )),
        _ => {
            tracing::info!("LLM_ENDPOINT/LLM_API_KEY not set, vendor LLM fallback disabled");
            None
        }
    };
    let vendor_cache = Arc::new(VendorCache::with_default_ttl());
    let rate_limiter = RateLimiter::new(config.rate_limit_per_minute, config.rate_limit_disabled);

    // Notification Worker (notifications -> raw-mail) and Timer Poller
    // (fallback) both converge on raw-mail via the shared ingest
    // pipeline (workers::ingest); Enricher/Router/Notifier drain the
    // rest of the pipeline; Subscription Manager keeps the push
    // subscription alive.
    tokio::spawn(notification_worker::spawn(
        pool.clone(),
        Arc::clone(&bus),
        Arc::clone(&config),
        Arc::clone(&provider),
        Arc::clone(&blob_store),
        breaker,
        llm.clone(),
    ));

    tokio::spawn(timer_poller::spawn(
        pool.clone(),
        Arc::clone(&bus),
        Arc::clone(&config),
        Arc::clone(&provider),
        Arc::clone(&blob_store),
        breaker,
        llm.clone(),
    ));

    tokio::spawn(enricher::spawn(
        pool.clone(),
        Arc::clone(&bus),
        Arc::clone(&config),
        Arc::clone(&vendor_cache),
        llm.clone(),
    ));

    tokio::spawn(router::spawn(
        pool.clone(),
        Arc::clone(&bus),
        Arc::clone(&config),
        Arc::clone(&provider),
        Arc::clone(&blob_store),
        breaker,
    ));

    tokio::spawn(notifier::spawn(
        pool.clone(),
        Arc::clone(&bus),
        Arc::clone(&config),
        Arc::clone(&chat_notifier),
        breaker,
    ));

    tokio::spawn(subscription_manager::spawn(
        pool.clone(),
        Arc::clone(&config),
        Arc::clone(&provider),
        breaker,
    ));

    tokio::spawn(dead_letter_depth_poller(pool.clone()));

    let webhook_state = Arc::new(WebhookState {
        pool: pool.clone(),
        bus: Arc::clone(&bus),
        config: (*config).clone(),
        rate_limiter,
    });

    let webhook_router = Router::new()
        .route("/webhook", post(webhook::handle_webhook))
        .with_state(webhook_state);

    let health_router = Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .with_state(Arc::new(pool.clone()));

    let metrics_router = Router::new().route("/metrics", get(metrics::serve_metrics));

    let app = Router::new()
        .merge(webhook_router)
        .merge(health_router)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        );

    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!(%addr, "ap-intake listening");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
    .expect("server failed to start");
}

/// Surfaces dead-letter queue depth on `/metrics` per queue; a
/// dashboard slicing that by day is a downstream concern, this poller
/// only emits the gauge that feeds it.
async fn dead_letter_depth_poller(pool: sqlx::PgPool) {
    const QUEUES: [QueueName; 4] = [
        QueueName::Notifications,
        QueueName::RawMail,
        QueueName::ToPost,
        QueueName::Notify,
    ];

    let mut ticker = tokio::time::interval(Duration::from_secs(30));
    loop {
        ticker.tick().await;
        for queue in QUEUES {
            match queue_repo::dead_letter_depth(&pool, queue).await {
                Ok(depth) => metrics::set_dead_letter_depth(queue.as_str(), depth),
                Err(e) => tracing::warn!(queue = queue.as_str(), error = %e, "failed to read dead-letter depth"),
            }
        }
    }
}
