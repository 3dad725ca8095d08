use axum::Router;
use proctoring_ledger::{
    config::{get_config, init_config},
    database::pool::create_pool,
    middleware::{auth::require_secret, rate_limit::{rps_middleware, RateLimiter}},
    routes,
    store::{EntityStore, MemoryStore, PgStore},
    AppState,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false) {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    init_config()?;
    let config = get_config();

    let store: Arc<dyn EntityStore> = match &config.database_url {
        Some(url) => {
            let pool = create_pool(url).await?;
            sqlx::migrate!("./migrations").run(&pool).await?;
            info!("using postgres store");
            Arc::new(PgStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let app_state = AppState::from_config(store, config);

    {
        let attempts = app_state.attempt_service.clone();
        let max_age = chrono::Duration::hours(config.stale_attempt_hours);
        tokio::spawn(async move {
            loop {
                if let Err(e) = attempts.delete_stale_created(max_age).await {
                    tracing::error!(error = ?e, "stale attempt sweeper error");
                }
                tokio::time::sleep(Duration::from_secs(60 * 60)).await;
            }
        });
    }

    let callback_api = routes::callback_routes().layer(axum::middleware::from_fn_with_state(
        RateLimiter::new("callback", config.callback_rps),
        rps_middleware,
    ));

    let admin_api = routes::admin_routes()
        .layer(axum::middleware::from_fn_with_state(
            app_state.clone(),
            require_secret,
        ))
        .layer(axum::middleware::from_fn_with_state(
            RateLimiter::new("admin", config.admin_rps),
            rps_middleware,
        ));

    let app = Router::new()
        .route("/health", axum::routing::get(routes::health::health))
        .merge(callback_api)
        .merge(admin_api)
        .with_state(app_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.server_address.parse()?;
    info!("Server listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
