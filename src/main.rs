use std::sync::Arc;

use axum::{
    http::{header, HeaderValue, Method},
    routing::get,
    Extension, Router,
};
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use edutrack_api::{
    config::Config,
    db,
    middleware::{auth::JwtSecret, workstream::WORKSTREAM_HEADER},
    routes,
    services::{email::EmailService, metrics},
    AppState,
};

/// Origins allowed to call the API: localhost, the base url and any of its
/// subdomains (workstream sites).
fn allowed_origin(origin: &str, base: &str) -> bool {
    if origin.starts_with("http://localhost") || origin.starts_with("http://127.0.0.1") {
        return true;
    }
    if origin == base {
        return true;
    }
    let Some((_, rest)) = base.split_once("://") else {
        return false;
    };
    let host = rest.split('/').next().unwrap_or(rest);
    let domain = host.split(':').next().unwrap_or(host);
    origin.ends_with(&format!(".{domain}")) || origin.contains(&format!(".{domain}:"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env()?);

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;
    info!("Database connected and migrations applied");

    let redis = redis::Client::open(config.redis_url.as_str())?
        .get_multiplexed_async_connection()
        .await?;
    info!("Redis connected");

    let email = EmailService::new(&config).map(Arc::new);
    if email.is_some() {
        info!("SMTP email service configured");
    } else {
        info!("SMTP not configured, welcome and reset emails disabled");
    }

    metrics::start(pool.clone());

    let state = AppState {
        db: pool,
        redis,
        config: config.clone(),
        email,
    };

    let base = config.app_base_url.clone();
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(AllowHeaders::list([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::HeaderName::from_static(WORKSTREAM_HEADER),
        ]))
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            origin.to_str().map(|o| allowed_origin(o, &base)).unwrap_or(false)
        }));

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/metrics", get(routes::metrics::metrics_handler))
        .merge(routes::api_router())
        .layer(Extension(JwtSecret(config.jwt_secret.clone())))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("EduTrack API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::allowed_origin;

    #[test]
    fn origins() {
        let base = "https://edutrack.example.com";
        assert!(allowed_origin("http://localhost:5173", base));
        assert!(allowed_origin("https://edutrack.example.com", base));
        assert!(allowed_origin("https://north.edutrack.example.com", base));
        assert!(!allowed_origin("https://evil-edutrack.example.com.attacker.io", base));
        assert!(!allowed_origin("https://other.org", base));
    }
}
