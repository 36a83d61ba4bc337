use actix_web::{middleware, web, App, HttpServer};
use push_gateway::config::ApnsMode;
use push_gateway::dispatch::{
    spawn_completion_loop, spawn_feedback_consumer, PushGateway, RedeliveryLoop,
};
use push_gateway::providers::{
    ApnsClient, ApnsEndpoints, ApnsFeedback, GcmClient, PushClient, TlsApnsConnector,
};
use push_gateway::store::{RedisStore, Store};
use push_gateway::{handlers, metrics, Config};
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting push gateway");

    let config = Config::from_env().map_err(|e| io::Error::other(e.to_string()))?;

    let redis_pool = match redis_utils::RedisPool::connect(&config.redis.url).await {
        Ok(pool) => {
            tracing::info!("Connection to redis established");
            pool
        }
        Err(e) => {
            tracing::error!("Can't establish connection to redis: {}", e);
            return Err(io::Error::other("Redis connection failed"));
        }
    };
    let store: Arc<dyn Store> = Arc::new(RedisStore::new(redis_pool.manager()));

    let (completions_tx, completions_rx) = mpsc::unbounded_channel();
    let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();

    // APNS push and feedback channels
    let mut feedback_handle = None;
    let apns_client: Option<Arc<dyn PushClient>> = match &config.apns {
        Some(apns_cfg) => {
            let endpoints = match apns_cfg.mode {
                ApnsMode::Production => ApnsEndpoints::production(),
                ApnsMode::Sandbox => ApnsEndpoints::sandbox(),
            };

            let push_connector = TlsApnsConnector::from_p12(
                endpoints.push_host,
                endpoints.push_port,
                &apns_cfg.p12_path,
                &apns_cfg.p12_password,
            )
            .map_err(|e| io::Error::other(format!("APNS push connector: {e}")))?;
            let client = ApnsClient::new(
                Arc::new(push_connector),
                apns_cfg.pool_size,
                completions_tx.clone(),
            );

            let feedback_connector = TlsApnsConnector::from_p12(
                endpoints.feedback_host,
                endpoints.feedback_port,
                &apns_cfg.p12_path,
                &apns_cfg.p12_password,
            )
            .map_err(|e| io::Error::other(format!("APNS feedback connector: {e}")))?;
            feedback_handle = Some(
                ApnsFeedback::new(Arc::new(feedback_connector), feedback_tx.clone()).start(),
            );

            tracing::info!(
                "APNS client initialized ({:?}, pool size {})",
                apns_cfg.mode,
                apns_cfg.pool_size
            );
            Some(Arc::new(client))
        }
        None => {
            tracing::warn!("APNS_P12_PATH not set - APNS push disabled");
            None
        }
    };

    let gcm_client: Option<Arc<dyn PushClient>> = match &config.gcm {
        Some(gcm_cfg) => {
            let client = GcmClient::new(
                gcm_cfg.project_id.clone(),
                gcm_cfg.api_key.clone(),
                gcm_cfg.pool_size,
                completions_tx.clone(),
            )
            .map_err(|e| io::Error::other(format!("GCM client: {e}")))?;
            tracing::info!("GCM client initialized for project {}", gcm_cfg.project_id);
            Some(Arc::new(client))
        }
        None => {
            tracing::warn!("GCM_PROJECT_ID/GCM_API_KEY not set - GCM push disabled");
            None
        }
    };

    let gateway = Arc::new(PushGateway::new(
        store.clone(),
        apns_client,
        gcm_client,
        config.automation.clone(),
    ));

    let _completion_loop = spawn_completion_loop(gateway.clone(), completions_rx);
    let _feedback_consumer = spawn_feedback_consumer(gateway.clone(), feedback_rx);

    let _redelivery = if config.automation.auto_redeliver {
        tracing::info!(
            "Automatic redelivery enabled every {}s, {} attempts",
            config.automation.retry_interval_secs,
            config.automation.redeliver_attempts
        );
        Some(RedeliveryLoop::spawn(
            gateway.clone(),
            Duration::from_secs(config.automation.retry_interval_secs),
        ))
    } else {
        tracing::info!("Automatic redelivery disabled");
        None
    };

    let addr = format!("{}:{}", config.api.address, config.api.port);
    let base = config.api.base.clone();
    tracing::info!("Starting JSON API server on {}{}", addr, base);

    let result = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(gateway.clone()))
            .app_data(web::Data::new(store.clone()))
            .wrap(middleware::Logger::default())
            .route("/health", web::get().to(|| async { "OK" }))
            .route("/metrics", web::get().to(metrics::serve_metrics))
            .service(web::scope(&base).configure(handlers::register_routes))
    })
    .bind(&addr)?
    .run()
    .await;

    if let Some(handle) = feedback_handle {
        handle.abort();
    }

    result
}
