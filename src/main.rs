use axum::extract::DefaultBodyLimit;
use axum::{routing::get, Router};
use std::{env, sync::Arc};
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lti_exam_runtime::{
    config::Config,
    db,
    outcome::LtiOutcomeReporter,
    receipt::ReceiptSigner,
    routes::{self, AppState},
    store::{PgStore, Store},
    tasks::{self, TokioTaskQueue, Worker},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            env::var("RUST_LOG").unwrap_or_else(|_| "lti_exam_runtime=info,axum=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let pool = db::connect(&config.database_url).await?;
    // crate-relative path for sqlx migrations
    sqlx::migrate!("./migrations").run(&pool).await?;
    tokio::fs::create_dir_all(config.data_dir.join("exams")).await?;

    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));
    let http = reqwest::Client::new();
    let worker = Worker {
        store: store.clone(),
        reporter: Arc::new(LtiOutcomeReporter::new(http.clone())),
        http,
        report_outcome_delay: config.report_outcome_delay,
        diff_sweep_budget: config.diff_sweep_budget,
    };
    let queue = TokioTaskQueue::new(worker, config.task_workers);
    tasks::schedule_recurring(&queue, config.diff_sweep_schedule);

    let state = AppState {
        store,
        queue: Arc::new(queue),
        signer: ReceiptSigner::new(&config.secret_key),
        data_dir: config.data_dir.clone(),
    };

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .merge(routes::router(state))
        .layer(DefaultBodyLimit::max(200 * 1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
