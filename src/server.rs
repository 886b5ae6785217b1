use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::{header::CONTENT_TYPE, Method},
    routing::{get, post},
    Router,
};
use tokio::{net::TcpListener, signal, sync::Mutex};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::Database;
use crate::exams::ExamOrchestrator;
use crate::leaderboard::LeaderboardRanker;
use crate::lectures::LecturePipeline;
use crate::oracle::{
    DeepSeekClient, DocumentRenderer, HtmlRenderer, LlmTranslator, OracleError, RetryPolicy, SpeechOracle,
    TextOracle,
};
use crate::routes;

pub struct AppState {
    pub db: Arc<Mutex<Database>>,
    pub exams: ExamOrchestrator,
    pub lectures: LecturePipeline,
    pub renderer: Arc<dyn DocumentRenderer>,
}

impl AppState {
    pub fn new(db: Database, config: &Config) -> Result<Arc<Self>, OracleError> {
        let oracle: Arc<dyn TextOracle> = Arc::new(DeepSeekClient::new(config.oracle.clone())?);
        let speech: Arc<dyn SpeechOracle> = Arc::new(LlmTranslator::new(oracle.clone()));
        let renderer = Arc::new(HtmlRenderer::new(config.export_dir.clone()));
        Ok(Self::assemble(
            db,
            oracle,
            speech,
            renderer,
            config.oracle.timeout,
            config.oracle.retry_policy(),
        ))
    }

    #[cfg(test)]
    pub fn with_oracles(
        db: Database,
        oracle: Arc<dyn TextOracle>,
        speech: Arc<dyn SpeechOracle>,
        renderer: Arc<dyn DocumentRenderer>,
        timeout: Duration,
    ) -> Arc<Self> {
        Self::assemble(db, oracle, speech, renderer, timeout, RetryPolicy::default())
    }

    fn assemble(
        db: Database,
        oracle: Arc<dyn TextOracle>,
        speech: Arc<dyn SpeechOracle>,
        renderer: Arc<dyn DocumentRenderer>,
        timeout: Duration,
        policy: RetryPolicy,
    ) -> Arc<Self> {
        let db = Arc::new(Mutex::new(db));
        Arc::new(Self {
            exams: ExamOrchestrator::new(db.clone(), oracle.clone(), timeout).with_policy(policy),
            lectures: LecturePipeline::new(db.clone(), speech, oracle, timeout),
            renderer,
            db,
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/health", get(routes::health))
        .route("/users", post(routes::create_user))
        .route("/attempts", post(routes::record_attempt))
        .route("/users/:id/stats", get(routes::user_stats))
        .route("/users/:id/category-stats", get(routes::category_stats))
        .route("/users/:id/daily-stats", get(routes::daily_stats))
        .route("/users/:id/attempts", get(routes::recent_attempts))
        .route("/users/:id/rank", get(routes::user_rank))
        .route("/users/:id/badges", get(routes::badges))
        .route("/users/:id/badges/check", post(routes::check_badges))
        .route("/users/:id/replay", post(routes::replay))
        .route("/users/:id/exam-history", get(routes::exam_history))
        .route("/leaderboard", get(routes::leaderboard))
        .route("/leaderboard/refresh", post(routes::refresh_leaderboard))
        .route("/exams/generate", post(routes::generate_exam))
        .route("/exams/:id", get(routes::get_exam))
        .route("/exams/:id/submit", post(routes::submit_exam))
        .route("/lectures", post(routes::create_lecture))
        .route("/lectures/:id", get(routes::lecture_detail))
        .route("/lectures/:id/export", post(routes::export_lecture))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Re-ranks every board in the background. Failures are logged only.
pub fn spawn_leaderboard_refresh(db: Arc<Mutex<Database>>) {
    tokio::spawn(async move {
        let db = db.lock().await;
        if let Err(e) = LeaderboardRanker::new(&db).refresh() {
            warn!("Background leaderboard refresh failed: {}", e);
        }
    });
}

pub async fn serve(config: Config, db: Database) -> Result<(), Box<dyn Error>> {
    info!("Initializing state...");
    let state = AppState::new(db, &config)?;
    let app = router(state);

    info!("Binding to {}", config.addr);
    let listener = TcpListener::bind(config.addr).await?;
    info!("Server running on {}", config.addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
