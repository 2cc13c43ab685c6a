//! Quiz session binary: hosts one user's session on a quiz and bridges it to
//! the page over REST and SSE.

use std::{env, net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;
use quiz_session::{
    backend::{
        QuizBackend,
        http::{HttpBackendConfig, HttpQuizBackend},
    },
    config::EngineConfig,
    routes,
    services::{
        connectivity_supervisor,
        notices::NoticeHub,
        session_service::{QuizSession, SessionOptions},
        visibility::VisibilityGate,
    },
    state::{AppState, SharedState, clock::SystemClock},
};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = EngineConfig::load();
    let target_id: Uuid = env::var("QUIZ_ID")
        .context("QUIZ_ID must name the quiz or slot to open")?
        .parse()
        .context("QUIZ_ID is not a UUID")?;
    let user_id = env::var("QUIZ_USER_ID")
        .ok()
        .filter(|value| !value.is_empty())
        .map(|value| value.parse::<Uuid>())
        .transpose()
        .context("QUIZ_USER_ID is not a UUID")?;
    if user_id.is_none() {
        warn!("QUIZ_USER_ID not set; the session is read-only");
    }

    let backend_config = HttpBackendConfig::from_env().context("configuring quiz backend")?;
    let backend: Arc<dyn QuizBackend> =
        Arc::new(HttpQuizBackend::connect(backend_config).context("building backend client")?);

    let gate = VisibilityGate::global().clone();
    let session = QuizSession::new(
        backend.clone(),
        config.clone(),
        SessionOptions {
            target_id,
            user_id,
            clock: Arc::new(SystemClock),
            gate: gate.clone(),
            notices: NoticeHub::default(),
        },
    );

    tokio::spawn(connectivity_supervisor::run(
        backend.clone(),
        gate,
        config.connectivity,
    ));

    if let Err(err) = session.start().await {
        warn!(error = %err, "initial quiz load failed; POST /session/retry to try again");
    }

    let app = build_router(AppState::new(session.clone(), backend));

    let port = env::var("PORT")
        .or_else(|_| env::var("SERVER_PORT"))
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, %target_id, "starting server");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving axum")?;

    session.teardown().await;
    info!("session torn down");
    Ok(())
}

/// Build the top-level router and attach cross-cutting middleware layers.
fn build_router(state: SharedState) -> Router<()> {
    routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM and shut the server down gracefully.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
