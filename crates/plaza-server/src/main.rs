use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use plaza_api::auth::{self, AppState, AppStateInner};
use plaza_api::middleware::require_auth;
use plaza_api::posts;
use plaza_mailer::{LogMailer, Mailer, SmtpMailer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "plaza=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("PLAZA_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("PLAZA_DB_PATH").unwrap_or_else(|_| "plaza.db".into());
    let host = std::env::var("PLAZA_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("PLAZA_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;
    let base_url = std::env::var("PLAZA_BASE_URL")
        .unwrap_or_else(|_| format!("http://localhost:{}", port));

    // Init database
    let db = plaza_db::Database::open(&PathBuf::from(&db_path))?;

    // Mail dispatch: SMTP when configured, otherwise log-only
    let mailer: Arc<dyn Mailer> = match build_smtp_mailer()? {
        Some(m) => Arc::new(m),
        None => {
            warn!("PLAZA_SMTP_HOST not set; verification links will only be logged");
            Arc::new(LogMailer)
        }
    };

    // Shared state
    let state: AppState = Arc::new(AppStateInner {
        db,
        mailer,
        jwt_secret,
        base_url,
    });

    // Routes
    let public_routes = Router::new()
        .route("/register", post(auth::register))
        .route("/verify", get(auth::verify))
        .route("/login", post(auth::login))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/posts", post(posts::create_post))
        .route("/posts", get(posts::get_posts))
        .route("/posts/{post_id}/like", post(posts::toggle_like))
        .route("/posts/{post_id}/comments", post(posts::create_comment))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state);

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Plaza server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_smtp_mailer() -> anyhow::Result<Option<SmtpMailer>> {
    let Ok(smtp_host) = std::env::var("PLAZA_SMTP_HOST") else {
        return Ok(None);
    };

    let smtp_port: u16 = std::env::var("PLAZA_SMTP_PORT")
        .unwrap_or_else(|_| "465".into())
        .parse()?;
    let smtp_user = std::env::var("PLAZA_SMTP_USER").unwrap_or_default();
    let smtp_pass = std::env::var("PLAZA_SMTP_PASS").unwrap_or_default();
    let mail_from = std::env::var("PLAZA_MAIL_FROM")
        .unwrap_or_else(|_| format!("Plaza <{}>", smtp_user));

    let mailer = SmtpMailer::new(&smtp_host, smtp_port, smtp_user, smtp_pass, &mail_from)?;
    Ok(Some(mailer))
}
