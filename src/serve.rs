use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};

use anyhow::Context as _;
use axum::{extract::FromRef, routing::get, Router};
use clap::Parser;
use clap_verbosity_flag::{log::LevelFilter, InfoLevel, Verbosity};
use figment::{providers::Format as _, Figment};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::{info, warn};

pub use super::error::Error;
use super::{
    config::AppConfig,
    db::{establish_pool, Db},
    embeddings::Embedder,
    mailer::Mailer,
    storage::ObjectStore,
};

/// The application user agent. Concatenates the package name and version. e.g. `aikya/0.0.0`.
pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

/// The application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Parser, Debug, Clone)]
/// Command line arguments.
pub struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "default.toml")]
    pub config: PathBuf,
    /// The verbosity level.
    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,
}

#[derive(Clone, FromRef)]
/// The application state, shared across all routes.
pub struct AppState {
    /// The application configuration.
    pub config: AppConfig,
    /// The main database connection pool.
    pub db: Db,
    /// Public object storage (certificates).
    pub storage: ObjectStore,
    /// Transactional email sender.
    pub mailer: Mailer,
    /// The embeddings client, when configured.
    pub embedder: Option<Embedder>,
}

impl AppState {
    /// Connect to the database and build every shared service described by `config`.
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(APP_USER_AGENT)
            .build()
            .context("failed to build requester client")?;

        let db = establish_pool(&config.db)
            .await
            .context("failed to establish database connection pool")?;

        let storage = ObjectStore::open(&config.storage.path, &config.site_url())
            .await
            .context("failed to open object storage")?;

        let mailer = Mailer::new(client.clone(), config.email.clone(), config.test);
        let embedder = config
            .embeddings
            .clone()
            .map(|cfg| Embedder::new(client.clone(), cfg));

        if embedder.is_none() {
            info!("embeddings not configured; vector search falls back to keyword search");
        }

        Ok(Self {
            config,
            db,
            storage,
            mailer,
            embedder,
        })
    }
}

/// Build the full router over `state`.
pub fn app(state: AppState) -> Router {
    let storage_dir = ServeDir::new(state.storage.root());

    Router::new()
        .route("/", get(super::index))
        .merge(super::endpoints::routes())
        .nest_service("/storage", storage_dir)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The main application entry point.
pub async fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    // Set up trace logging to console and account for the user-provided verbosity flag.
    if args.verbosity.log_level_filter() != LevelFilter::Off {
        let lvl = match args.verbosity.log_level_filter() {
            LevelFilter::Error => tracing::Level::ERROR,
            LevelFilter::Warn => tracing::Level::WARN,
            LevelFilter::Info | LevelFilter::Off => tracing::Level::INFO,
            LevelFilter::Debug => tracing::Level::DEBUG,
            LevelFilter::Trace => tracing::Level::TRACE,
        };
        tracing_subscriber::fmt().with_max_level(lvl).init();
    }

    if !args.config.exists() {
        // Not fatal: every setting can also come from the environment.
        warn!(
            "configuration file {} does not exist",
            args.config.display()
        );
    }

    // Read and parse the user-provided configuration.
    let config: AppConfig = Figment::new()
        .admerge(figment::providers::Toml::file(args.config))
        .admerge(figment::providers::Env::prefixed("AIKYA_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    if config.test {
        warn!("Aikya starting up in TEST mode.");
        warn!("Outbound email is disabled and sign-in tokens are echoed back to callers.");
    }

    // Initialize metrics reporting.
    super::metrics::setup(config.metrics.as_ref()).context("failed to set up metrics exporter")?;

    let addr = config
        .listen_address
        .unwrap_or(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8000));

    let state = AppState::new(config).await?;
    let app = app(state);

    info!("listening on {addr}");
    info!("connect to: http://127.0.0.1:{}", addr.port());

    let listener = TcpListener::bind(&addr)
        .await
        .context("failed to bind address")?;

    axum::serve(listener, app.into_make_service())
        .await
        .context("failed to serve app")
}
