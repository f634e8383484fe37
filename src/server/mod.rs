pub mod assembly;
pub mod handlers;

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::paths::PathService;
use crate::staging::StagingStore;
use crate::strategy::StrategyRegistry;
use assembly::Assembler;
use axum::Router;
use axum::http::{HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{patch, post};
use log::info;
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};

/// Shared state behind every TUS handler.
pub struct AppState {
    pub config: ServerConfig,
    pub store: StagingStore,
    pub paths: PathService,
    pub strategies: StrategyRegistry,
    pub assembler: Assembler,
    pub locks: KeyedLocks,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Builds the handler state from configuration, with the built-in
    /// strategies registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the sanitize pattern does not compile.
    pub fn new(config: ServerConfig) -> Result<Self> {
        Self::with_strategies(config, StrategyRegistry::new())
    }

    /// Same as [`AppState::new`] but with a caller-populated registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the sanitize pattern does not compile.
    pub fn with_strategies(config: ServerConfig, strategies: StrategyRegistry) -> Result<Self> {
        let paths = PathService::new(
            config.mount_path.clone(),
            &config.filename_sanitize_pattern,
        )?;
        let store = StagingStore::new(config.staging_dir.clone());

        Ok(Self {
            config,
            store,
            paths,
            strategies,
            assembler: Assembler::default(),
            locks: KeyedLocks::default(),
        })
    }
}

/// One async mutex per staging id, so the sidecar read-mutate-rewrite cycle
/// is serialized even under parallel handlers. Entries are dropped when an
/// upload leaves staging.
#[derive(Default)]
pub struct KeyedLocks {
    inner: SyncMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    /// Returns the lock for `key`, creating it on first use.
    #[must_use]
    pub fn acquire(&self, key: &str) -> Arc<Mutex<()>> {
        self.inner
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Forgets the lock for `key` once the upload is finalized or removed.
    pub fn release(&self, key: &str) {
        self.inner.lock().remove(key);
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorMessage,
}

#[derive(Serialize)]
struct ErrorMessage {
    message: String,
}

impl Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::Protocol(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::OffsetMismatch { .. } | Error::DuplicateFile(_) => StatusCode::CONFLICT,
            Error::TooLarge(..) => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = axum::Json(ErrorBody {
            error: ErrorMessage {
                message: self.to_string(),
            },
        });
        (status, [(handlers::TUS_RESUMABLE, handlers::TUS_VERSION)], body).into_response()
    }
}

/// Builds the TUS router: create/options on the upload root, append, head
/// and terminate on individual uploads.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route(
            "/api/upload",
            post(handlers::create).options(handlers::options),
        )
        .route(
            "/api/upload/",
            post(handlers::create).options(handlers::options),
        )
        .route(
            "/api/upload/:id",
            patch(handlers::append)
                .head(handlers::head)
                .delete(handlers::terminate),
        )
        .with_state(state)
        .layer(cors_layer())
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            HeaderName::from_static("location"),
            HeaderName::from_static("upload-offset"),
            HeaderName::from_static("upload-length"),
            HeaderName::from_static("upload-complete"),
            HeaderName::from_static("tus-resumable"),
            HeaderName::from_static("tus-version"),
            HeaderName::from_static("tus-extension"),
        ])
}

/// Runs the upload server until ctrl-c.
///
/// # Errors
///
/// Returns an error if the staging or mount directories cannot be created,
/// or if binding or serving fails.
pub async fn serve(config: ServerConfig, addr: SocketAddr) -> Result<()> {
    let state = Arc::new(AppState::new(config)?);
    state.store.init().await?;
    tokio::fs::create_dir_all(state.paths.mount_path()).await?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
    }
}
