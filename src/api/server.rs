//! API server using Axum
//!
//! Serves the REST endpoints and upgrades `/api/ws` into the hub.

use std::net::SocketAddr;
use std::time::Instant;

use axum::extract::FromRef;
use axum::Router;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

use crate::config::Config;
use crate::database::Database;
use crate::error::{AppError, Result};
use crate::hub::HubHandle;

use super::middleware::{cors_layer, JwtAuth, RequestLogging};
use super::routes;

/// Shared state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Config,
    pub jwt_auth: JwtAuth,
    pub started_at: Instant,
    pub hub: HubHandle,
}

impl AppState {
    pub fn new(config: Config, db: Database, hub: HubHandle) -> Result<Self> {
        let jwt_auth = JwtAuth::new(&config.api.jwt_secret)?;

        Ok(Self {
            db,
            config,
            jwt_auth,
            started_at: Instant::now(),
            hub,
        })
    }
}

impl FromRef<AppState> for JwtAuth {
    fn from_ref(state: &AppState) -> Self {
        state.jwt_auth.clone()
    }
}

/// API server
pub struct ApiServer {
    state: AppState,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(config: Config, db: Database, hub: HubHandle) -> Result<Self> {
        Ok(Self {
            state: AppState::new(config, db, hub)?,
        })
    }

    /// Build the router with the full middleware stack
    pub fn build_router(state: AppState) -> Router {
        let cors = cors_layer(&state.config.api.cors_origins);

        routes::create_router(state)
            .layer(axum::middleware::from_fn(RequestLogging::log_request))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Run the API server until `shutdown` flips
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = self.state.config.api_addr().parse().map_err(|_| {
            AppError::InvalidConfig(format!(
                "Invalid API server address: {}",
                self.state.config.api_addr()
            ))
        })?;

        let router = Self::build_router(self.state.clone());

        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("API server listening on {}", addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await?;

        info!("API server shut down");
        Ok(())
    }
}
