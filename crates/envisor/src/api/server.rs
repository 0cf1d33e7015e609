use std::sync::Arc;

use error_stack::Report;
use poem::get;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Route;
use poem::Server;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::errors::ApiError;
use super::handlers::get_environment;
use super::handlers::get_snapshot;
use super::handlers::get_view;
use super::handlers::healthz;
use super::handlers::list_environments;
use super::handlers::ApiState;

/// Read-only HTTP API over the host registry
pub struct ApiServer {
    state: Arc<ApiState>,
    listen_addr: String,
}

/// Routes served by [`ApiServer`]
pub fn routes(state: Arc<ApiState>) -> impl Endpoint {
    Route::new()
        .at("/api/v1/environments", get(list_environments))
        .at("/api/v1/environments/:eid", get(get_environment))
        .at("/api/v1/views/:pid", get(get_view))
        .at("/api/v1/snapshot", get(get_snapshot))
        .at("/healthz", get(healthz))
        .data(state)
        .with(Tracing)
}

impl ApiServer {
    pub fn new(state: Arc<ApiState>, listen_addr: String) -> Self {
        Self { state, listen_addr }
    }

    /// Serves until `cancellation_token` is cancelled.
    ///
    /// # Errors
    ///
    /// - [`ApiError::ServerError`] if the server fails to start or bind to the address
    pub async fn run(self, cancellation_token: CancellationToken) -> Result<(), Report<ApiError>> {
        info!("Starting HTTP API server on {}", self.listen_addr);

        let app = routes(self.state);
        let listener = TcpListener::bind(&self.listen_addr);
        let server = Server::new(listener);

        tokio::select! {
            result = server.run(app) => {
                match result {
                    Ok(()) => {
                        info!("API server stopped normally");
                        Ok(())
                    }
                    Err(e) => {
                        error!("API server failed: {e}");
                        Err(Report::new(ApiError::ServerError {
                            message: format!("Server failed: {e}"),
                        }))
                    }
                }
            }
            _ = cancellation_token.cancelled() => {
                info!("API server shutdown requested");
                Ok(())
            }
        }
    }
}
