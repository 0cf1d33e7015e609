use std::sync::Arc;

use api_types::Eid;
use api_types::EnvironmentFilter;
use api_types::EnvironmentListResponse;
use api_types::EnvironmentResponse;
use api_types::HostSnapshot;
use api_types::ViewResponse;
use poem::handler;
use poem::http::StatusCode;
use poem::web::Data;
use poem::web::Json;
use poem::web::Path;
use poem::web::Query;
use registry::Registry;
use registry::RegistryError;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;
use tracing::warn;
use utils::process::ProcessProbe;

use super::errors::registry_error;
use crate::domain::enforcement::EngineState;
use crate::domain::enforcement::EnforcementEngine;

/// Everything the handlers read from
pub struct ApiState {
    pub registry: Registry,
    pub probe: Arc<dyn ProcessProbe>,
    pub engine: Option<Arc<EnforcementEngine>>,
    pub hostname: Option<String>,
}

/// Query parameters for listing environments
#[derive(Debug, Default, Deserialize)]
pub struct EnvironmentQuery {
    pub uid: Option<u32>,
    pub username: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    /// Enforcement engine state, absent when enforcement is not running here
    pub engine_state: Option<EngineState>,
}

/// Runs a blocking registry call off the async workers.
async fn blocking<T, F>(f: F) -> poem::Result<Result<T, RegistryError>>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, RegistryError> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        poem::Error::from_string(
            format!("registry task failed: {e}"),
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    })
}

/// List environments, optionally filtered by owner and name
#[handler]
pub async fn list_environments(
    query: Query<EnvironmentQuery>,
    state: Data<&Arc<ApiState>>,
) -> poem::Result<Json<EnvironmentListResponse>> {
    let filter = EnvironmentFilter {
        uid: query.uid,
        username: query.username.clone(),
        name: query.name.clone(),
        eids: None,
    };
    let registry = state.registry.clone();
    let environments = blocking(move || registry.list_environments(&filter))
        .await?
        .map_err(registry_error)?;

    Ok(Json(EnvironmentListResponse {
        success: true,
        message: format!("{} environments", environments.len()),
        data: environments,
    }))
}

/// Get one environment
#[handler]
pub async fn get_environment(
    Path(eid): Path<String>,
    state: Data<&Arc<ApiState>>,
) -> poem::Result<Json<EnvironmentResponse>> {
    let eid = Eid::from(eid);
    let registry = state.registry.clone();
    let lookup = eid.clone();
    match blocking(move || registry.query_environment(&lookup)).await? {
        Ok(environment) => Ok(Json(EnvironmentResponse {
            success: true,
            data: Some(environment),
            message: format!("Environment {eid} retrieved successfully"),
        })),
        Err(RegistryError::UnknownEnvironment { .. }) => {
            warn!(eid = %eid, "Environment not found in registry");
            Ok(Json(EnvironmentResponse {
                success: false,
                data: None,
                message: format!("Environment {eid} not found"),
            }))
        }
        Err(e) => Err(registry_error(e)),
    }
}

/// Device view the shim would compute for a live process
#[handler]
pub async fn get_view(
    Path(pid): Path<u32>,
    state: Data<&Arc<ApiState>>,
) -> poem::Result<Json<ViewResponse>> {
    let Some(start_token) = state.probe.start_token(pid) else {
        return Ok(Json(ViewResponse {
            success: false,
            data: None,
            message: format!("Process {pid} is not running"),
        }));
    };

    let registry = state.registry.clone();
    let view = blocking(move || registry.resolve_view(pid, Some(start_token)))
        .await?
        .map_err(registry_error)?;

    Ok(Json(match view {
        Some(view) => {
            info!(pid, eid = %view.eid, "View resolved");
            ViewResponse {
                success: true,
                data: Some(view),
                message: format!("Process {pid} is bound"),
            }
        }
        None => ViewResponse {
            success: false,
            data: None,
            message: format!("Process {pid} is not bound to an environment"),
        },
    }))
}

/// Host snapshot, the same document `envisor snapshot` prints
#[handler]
pub async fn get_snapshot(state: Data<&Arc<ApiState>>) -> poem::Result<Json<HostSnapshot>> {
    let registry = state.registry.clone();
    let hostname = state.hostname.clone();
    let snapshot = blocking(move || registry.snapshot(hostname))
        .await?
        .map_err(registry_error)?;
    Ok(Json(snapshot))
}

#[handler]
pub async fn healthz(state: Data<&Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        engine_state: state.engine.as_ref().map(|engine| engine.state()),
    })
}
