//! HTTP routes of the API server
//!
//! - `GET /healthz` liveness probe
//! - `GET /version` build and host information
//! - `GET|POST /api/{namespace}/darkrooms`
//! - `GET|DELETE /api/{namespace}/darkrooms/{name}`

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use kube::ResourceExt;
use serde::Serialize;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{debug, warn};

use darkroom_common::crd::{Darkroom, DeployState, SourceType};
use darkroom_common::metrics::record_api_request;

use crate::error::ApiError;
use crate::store::DarkroomStore;

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    /// Backing store for Darkroom objects
    pub store: Arc<dyn DarkroomStore>,
    /// Served on `/version`
    pub version: VersionInfo,
}

/// Body of `GET /version`
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct VersionInfo {
    /// Host the API server runs on
    pub hostname: String,
    /// Product name
    pub tagline: String,
    /// Build version
    pub version: String,
}

impl VersionInfo {
    /// Version info for this build on the current host
    pub fn current() -> Self {
        Self {
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
            tagline: "Darkroom Operator".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Condensed view of a Darkroom returned by the list endpoint
#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DarkroomSummary {
    /// Object name
    pub name: String,
    /// Image version
    pub version: String,
    /// Source backend
    pub source: SourceSummary,
    /// Served domains
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<String>,
    /// Reported rollout state
    #[serde(skip_serializing_if = "is_unknown")]
    pub deploy_state: DeployState,
}

/// Source part of a [`DarkroomSummary`]
#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceSummary {
    /// Backend kind
    #[serde(rename = "type")]
    pub type_: SourceType,
    /// Base URL for web folders
    #[serde(skip_serializing_if = "String::is_empty")]
    pub base_url: String,
}

fn is_unknown(state: &DeployState) -> bool {
    *state == DeployState::Unknown
}

impl From<&Darkroom> for DarkroomSummary {
    fn from(darkroom: &Darkroom) -> Self {
        let status = darkroom.status.clone().unwrap_or_default();
        Self {
            name: darkroom.name_any(),
            version: darkroom.spec.version.clone(),
            source: SourceSummary {
                type_: darkroom.spec.source.source_type(),
                base_url: darkroom.spec.source.base_url().to_string(),
            },
            domains: darkroom.spec.domains.clone(),
            deploy_state: status.deploy_state,
        }
    }
}

/// Body of `GET /api/{namespace}/darkrooms`
#[derive(Debug, Serialize, PartialEq)]
pub struct DarkroomList {
    /// One entry per Darkroom
    pub items: Vec<DarkroomSummary>,
}

/// Build the API router
///
/// CORS headers are only added when `allowed_origins` is non-empty.
pub fn router(state: AppState, allowed_origins: &[String]) -> Router {
    let api = Router::new()
        .route(
            "/{namespace}/darkrooms",
            get(list_darkrooms).post(create_darkroom),
        )
        .route(
            "/{namespace}/darkrooms/{name}",
            get(get_darkroom).delete(delete_darkroom),
        );

    let router = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/version", get(version))
        .nest("/api", api)
        .with_state(state);

    match cors_layer(allowed_origins) {
        Some(cors) => router.layer(cors),
        None => router,
    }
}

fn cors_layer(allowed_origins: &[String]) -> Option<CorsLayer> {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring unparsable CORS origin");
                None
            }
        })
        .collect();
    if origins.is_empty() {
        return None;
    }
    Some(CorsLayer::new().allow_origin(AllowOrigin::list(origins)))
}

fn observe(verb: &'static str, response: Response) -> Response {
    record_api_request(verb, response.status().as_u16());
    response
}

// =============================================================================
// Handlers
// =============================================================================

async fn version(State(state): State<AppState>) -> Json<VersionInfo> {
    Json(state.version)
}

async fn list_darkrooms(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
) -> Response {
    let response = match state.store.list(&namespace).await {
        Ok(items) => Json(DarkroomList {
            items: items.iter().map(DarkroomSummary::from).collect(),
        })
        .into_response(),
        Err(e) => ApiError::new("Unable to list darkrooms instances", &e).into_response(),
    };
    observe("list", response)
}

async fn get_darkroom(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    let response = match state.store.get(&namespace, &name).await {
        Ok(darkroom) => Json(darkroom).into_response(),
        Err(e) => ApiError::new(format!("Unable to get instance {name}"), &e).into_response(),
    };
    observe("get", response)
}

async fn create_darkroom(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    body: Result<Json<Darkroom>, JsonRejection>,
) -> Response {
    const FAILURE: &str = "Unable to create instance";

    let mut darkroom = match body {
        Ok(Json(darkroom)) => darkroom,
        Err(rejection @ JsonRejection::MissingJsonContentType(_)) => {
            return observe("create", rejection.into_response());
        }
        Err(rejection) => {
            return observe(
                "create",
                ApiError::malformed(FAILURE, rejection.body_text()).into_response(),
            );
        }
    };

    darkroom.spec.apply_defaults();
    if let Err(e) = darkroom.validate_admission() {
        debug!(error = %e, "rejected darkroom");
        return observe("create", ApiError::new(FAILURE, &e.into()).into_response());
    }
    darkroom.metadata.namespace = Some(namespace);

    let response = match state.store.create(&darkroom).await {
        Ok(created) => (StatusCode::CREATED, Json(created)).into_response(),
        Err(e) => ApiError::new(FAILURE, &e).into_response(),
    };
    observe("create", response)
}

async fn delete_darkroom(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    let response = match state.store.delete(&namespace, &name).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => ApiError::new(format!("Unable to delete instance {name}"), &e).into_response(),
    };
    observe("delete", response)
}
