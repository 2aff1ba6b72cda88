use std::convert::Infallible;
use std::sync::Arc;

use shuttle_axum::axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::config::AggregatorConfig;
use crate::coord;
use crate::error::SearchError;
use crate::model::SearchRequest;
use crate::search::{SearchOptions, SearchResponse, SearchService};
use crate::sources::SourceAdapter;
use crate::sources::{ComprasnetAdapter, PncpAdapter, TransparenciaAdapter};
use crate::summary::DisabledSummaryClient;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SearchService>,
}

impl AppState {
    /// Wire the production adapter set from config + environment. Sources
    /// whose credentials are absent are skipped, not stubbed.
    pub fn from_config(cfg: AggregatorConfig) -> anyhow::Result<Self> {
        let coordination = coord::from_config(&cfg.coordination)?;
        let client = reqwest::Client::builder()
            .user_agent("licita-radar/0.1")
            .build()?;

        let mut adapters: Vec<Arc<dyn SourceAdapter>> = vec![
            Arc::new(PncpAdapter::from_url(
                env_or("PNCP_BASE_URL", "https://pncp.gov.br/api/consulta"),
                client.clone(),
            )),
            Arc::new(ComprasnetAdapter::from_url(
                env_or("COMPRASNET_BASE_URL", "https://compras.dados.gov.br"),
                client.clone(),
            )),
        ];
        match std::env::var("TRANSPARENCIA_API_KEY") {
            Ok(key) if !key.is_empty() => {
                adapters.push(Arc::new(TransparenciaAdapter::from_url(
                    env_or(
                        "TRANSPARENCIA_BASE_URL",
                        "https://api.portaldatransparencia.gov.br",
                    ),
                    key,
                    client,
                )));
            }
            _ => warn!("TRANSPARENCIA_API_KEY not set; transparencia source disabled"),
        }

        Ok(Self {
            service: Arc::new(SearchService::new(
                adapters,
                coordination,
                Arc::new(DisabledSummaryClient),
                cfg,
            )),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/search", post(run_search))
        .route("/search/{id}/cancel", post(cancel_search))
        .route("/progress/{id}", get(progress_stream))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

#[derive(serde::Deserialize)]
struct SearchBody {
    #[serde(flatten)]
    request: SearchRequest,
    #[serde(default)]
    force_refresh: bool,
    #[serde(default)]
    search_id: Option<String>,
}

#[derive(serde::Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    unavailable_sources: Vec<String>,
}

struct ApiError(SearchError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self.0 {
            SearchError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    error: msg,
                    unavailable_sources: Vec::new(),
                },
            ),
            SearchError::AllSourcesUnavailable(sources) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorBody {
                    error: "all sources unavailable".to_string(),
                    unavailable_sources: sources,
                },
            ),
        };
        (status, Json(body)).into_response()
    }
}

async fn run_search(
    State(state): State<AppState>,
    Json(body): Json<SearchBody>,
) -> Result<Json<SearchResponse>, ApiError> {
    let opts = SearchOptions {
        force_refresh: body.force_refresh,
        search_id: body.search_id,
    };
    let response = state
        .service
        .search(body.request, opts)
        .await
        .map_err(ApiError)?;
    Ok(Json(response))
}

async fn cancel_search(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    if state.service.cancel(&id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// SSE feed of per-region progress; late joiners get the catch-up snapshot
/// first, then live events.
async fn progress_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let rx = state
        .service
        .subscribe(&id)
        .await
        .map_err(|e| {
            warn!(search_id = %id, error = %e, "progress subscribe failed");
            StatusCode::SERVICE_UNAVAILABLE
        })?;

    let stream = ReceiverStream::new(rx).map(|event| {
        Ok(Event::default()
            .event("progress")
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().data("{}")))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
