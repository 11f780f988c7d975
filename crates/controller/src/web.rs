//! Read-only diagnostics over HTTP. Mutations go through the attribute
//! endpoints only.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::history::store::RecordSet;
use crate::history::{Granularity, HistoryStore};
use crate::state::SharedState;

/// Cap on records returned by one history request.
pub const MAX_HISTORY_ROWS: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub history: Arc<Mutex<HistoryStore>>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(app: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/history/{granularity}", get(api_history))
        .with_state(app)
}

async fn api_status(State(app): State<AppState>) -> impl IntoResponse {
    let st = app.shared.read().await;
    Json(st.to_status())
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    start: Option<u32>,
    end: Option<u32>,
    max: Option<usize>,
}

#[derive(Serialize)]
struct HistoryBody {
    count: usize,
    #[serde(flatten)]
    records: RecordSet,
}

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.1 });
        (self.0, Json(body)).into_response()
    }
}

async fn api_history(
    State(app): State<AppState>,
    Path(granularity): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<HistoryBody>, ApiError> {
    let g: Granularity = granularity
        .parse()
        .map_err(|e: String| ApiError(StatusCode::NOT_FOUND, e))?;
    let start = q.start.unwrap_or(0);
    let end = q.end.unwrap_or(u32::MAX);
    if start > end {
        return Err(ApiError(
            StatusCode::BAD_REQUEST,
            format!("start {start} is after end {end}"),
        ));
    }
    let max = q.max.unwrap_or(MAX_HISTORY_ROWS).min(MAX_HISTORY_ROWS);

    let records = app
        .history
        .lock()
        .await
        .get_range(g, start, end, max)
        .map_err(|e| {
            warn!(granularity = %g, "web: history query failed: {e}");
            ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;
    Ok(Json(HistoryBody {
        count: records.len(),
        records,
    }))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(app: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "web: diagnostics listening");

    axum::serve(listener, router(app))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::bucket::DAY_SECS;
    use crate::history::entry::DailyEntry;
    use crate::history::kv::MemKv;
    use crate::history::store::Capacities;
    use crate::state;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    fn app() -> AppState {
        let store = HistoryStore::with_kv(Arc::new(MemKv::new()), Capacities::default()).unwrap();
        AppState {
            shared: state::shared(),
            history: Arc::new(Mutex::new(store)),
        }
    }

    async fn get_json(app: AppState, uri: &str) -> (StatusCode, Value) {
        let resp = router(app)
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn status_lists_events() {
        let app = app();
        app.shared
            .write()
            .await
            .record_system("controller started".to_string());

        let (status, body) = get_json(app, "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["events"][0]["kind"], "system");
        assert_eq!(body["events"][0]["detail"], "controller started");
        assert!(body["history"].is_null());
    }

    #[tokio::test]
    async fn history_range_as_json() {
        let app = app();
        {
            let mut h = app.history.lock().await;
            for d in 1..=3 {
                h.add_daily(DailyEntry {
                    timestamp: d * DAY_SECS,
                    sample_count: 24,
                    ..Default::default()
                })
                .unwrap();
            }
        }

        let uri = format!("/api/history/daily?start={}&max=5", 2 * DAY_SECS);
        let (status, body) = get_json(app, &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["granularity"], "daily");
        assert_eq!(body["count"], 2);
        assert_eq!(body["records"][0]["timestamp"], 2 * DAY_SECS);
    }

    #[tokio::test]
    async fn history_rejects_bad_input() {
        let (status, body) = get_json(app(), "/api/history/weekly").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("weekly"));

        let (status, _) = get_json(app(), "/api/history/hourly?start=10&end=5").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
