use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};

use crate::collector::Collector;
use crate::manager::node_state;
use crate::slot::{SlotRecord, State as SlotState};

#[derive(Clone)]
pub struct DashboardState {
    pub collector: Arc<dyn Collector>,
}

#[derive(Serialize)]
struct SlotSummary {
    name: String,
    state: Option<String>,
    activity: Option<String>,
    cpus: Option<f64>,
    memory_mb: Option<f64>,
    remote_user: Option<String>,
    draining: bool,
}

impl From<&SlotRecord> for SlotSummary {
    fn from(record: &SlotRecord) -> Self {
        let text = |name: &str| {
            record
                .public
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        Self {
            name: record.name.clone(),
            state: text("State"),
            activity: text("Activity"),
            cpus: record.number("Cpus"),
            memory_mb: record.number("Memory"),
            remote_user: text("RemoteUser"),
            draining: record
                .public
                .get("Draining")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
    }
}

#[derive(Serialize)]
struct SlotsResponse {
    state: SlotState,
    slots: Vec<SlotSummary>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index_handler))
        .route("/api/slots", get(list_slots_handler))
        .route("/api/slots/:name", get(slot_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

const INDEX: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>slotd</title></head>
<body>
<h1>Slots</h1>
<table id="slots"><thead><tr>
<th>Name</th><th>State</th><th>Activity</th><th>Cpus</th><th>Memory</th><th>User</th>
</tr></thead><tbody></tbody></table>
<script>
async function refresh() {
  const res = await fetch('/api/slots');
  const body = await res.json();
  const rows = body.slots.map(s =>
    `<tr><td>${s.name}</td><td>${s.state ?? ''}</td><td>${s.activity ?? ''}</td>` +
    `<td>${s.cpus ?? ''}</td><td>${s.memory_mb ?? ''}</td><td>${s.remote_user ?? ''}</td></tr>`);
  document.querySelector('#slots tbody').innerHTML = rows.join('');
}
refresh();
setInterval(refresh, 5000);
</script>
</body>
</html>
"#;

async fn index_handler() -> Html<&'static str> {
    Html(INDEX)
}

async fn list_slots_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let records = state.collector.records();
    Json(SlotsResponse {
        state: node_state(records.iter().filter_map(SlotRecord::state)),
        slots: records.iter().map(SlotSummary::from).collect(),
    })
}

/// Full public record of one slot. The private half never leaves the collector.
async fn slot_handler(
    State(state): State<DashboardState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.collector.get(&name) {
        Some(record) => (StatusCode::OK, Json(Value::Object(record.public))).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("no slot named {}", name),
            }),
        )
            .into_response(),
    }
}
