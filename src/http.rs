//! HTTP and WebSocket surface of the service.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use realtime::{Error, GeoPoint, HttpError, bad_request, not_found};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;
use tracking::position::validate_unit_id;
use tracking::{
    NearbyUnit, Position, PositionRecord, PositionStore, ProximityIndex, RoutePlan, Simulator,
    StreamGateway, SyncCheckpoint, SyncStats, UpdateSink,
};

use crate::provider::LoopRoutes;

type HttpResult<T> = Result<T, HttpError>;

const DEFAULT_RADIUS_KM: f64 = 5.0;

#[derive(Clone)]
pub struct AppState {
    pub store: PositionStore,
    pub simulator: Simulator<LoopRoutes>,
    pub gateway: StreamGateway,
    pub sync: Arc<SyncCheckpoint>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/units", get(list_units))
        .route("/units/{unit_id}", get(get_unit).delete(delete_unit))
        .route("/units/{unit_id}/position", put(put_position))
        .route("/nearby", get(nearby))
        .route("/sync/stats", get(sync_stats))
        .route("/simulator/units", get(simulated_units))
        .route("/simulator/units/{unit_id}", post(add_simulated).delete(remove_simulated))
        .route("/ws/track/{unit_id}", get(track))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_units(State(state): State<AppState>) -> Json<Vec<PositionRecord>> {
    Json(state.store.list_all())
}

async fn get_unit(
    State(state): State<AppState>, Path(unit_id): Path<String>,
) -> HttpResult<Json<PositionRecord>> {
    let unit_id = validate_unit_id(&unit_id)?;
    let record = state
        .store
        .get(unit_id)
        .ok_or_else(|| not_found!("unit {unit_id} has no live position"))?;
    Ok(Json(record))
}

async fn put_position(
    State(state): State<AppState>, Path(unit_id): Path<String>, body: Bytes,
) -> HttpResult<Json<PositionRecord>> {
    let unit_id = validate_unit_id(&unit_id)?;
    let position: Position = serde_json::from_slice(&body).map_err(Error::from)?;
    let record = state.store.put(unit_id, position.validate()?);
    Ok(Json(record))
}

async fn delete_unit(
    State(state): State<AppState>, Path(unit_id): Path<String>,
) -> HttpResult<StatusCode> {
    let unit_id = validate_unit_id(&unit_id)?;

    // stop the simulation first so it cannot write the unit back
    let simulated = state.simulator.remove(unit_id).await.is_ok();
    let removed = state.store.remove(unit_id).is_some();

    if !simulated && !removed {
        return Err(not_found!("unit {unit_id} is not registered").into());
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct NearbyQuery {
    lat: f64,
    lng: f64,
    radius_km: Option<f64>,
}

async fn nearby(
    State(state): State<AppState>, Query(query): Query<NearbyQuery>,
) -> HttpResult<Json<Vec<NearbyUnit>>> {
    let radius_km = query.radius_km.unwrap_or(DEFAULT_RADIUS_KM);
    let units = ProximityIndex::new(state.store).query(query.lat, query.lng, radius_km)?;
    Ok(Json(units))
}

async fn sync_stats(State(state): State<AppState>) -> Json<SyncStats> {
    Json(state.sync.snapshot())
}

async fn simulated_units(State(state): State<AppState>) -> Json<Value> {
    let units = state.simulator.units();
    Json(json!({ "count": units.len(), "units": units }))
}

#[derive(Debug, Default, Deserialize)]
struct SimulateRequest {
    lat: Option<f64>,
    lng: Option<f64>,
    route: Option<Vec<GeoPoint>>,
}

async fn add_simulated(
    State(state): State<AppState>, Path(unit_id): Path<String>, body: Bytes,
) -> HttpResult<(StatusCode, Json<PositionRecord>)> {
    let request: SimulateRequest = if body.is_empty() {
        SimulateRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(Error::from)?
    };

    let start = match (request.lat, request.lng) {
        (Some(lat), Some(lng)) => GeoPoint { lat, lng },
        (None, None) => state.simulator.random_start(),
        _ => return Err(bad_request!("lat and lng must be given together").into()),
    };
    let plan = request.route.map_or(RoutePlan::Synthesize, RoutePlan::Explicit);

    let record = state.simulator.add(&unit_id, start, plan).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn remove_simulated(
    State(state): State<AppState>, Path(unit_id): Path<String>,
) -> HttpResult<StatusCode> {
    state.simulator.remove(&unit_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn track(
    State(state): State<AppState>, Path(unit_id): Path<String>, ws: WebSocketUpgrade,
) -> HttpResult<Response> {
    let session = state.gateway.connect(&unit_id)?;

    Ok(ws
        .on_upgrade(move |socket| async move {
            let (sender, mut receiver) = socket.split();
            let mut sink = WsSink(sender);

            let remote_closed = async move {
                while let Some(Ok(message)) = receiver.next().await {
                    if matches!(message, Message::Close(_)) {
                        break;
                    }
                }
            };

            let reason = session.run(&mut sink, remote_closed).await;
            debug!(?reason, "closing websocket");
            let _ = sink.0.close().await;
        })
        .into_response())
}

/// Writes each update as one JSON text frame.
struct WsSink(SplitSink<WebSocket, Message>);

impl UpdateSink for WsSink {
    async fn send(&mut self, record: &PositionRecord) -> anyhow::Result<()> {
        let text = serde_json::to_string(record)?;
        self.0.send(Message::Text(text.into())).await?;
        Ok(())
    }
}
