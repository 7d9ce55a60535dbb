use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use tracing::debug;
use transport_tunnel::proto::{FetchQuery, OfflineQuery, PostCandidateRequest, PostSdpRequest};

use crate::state::RelayState;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
    sessions: usize,
}

pub async fn health_check(State(state): State<RelayState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        sessions: state.session_count(),
    })
}

pub async fn post_sdp(
    State(state): State<RelayState>,
    Json(request): Json<PostSdpRequest>,
) -> StatusCode {
    if request.name.is_empty() || request.id.is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    debug!(
        name = %request.name,
        id = %request.id,
        sdp_type = request.sdp.sdp_type.as_str(),
        "description published"
    );
    state.publish_description(&request.name, &request.id, request.sdp);
    StatusCode::OK
}

pub async fn post_candidate(
    State(state): State<RelayState>,
    Json(request): Json<PostCandidateRequest>,
) -> StatusCode {
    if request.name.is_empty() || request.id.is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    state.publish_candidate(&request.name, &request.id, request.sdp_type, request.ice);
    StatusCode::OK
}

/// `200` with pending material, or `203` when nothing arrived in time.
pub async fn fetch(State(state): State<RelayState>, Query(query): Query<FetchQuery>) -> Response {
    if query.name.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }
    match state
        .fetch(&query.name, query.sdp_type, query.session_id())
        .await
    {
        Some(response) => Json(response).into_response(),
        None => StatusCode::NON_AUTHORITATIVE_INFORMATION.into_response(),
    }
}

pub async fn offline(State(state): State<RelayState>, Query(query): Query<OfflineQuery>) -> StatusCode {
    state.remove_session(&query.name, &query.id);
    StatusCode::OK
}
