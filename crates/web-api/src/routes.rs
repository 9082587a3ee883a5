use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use application::SendMessageRequest;
use domain::{
    ChangeFilter, Connection, ConnectionId, DeviceId, DisplayName, Identity, Message,
    MessageDraft, Participant, PartnerInfo, Room, RoomId, SessionId,
};

use crate::{error::ApiError, state::AppState};

#[derive(Debug, Deserialize)]
struct MatchPayload {
    identity: Identity,
    /// 标签页会话令牌，缺省时由服务端生成
    session_id: Option<SessionId>,
}

#[derive(Debug, Serialize)]
struct MatchResponse {
    room: Room,
    participant: Participant,
    partner: Option<PartnerInfo>,
    heartbeat_interval_secs: u64,
}

#[derive(Debug, Deserialize)]
struct SendMessagePayload {
    participant_id: DisplayName,
    device_id: DeviceId,
    #[serde(flatten)]
    draft: MessageDraft,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    after: Option<u64>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct LeavePayload {
    device_id: DeviceId,
}

#[derive(Debug, Serialize)]
struct LeaveResponse {
    room_ended: Option<Room>,
    connection: Option<Connection>,
}

#[derive(Debug, Deserialize)]
struct HeartbeatPayload {
    device_id: DeviceId,
    session_id: SessionId,
}

#[derive(Debug, Serialize)]
struct ReconnectResponse {
    room: Room,
    participant: Participant,
    connection: Connection,
    heartbeat_interval_secs: u64,
}

#[derive(Debug, Deserialize)]
struct FavoritePayload {
    favorite: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/match", post(find_match))
        .route(
            "/rooms/{room_id}/messages",
            post(send_message).get(get_history),
        )
        .route("/rooms/{room_id}/participants", get(list_participants))
        .route("/rooms/{room_id}/participants/active", get(list_active))
        .route("/rooms/{room_id}/leave", post(leave_room))
        .route("/rooms/{room_id}/heartbeat", post(heartbeat))
        .route("/rooms/{room_id}/events", get(websocket_upgrade))
        .route("/devices/{device_id}/connections", get(list_connections))
        .route("/connections/{connection_id}/reconnect", post(reconnect))
        .route("/connections/{connection_id}/favorite", put(set_favorite))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn find_match(
    State(state): State<AppState>,
    Json(payload): Json<MatchPayload>,
) -> Result<Json<MatchResponse>, ApiError> {
    let session_id = payload.session_id.unwrap_or_else(SessionId::random);
    let outcome = state
        .matcher
        .find_or_create_room(&payload.identity, session_id)
        .await?;

    Ok(Json(MatchResponse {
        room: outcome.room,
        participant: outcome.participant,
        partner: outcome.partner,
        heartbeat_interval_secs: state.heartbeat_interval_secs,
    }))
}

async fn send_message(
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
    Json(payload): Json<SendMessagePayload>,
) -> Result<Response, ApiError> {
    let sent = state
        .channel
        .send(SendMessageRequest {
            room_id,
            participant_id: payload.participant_id,
            device_id: payload.device_id,
            draft: payload.draft,
        })
        .await?;

    // 空消息静默丢弃
    Ok(match sent {
        Some(message) => (StatusCode::CREATED, Json(message)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

async fn get_history(
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Message>>, ApiError> {
    if query.limit == Some(0) {
        return Err(ApiError::bad_request("limit must be greater than 0"));
    }
    let items = state
        .channel
        .history(room_id, query.after, query.limit)
        .await?;

    Ok(Json(items))
}

async fn list_participants(
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
) -> Result<Json<Vec<Participant>>, ApiError> {
    Ok(Json(state.registry.list_members(room_id).await?))
}

async fn list_active(
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
) -> Result<Json<Vec<DisplayName>>, ApiError> {
    Ok(Json(state.registry.list_active(room_id).await?))
}

async fn leave_room(
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
    Json(payload): Json<LeavePayload>,
) -> Result<Json<LeaveResponse>, ApiError> {
    let outcome = state
        .reconnection
        .leave_chat(room_id, payload.device_id)
        .await?;

    Ok(Json(LeaveResponse {
        room_ended: outcome.leave.room_ended,
        connection: outcome.connection,
    }))
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
    Json(payload): Json<HeartbeatPayload>,
) -> Result<Json<Participant>, ApiError> {
    let participant = state
        .registry
        .heartbeat(room_id, payload.device_id, payload.session_id)
        .await?;

    Ok(Json(participant))
}

async fn list_connections(
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
) -> Result<Json<Vec<Connection>>, ApiError> {
    Ok(Json(state.reconnection.list_history(device_id).await?))
}

async fn reconnect(
    State(state): State<AppState>,
    Path(connection_id): Path<ConnectionId>,
    Json(payload): Json<MatchPayload>,
) -> Result<Json<ReconnectResponse>, ApiError> {
    let connection = state.reconnection.find_connection(connection_id).await?;
    let session_id = payload.session_id.unwrap_or_else(SessionId::random);
    let outcome = state
        .reconnection
        .reconnect(&connection, &payload.identity, session_id)
        .await?;

    Ok(Json(ReconnectResponse {
        room: outcome.room,
        participant: outcome.participant,
        connection: outcome.connection,
        heartbeat_interval_secs: state.heartbeat_interval_secs,
    }))
}

async fn set_favorite(
    State(state): State<AppState>,
    Path(connection_id): Path<ConnectionId>,
    Json(payload): Json<FavoritePayload>,
) -> Result<Json<Connection>, ApiError> {
    let connection = state
        .reconnection
        .set_favorite(connection_id, payload.favorite)
        .await?;

    Ok(Json(connection))
}

async fn websocket_upgrade(
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| websocket_handler(socket, state, room_id))
}

/// 把房间内的所有变更事件以 JSON 文本帧推给客户端。
async fn websocket_handler(socket: WebSocket, state: AppState, room_id: RoomId) {
    let mut subscription = state.bus.subscribe(ChangeFilter::AnyInRoom(room_id));
    let (mut sender, mut incoming) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            let payload = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(err) => {
                    tracing::warn!(error = %err, "事件序列化失败");
                    continue;
                }
            };
            if sender.send(WsMessage::Text(payload.into())).await.is_err() {
                break;
            }
        }
        if subscription.lagged() > 0 {
            tracing::debug!(room_id = %room_id, lagged = subscription.lagged(), "订阅者曾落后");
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = incoming.next().await {
            if matches!(message, WsMessage::Close(_)) {
                break;
            }
        }
    });

    // 任一方向结束即关闭整条连接
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    tracing::debug!(room_id = %room_id, "事件流连接关闭");
}
