use std::collections::HashMap;
use std::sync::Arc;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::models::ErrorResponse;
use crate::services::auth_service::get_auth_token;
use crate::ws::protocol::{self, ProtocolError};
use crate::ws::room::RoomCommand;
use crate::ws::sessions::Outbound;
use crate::AppState;

const MAX_ROOM_ID_LEN: usize = 256;

/// Websocket upgrade for a room.
///
/// The token is verified and room access checked here, before the upgrade.
/// The coordinator verifies the token again on `connect`.
pub async fn room_socket_handler(
    Path(room_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    ws: Option<WebSocketUpgrade>,
) -> Result<Response, Response> {
    if room_id.trim().is_empty() || room_id.len() > MAX_ROOM_ID_LEN {
        return Err(ErrorResponse::reply(StatusCode::BAD_REQUEST, "Invalid room id").into_response());
    }

    let token = get_auth_token(&headers, params.get("token").map(String::as_str))
        .map_err(|e| ErrorResponse::reply(StatusCode::UNAUTHORIZED, e).into_response())?;

    let identity = state.gate().verify(&token).map_err(|failure| {
        warn!("Upgrade to room {} refused: {}", room_id, failure);
        refuse_token(&SyncError::from(failure))
    })?;

    if !state.access().may_open(&room_id, &identity).await {
        warn!("Identity {} may not open room {}", identity.subject, room_id);
        return Err(ErrorResponse::reply(StatusCode::FORBIDDEN, "forbidden").into_response());
    }

    let Some(ws) = ws else {
        return Err(ErrorResponse::reply(
            StatusCode::UPGRADE_REQUIRED,
            "Expected WebSocket upgrade request",
        )
        .into_response());
    };

    info!("New WebSocket connection for room {} from {}", room_id, identity.subject);
    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, room_id, state))
        .into_response())
}

/// 401 for a token the gate refused. The code also goes into the
/// `WWW-Authenticate` challenge, which clients can read even when the
/// handshake gives them no body.
fn refuse_token(err: &SyncError) -> Response {
    let challenge = format!(
        "Bearer error=\"invalid_token\", error_description=\"{}\"",
        err.error_code()
    );
    let (status, body) = ErrorResponse::refused_token(err.error_code(), err.should_retry());
    (status, [(header::WWW_AUTHENTICATE, challenge)], body).into_response()
}

/// Pump one connection: inbound frames are decoded and queued on the room,
/// outbound frames come from the room through `Outbound`.
async fn handle_socket(mut socket: WebSocket, room_id: String, state: Arc<AppState>) {
    let conn_id = Uuid::new_v4();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();

    let room = match state.rooms.attach(&room_id, conn_id, out_tx.clone()) {
        Ok(room) => room,
        Err(e) => {
            error!("Could not attach connection {} to room {}: {}", conn_id, room_id, e);
            if let Ok(text) = protocol::encode(&e.to_envelope()) {
                let _ = socket.send(Message::Text(text)).await;
            }
            return;
        }
    };
    info!("Connection {} attached to room {}", conn_id, room_id);

    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(out) = out_rx.recv().await {
            match out {
                Outbound::Text(frame) => {
                    if sender.send(Message::Text(frame.to_string())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let close = CloseFrame { code, reason: reason.into() };
                    let _ = sender.send(Message::Close(Some(close))).await;
                    break;
                }
            }
        }
    });

    let inbound_room = room.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(frame) = receiver.next().await {
            let decoded = match frame {
                Ok(Message::Text(text)) => protocol::decode_client(&text),
                Ok(Message::Binary(_)) => Err(ProtocolError::BinaryFrame),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!("Transport error on connection {}: {}", conn_id, e);
                    break;
                }
            };

            match decoded {
                Ok(message) => {
                    if inbound_room.send(RoomCommand::Inbound { conn_id, message }).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // Soft failure: answer the offending connection and keep reading.
                    let err = SyncError::MalformedMessage(e);
                    warn!("Connection {}: {}", conn_id, err);
                    if let Ok(text) = protocol::encode(&err.to_envelope()) {
                        let _ = out_tx.send(Outbound::Text(Arc::from(text)));
                    }
                }
            }
        }
    });

    // Wait for either task to finish (and finish the other)
    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    };

    let _ = room.send(RoomCommand::Detach { conn_id });
    info!("Connection {} to room {} terminated", conn_id, room_id);
}
