//! WebSocket handler for JSON-RPC communication.
//!
//! One request per text frame, one response frame per request. Frames
//! carrying notifications get no reply, as on the TCP transport.

use axum::{
    extract::ws::{Message, WebSocket},
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
};
use serde_json::Value;

use super::WebState;
use crate::rpc::{Request, Response};

/// Handle WebSocket upgrade requests
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WebState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn respond(state: &WebState, text: &str) -> Option<Response> {
    let request = match serde_json::from_str::<Request>(text) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(error = %e, "WebSocket parse error");
            return Some(Response::parse_error());
        }
    };

    if request.validate().is_err() {
        return Some(Response::invalid_request(
            request.id.clone().unwrap_or(Value::Null),
        ));
    }
    if request.is_notification() {
        state.handler.handle(request).await;
        return None;
    }
    Some(state.handler.handle(request).await)
}

/// Handle an established WebSocket connection
async fn handle_socket(mut socket: WebSocket, state: WebState) {
    while let Some(msg) = socket.recv().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(error = %e, "WebSocket receive error");
                break;
            }
        };

        let Some(response) = respond(&state, text.as_str()).await else {
            continue;
        };
        let json = match serde_json::to_string(&response) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize RPC response");
                continue;
            }
        };

        if socket.send(Message::Text(json.into())).await.is_err() {
            break;
        }
    }

    tracing::debug!("WebSocket connection closed");
}
