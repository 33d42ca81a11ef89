//! WebSocket ingress: upgrade, identity, and the axum transport halves.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use relay_core::{
    ConnectionId, FrameKind, FrameReader, FrameWriter, Inbound, Payload, TransportError,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::connection::spawn_pumps;
use crate::server::AppState;

/// Reasons a handshake is refused. Each affects only its own request.
#[derive(Debug, Error)]
pub enum IngressError {
    /// No usable `Sec-WebSocket-Key` header.
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,
    /// The key header is not valid UTF-8.
    #[error("Sec-WebSocket-Key header is not valid UTF-8")]
    InvalidKey,
    /// The request is not a valid WebSocket upgrade.
    #[error(transparent)]
    Upgrade(#[from] WebSocketUpgradeRejection),
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        match self {
            Self::Upgrade(rejection) => rejection.into_response(),
            other => (StatusCode::BAD_REQUEST, other.to_string()).into_response(),
        }
    }
}

/// Identity of the connection being upgraded: the client's handshake key.
pub fn connection_id_from_headers(headers: &HeaderMap) -> Result<ConnectionId, IngressError> {
    let value = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .ok_or(IngressError::MissingKey)?;
    let key = value.to_str().map_err(|_| IngressError::InvalidKey)?;
    if key.is_empty() {
        return Err(IngressError::MissingKey);
    }
    Ok(ConnectionId::from(key))
}

/// `GET {ws_path}` handler.
pub async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, IngressError> {
    let upgrade = upgrade.inspect_err(|e| {
        warn!(error = %e, "websocket handshake rejected");
    })?;
    let id = connection_id_from_headers(&headers).inspect_err(|e| {
        warn!(error = %e, "websocket handshake rejected");
    })?;

    let max_message_size = state.settings.max_message_size;
    let response = upgrade
        .max_message_size(max_message_size)
        .max_frame_size(max_message_size)
        .on_failed_upgrade({
            let id = id.clone();
            move |e| warn!(conn_id = %id, error = %e, "websocket upgrade failed")
        })
        .on_upgrade(move |socket| admit(state, id, socket));
    Ok(response)
}

async fn admit(state: AppState, id: ConnectionId, socket: WebSocket) {
    let (sink, stream) = socket.split();
    let coordinator = state.coordinator.clone();
    let (connection, mailbox) = coordinator.connect(id);
    let handle = Arc::clone(connection.handle());

    debug!(conn_id = %handle.id(), generation = handle.generation(), "websocket upgraded");
    if let Err(e) = coordinator.join(connection) {
        warn!(conn_id = %handle.id(), error = %e, "cannot admit connection");
        return;
    }

    let _pumps = spawn_pumps(
        handle,
        WsReader { stream },
        WsWriter { sink },
        mailbox,
        coordinator,
        state.settings.idle_timeout(),
    );
}

/// Receiving half of an axum WebSocket.
pub struct WsReader {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameReader for WsReader {
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        let Some(message) = self.stream.next().await else {
            return Ok(None);
        };
        let inbound = match message.map_err(|e| TransportError::Protocol(e.to_string()))? {
            Message::Text(text) => Inbound::Frame(Payload::text_bytes(text)),
            Message::Binary(data) => Inbound::Frame(Payload::binary(data)),
            Message::Close(_) => return Ok(None),
            // Pongs are sent by the protocol layer; the ping still counts as
            // activity.
            Message::Ping(_) | Message::Pong(_) => Inbound::KeepAlive,
        };
        Ok(Some(inbound))
    }
}

/// Sending half of an axum WebSocket.
pub struct WsWriter {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameWriter for WsWriter {
    async fn send(&mut self, payload: Payload) -> Result<(), TransportError> {
        let message = match payload.kind() {
            FrameKind::Text => Message::Text(
                Utf8Bytes::try_from(payload.into_bytes())
                    .map_err(|e| TransportError::Protocol(e.to_string()))?,
            ),
            FrameKind::Binary => Message::Binary(payload.into_bytes()),
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn key_header_becomes_id() {
        let mut headers = HeaderMap::new();
        let _ = headers.insert(
            header::SEC_WEBSOCKET_KEY,
            HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="),
        );
        let id = connection_id_from_headers(&headers).unwrap();
        assert_eq!(id.as_str(), "dGhlIHNhbXBsZSBub25jZQ==");
    }

    #[test]
    fn missing_key_rejected() {
        let headers = HeaderMap::new();
        assert!(matches!(
            connection_id_from_headers(&headers),
            Err(IngressError::MissingKey)
        ));
    }

    #[test]
    fn empty_key_rejected() {
        let mut headers = HeaderMap::new();
        let _ = headers.insert(header::SEC_WEBSOCKET_KEY, HeaderValue::from_static(""));
        assert!(matches!(
            connection_id_from_headers(&headers),
            Err(IngressError::MissingKey)
        ));
    }

    #[test]
    fn non_utf8_key_rejected() {
        let mut headers = HeaderMap::new();
        let _ = headers.insert(
            header::SEC_WEBSOCKET_KEY,
            HeaderValue::from_bytes(&[0xff, 0xfe]).unwrap(),
        );
        assert!(matches!(
            connection_id_from_headers(&headers),
            Err(IngressError::InvalidKey)
        ));
    }

    #[test]
    fn key_errors_are_bad_request() {
        assert_eq!(
            IngressError::MissingKey.into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            IngressError::InvalidKey.into_response().status(),
            StatusCode::BAD_REQUEST
        );
    }
}
