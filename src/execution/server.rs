//! WebSocket endpoint for resize units.
//!
//! - `GET /units`: upgrade; one socket is one unit connection
//! - `GET /ping`: liveness

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::dispatcher::DispatcherHandle;
use super::transport::UnitMessage;
use super::worker_pool::ConnectionId;
use crate::error::RszrError;

#[derive(Debug, Clone)]
struct ServerState {
    dispatcher: DispatcherHandle,
    shutdown: broadcast::Sender<()>,
}

pub fn router(dispatcher: DispatcherHandle, shutdown: broadcast::Sender<()>) -> Router {
    Router::new()
        .route("/units", get(units_handler))
        .route("/ping", get(ping_handler))
        .with_state(ServerState {
            dispatcher,
            shutdown,
        })
}

/// Serve units until `shutdown` fires; open unit sockets are closed first
pub async fn serve(
    listener: TcpListener,
    dispatcher: DispatcherHandle,
    shutdown: broadcast::Sender<()>,
) -> Result<(), RszrError> {
    let address = listener.local_addr()?;
    let mut stop = shutdown.subscribe();
    let app = router(dispatcher, shutdown);

    info!(address = %address, "🌐 Unit server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = stop.recv().await;
        })
        .await
        .map_err(|e| RszrError::server(e.to_string()))?;
    info!("Unit server stopped");
    Ok(())
}

async fn ping_handler() -> StatusCode {
    StatusCode::OK
}

async fn units_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> impl IntoResponse {
    let shutdown = state.shutdown.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, state.dispatcher, shutdown))
}

async fn handle_socket(
    socket: WebSocket,
    dispatcher: DispatcherHandle,
    mut shutdown: broadcast::Receiver<()>,
) {
    let (connection_id, mut frames) = match dispatcher.unit_connected() {
        Ok(registered) => registered,
        Err(e) => {
            error!(error = %e, "Refusing unit connection");
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(message) = frames.recv().await {
            let text = match message.encode() {
                Ok(text) => text,
                Err(e) => {
                    error!(connection_id = %connection_id, error = %e, "Frame encoding failed");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                debug!(connection_id = %connection_id, "Unit sink closed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let failure = loop {
        tokio::select! {
            _ = shutdown.recv() => break None,
            next = stream.next() => match next {
                Some(Ok(Message::Text(text))) => handle_frame(&dispatcher, connection_id, text.as_str()),
                Some(Ok(Message::Close(_))) | None => break None,
                Some(Ok(Message::Binary(_))) => {
                    debug!(connection_id = %connection_id, "Ignoring binary frame");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(e.to_string()),
            }
        }
    };

    send_task.abort();
    let result = match failure {
        None => dispatcher.unit_disconnected(connection_id),
        Some(e) => {
            warn!(connection_id = %connection_id, error = %e, "Unit socket error");
            dispatcher.unit_errored(connection_id, e)
        }
    };
    if let Err(e) = result {
        debug!(connection_id = %connection_id, error = %e, "Dispatcher gone before disconnect");
    }
}

fn handle_frame(dispatcher: &DispatcherHandle, connection_id: ConnectionId, frame: &str) {
    match UnitMessage::decode(frame) {
        Ok(UnitMessage::Complete(content)) => {
            if let Err(e) = dispatcher.unit_completed(connection_id, content) {
                warn!(connection_id = %connection_id, error = %e, "Completion not delivered");
            }
        }
        Ok(other) => warn!(
            connection_id = %connection_id,
            event = other.event_name(),
            "Unexpected event from unit"
        ),
        Err(e) => warn!(connection_id = %connection_id, error = %e, "Ignoring garbled frame"),
    }
}
