use std::{net::SocketAddr, sync::Arc};

use {
    axum::extract::ws::{Message, WebSocket},
    futures::{SinkExt, stream::StreamExt},
    harbor_protocol::{ErrorShape, MAX_PAYLOAD_BYTES, RequestFrame, ResponseFrame, error_codes},
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
};

use crate::{
    methods::{MethodContext, MethodRegistry},
    state::{ConnectedClient, GatewayState},
};

fn send_frame(tx: &mpsc::UnboundedSender<String>, frame: &ResponseFrame) {
    match serde_json::to_string(frame) {
        Ok(json) => {
            let _ = tx.send(json);
        },
        Err(e) => warn!("failed to serialize response frame: {e}"),
    }
}

fn reject(tx: &mpsc::UnboundedSender<String>, id: &str, message: impl Into<String>) {
    send_frame(
        tx,
        &ResponseFrame::err(id, ErrorShape::new(error_codes::INVALID_REQUEST, message)),
    );
}

/// Handle a single WebSocket connection: register the client so it receives
/// bridge events, serve request frames, then unregister on close.
pub async fn handle_connection(
    socket: WebSocket,
    state: Arc<GatewayState>,
    methods: Arc<MethodRegistry>,
    remote_addr: SocketAddr,
) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, remote = %remote_addr, "ws: new connection");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (client_tx, mut client_rx) = mpsc::unbounded_channel::<String>();

    // Write loop: forwards frames from the client channel to the socket.
    let write_conn_id = conn_id.clone();
    let write_handle = tokio::spawn(async move {
        while let Some(msg) = client_rx.recv().await {
            if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                debug!(conn_id = %write_conn_id, "ws: write loop closed");
                break;
            }
        }
    });

    state
        .register_client(ConnectedClient::new(&conn_id, client_tx.clone()))
        .await;

    // ── Message loop ─────────────────────────────────────────────────────

    while let Some(msg) = ws_rx.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t.to_string(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(conn_id = %conn_id, error = %e, "ws: read error");
                break;
            },
        };

        if text.len() > MAX_PAYLOAD_BYTES {
            warn!(conn_id = %conn_id, size = text.len(), "ws: payload too large");
            reject(&client_tx, "", "payload too large");
            continue;
        }

        let req: RequestFrame = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(e) => {
                warn!(conn_id = %conn_id, error = %e, "ws: invalid frame");
                reject(&client_tx, "", "invalid frame");
                continue;
            },
        };
        if req.r#type != "req" {
            debug!(conn_id = %conn_id, frame_type = %req.r#type, "ws: ignoring non-request frame");
            continue;
        }

        // Installs and updates can take a while; keep reading meanwhile.
        let ctx = MethodContext {
            request_id: req.id,
            method: req.method,
            params: req.params,
            state: Arc::clone(&state),
        };
        let methods = Arc::clone(&methods);
        let tx = client_tx.clone();
        tokio::spawn(async move {
            let response = methods.dispatch(ctx).await;
            send_frame(&tx, &response);
        });
    }

    // ── Cleanup ──────────────────────────────────────────────────────────

    state.remove_client(&conn_id).await;
    drop(client_tx);
    write_handle.abort();
    info!(conn_id = %conn_id, "ws: connection closed");
}
