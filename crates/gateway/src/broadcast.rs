use std::sync::Arc;

use {
    harbor_protocol::EventFrame,
    tokio::{sync::broadcast::error::RecvError, task::JoinHandle},
    tracing::{debug, info, warn},
};

use crate::state::GatewayState;

// ── Broadcaster ──────────────────────────────────────────────────────────────

/// Send an event frame to every connected WebSocket client. Clients whose
/// write loop has gone away are dropped from the registry.
pub async fn broadcast(state: &Arc<GatewayState>, event: &str, payload: serde_json::Value) {
    let seq = state.next_seq();
    let frame = EventFrame::new(event, payload, seq);
    let json = match serde_json::to_string(&frame) {
        Ok(j) => j,
        Err(e) => {
            warn!("failed to serialize broadcast event: {e}");
            return;
        },
    };

    let closed: Vec<String> = {
        let inner = state.inner.read().await;
        debug!(
            event,
            seq,
            clients = inner.clients.len(),
            "broadcasting event"
        );
        inner
            .clients
            .values()
            .filter(|client| !client.send(&json))
            .map(|client| client.conn_id.clone())
            .collect()
    };
    for conn_id in closed {
        debug!(conn_id = %conn_id, "dropping closed client");
        state.remove_client(&conn_id).await;
    }
}

// ── Bridge forwarding ────────────────────────────────────────────────────────

/// Forward plugin bridge events to WebSocket clients until the bridge's
/// event channel closes.
pub fn spawn_bridge_forwarder(state: Arc<GatewayState>) -> JoinHandle<()> {
    let mut events = state.bridge.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => broadcast(&state, event.event, event.payload).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "bridge event forwarder lagged");
                },
                Err(RecvError::Closed) => break,
            }
        }
        info!("bridge event forwarder stopped");
    })
}
