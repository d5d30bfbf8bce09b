use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use {
    harbor_plugins::{PluginBridge, ResourceResolver},
    tokio::sync::{RwLock, mpsc},
};

// ── Connected client ─────────────────────────────────────────────────────────

/// A WebSocket client attached to the gateway.
#[derive(Debug)]
pub struct ConnectedClient {
    pub conn_id: String,
    /// Channel for sending serialized frames to this client's write loop.
    pub sender: mpsc::UnboundedSender<String>,
    pub connected_at: Instant,
}

impl ConnectedClient {
    pub fn new(conn_id: impl Into<String>, sender: mpsc::UnboundedSender<String>) -> Self {
        Self {
            conn_id: conn_id.into(),
            sender,
            connected_at: Instant::now(),
        }
    }

    /// Queue a frame; returns false once the write loop has gone away.
    pub fn send(&self, frame: &str) -> bool {
        self.sender.send(frame.to_string()).is_ok()
    }
}

// ── Gateway state ────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct GatewayInner {
    pub clients: HashMap<String, ConnectedClient>,
}

/// Shared state behind every route and method handler.
pub struct GatewayState {
    pub bridge: Arc<PluginBridge>,
    pub resources: ResourceResolver,
    pub version: String,
    pub inner: RwLock<GatewayInner>,
    seq: AtomicU64,
}

impl GatewayState {
    pub fn new(bridge: Arc<PluginBridge>, resources: ResourceResolver) -> Arc<Self> {
        Arc::new(Self {
            bridge,
            resources,
            version: env!("CARGO_PKG_VERSION").to_string(),
            inner: RwLock::new(GatewayInner::default()),
            seq: AtomicU64::new(0),
        })
    }

    /// Monotonic sequence number for outgoing event frames, starting at 1.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub async fn register_client(&self, client: ConnectedClient) {
        let mut inner = self.inner.write().await;
        inner.clients.insert(client.conn_id.clone(), client);
    }

    pub async fn remove_client(&self, conn_id: &str) -> Option<ConnectedClient> {
        self.inner.write().await.clients.remove(conn_id)
    }

    pub async fn client_count(&self) -> usize {
        self.inner.read().await.clients.len()
    }
}
