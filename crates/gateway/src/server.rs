use std::{net::SocketAddr, sync::Arc};

use {
    axum::{
        Json, Router,
        extract::{ConnectInfo, State, WebSocketUpgrade},
        http::{StatusCode, Uri},
        response::IntoResponse,
        routing::{get, post},
    },
    harbor_protocol::{RequestFrame, ResponseFrame},
    tracing::{debug, info, warn},
};

use crate::{
    broadcast::spawn_bridge_forwarder,
    methods::{MethodContext, MethodRegistry},
    state::GatewayState,
    ws::handle_connection,
};

/// Route prefix standing in for the `plugin://` scheme over HTTP.
pub const PLUGIN_ROUTE_PREFIX: &str = "/plugin/";

// ── Shared app state ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<GatewayState>,
    pub methods: Arc<MethodRegistry>,
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>, methods: Arc<MethodRegistry>) -> Router {
    let app_state = AppState {
        gateway: state,
        methods,
    };

    Router::new()
        .route("/health", get(health_handler))
        .route("/rpc", post(rpc_handler))
        .route("/ws", get(ws_upgrade_handler))
        .route("/plugin/{*path}", get(plugin_resource_handler))
        .with_state(app_state)
}

/// Bind, forward bridge events to WebSocket clients, and serve until
/// ctrl-c. In-flight plugin downloads are cancelled on shutdown.
pub async fn start_gateway(bind: &str, port: u16, state: Arc<GatewayState>) -> anyhow::Result<()> {
    let methods = Arc::new(MethodRegistry::new());
    let forwarder = spawn_bridge_forwarder(Arc::clone(&state));
    let app = build_gateway_app(Arc::clone(&state), methods);

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        addr = %listener.local_addr()?,
        plugins_root = %state.resources.root().display(),
        ready = state.bridge.is_ready(),
        "gateway listening"
    );

    let bridge = Arc::clone(&state.bridge);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down gateway");
        bridge.cancel_all();
    })
    .await?;

    forwarder.abort();
    Ok(())
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let count = state.gateway.client_count().await;
    Json(serde_json::json!({
        "status": "ok",
        "version": state.gateway.version,
        "protocol": harbor_protocol::PROTOCOL_VERSION,
        "plugins": state.gateway.bridge.is_ready(),
        "connections": count,
    }))
}

async fn rpc_handler(
    State(state): State<AppState>,
    Json(req): Json<RequestFrame>,
) -> Json<ResponseFrame> {
    let ctx = MethodContext {
        request_id: req.id,
        method: req.method,
        params: req.params,
        state: state.gateway,
    };
    Json(state.methods.dispatch(ctx).await)
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state.gateway, state.methods, addr))
}

/// Serve a static plugin asset. The raw (still percent-encoded) path is
/// handed to the resolver so it is decoded exactly once.
async fn plugin_resource_handler(State(state): State<AppState>, uri: Uri) -> impl IntoResponse {
    let raw = uri
        .path()
        .strip_prefix(PLUGIN_ROUTE_PREFIX)
        .unwrap_or_default();

    let path = match state.gateway.resources.resolve_relative(raw).await {
        Ok(path) => path,
        Err(e) => {
            debug!(path = %raw, error = %e, "plugin resource rejected");
            return (StatusCode::NOT_FOUND, "not found").into_response();
        },
    };

    match tokio::fs::read(&path).await {
        Ok(body) => {
            let mime = mime_for_path(&path.to_string_lossy());
            (
                StatusCode::OK,
                [("content-type", mime), ("cache-control", "no-cache")],
                body,
            )
                .into_response()
        },
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read plugin resource");
            (StatusCode::NOT_FOUND, "not found").into_response()
        },
    }
}

fn mime_for_path(path: &str) -> &'static str {
    match path.rsplit('.').next().unwrap_or("") {
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" | "cjs" => "application/javascript; charset=utf-8",
        "html" => "text/html; charset=utf-8",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "ico" => "image/x-icon",
        "json" => "application/json",
        "wasm" => "application/wasm",
        "woff2" => "font/woff2",
        "woff" => "font/woff",
        _ => "application/octet-stream",
    }
}
