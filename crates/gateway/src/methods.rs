use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use {
    harbor_plugins::Error as PluginError,
    harbor_protocol::{ErrorShape, ResponseFrame, error_codes, methods},
    serde::{Deserialize, de::DeserializeOwned},
    serde_json::json,
    tracing::{debug, warn},
};

use crate::state::GatewayState;

// ── Types ────────────────────────────────────────────────────────────────────

/// Context passed to every method handler.
pub struct MethodContext {
    pub request_id: String,
    pub method: String,
    pub params: Option<serde_json::Value>,
    pub state: Arc<GatewayState>,
}

/// The result a method handler produces.
pub type MethodResult = Result<serde_json::Value, ErrorShape>;

/// A boxed async method handler.
pub type HandlerFn = Box<
    dyn Fn(MethodContext) -> Pin<Box<dyn Future<Output = MethodResult> + Send>> + Send + Sync,
>;

// ── Params ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstallParams {
    specifiers: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchParams {
    names: Vec<String>,
    #[serde(default)]
    reload: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckUpdatesParams {
    #[serde(default)]
    names: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetActiveParams {
    name: String,
    active: bool,
}

fn parse_params<T: DeserializeOwned>(params: Option<serde_json::Value>) -> Result<T, ErrorShape> {
    let value = params.unwrap_or_else(|| json!({}));
    serde_json::from_value(value)
        .map_err(|e| ErrorShape::new(error_codes::INVALID_REQUEST, format!("invalid params: {e}")))
}

/// Map a plugin error onto the wire shape, keeping its stable code.
pub fn error_shape(err: &PluginError) -> ErrorShape {
    ErrorShape::new(err.code(), err.to_string()).with_retryable(err.is_retryable())
}

fn to_payload<T: serde::Serialize>(value: T) -> MethodResult {
    serde_json::to_value(value).map_err(|e| {
        ErrorShape::new(error_codes::INTERNAL, format!("serialize response: {e}"))
            .with_retryable(false)
    })
}

// ── Registry ─────────────────────────────────────────────────────────────────

pub struct MethodRegistry {
    handlers: HashMap<String, HandlerFn>,
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        let mut reg = Self {
            handlers: HashMap::new(),
        };
        reg.register_plugin_methods();
        reg
    }

    pub fn register(&mut self, method: impl Into<String>, handler: HandlerFn) {
        self.handlers.insert(method.into(), handler);
    }

    pub async fn dispatch(&self, ctx: MethodContext) -> ResponseFrame {
        let method = ctx.method.clone();
        let request_id = ctx.request_id.clone();

        let Some(handler) = self.handlers.get(&method) else {
            warn!(method, request_id = %request_id, "unknown method");
            return ResponseFrame::err(
                &request_id,
                ErrorShape::new(
                    error_codes::UNKNOWN_METHOD,
                    format!("unknown method: {method}"),
                ),
            );
        };

        debug!(method, request_id = %request_id, "dispatching method");
        match handler(ctx).await {
            Ok(payload) => ResponseFrame::ok(&request_id, payload),
            Err(err) => {
                if err.code == error_codes::UNAVAILABLE {
                    debug!(method, request_id = %request_id, msg = %err.message, "method unavailable");
                } else {
                    warn!(method, request_id = %request_id, code = %err.code, msg = %err.message, "method error");
                }
                ResponseFrame::err(&request_id, err)
            },
        }
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    // ── Plugin command bridge ────────────────────────────────────────────────

    fn register_plugin_methods(&mut self) {
        self.register(
            methods::VERSION,
            Box::new(|ctx| {
                Box::pin(async move { Ok(json!({ "version": ctx.state.bridge.version() })) })
            }),
        );

        self.register(
            methods::INSTALL,
            Box::new(|ctx| {
                Box::pin(async move {
                    let params: InstallParams = parse_params(ctx.params)?;
                    let installed = ctx
                        .state
                        .bridge
                        .install(params.specifiers)
                        .await
                        .map_err(|e| error_shape(&e))?;
                    to_payload(installed)
                })
            }),
        );

        self.register(
            methods::UNINSTALL,
            Box::new(|ctx| {
                Box::pin(async move {
                    let params: BatchParams = parse_params(ctx.params)?;
                    let done = ctx
                        .state
                        .bridge
                        .uninstall(params.names, params.reload)
                        .await
                        .map_err(|e| error_shape(&e))?;
                    Ok(json!(done))
                })
            }),
        );

        self.register(
            methods::UPDATE,
            Box::new(|ctx| {
                Box::pin(async move {
                    let params: BatchParams = parse_params(ctx.params)?;
                    let updated = ctx
                        .state
                        .bridge
                        .update(params.names, params.reload)
                        .await
                        .map_err(|e| error_shape(&e))?;
                    to_payload(updated)
                })
            }),
        );

        self.register(
            methods::CHECK_UPDATES,
            Box::new(|ctx| {
                Box::pin(async move {
                    let params: CheckUpdatesParams = parse_params(ctx.params)?;
                    let statuses = ctx
                        .state
                        .bridge
                        .check_updates(params.names)
                        .await
                        .map_err(|e| error_shape(&e))?;
                    to_payload(statuses)
                })
            }),
        );

        self.register(
            methods::LIST_ACTIVE,
            Box::new(|ctx| {
                Box::pin(async move {
                    let active = ctx
                        .state
                        .bridge
                        .list_active()
                        .map_err(|e| error_shape(&e))?;
                    to_payload(active)
                })
            }),
        );

        self.register(
            methods::LIST_ALL,
            Box::new(|ctx| {
                Box::pin(async move {
                    let all = ctx
                        .state
                        .bridge
                        .list_all()
                        .map_err(|e| error_shape(&e))?;
                    to_payload(all)
                })
            }),
        );

        self.register(
            methods::SET_ACTIVE,
            Box::new(|ctx| {
                Box::pin(async move {
                    let params: SetActiveParams = parse_params(ctx.params)?;
                    let record = ctx
                        .state
                        .bridge
                        .set_active(&params.name, params.active)
                        .await
                        .map_err(|e| error_shape(&e))?;
                    to_payload(record)
                })
            }),
        );
    }
}
