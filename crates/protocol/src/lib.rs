//! Command bridge wire protocol.
//!
//! Protocol version 1. The presentation process sends one `RequestFrame` per
//! plugin operation and receives exactly one `ResponseFrame`. Side-channel
//! notifications (reload signals, per-item install failures) are pushed as
//! `EventFrame`s over the event socket.

use serde::{Deserialize, Serialize};

// ── Constants ────────────────────────────────────────────────────────────────

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_PAYLOAD_BYTES: usize = 262_144; // 256 KB

// ── Methods ──────────────────────────────────────────────────────────────────

/// Every method the presentation process may invoke.
pub mod methods {
    pub const VERSION: &str = "plugins.version";
    pub const INSTALL: &str = "plugins.install";
    pub const UNINSTALL: &str = "plugins.uninstall";
    pub const UPDATE: &str = "plugins.update";
    pub const CHECK_UPDATES: &str = "plugins.check_updates";
    pub const LIST_ACTIVE: &str = "plugins.list_active";
    pub const LIST_ALL: &str = "plugins.list";
    pub const SET_ACTIVE: &str = "plugins.set_active";

    pub const ALL: &[&str] = &[
        VERSION,
        INSTALL,
        UNINSTALL,
        UPDATE,
        CHECK_UPDATES,
        LIST_ACTIVE,
        LIST_ALL,
        SET_ACTIVE,
    ];
}

/// Events pushed to the presentation process.
pub mod events {
    /// The presentation process should reload its view.
    pub const RELOAD: &str = "plugins.reload";
    /// A single specifier in an install batch failed.
    pub const INSTALL_FAILED: &str = "plugins.install.failed";
    /// A single name in an update/uninstall batch failed.
    pub const OPERATION_FAILED: &str = "plugins.operation.failed";
    /// Plugins were replaced by newer versions.
    pub const UPDATED: &str = "plugins.updated";
}

// ── Error codes ──────────────────────────────────────────────────────────────

pub mod error_codes {
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const UNKNOWN_METHOD: &str = "UNKNOWN_METHOD";
    pub const NOT_INITIALIZED: &str = "NOT_INITIALIZED";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const PACKAGE_NOT_FOUND: &str = "PACKAGE_NOT_FOUND";
    pub const NETWORK_ERROR: &str = "NETWORK_ERROR";
    pub const WRITE_ERROR: &str = "WRITE_ERROR";
    pub const INSTALL_ERROR: &str = "INSTALL_ERROR";
    pub const UNPACK_ERROR: &str = "UNPACK_ERROR";
    pub const MANIFEST_CORRUPT: &str = "MANIFEST_CORRUPT";
    pub const OPERATION_IN_PROGRESS: &str = "OPERATION_IN_PROGRESS";
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
    pub const INTERNAL: &str = "INTERNAL";
}

// ── Error shape ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl ErrorShape {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable: None,
        }
    }

    #[must_use]
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// Presentation → host request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub r#type: String, // always "req"
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl RequestFrame {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            r#type: "req".into(),
            id: id.into(),
            method: method.into(),
            params: Some(params),
        }
    }
}

/// Host → presentation response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub r#type: String, // always "res"
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    pub fn ok(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            r#type: "res".into(),
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: ErrorShape) -> Self {
        Self {
            r#type: "res".into(),
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }
}

/// Host → presentation server-push event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub r#type: String, // always "event"
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, payload: serde_json::Value, seq: u64) -> Self {
        Self {
            r#type: "event".into(),
            event: event.into(),
            payload: Some(payload),
            seq: Some(seq),
        }
    }
}
