//! API module for the Rounds core.
//!
//! Thin translation layer: handlers decode JSON, call into the core, and
//! map the error taxonomy onto status codes. Anything resembling UI
//! plumbing lives outside this crate.

pub mod handlers;
pub mod routes;

pub use routes::configure;

use std::sync::Arc;

use crate::alerts::CriticalAlertEngine;
use crate::config::WebSocketConfig;
use crate::consult::ConsultationService;
use crate::store::EntityStore;

/// Shared application state.
pub struct AppState {
    pub store: Arc<dyn EntityStore>,
    pub consultations: ConsultationService,
    /// Administrative-scope alert engine backing the REST alert surface;
    /// per-client engines hang off the websocket feed instead.
    pub alerts: CriticalAlertEngine,
    pub websocket: WebSocketConfig,
}
