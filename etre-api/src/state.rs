//! Shared application state for the axum router.

use std::sync::Arc;

use crate::auth;
use crate::cdc::StreamerFactory;
use crate::metrics::Metrics;
use crate::schema::SchemaConfig;
use crate::store::Store;

/// Application-wide state shared across all routes.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub auth: Arc<auth::Manager>,
    pub metrics: Arc<Metrics>,
    pub schemas: Arc<SchemaConfig>,
    /// Present only when CDC is enabled.
    pub streamer_factory: Option<StreamerFactory>,
}

impl AppState {
    pub fn cdc_enabled(&self) -> bool {
        self.streamer_factory.is_some()
    }
}
