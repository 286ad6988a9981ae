use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

use crate::services::bus::RedisStreamBus;
use crate::services::live::{LiveFeed, SystemReadiness, READINESS_CEILING};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub bus: Arc<RedisStreamBus>,
    pub live: LiveFeed,
    pub readiness: SystemReadiness,
    /// How long a live subscriber is held waiting for readiness.
    pub readiness_ceiling: Duration,
}

impl AppState {
    pub fn new(db: PgPool, bus: Arc<RedisStreamBus>, live: LiveFeed) -> Self {
        Self {
            db,
            bus,
            live,
            readiness: SystemReadiness::new(),
            readiness_ceiling: READINESS_CEILING,
        }
    }

    pub fn with_readiness_ceiling(mut self, ceiling: Duration) -> Self {
        self.readiness_ceiling = ceiling;
        self
    }
}
