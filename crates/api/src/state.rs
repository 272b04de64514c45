//! Application state

use std::sync::Arc;

use frontdesk_core::CoreServices;
use sqlx::PgPool;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub core: Arc<CoreServices>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config, core: CoreServices) -> Self {
        Self {
            pool,
            config,
            core: Arc::new(core),
        }
    }
}
