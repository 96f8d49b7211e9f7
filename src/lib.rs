pub mod appresult;
pub mod auth;
pub mod config;
pub mod health;
pub mod hub;
pub mod protocol;
pub mod res;
pub mod rooms;
pub mod store;

use std::sync::Arc;

use axum::{Router, extract::FromRef};
use tower_http::trace::TraceLayer;

pub use appresult::{AppError, AppResult};

use crate::{
    auth::Authenticator,
    config::Config,
    hub::HubHandle,
    store::{Membership, MessageStore, SqliteStore},
};

/// The external capabilities a connection consults. Trait objects so that
/// a deployment (or a test) can swap any of them independently.
#[derive(Clone)]
pub struct Oracles {
    pub sessions: Arc<dyn Authenticator>,
    pub members: Arc<dyn Membership>,
    pub messages: Arc<dyn MessageStore>,
}

impl Oracles {
    pub fn sqlite(store: &SqliteStore) -> Self {
        Self {
            sessions: Arc::new(store.clone()),
            members: Arc::new(store.clone()),
            messages: Arc::new(store.clone()),
        }
    }
}

#[derive(Clone, FromRef)]
pub struct AppState {
    pub db: SqliteStore,
    pub hub: HubHandle,
    pub oracles: Oracles,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(db: SqliteStore, hub: HubHandle, config: Config) -> Self {
        Self {
            oracles: Oracles::sqlite(&db),
            db,
            hub,
            config: Arc::new(config),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(rooms::router())
        .merge(health::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
