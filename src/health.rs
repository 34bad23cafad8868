//! Status endpoints.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::cache::CacheStats;
use crate::player::Player;

#[derive(Clone)]
pub struct StatusState {
    pub player: Arc<Player>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub uptime_secs: i64,
}

#[derive(Debug, Serialize)]
pub struct Stats {
    pub cache: CacheStats,
    pub tracked_chats: usize,
    pub chat_locks: usize,
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn health(State(state): State<StatusState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    })
}

async fn stats(State(state): State<StatusState>) -> Json<Stats> {
    Json(Stats {
        cache: state.player.cache().stats(),
        tracked_chats: state.player.tracker().len(),
        chat_locks: state.player.locks().len(),
    })
}
