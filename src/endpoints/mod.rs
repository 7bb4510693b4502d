use axum::{routing::get, Router};

use crate::AppState;

mod admin;
mod auth;
mod cron;
mod good;
mod karma;
mod site;
mod stories;
mod support;

async fn health() -> &'static str {
    "ok"
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/_health", get(health))
        .merge(auth::routes())
        .merge(stories::routes())
        .merge(good::routes())
        .merge(support::routes())
        .merge(karma::routes())
        .merge(site::routes())
        .merge(cron::routes())
        .merge(admin::routes())
}
