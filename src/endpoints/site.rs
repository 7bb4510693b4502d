//! Syndication feeds, partners, analytics beacons and digest subscriptions.
use axum::{
    extract::{Query, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    analytics::{self, NewEvent},
    auth::AuthenticatedUser,
    config::AppConfig,
    db::Db,
    error::Body,
    feeds, jobs,
    partners::{self, Partner},
    stories, AppState, Error, Result,
};

/// Stories included in each feed.
const FEED_STORIES: i64 = 50;

async fn feed_response(
    db: &Db,
    config: &AppConfig,
    content_type: &'static str,
    render: fn(&str, &[stories::Story]) -> String,
) -> Result<impl IntoResponse> {
    let stories = stories::recent(db, FEED_STORIES).await?;
    let body = render(&config.site_url(), &stories);
    Ok(([(CONTENT_TYPE, content_type)], body))
}

async fn rss(State(db): State<Db>, State(config): State<AppConfig>) -> Result<impl IntoResponse> {
    feed_response(&db, &config, "application/rss+xml; charset=utf-8", feeds::rss).await
}

async fn atom(State(db): State<Db>, State(config): State<AppConfig>) -> Result<impl IntoResponse> {
    feed_response(&db, &config, "application/atom+xml; charset=utf-8", feeds::atom).await
}

async fn sitemap(
    State(db): State<Db>,
    State(config): State<AppConfig>,
) -> Result<impl IntoResponse> {
    feed_response(&db, &config, "application/xml; charset=utf-8", feeds::sitemap).await
}

async fn list_partners(State(db): State<Db>) -> Result<Json<Vec<Partner>>> {
    Ok(Json(partners::list(&db, true).await?))
}

async fn track(
    user: Option<AuthenticatedUser>,
    State(db): State<Db>,
    Body(event): Body<NewEvent>,
) -> Result<StatusCode> {
    let kind = event.kind.trim();
    if kind.is_empty() || kind.len() > 64 {
        return Err(Error::bad_request("event kind must be 1 to 64 characters"));
    }

    analytics::record(&db, &event, user.as_ref().map(|u| u.id.as_str())).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct DigestInput {
    email: String,
}

async fn subscribe(State(db): State<Db>, Body(input): Body<DigestInput>) -> Result<Json<Value>> {
    jobs::subscribe(&db, &input.email).await?;
    Ok(Json(json!({ "subscribed": true })))
}

async fn unsubscribe(State(db): State<Db>, Body(input): Body<DigestInput>) -> Result<Json<Value>> {
    jobs::unsubscribe(&db, &input.email).await?;
    Ok(Json(json!({ "subscribed": false })))
}

/// Target of the link in digest emails.
async fn unsubscribe_link(
    State(db): State<Db>,
    Query(input): Query<DigestInput>,
) -> Result<Json<Value>> {
    jobs::unsubscribe(&db, &input.email).await?;
    Ok(Json(json!({ "subscribed": false })))
}

#[rustfmt::skip]
pub(super) fn routes() -> Router<AppState> {
    // UG /rss.xml
    // UG /atom.xml
    // UG /sitemap.xml
    // UG /api/partners
    // UP /api/analytics/events
    // UP /api/digest/subscribe
    // UP /api/digest/unsubscribe
    Router::new()
        .route("/rss.xml",                 get(rss))
        .route("/atom.xml",                get(atom))
        .route("/sitemap.xml",             get(sitemap))
        .route("/api/partners",            get(list_partners))
        .route("/api/analytics/events",    post(track))
        .route("/api/digest/subscribe",    post(subscribe))
        .route("/api/digest/unsubscribe",  get(unsubscribe_link).post(unsubscribe))
}
