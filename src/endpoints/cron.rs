//! Entry points for the external scheduler.
use axum::{
    extract::{FromRequestParts, State},
    http::{header::AUTHORIZATION, request::Parts},
    routing::post,
    Json, Router,
};
use chrono::{Duration, Utc};

use crate::{
    auth,
    config::AppConfig,
    db::Db,
    embeddings::Embedder,
    jobs::{self, BackfillReport, DigestReport},
    mailer::Mailer,
    AppState, Error, Result,
};

/// How long a job may hold its lock before another trigger is allowed to take over.
const LOCK_TTL_MINUTES: i64 = 15;

/// A request carrying `Authorization: Bearer <cron_secret>`.
struct CronCaller;

impl FromRequestParts<AppState> for CronCaller {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let Some(secret) = state.config.cron_secret.as_deref() else {
            return Err(Error::forbidden("scheduled jobs are not enabled"));
        };

        let presented = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        match presented {
            Some(token) if secret_matches(token.trim(), secret) => Ok(Self),
            _ => Err(Error::unauthorized("invalid cron secret")),
        }
    }
}

/// Compare fixed-length digests so the check does not short-circuit on the secret's bytes.
fn secret_matches(presented: &str, secret: &str) -> bool {
    auth::hash_token(presented) == auth::hash_token(secret)
}

async fn embeddings(
    _caller: CronCaller,
    State(db): State<Db>,
    State(embedder): State<Option<Embedder>>,
) -> Result<Json<BackfillReport>> {
    let embedder = embedder.ok_or_else(|| Error::bad_request("embeddings are not configured"))?;

    let report = jobs::run_locked(&db, jobs::EMBEDDINGS_JOB, Duration::minutes(LOCK_TTL_MINUTES), || async {
        Ok(jobs::backfill_embeddings(&db, &embedder).await?)
    })
    .await?;
    Ok(Json(report))
}

async fn digest(
    _caller: CronCaller,
    State(db): State<Db>,
    State(mailer): State<Mailer>,
    State(config): State<AppConfig>,
) -> Result<Json<DigestReport>> {
    let site_url = config.site_url();

    let report = jobs::run_locked(&db, jobs::DIGEST_JOB, Duration::minutes(LOCK_TTL_MINUTES), || async {
        Ok(jobs::send_digest(&db, &mailer, &site_url, Utc::now()).await?)
    })
    .await?;
    Ok(Json(report))
}

#[rustfmt::skip]
pub(super) fn routes() -> Router<AppState> {
    // CP /api/cron/embeddings
    // CP /api/cron/digest
    Router::new()
        .route("/api/cron/embeddings", post(embeddings))
        .route("/api/cron/digest",     post(digest))
}
