use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;

use crate::{
    auth::AuthenticatedUser,
    db::{pagination, Db},
    karma::{self, CheckIn, Goal, LeaderboardEntry, LedgerEntry, NewGoal, Summary},
    error::Body, AppState, Result,
};

#[derive(Debug, Deserialize)]
struct LimitParams {
    limit: Option<i64>,
}

async fn summary(user: AuthenticatedUser, State(db): State<Db>) -> Result<Json<Summary>> {
    Ok(Json(karma::summary(&db, &user.id).await?))
}

async fn check_in(user: AuthenticatedUser, State(db): State<Db>) -> Result<Json<CheckIn>> {
    user.ensure_not_banned()?;
    let today = Utc::now().date_naive();
    Ok(Json(karma::check_in(&db, &user.id, today).await?))
}

async fn ledger(
    user: AuthenticatedUser,
    State(db): State<Db>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Vec<LedgerEntry>>> {
    let limit = pagination::limit(params.limit);
    Ok(Json(karma::ledger(&db, &user.id, limit).await?))
}

async fn leaderboard(
    State(db): State<Db>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Vec<LeaderboardEntry>>> {
    let limit = pagination::limit(params.limit);
    Ok(Json(karma::leaderboard(&db, limit).await?))
}

async fn list_goals(user: AuthenticatedUser, State(db): State<Db>) -> Result<Json<Vec<Goal>>> {
    Ok(Json(karma::goals(&db, &user.id).await?))
}

async fn create_goal(
    user: AuthenticatedUser,
    State(db): State<Db>,
    Body(goal): Body<NewGoal>,
) -> Result<Json<Goal>> {
    user.ensure_not_banned()?;
    Ok(Json(karma::create_goal(&db, &user.id, goal).await?))
}

async fn progress_goal(
    user: AuthenticatedUser,
    State(db): State<Db>,
    Path(id): Path<String>,
) -> Result<Json<Goal>> {
    Ok(Json(karma::progress_goal(&db, &user.id, &id).await?))
}

#[rustfmt::skip]
pub(super) fn routes() -> Router<AppState> {
    // AG /api/karma
    // AP /api/karma/check-in
    // AG /api/karma/ledger
    // UG /api/karma/leaderboard
    // AG /api/karma/goals
    // AP /api/karma/goals
    // AP /api/karma/goals/{id}/progress
    Router::new()
        .route("/api/karma",                     get(summary))
        .route("/api/karma/check-in",            post(check_in))
        .route("/api/karma/ledger",              get(ledger))
        .route("/api/karma/leaderboard",         get(leaderboard))
        .route("/api/karma/goals",               get(list_goals).post(create_goal))
        .route("/api/karma/goals/{id}/progress", post(progress_goal))
}
