//! Support hub routes.
use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use constcat::concat;

use crate::{
    auth::AuthenticatedUser,
    db::Db,
    support::{self, NewSupportPost, PostKind, Proposal, SupportFilter, SupportMatch, SupportPost},
    error::Body, AppState, Result,
};

const SUPPORT: &str = "/api/support";

async fn create_post(
    kind: PostKind,
    user: AuthenticatedUser,
    db: Db,
    input: NewSupportPost,
) -> Result<Json<SupportPost>> {
    user.ensure_not_banned()?;
    Ok(Json(support::create_post(&db, kind, &user.id, input).await?))
}

async fn create_request(
    user: AuthenticatedUser,
    State(db): State<Db>,
    Body(input): Body<NewSupportPost>,
) -> Result<Json<SupportPost>> {
    create_post(PostKind::Request, user, db, input).await
}

async fn create_offer(
    user: AuthenticatedUser,
    State(db): State<Db>,
    Body(input): Body<NewSupportPost>,
) -> Result<Json<SupportPost>> {
    create_post(PostKind::Offer, user, db, input).await
}

async fn list_requests(
    State(db): State<Db>,
    Query(filter): Query<SupportFilter>,
) -> Result<Json<Vec<SupportPost>>> {
    Ok(Json(support::list_open(&db, PostKind::Request, &filter).await?))
}

async fn list_offers(
    State(db): State<Db>,
    Query(filter): Query<SupportFilter>,
) -> Result<Json<Vec<SupportPost>>> {
    Ok(Json(support::list_open(&db, PostKind::Offer, &filter).await?))
}

async fn get_request(State(db): State<Db>, Path(id): Path<String>) -> Result<Json<SupportPost>> {
    Ok(Json(support::get_post(&db, PostKind::Request, &id).await?))
}

async fn get_offer(State(db): State<Db>, Path(id): Path<String>) -> Result<Json<SupportPost>> {
    Ok(Json(support::get_post(&db, PostKind::Offer, &id).await?))
}

async fn close_request(
    user: AuthenticatedUser,
    State(db): State<Db>,
    Path(id): Path<String>,
) -> Result<Json<SupportPost>> {
    Ok(Json(support::close_post(&db, PostKind::Request, &id, &user.id).await?))
}

async fn close_offer(
    user: AuthenticatedUser,
    State(db): State<Db>,
    Path(id): Path<String>,
) -> Result<Json<SupportPost>> {
    Ok(Json(support::close_post(&db, PostKind::Offer, &id, &user.id).await?))
}

async fn propose(
    user: AuthenticatedUser,
    State(db): State<Db>,
    Body(proposal): Body<Proposal>,
) -> Result<Json<SupportMatch>> {
    user.ensure_not_banned()?;
    Ok(Json(support::propose(&db, &user.id, proposal).await?))
}

async fn my_matches(user: AuthenticatedUser, State(db): State<Db>) -> Result<Json<Vec<SupportMatch>>> {
    Ok(Json(support::matches_for(&db, &user.id).await?))
}

async fn accept(
    user: AuthenticatedUser,
    State(db): State<Db>,
    Path(id): Path<String>,
) -> Result<Json<SupportMatch>> {
    Ok(Json(support::respond(&db, &id, &user.id, true).await?))
}

async fn decline(
    user: AuthenticatedUser,
    State(db): State<Db>,
    Path(id): Path<String>,
) -> Result<Json<SupportMatch>> {
    Ok(Json(support::respond(&db, &id, &user.id, false).await?))
}

async fn complete(
    user: AuthenticatedUser,
    State(db): State<Db>,
    Path(id): Path<String>,
) -> Result<Json<SupportMatch>> {
    Ok(Json(support::complete(&db, &id, &user.id).await?))
}

#[rustfmt::skip]
pub(super) fn routes() -> Router<AppState> {
    // UG /api/support/requests
    // AP /api/support/requests
    // UG /api/support/requests/{id}
    // AP /api/support/requests/{id}/close
    // UG /api/support/offers
    // AP /api/support/offers
    // UG /api/support/offers/{id}
    // AP /api/support/offers/{id}/close
    // AG /api/support/matches
    // AP /api/support/matches
    // AP /api/support/matches/{id}/accept
    // AP /api/support/matches/{id}/decline
    // AP /api/support/matches/{id}/complete
    Router::new()
        .route(concat!(SUPPORT, "/requests"),              get(list_requests).post(create_request))
        .route(concat!(SUPPORT, "/requests/{id}"),         get(get_request))
        .route(concat!(SUPPORT, "/requests/{id}/close"),   post(close_request))
        .route(concat!(SUPPORT, "/offers"),                get(list_offers).post(create_offer))
        .route(concat!(SUPPORT, "/offers/{id}"),           get(get_offer))
        .route(concat!(SUPPORT, "/offers/{id}/close"),     post(close_offer))
        .route(concat!(SUPPORT, "/matches"),               get(my_matches).post(propose))
        .route(concat!(SUPPORT, "/matches/{id}/accept"),   post(accept))
        .route(concat!(SUPPORT, "/matches/{id}/decline"),  post(decline))
        .route(concat!(SUPPORT, "/matches/{id}/complete"), post(complete))
}
