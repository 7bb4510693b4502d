use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};

use crate::{
    auth::{self, AuthenticatedUser},
    db::Db,
    good::{self, GoodAct, GoodActDetail, GoodProof, NewGoodAct, NewProof},
    status::GoodActStatus,
    error::Body, AppState, Error, Result,
};

async fn create_act(
    user: AuthenticatedUser,
    State(db): State<Db>,
    Body(input): Body<NewGoodAct>,
) -> Result<Json<GoodAct>> {
    user.ensure_not_banned()?;
    Ok(Json(good::create(&db, &user.id, input).await?))
}

async fn my_acts(user: AuthenticatedUser, State(db): State<Db>) -> Result<Json<Vec<GoodAct>>> {
    Ok(Json(good::list_for_user(&db, &user.id).await?))
}

/// Verified acts are public. Anything else is visible to its owner and to admins.
async fn get_act(
    user: Option<AuthenticatedUser>,
    State(db): State<Db>,
    Path(id): Path<String>,
) -> Result<Json<GoodActDetail>> {
    let detail = good::detail(&db, &id).await?;

    if detail.act.status != GoodActStatus::Verified {
        let allowed = match &user {
            Some(user) if user.id == detail.act.user_id => true,
            Some(user) => auth::is_admin(&db, &user.id).await?,
            None => false,
        };
        if !allowed {
            return Err(Error::not_found("good act not found"));
        }
    }

    Ok(Json(detail))
}

async fn add_proof(
    user: AuthenticatedUser,
    State(db): State<Db>,
    Path(id): Path<String>,
    Body(input): Body<NewProof>,
) -> Result<Json<GoodProof>> {
    user.ensure_not_banned()?;
    Ok(Json(good::add_proof(&db, &id, &user.id, input).await?))
}

#[rustfmt::skip]
pub(super) fn routes() -> Router<AppState> {
    // AP /api/good-acts
    // AG /api/good-acts/mine
    // UG /api/good-acts/{id}
    // AP /api/good-acts/{id}/proofs
    Router::new()
        .route("/api/good-acts",             post(create_act))
        .route("/api/good-acts/mine",        get(my_acts))
        .route("/api/good-acts/{id}",        get(get_act))
        .route("/api/good-acts/{id}/proofs", post(add_proof))
}
