//! The admin console API. Every route requires the admin role.
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use constcat::concat;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    analytics::{self, Dashboard},
    auth::AdminUser,
    comments::{self, Comment, ModerationAction},
    config::AppConfig,
    db::{pagination, Db},
    embeddings::Embedder,
    good::{self, GoodAct},
    karma,
    partners::{self, Partner, PartnerInput},
    status::{CommentStatus, GoodActStatus, SubmissionStatus, Verdict},
    storage::ObjectStore,
    stories::{self, Story, StoryInput},
    submissions::{self, Submission},
    error::Body, AppState, Result,
};

const ADMIN: &str = "/api/admin";

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_stories(
    _admin: AdminUser,
    State(db): State<Db>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Story>>> {
    let limit = pagination::limit(params.limit);
    let offset = params.offset.unwrap_or(0).max(0);
    Ok(Json(stories::list_all(&db, limit, offset).await?))
}

async fn create_story(
    AdminUser(admin): AdminUser,
    State(db): State<Db>,
    State(embedder): State<Option<Embedder>>,
    Body(input): Body<StoryInput>,
) -> Result<Json<Story>> {
    let story = stories::create(&db, input, Some(&admin.id)).await?;
    stories::refresh_embedding(&db, embedder.as_ref(), &story).await;
    Ok(Json(story))
}

async fn get_story(
    _admin: AdminUser,
    State(db): State<Db>,
    Path(id): Path<String>,
) -> Result<Json<Story>> {
    Ok(Json(stories::get(&db, &id).await?))
}

async fn update_story(
    _admin: AdminUser,
    State(db): State<Db>,
    State(embedder): State<Option<Embedder>>,
    Path(id): Path<String>,
    Body(input): Body<StoryInput>,
) -> Result<Json<Story>> {
    let story = stories::update(&db, &id, input).await?;
    stories::refresh_embedding(&db, embedder.as_ref(), &story).await;
    Ok(Json(story))
}

async fn delete_story(
    _admin: AdminUser,
    State(db): State<Db>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    stories::delete(&db, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct PublishInput {
    published: bool,
}

async fn publish_story(
    _admin: AdminUser,
    State(db): State<Db>,
    Path(id): Path<String>,
    Body(input): Body<PublishInput>,
) -> Result<Json<Story>> {
    Ok(Json(stories::set_published(&db, &id, input.published).await?))
}

#[derive(Debug, Serialize)]
struct ImportError {
    index: usize,
    error: String,
}

#[derive(Debug, Default, Serialize)]
struct ImportOutput {
    created: Vec<String>,
    errors: Vec<ImportError>,
}

/// Bulk-create drafts. Each item succeeds or fails on its own.
async fn import_stories(
    AdminUser(admin): AdminUser,
    State(db): State<Db>,
    State(embedder): State<Option<Embedder>>,
    Body(items): Body<Vec<StoryInput>>,
) -> Result<Json<ImportOutput>> {
    let mut out = ImportOutput::default();

    for (index, input) in items.into_iter().enumerate() {
        match stories::create(&db, input, Some(&admin.id)).await {
            Ok(story) => {
                stories::refresh_embedding(&db, embedder.as_ref(), &story).await;
                out.created.push(story.id);
            }
            Err(e) => out.errors.push(ImportError {
                index,
                error: e.to_string(),
            }),
        }
    }

    info!(
        "imported {} stories ({} failed)",
        out.created.len(),
        out.errors.len()
    );
    Ok(Json(out))
}

#[derive(Debug, Deserialize)]
struct SubmissionParams {
    status: Option<SubmissionStatus>,
}

async fn list_submissions(
    _admin: AdminUser,
    State(db): State<Db>,
    Query(params): Query<SubmissionParams>,
) -> Result<Json<Vec<Submission>>> {
    Ok(Json(submissions::list(&db, params.status).await?))
}

#[derive(Debug, Serialize)]
struct AcceptOutput {
    submission: Submission,
    story: Story,
}

async fn accept_submission(
    _admin: AdminUser,
    State(db): State<Db>,
    Path(id): Path<String>,
) -> Result<Json<AcceptOutput>> {
    let (submission, story) = submissions::accept(&db, &id).await?;
    Ok(Json(AcceptOutput { submission, story }))
}

async fn reject_submission(
    _admin: AdminUser,
    State(db): State<Db>,
    Path(id): Path<String>,
) -> Result<Json<Submission>> {
    Ok(Json(submissions::reject(&db, &id).await?))
}

#[derive(Debug, Deserialize)]
struct CommentParams {
    status: Option<CommentStatus>,
}

async fn comment_queue(
    _admin: AdminUser,
    State(db): State<Db>,
    Query(params): Query<CommentParams>,
) -> Result<Json<Vec<Comment>>> {
    Ok(Json(comments::queue(&db, params.status).await?))
}

#[derive(Debug, Deserialize)]
struct ModerateInput {
    action: ModerationAction,
}

#[derive(Debug, Serialize)]
struct ModerateOutput {
    comment: Comment,
    #[serde(skip_serializing_if = "Option::is_none")]
    hidden_comments: Option<u64>,
}

async fn moderate_comment(
    AdminUser(admin): AdminUser,
    State(db): State<Db>,
    Path(id): Path<String>,
    Body(input): Body<ModerateInput>,
) -> Result<Json<ModerateOutput>> {
    let before = comments::get(&db, &id).await?;

    let hidden_comments = match input.action {
        ModerationAction::Approve => {
            comments::set_status(&db, &id, CommentStatus::Approved).await?;
            if before.status != CommentStatus::Approved {
                karma::award_best_effort(
                    &db,
                    &before.user_id,
                    karma::points::COMMENT_APPROVED,
                    "comment_approved",
                    Some(&id),
                )
                .await;
            }
            None
        }
        ModerationAction::Hide => {
            comments::set_status(&db, &id, CommentStatus::Hidden).await?;
            None
        }
        ModerationAction::BanUser => Some(comments::ban_author(&db, &id).await?),
    };

    info!("admin {} applied {:?} to comment {id}", admin.id, input.action);
    Ok(Json(ModerateOutput {
        comment: comments::get(&db, &id).await?,
        hidden_comments,
    }))
}

async fn delete_comment(
    _admin: AdminUser,
    State(db): State<Db>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    comments::delete(&db, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct GoodActParams {
    status: Option<GoodActStatus>,
}

async fn list_good_acts(
    _admin: AdminUser,
    State(db): State<Db>,
    Query(params): Query<GoodActParams>,
) -> Result<Json<Vec<GoodAct>>> {
    Ok(Json(good::list_by_status(&db, params.status).await?))
}

#[derive(Debug, Deserialize)]
struct VerifyInput {
    verdict: Verdict,
    #[serde(default)]
    note: String,
}

async fn verify_good_act(
    AdminUser(admin): AdminUser,
    State(db): State<Db>,
    Path(id): Path<String>,
    Body(input): Body<VerifyInput>,
) -> Result<Json<GoodAct>> {
    Ok(Json(
        good::verify(&db, &id, &admin.id, input.verdict, &input.note).await?,
    ))
}

async fn issue_certificate(
    _admin: AdminUser,
    State(db): State<Db>,
    State(storage): State<ObjectStore>,
    State(config): State<AppConfig>,
    Path(id): Path<String>,
) -> Result<Json<GoodAct>> {
    Ok(Json(
        good::issue_certificate(&db, &storage, &config.site_url(), &id).await?,
    ))
}

async fn list_partners(_admin: AdminUser, State(db): State<Db>) -> Result<Json<Vec<Partner>>> {
    Ok(Json(partners::list(&db, false).await?))
}

async fn create_partner(
    _admin: AdminUser,
    State(db): State<Db>,
    Body(input): Body<PartnerInput>,
) -> Result<Json<Partner>> {
    Ok(Json(partners::create(&db, input).await?))
}

async fn update_partner(
    _admin: AdminUser,
    State(db): State<Db>,
    Path(id): Path<String>,
    Body(input): Body<PartnerInput>,
) -> Result<Json<Partner>> {
    Ok(Json(partners::update(&db, &id, input).await?))
}

async fn delete_partner(
    _admin: AdminUser,
    State(db): State<Db>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    partners::delete(&db, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn dashboard(_admin: AdminUser, State(db): State<Db>) -> Result<Json<Dashboard>> {
    Ok(Json(analytics::dashboard(&db, Utc::now()).await?))
}

#[rustfmt::skip]
pub(super) fn routes() -> Router<AppState> {
    // Every route here requires an admin session: 401 without a session, 403 without the role.
    Router::new()
        .route(concat!(ADMIN, "/stories"),                  get(list_stories).post(create_story))
        .route(concat!(ADMIN, "/stories/import"),           post(import_stories))
        .route(concat!(ADMIN, "/stories/{id}"),             get(get_story).put(update_story).delete(delete_story))
        .route(concat!(ADMIN, "/stories/{id}/publish"),     post(publish_story))
        .route(concat!(ADMIN, "/submissions"),              get(list_submissions))
        .route(concat!(ADMIN, "/submissions/{id}/accept"),  post(accept_submission))
        .route(concat!(ADMIN, "/submissions/{id}/reject"),  post(reject_submission))
        .route(concat!(ADMIN, "/comments"),                 get(comment_queue))
        .route(concat!(ADMIN, "/comments/{id}"),            axum::routing::delete(delete_comment))
        .route(concat!(ADMIN, "/comments/{id}/moderate"),   post(moderate_comment))
        .route(concat!(ADMIN, "/good-acts"),                get(list_good_acts))
        .route(concat!(ADMIN, "/good-acts/{id}/verify"),    post(verify_good_act))
        .route(concat!(ADMIN, "/good-acts/{id}/certificate"), post(issue_certificate))
        .route(concat!(ADMIN, "/partners"),                 get(list_partners).post(create_partner))
        .route(concat!(ADMIN, "/partners/{id}"),            axum::routing::put(update_partner).delete(delete_partner))
        .route(concat!(ADMIN, "/analytics"),                get(dashboard))
}
