//! Public story routes: feeds, detail, search, submissions, comments and reactions.
use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use constcat::concat;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    analytics::{self, NewEvent},
    auth::{self, AuthenticatedUser},
    comments::{self, Comment, FlagOutcome},
    config::AppConfig,
    db::{pagination, Db},
    embeddings::Embedder,
    stories::{self, FeedFilter, Reaction, ReactionState, Reactions, Region, Story},
    submissions::{self, NewSubmission, Submission},
    error::Body, AppState, Error, Result,
};

const STORIES: &str = "/api/stories";

#[derive(Debug, Deserialize)]
struct FeedParams {
    city: Option<String>,
    state: Option<String>,
    category: Option<String>,
    cursor: Option<String>,
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct FeedOutput {
    stories: Vec<Story>,
    cursor: Option<String>,
}

async fn feed(State(db): State<Db>, Query(params): Query<FeedParams>) -> Result<Json<FeedOutput>> {
    let limit = pagination::limit(params.limit);
    let cursor = match params.cursor.as_deref().filter(|c| !c.is_empty()) {
        Some(raw) => Some(
            pagination::Cursor::unpack(raw).ok_or_else(|| Error::bad_request("invalid cursor"))?,
        ),
        None => None,
    };
    let filter = FeedFilter {
        city: params.city,
        state: params.state,
        category: params.category,
    };

    let page = stories::feed(&db, &filter, cursor.as_ref(), limit).await?;
    Ok(Json(FeedOutput {
        cursor: stories::next_cursor(&page, limit),
        stories: page,
    }))
}

async fn regions(State(db): State<Db>) -> Result<Json<Vec<Region>>> {
    Ok(Json(stories::regions(&db).await?))
}

#[derive(Debug, Serialize)]
struct StoryDetail {
    #[serde(flatten)]
    story: Story,
    #[serde(flatten)]
    reactions: Reactions,
}

/// A story by slug, or by id. Drafts are only visible to admins.
async fn detail(
    user: Option<AuthenticatedUser>,
    State(db): State<Db>,
    Path(key): Path<String>,
) -> Result<Json<StoryDetail>> {
    let story = match stories::find_by_slug(&db, &key).await? {
        Some(story) => story,
        None => stories::get(&db, &key).await?,
    };

    if !story.is_published {
        let is_admin = match &user {
            Some(user) => auth::is_admin(&db, &user.id).await?,
            None => false,
        };
        if !is_admin {
            return Err(Error::not_found("story not found"));
        }
    }

    let user_id = user.as_ref().map(|u| u.id.as_str());
    let reactions = stories::reactions(&db, &story.id, user_id).await?;

    analytics::record_best_effort(
        &db,
        &NewEvent {
            kind: analytics::STORY_VIEW.to_owned(),
            path: format!("/stories/{}", story.slug),
            story_id: Some(story.id.clone()),
            referrer: None,
        },
        user_id,
    )
    .await;

    Ok(Json(StoryDetail { story, reactions }))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
enum SearchMode {
    #[default]
    Keyword,
    Vector,
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: String,
    #[serde(default)]
    mode: SearchMode,
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct SearchOutput {
    mode: SearchMode,
    stories: Vec<Story>,
}

async fn search(
    State(db): State<Db>,
    State(embedder): State<Option<Embedder>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchOutput>> {
    let q = params.q.trim();
    if q.is_empty() {
        return Err(Error::bad_request("query is required"));
    }
    let limit = pagination::limit(params.limit);

    if let (SearchMode::Vector, Some(embedder)) = (params.mode, &embedder) {
        match embedder.embed(q).await {
            Ok(vector) => {
                return Ok(Json(SearchOutput {
                    mode: SearchMode::Vector,
                    stories: stories::search_vector(&db, &vector, limit).await?,
                }));
            }
            Err(e) => warn!("vector search unavailable, falling back to keyword: {e:#}"),
        }
    }

    Ok(Json(SearchOutput {
        mode: SearchMode::Keyword,
        stories: stories::search_keyword(&db, q, limit).await?,
    }))
}

async fn submit(
    user: Option<AuthenticatedUser>,
    State(db): State<Db>,
    Body(input): Body<NewSubmission>,
) -> Result<Json<Submission>> {
    if let Some(user) = &user {
        user.ensure_not_banned()?;
    }
    let user_id = user.as_ref().map(|u| u.id.as_str());
    Ok(Json(submissions::create(&db, user_id, input).await?))
}

async fn my_saves(user: AuthenticatedUser, State(db): State<Db>) -> Result<Json<Vec<Story>>> {
    Ok(Json(stories::saved_by(&db, &user.id).await?))
}

async fn list_comments(
    State(db): State<Db>,
    Path(story_id): Path<String>,
) -> Result<Json<Vec<Comment>>> {
    Ok(Json(comments::list_visible(&db, &story_id).await?))
}

#[derive(Debug, Deserialize)]
struct CommentInput {
    body: String,
}

async fn create_comment(
    user: AuthenticatedUser,
    State(db): State<Db>,
    Path(story_id): Path<String>,
    Body(input): Body<CommentInput>,
) -> Result<Json<Comment>> {
    user.ensure_not_banned()?;
    Ok(Json(comments::create(&db, &story_id, &user.id, &input.body).await?))
}

#[derive(Debug, Deserialize)]
struct FlagInput {
    reason: Option<String>,
}

async fn flag_comment(
    user: AuthenticatedUser,
    State(db): State<Db>,
    State(config): State<AppConfig>,
    Path(comment_id): Path<String>,
    input: Option<Json<FlagInput>>,
) -> Result<Json<FlagOutcome>> {
    user.ensure_not_banned()?;
    let reason = input.and_then(|Json(input)| input.reason);

    let outcome = comments::flag(
        &db,
        &comment_id,
        &user.id,
        reason.as_deref(),
        config.moderation.flag_threshold,
    )
    .await?;
    Ok(Json(outcome))
}

async fn toggle_reaction(
    reaction: Reaction,
    user: AuthenticatedUser,
    db: Db,
    story_id: String,
) -> Result<Json<ReactionState>> {
    user.ensure_not_banned()?;
    Ok(Json(stories::toggle(&db, reaction, &story_id, &user.id).await?))
}

async fn like(
    user: AuthenticatedUser,
    State(db): State<Db>,
    Path(story_id): Path<String>,
) -> Result<Json<ReactionState>> {
    toggle_reaction(Reaction::Like, user, db, story_id).await
}

async fn save(
    user: AuthenticatedUser,
    State(db): State<Db>,
    Path(story_id): Path<String>,
) -> Result<Json<ReactionState>> {
    toggle_reaction(Reaction::Save, user, db, story_id).await
}

#[rustfmt::skip]
pub(super) fn routes() -> Router<AppState> {
    // UG /api/stories
    // UG /api/stories/{id} (slug or id)
    // UG /api/stories/{id}/comments
    // AP /api/stories/{id}/comments
    // AP /api/stories/{id}/like
    // AP /api/stories/{id}/save
    // AP /api/comments/{id}/flag
    // UG /api/regions
    // UG /api/search
    // UP /api/submissions
    // AG /api/me/saves
    Router::new()
        .route(STORIES,                            get(feed))
        .route(concat!(STORIES, "/{id}"),          get(detail))
        .route(concat!(STORIES, "/{id}/comments"), get(list_comments).post(create_comment))
        .route(concat!(STORIES, "/{id}/like"),     post(like))
        .route(concat!(STORIES, "/{id}/save"),     post(save))
        .route("/api/comments/{id}/flag",          post(flag_comment))
        .route("/api/regions",                     get(regions))
        .route("/api/search",                      get(search))
        .route("/api/submissions",                 post(submit))
        .route("/api/me/saves",                    get(my_saves))
}
