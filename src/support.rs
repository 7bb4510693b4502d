//! Support hub: requests for help, offers of help, and the matches between them.
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite};
use tracing::info;

use crate::{
    db::{new_id, Db},
    karma,
    status::{MatchStatus, SupportStatus},
    Error, Result,
};

/// Requests and offers share one shape and live in sibling tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostKind {
    Request,
    Offer,
}

impl PostKind {
    const fn table(self) -> &'static str {
        match self {
            Self::Request => "support_requests",
            Self::Offer => "support_offers",
        }
    }

    const fn noun(self) -> &'static str {
        match self {
            Self::Request => "support request",
            Self::Offer => "support offer",
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SupportPost {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: String,
    pub category: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub status: SupportStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewSupportPost {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub category: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SupportFilter {
    pub city: Option<String>,
    pub state: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SupportMatch {
    pub id: String,
    pub request_id: String,
    pub offer_id: Option<String>,
    pub helper_id: String,
    pub requester_id: String,
    pub message: String,
    pub status: MatchStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Proposal {
    pub request_id: String,
    pub offer_id: Option<String>,
    #[serde(default)]
    pub message: String,
}

pub async fn create_post(
    db: &Db,
    kind: PostKind,
    user_id: &str,
    input: NewSupportPost,
) -> Result<SupportPost> {
    let title = input.title.trim();
    if title.is_empty() {
        return Err(Error::bad_request("title is required"));
    }

    let now = Utc::now();
    let post = sqlx::query_as::<_, SupportPost>(&format!(
        r#"
        INSERT INTO {} (id, user_id, title, description, category, city, state, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
        "#,
        kind.table()
    ))
    .bind(new_id())
    .bind(user_id)
    .bind(title)
    .bind(input.description.trim())
    .bind(input.category)
    .bind(input.city)
    .bind(input.state)
    .bind(SupportStatus::Open)
    .bind(now)
    .bind(now)
    .fetch_one(db)
    .await
    .with_context(|| format!("failed to create {}", kind.noun()))?;

    Ok(post)
}

pub async fn get_post(db: &Db, kind: PostKind, id: &str) -> Result<SupportPost> {
    sqlx::query_as::<_, SupportPost>(&format!("SELECT * FROM {} WHERE id = ?", kind.table()))
        .bind(id)
        .fetch_optional(db)
        .await
        .with_context(|| format!("failed to fetch {}", kind.noun()))?
        .ok_or_else(|| Error::not_found(format!("{} not found", kind.noun())))
}

/// Open posts, newest first.
pub async fn list_open(
    db: &Db,
    kind: PostKind,
    filter: &SupportFilter,
) -> anyhow::Result<Vec<SupportPost>> {
    let mut query: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!("SELECT * FROM {} WHERE status = ", kind.table()));
    query.push_bind(SupportStatus::Open);
    if let Some(city) = &filter.city {
        query.push(" AND city = ").push_bind(city);
    }
    if let Some(state) = &filter.state {
        query.push(" AND state = ").push_bind(state);
    }
    if let Some(category) = &filter.category {
        query.push(" AND category = ").push_bind(category);
    }
    query.push(" ORDER BY created_at DESC LIMIT 100");

    query
        .build_query_as::<SupportPost>()
        .fetch_all(db)
        .await
        .with_context(|| format!("failed to list {}s", kind.noun()))
}

pub async fn close_post(db: &Db, kind: PostKind, id: &str, user_id: &str) -> Result<SupportPost> {
    let post = get_post(db, kind, id).await?;
    if post.user_id != user_id {
        return Err(Error::forbidden(format!("only the owner can close this {}", kind.noun())));
    }
    let status = post.status.close()?;

    set_post_status(db, kind, id, status).await?;
    get_post(db, kind, id).await
}

async fn set_post_status<'c, E>(
    conn: E,
    kind: PostKind,
    id: &str,
    status: SupportStatus,
) -> anyhow::Result<()>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    sqlx::query(&format!(
        "UPDATE {} SET status = ?, updated_at = ? WHERE id = ?",
        kind.table()
    ))
    .bind(status)
    .bind(Utc::now())
    .bind(id)
    .execute(conn)
    .await
    .with_context(|| format!("failed to update {}", kind.noun()))?;
    Ok(())
}

pub async fn get_match(db: &Db, id: &str) -> Result<SupportMatch> {
    sqlx::query_as::<_, SupportMatch>("SELECT * FROM support_matches WHERE id = ?")
        .bind(id)
        .fetch_optional(db)
        .await
        .context("failed to fetch support match")?
        .ok_or_else(|| Error::not_found("support match not found"))
}

/// Offer help on an open request, optionally pointing at one of the helper's own offers.
pub async fn propose(db: &Db, helper_id: &str, proposal: Proposal) -> Result<SupportMatch> {
    let request = get_post(db, PostKind::Request, &proposal.request_id).await?;
    if request.user_id == helper_id {
        return Err(Error::bad_request("cannot offer help on your own request"));
    }
    if request.status != SupportStatus::Open {
        return Err(Error::conflict(format!(
            "support request is {}, not open",
            request.status
        )));
    }

    if let Some(offer_id) = &proposal.offer_id {
        let offer = get_post(db, PostKind::Offer, offer_id).await?;
        if offer.user_id != helper_id {
            return Err(Error::forbidden("offer belongs to another user"));
        }
        if offer.status == SupportStatus::Closed {
            return Err(Error::conflict("support offer is closed"));
        }
    }

    let now = Utc::now();
    let m = sqlx::query_as::<_, SupportMatch>(
        r#"
        INSERT INTO support_matches (id, request_id, offer_id, helper_id, requester_id, message, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
        "#,
    )
    .bind(new_id())
    .bind(&request.id)
    .bind(&proposal.offer_id)
    .bind(helper_id)
    .bind(&request.user_id)
    .bind(proposal.message.trim())
    .bind(MatchStatus::Pending)
    .bind(now)
    .bind(now)
    .fetch_one(db)
    .await
    .context("failed to create support match")?;

    info!("support match {} proposed on request {}", m.id, request.id);
    Ok(m)
}

/// Move a match to `to`, guarding against a concurrent change of its current status.
async fn transition<'c, E>(conn: E, m: &SupportMatch, to: MatchStatus) -> Result<()>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let to = m.status.transition(to)?;

    let res = sqlx::query(
        "UPDATE support_matches SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
    )
    .bind(to)
    .bind(Utc::now())
    .bind(&m.id)
    .bind(m.status)
    .execute(conn)
    .await
    .context("failed to update support match")?;

    if res.rows_affected() == 0 {
        return Err(Error::conflict("support match changed concurrently"));
    }
    Ok(())
}

/// Accept or decline a pending match. Only the requester may respond.
///
/// Accepting claims the request, which must still be open, and declines every other pending
/// match on it.
pub async fn respond(db: &Db, match_id: &str, user_id: &str, accept: bool) -> Result<SupportMatch> {
    let m = get_match(db, match_id).await?;
    if m.requester_id != user_id {
        return Err(Error::forbidden("only the requester can respond to this match"));
    }

    if !accept {
        transition(db, &m, MatchStatus::Declined).await?;
        return get_match(db, match_id).await;
    }

    let mut tx = db.begin().await.context("failed to begin transaction")?;
    transition(&mut *tx, &m, MatchStatus::Accepted).await?;

    let claimed = sqlx::query(
        "UPDATE support_requests SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
    )
    .bind(SupportStatus::Matched)
    .bind(Utc::now())
    .bind(&m.request_id)
    .bind(SupportStatus::Open)
    .execute(&mut *tx)
    .await
    .context("failed to claim support request")?
    .rows_affected();

    if claimed == 0 {
        return Err(Error::conflict("support request is no longer open"));
    }

    if let Some(offer_id) = &m.offer_id {
        set_post_status(&mut *tx, PostKind::Offer, offer_id, SupportStatus::Matched).await?;
    }

    let declined = sqlx::query(
        "UPDATE support_matches SET status = ?, updated_at = ? WHERE request_id = ? AND id <> ? AND status = ?",
    )
    .bind(MatchStatus::Declined)
    .bind(Utc::now())
    .bind(&m.request_id)
    .bind(&m.id)
    .bind(MatchStatus::Pending)
    .execute(&mut *tx)
    .await
    .context("failed to decline competing matches")?
    .rows_affected();

    tx.commit().await.context("failed to commit transaction")?;

    info!("support match {match_id} accepted; {declined} competing matches declined");
    get_match(db, match_id).await
}

/// Mark an accepted match as done. Either party may complete it; the helper earns karma.
pub async fn complete(db: &Db, match_id: &str, user_id: &str) -> Result<SupportMatch> {
    let m = get_match(db, match_id).await?;
    if m.requester_id != user_id && m.helper_id != user_id {
        return Err(Error::forbidden("not a party to this match"));
    }

    transition(db, &m, MatchStatus::Completed).await?;

    set_post_status(db, PostKind::Request, &m.request_id, SupportStatus::Closed).await?;
    if let Some(offer_id) = &m.offer_id {
        set_post_status(db, PostKind::Offer, offer_id, SupportStatus::Closed).await?;
    }

    karma::award_best_effort(
        db,
        &m.helper_id,
        karma::points::SUPPORT_COMPLETED,
        "support_completed",
        Some(match_id),
    )
    .await;

    info!("support match {match_id} completed");
    get_match(db, match_id).await
}

/// Matches where the user is either the helper or the requester, newest first.
pub async fn matches_for(db: &Db, user_id: &str) -> anyhow::Result<Vec<SupportMatch>> {
    sqlx::query_as::<_, SupportMatch>(
        "SELECT * FROM support_matches WHERE helper_id = ? OR requester_id = ? ORDER BY created_at DESC",
    )
    .bind(user_id)
    .bind(user_id)
    .fetch_all(db)
    .await
    .context("failed to list support matches")
}
