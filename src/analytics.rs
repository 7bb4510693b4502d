//! Page and story event tracking, and the admin dashboard built from it.
use anyhow::Context as _;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    db::{new_id, Db},
    status::{CommentStatus, GoodActStatus, SubmissionStatus},
};

pub const STORY_VIEW: &str = "story_view";

#[derive(Debug, Clone, Deserialize)]
pub struct NewEvent {
    pub kind: String,
    #[serde(default)]
    pub path: String,
    pub story_id: Option<String>,
    pub referrer: Option<String>,
}

/// Store an event. Unknown story ids are recorded as `NULL` rather than rejected.
pub async fn record(db: &Db, event: &NewEvent, user_id: Option<&str>) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO analytics_events (id, kind, path, story_id, user_id, referrer, created_at)
            VALUES (?, ?, ?, (SELECT id FROM stories WHERE id = ?), ?, ?, ?)
        "#,
    )
    .bind(new_id())
    .bind(&event.kind)
    .bind(&event.path)
    .bind(&event.story_id)
    .bind(user_id)
    .bind(&event.referrer)
    .bind(Utc::now())
    .execute(db)
    .await
    .context("failed to record analytics event")?;
    Ok(())
}

pub async fn record_best_effort(db: &Db, event: &NewEvent, user_id: Option<&str>) {
    if let Err(e) = record(db, event, user_id).await {
        warn!("dropping {} event: {e:#}", event.kind);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Totals {
    pub users: i64,
    pub stories: i64,
    pub published_stories: i64,
    pub comments: i64,
    pub pending_comments: i64,
    pub flagged_comments: i64,
    pub submissions: i64,
    pub pending_submissions: i64,
    pub good_acts: i64,
    pub verified_good_acts: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DailyCount {
    pub day: String,
    pub events: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TopStory {
    pub story_id: String,
    pub slug: String,
    pub title: String,
    pub views: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    pub totals: Totals,
    pub events_per_day: Vec<DailyCount>,
    pub top_stories: Vec<TopStory>,
}

async fn count(db: &Db, sql: &str) -> anyhow::Result<i64> {
    sqlx::query_scalar(sql)
        .fetch_one(db)
        .await
        .with_context(|| format!("failed to run `{sql}`"))
}

async fn count_status(db: &Db, table: &str, status: &str) -> anyhow::Result<i64> {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table} WHERE status = ?"))
        .bind(status)
        .fetch_one(db)
        .await
        .with_context(|| format!("failed to count {status} rows in {table}"))
}

pub async fn totals(db: &Db) -> anyhow::Result<Totals> {
    Ok(Totals {
        users: count(db, "SELECT COUNT(*) FROM profiles").await?,
        stories: count(db, "SELECT COUNT(*) FROM stories").await?,
        published_stories: count(db, "SELECT COUNT(*) FROM stories WHERE is_published = 1").await?,
        comments: count(db, "SELECT COUNT(*) FROM comments").await?,
        pending_comments: count_status(db, "comments", CommentStatus::Pending.as_str()).await?,
        flagged_comments: count_status(db, "comments", CommentStatus::Flagged.as_str()).await?,
        submissions: count(db, "SELECT COUNT(*) FROM story_submissions").await?,
        pending_submissions: count_status(
            db,
            "story_submissions",
            SubmissionStatus::Pending.as_str(),
        )
        .await?,
        good_acts: count(db, "SELECT COUNT(*) FROM good_acts").await?,
        verified_good_acts: count_status(db, "good_acts", GoodActStatus::Verified.as_str()).await?,
    })
}

/// Totals, daily event counts for the past week and the most viewed stories of the past 30 days.
pub async fn dashboard(db: &Db, now: DateTime<Utc>) -> anyhow::Result<Dashboard> {
    let totals = totals(db).await?;

    let events_per_day = sqlx::query_as::<_, DailyCount>(
        r#"
        SELECT substr(created_at, 1, 10) AS day, COUNT(*) AS events
            FROM analytics_events
            WHERE created_at >= ?
            GROUP BY day
            ORDER BY day ASC
        "#,
    )
    .bind(now - Duration::days(7))
    .fetch_all(db)
    .await
    .context("failed to count events per day")?;

    let top_stories = sqlx::query_as::<_, TopStory>(
        r#"
        SELECT s.id AS story_id, s.slug, s.title, COUNT(*) AS views
            FROM analytics_events e
            JOIN stories s ON s.id = e.story_id
            WHERE e.kind = ? AND e.created_at >= ?
            GROUP BY s.id
            ORDER BY views DESC, s.title ASC
            LIMIT 10
        "#,
    )
    .bind(STORY_VIEW)
    .bind(now - Duration::days(30))
    .fetch_all(db)
    .await
    .context("failed to rank viewed stories")?;

    Ok(Dashboard {
        totals,
        events_per_day,
        top_stories,
    })
}
