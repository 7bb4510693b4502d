//! Scheduled jobs: the embeddings backfill and the weekly digest.
//!
//! Jobs are triggered over HTTP by an external scheduler. Each run holds an advisory lock in
//! `cron_control` so overlapping triggers do not run the same job twice.
use std::future::Future;

use anyhow::Context as _;
use chrono::{DateTime, Duration, Utc};
use futures::{stream, StreamExt as _};
use metrics::counter;
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    auth,
    db::Db,
    embeddings::Embedder,
    feeds::{escape_xml, story_url},
    mailer::{Email, Mailer},
    metrics::DIGEST_SENT,
    stories::{self, Story},
    Error, Result,
};

pub const EMBEDDINGS_JOB: &str = "embeddings";
pub const DIGEST_JOB: &str = "digest";

/// Concurrent embedding requests during a backfill.
const EMBED_CONCURRENCY: usize = 4;
const DIGEST_STORIES: i64 = 5;

/// Take the lock for `job` until `now + ttl`. Returns `false` if another run holds it.
pub async fn try_acquire(
    db: &Db,
    job: &str,
    now: DateTime<Utc>,
    ttl: Duration,
) -> anyhow::Result<bool> {
    sqlx::query("INSERT OR IGNORE INTO cron_control (job) VALUES (?)")
        .bind(job)
        .execute(db)
        .await
        .context("failed to register job")?;

    let res = sqlx::query(
        "UPDATE cron_control SET locked_until = ? WHERE job = ? AND (locked_until IS NULL OR locked_until < ?)",
    )
    .bind(now + ttl)
    .bind(job)
    .bind(now)
    .execute(db)
    .await
    .context("failed to acquire job lock")?;

    Ok(res.rows_affected() == 1)
}

/// Clear the lock and record how the run ended.
pub async fn release(db: &Db, job: &str, status: &str) -> anyhow::Result<()> {
    sqlx::query(
        "UPDATE cron_control SET locked_until = NULL, last_run_at = ?, last_status = ? WHERE job = ?",
    )
    .bind(Utc::now())
    .bind(status)
    .bind(job)
    .execute(db)
    .await
    .context("failed to release job lock")?;
    Ok(())
}

/// Run `f` while holding the lock for `job`. A held lock is reported as 409.
pub async fn run_locked<T, F, Fut>(db: &Db, job: &str, ttl: Duration, f: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if !try_acquire(db, job, Utc::now(), ttl).await? {
        return Err(Error::conflict(format!("job `{job}` is already running")));
    }

    let result = f().await;
    let status = match &result {
        Ok(_) => "ok".to_owned(),
        Err(e) => format!("error: {e}"),
    };
    if let Err(e) = release(db, job, &status).await {
        warn!("failed to release lock for {job}: {e:#}");
    }
    result
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackfillReport {
    pub processed: usize,
    pub failed: usize,
    pub remaining: i64,
}

async fn embed_story(db: &Db, embedder: &Embedder, story: &Story) -> anyhow::Result<()> {
    let embedding = embedder.embed(&stories::embedding_text(story)).await?;
    stories::store_embedding(db, &story.id, embedding).await
}

/// Compute embeddings for up to one batch of stories that lack them.
pub async fn backfill_embeddings(db: &Db, embedder: &Embedder) -> anyhow::Result<BackfillReport> {
    let batch = stories::missing_embeddings(db, embedder.batch_size()).await?;

    let results = stream::iter(0..batch.len())
        .map(|i| embed_story(db, embedder, &batch[i]))
        .buffer_unordered(EMBED_CONCURRENCY)
        .collect::<Vec<_>>()
        .await;

    let mut report = BackfillReport::default();
    for result in results {
        match result {
            Ok(()) => report.processed += 1,
            Err(e) => {
                report.failed += 1;
                warn!("embedding backfill failure: {e:#}");
            }
        }
    }

    report.remaining =
        sqlx::query_scalar("SELECT COUNT(*) FROM stories WHERE embedding IS NULL")
            .fetch_one(db)
            .await
            .context("failed to count remaining stories")?;

    info!(
        "embedding backfill: {} processed, {} failed, {} remaining",
        report.processed, report.failed, report.remaining
    );
    Ok(report)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DigestReport {
    pub stories: usize,
    pub recipients: usize,
    pub sent: usize,
    pub failed: usize,
}

pub fn digest_email(site_url: &str, to: &str, stories: &[Story]) -> Email {
    let mut html = String::from("<h1>This week on Aikya</h1>\n<ul>\n");
    let mut text = String::from("This week on Aikya\n\n");
    for story in stories {
        let url = story_url(site_url, story);
        html.push_str(&format!(
            "<li><a href=\"{}\">{}</a><p>{}</p></li>\n",
            escape_xml(&url),
            escape_xml(&story.title),
            escape_xml(&story.dek),
        ));
        text.push_str(&format!("* {}\n  {url}\n", story.title));
    }
    html.push_str("</ul>\n");
    let email: String = url::form_urlencoded::byte_serialize(to.as_bytes()).collect();
    html.push_str(&format!(
        "<p><a href=\"{}/api/digest/unsubscribe?email={}\">Unsubscribe</a></p>\n",
        escape_xml(site_url),
        escape_xml(&email),
    ));

    Email {
        to: to.to_owned(),
        subject: "This week's good news".to_owned(),
        html,
        text,
    }
}

/// Email the past week's top stories to every active subscriber.
pub async fn send_digest(
    db: &Db,
    mailer: &Mailer,
    site_url: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<DigestReport> {
    let top = stories::top_since(db, now - Duration::days(7), DIGEST_STORIES).await?;
    let recipients: Vec<String> = sqlx::query_scalar(
        "SELECT email FROM digest_subscribers WHERE unsubscribed_at IS NULL ORDER BY created_at",
    )
    .fetch_all(db)
    .await
    .context("failed to list digest subscribers")?;

    let mut report = DigestReport {
        stories: top.len(),
        recipients: recipients.len(),
        ..DigestReport::default()
    };

    if top.is_empty() {
        info!("no stories published this week; skipping digest");
        return Ok(report);
    }

    for to in &recipients {
        match mailer.send(&digest_email(site_url, to, &top)).await {
            Ok(true) => report.sent += 1,
            Ok(false) => {}
            Err(e) => {
                report.failed += 1;
                warn!("failed to send digest to {to}: {e:#}");
            }
        }
    }

    counter!(DIGEST_SENT).increment(report.sent as u64);
    info!(
        "digest: {} stories to {} subscribers ({} sent, {} failed)",
        report.stories, report.recipients, report.sent, report.failed
    );
    Ok(report)
}

/// Subscribe `email`, reactivating an earlier unsubscribe.
pub async fn subscribe(db: &Db, email: &str) -> Result<()> {
    let email = auth::normalize_email(email)?;
    sqlx::query(
        r#"
        INSERT INTO digest_subscribers (email, created_at) VALUES (?, ?)
            ON CONFLICT(email) DO UPDATE SET unsubscribed_at = NULL
        "#,
    )
    .bind(&email)
    .bind(Utc::now())
    .execute(db)
    .await
    .context("failed to subscribe")?;
    Ok(())
}

pub async fn unsubscribe(db: &Db, email: &str) -> Result<()> {
    let email = auth::normalize_email(email)?;
    sqlx::query(
        "UPDATE digest_subscribers SET unsubscribed_at = ? WHERE email = ? AND unsubscribed_at IS NULL",
    )
    .bind(Utc::now())
    .bind(&email)
    .execute(db)
    .await
    .context("failed to unsubscribe")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_is_exclusive_until_released_or_expired() {
        let db = crate::db::memory_pool().await.unwrap();
        let now = Utc::now();

        assert!(try_acquire(&db, "job", now, Duration::minutes(10)).await.unwrap());
        assert!(!try_acquire(&db, "job", now, Duration::minutes(10)).await.unwrap());
        assert!(try_acquire(&db, "other", now, Duration::minutes(10)).await.unwrap());

        // An expired lock can be taken over.
        let later = now + Duration::minutes(11);
        assert!(try_acquire(&db, "job", later, Duration::minutes(10)).await.unwrap());

        release(&db, "job", "ok").await.unwrap();
        assert!(try_acquire(&db, "job", later, Duration::minutes(10)).await.unwrap());
    }
}
