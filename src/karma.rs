//! Karma: points ledger, levels, daily streaks and personal goals.
use anyhow::Context as _;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    db::{new_id, Db},
    metrics::KARMA_POINTS,
    Error, Result,
};

/// Points awarded for each kind of contribution.
pub mod points {
    pub const CHECK_IN: i64 = 5;
    /// Extra points on every seventh consecutive day.
    pub const STREAK_BONUS: i64 = 10;
    pub const COMMENT_APPROVED: i64 = 2;
    pub const GOOD_ACT_VERIFIED: i64 = 25;
    pub const SUPPORT_COMPLETED: i64 = 15;
    pub const GOAL_COMPLETED: i64 = 10;
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Level {
    pub level: i64,
    pub name: &'static str,
    pub min_points: i64,
}

/// Level thresholds, in ascending order of `min_points`.
pub const LEVELS: &[Level] = &[
    Level { level: 1, name: "Seedling", min_points: 0 },
    Level { level: 2, name: "Sprout", min_points: 50 },
    Level { level: 3, name: "Sapling", min_points: 150 },
    Level { level: 4, name: "Tree", min_points: 400 },
    Level { level: 5, name: "Grove", min_points: 1000 },
];

/// The highest level whose threshold `total_points` meets.
pub fn level_for(total_points: i64) -> Level {
    let mut current = LEVELS[0];
    for level in LEVELS {
        if total_points >= level.min_points {
            current = *level;
        }
    }
    current
}

pub fn next_level(total_points: i64) -> Option<Level> {
    LEVELS.iter().copied().find(|l| l.min_points > total_points)
}

/// The streak after checking in on `today`, or `None` when already checked in today.
pub fn next_streak(last_check_in: Option<NaiveDate>, today: NaiveDate, streak: i64) -> Option<i64> {
    match last_check_in {
        Some(last) if last == today => None,
        Some(last) if last + Duration::days(1) == today => Some(streak + 1),
        _ => Some(1),
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct KarmaProfile {
    pub user_id: String,
    pub streak_days: i64,
    pub longest_streak: i64,
    pub last_check_in: Option<NaiveDate>,
    pub total_points: i64,
    pub level: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LedgerEntry {
    pub id: String,
    pub points: i64,
    pub reason: String,
    pub ref_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Goal {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub target_count: i64,
    pub progress: i64,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewGoal {
    pub title: String,
    pub target_count: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LeaderboardEntry {
    pub user_id: String,
    pub display_name: String,
    pub total_points: i64,
    pub level: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckIn {
    pub profile: KarmaProfile,
    pub awarded: i64,
    pub already_checked_in: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NextLevel {
    pub level: i64,
    pub name: &'static str,
    pub points_needed: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub profile: KarmaProfile,
    pub level_name: &'static str,
    pub next_level: Option<NextLevel>,
    pub tip: String,
}

/// A short nudge for the user based on where they stand today.
pub fn coach_tip(profile: &KarmaProfile, today: NaiveDate) -> String {
    if profile.last_check_in != Some(today) {
        return match profile.last_check_in {
            Some(last) if last + Duration::days(1) == today && profile.streak_days > 0 => format!(
                "Check in today to extend your {}-day streak.",
                profile.streak_days
            ),
            _ => "Check in today to start a new streak.".to_owned(),
        };
    }

    match next_level(profile.total_points) {
        Some(next) => format!(
            "You are {} points away from {}. Share a good act or lend a hand in the Support hub.",
            next.min_points - profile.total_points,
            next.name
        ),
        None => "You have reached the highest level. Keep inspiring others!".to_owned(),
    }
}

async fn ensure_profile<'c, E>(conn: E, user_id: &str) -> anyhow::Result<()>
where
    E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
{
    sqlx::query(
        "INSERT OR IGNORE INTO karma_profiles (user_id, streak_days, longest_streak, total_points, level, updated_at) \
         VALUES (?, 0, 0, 0, 1, ?)",
    )
    .bind(user_id)
    .bind(Utc::now())
    .execute(conn)
    .await
    .context("failed to create karma profile")?;
    Ok(())
}

pub async fn profile(db: &Db, user_id: &str) -> anyhow::Result<KarmaProfile> {
    ensure_profile(db, user_id).await?;
    sqlx::query_as::<_, KarmaProfile>("SELECT * FROM karma_profiles WHERE user_id = ?")
        .bind(user_id)
        .fetch_one(db)
        .await
        .context("failed to fetch karma profile")
}

pub async fn summary(db: &Db, user_id: &str) -> anyhow::Result<Summary> {
    let profile = profile(db, user_id).await?;
    let level = level_for(profile.total_points);
    let next = next_level(profile.total_points).map(|l| NextLevel {
        level: l.level,
        name: l.name,
        points_needed: l.min_points - profile.total_points,
    });
    let tip = coach_tip(&profile, Utc::now().date_naive());

    Ok(Summary {
        level_name: level.name,
        next_level: next,
        tip,
        profile,
    })
}

/// Append a ledger entry and add it to the user's total, recomputing their level.
///
/// An award with a `ref_id` is granted once per `(user, reason, ref_id)`; repeats leave the
/// profile unchanged.
pub async fn award(
    db: &Db,
    user_id: &str,
    points: i64,
    reason: &str,
    ref_id: Option<&str>,
) -> anyhow::Result<KarmaProfile> {
    let mut tx = db.begin().await.context("failed to begin transaction")?;
    ensure_profile(&mut *tx, user_id).await?;

    let inserted = sqlx::query(
        "INSERT OR IGNORE INTO karma_ledger (id, user_id, points, reason, ref_id, created_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(new_id())
    .bind(user_id)
    .bind(points)
    .bind(reason)
    .bind(ref_id)
    .bind(Utc::now())
    .execute(&mut *tx)
    .await
    .context("failed to append ledger entry")?
    .rows_affected();

    if inserted == 0 {
        let profile =
            sqlx::query_as::<_, KarmaProfile>("SELECT * FROM karma_profiles WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(&mut *tx)
                .await
                .context("failed to fetch karma profile")?;
        tx.commit().await.context("failed to commit transaction")?;
        debug!("{reason} karma for {user_id} was already awarded");
        return Ok(profile);
    }

    let total: i64 = sqlx::query_scalar(
        "UPDATE karma_profiles SET total_points = total_points + ?, updated_at = ? WHERE user_id = ? RETURNING total_points",
    )
    .bind(points)
    .bind(Utc::now())
    .bind(user_id)
    .fetch_one(&mut *tx)
    .await
    .context("failed to update karma total")?;

    let profile = sqlx::query_as::<_, KarmaProfile>(
        "UPDATE karma_profiles SET level = ? WHERE user_id = ? RETURNING *",
    )
    .bind(level_for(total).level)
    .bind(user_id)
    .fetch_one(&mut *tx)
    .await
    .context("failed to update karma level")?;

    tx.commit().await.context("failed to commit transaction")?;

    counter!(KARMA_POINTS).increment(u64::try_from(points).unwrap_or(0));
    debug!("awarded {points} karma to {user_id} for {reason}");
    Ok(profile)
}

/// Award points without letting a failure affect the caller's primary action.
pub async fn award_best_effort(db: &Db, user_id: &str, points: i64, reason: &str, ref_id: Option<&str>) {
    if let Err(e) = award(db, user_id, points, reason, ref_id).await {
        warn!("failed to award {points} karma to {user_id} for {reason}: {e:#}");
    }
}

/// Daily check-in for `today`.
pub async fn check_in(db: &Db, user_id: &str, today: NaiveDate) -> anyhow::Result<CheckIn> {
    let current = profile(db, user_id).await?;

    let Some(streak) = next_streak(current.last_check_in, today, current.streak_days) else {
        return Ok(CheckIn {
            profile: current,
            awarded: 0,
            already_checked_in: true,
        });
    };

    // Only the first writer for `today` wins; a concurrent duplicate check-in updates nothing.
    let res = sqlx::query(
        r#"
        UPDATE karma_profiles
            SET streak_days = ?, longest_streak = MAX(longest_streak, ?), last_check_in = ?, updated_at = ?
            WHERE user_id = ? AND (last_check_in IS NULL OR last_check_in <> ?)
        "#,
    )
    .bind(streak)
    .bind(streak)
    .bind(today)
    .bind(Utc::now())
    .bind(user_id)
    .bind(today)
    .execute(db)
    .await
    .context("failed to record check-in")?;

    if res.rows_affected() == 0 {
        return Ok(CheckIn {
            profile: profile(db, user_id).await?,
            awarded: 0,
            already_checked_in: true,
        });
    }

    let mut awarded = points::CHECK_IN;
    if streak % 7 == 0 {
        awarded += points::STREAK_BONUS;
    }
    let profile = award(db, user_id, awarded, "check_in", None).await?;

    Ok(CheckIn {
        profile,
        awarded,
        already_checked_in: false,
    })
}

pub async fn ledger(db: &Db, user_id: &str, limit: i64) -> anyhow::Result<Vec<LedgerEntry>> {
    sqlx::query_as::<_, LedgerEntry>(
        "SELECT id, points, reason, ref_id, created_at FROM karma_ledger WHERE user_id = ? ORDER BY created_at DESC LIMIT ?",
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(db)
    .await
    .context("failed to fetch karma ledger")
}

pub async fn leaderboard(db: &Db, limit: i64) -> anyhow::Result<Vec<LeaderboardEntry>> {
    sqlx::query_as::<_, LeaderboardEntry>(
        r#"
        SELECT k.user_id, p.display_name, k.total_points, k.level
        FROM karma_profiles k
        JOIN profiles p ON p.id = k.user_id
        WHERE p.is_banned = 0
        ORDER BY k.total_points DESC, k.updated_at ASC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(db)
    .await
    .context("failed to fetch leaderboard")
}

pub async fn create_goal(db: &Db, user_id: &str, goal: NewGoal) -> Result<Goal> {
    let title = goal.title.trim();
    if title.is_empty() {
        return Err(Error::bad_request("goal title is required"));
    }
    if !(1..=365).contains(&goal.target_count) {
        return Err(Error::bad_request("target_count must be between 1 and 365"));
    }

    let goal = sqlx::query_as::<_, Goal>(
        "INSERT INTO karma_goals (id, user_id, title, target_count, progress, created_at) VALUES (?, ?, ?, ?, 0, ?) RETURNING *",
    )
    .bind(new_id())
    .bind(user_id)
    .bind(title)
    .bind(goal.target_count)
    .bind(Utc::now())
    .fetch_one(db)
    .await
    .context("failed to create goal")?;
    Ok(goal)
}

pub async fn goals(db: &Db, user_id: &str) -> anyhow::Result<Vec<Goal>> {
    sqlx::query_as::<_, Goal>("SELECT * FROM karma_goals WHERE user_id = ? ORDER BY created_at DESC")
        .bind(user_id)
        .fetch_all(db)
        .await
        .context("failed to list goals")
}

/// Advance a goal by one step. Reaching the target completes it and awards points once.
pub async fn progress_goal(db: &Db, user_id: &str, goal_id: &str) -> Result<Goal> {
    let goal = sqlx::query_as::<_, Goal>("SELECT * FROM karma_goals WHERE id = ? AND user_id = ?")
        .bind(goal_id)
        .bind(user_id)
        .fetch_optional(db)
        .await
        .context("failed to fetch goal")?
        .ok_or_else(|| Error::not_found("goal not found"))?;

    if goal.completed_at.is_some() {
        return Ok(goal);
    }

    let goal = sqlx::query_as::<_, Goal>(
        r#"
        UPDATE karma_goals
            SET progress = progress + 1,
                completed_at = CASE WHEN progress + 1 >= target_count THEN ? ELSE NULL END
            WHERE id = ? AND completed_at IS NULL
            RETURNING *
        "#,
    )
    .bind(Utc::now())
    .bind(goal_id)
    .fetch_one(db)
    .await
    .context("failed to update goal")?;

    if goal.completed_at.is_some() {
        award_best_effort(db, user_id, points::GOAL_COMPLETED, "goal_completed", Some(goal_id)).await;
    }
    Ok(goal)
}
