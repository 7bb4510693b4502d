//! Authentication layers

use anyhow::{anyhow, Context as _};
use argon2::{
    password_hash::SaltString, Argon2, PasswordHash, PasswordHasher as _, PasswordVerifier as _,
};
use axum::{
    extract::{FromRequestParts, OptionalFromRequestParts},
    http::{
        header::{AUTHORIZATION, COOKIE},
        request::Parts,
    },
};
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use rand::RngCore as _;
use serde::Serialize;
use sha2::Digest as _;
use tracing::warn;

use crate::{
    db::{new_id, Db},
    metrics::AUTH_FAILED,
    AppState, Error,
};

/// Name of the cookie set by the magic-link callback.
pub const SESSION_COOKIE: &str = "aikya_session";

/// A row of `profiles`, as returned to its owner.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Profile {
    pub id: String,
    pub email: String,
    pub display_name: String,
    pub bio: String,
    pub avatar_url: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub role: String,
    pub is_banned: bool,
    pub created_at: DateTime<Utc>,
}

/// The caller behind a valid session.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuthenticatedUser {
    pub id: String,
    pub is_banned: bool,
}

impl AuthenticatedUser {
    /// Reject banned accounts from write paths that create public content.
    pub fn ensure_not_banned(&self) -> Result<(), Error> {
        if self.is_banned {
            Err(Error::forbidden("account is banned"))
        } else {
            Ok(())
        }
    }
}

/// A caller with the admin role.
#[derive(Debug, Clone)]
pub struct AdminUser(pub AuthenticatedUser);

/// Generate a random opaque token, base64url encoded.
pub fn generate_token() -> String {
    let mut bytes = [0_u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Tokens are only ever stored hashed.
pub fn hash_token(token: &str) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(sha2::Sha256::digest(token.as_bytes()))
}

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut rand::thread_rng());
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), salt.as_salt())
        .map_err(|e| anyhow!("failed to hash password: {e}"))?
        .to_string();
    Ok(hash)
}

pub fn verify_password(password: &str, hash: &str) -> anyhow::Result<bool> {
    let hash = PasswordHash::new(hash).map_err(|e| anyhow!("invalid password hash in db: {e}"))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &hash)
        .is_ok())
}

/// Start a session for `user_id` and return the bearer token.
pub async fn create_session(db: &Db, user_id: &str, ttl_days: i64) -> anyhow::Result<String> {
    let token = generate_token();
    let now = Utc::now();

    sqlx::query(
        r#"
        INSERT INTO sessions (token_hash, user_id, created_at, expires_at)
            VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(hash_token(&token))
    .bind(user_id)
    .bind(now)
    .bind(now + Duration::days(ttl_days))
    .execute(db)
    .await
    .context("failed to create new session")?;

    Ok(token)
}

pub async fn delete_session(db: &Db, token: &str) -> anyhow::Result<()> {
    sqlx::query("DELETE FROM sessions WHERE token_hash = ?")
        .bind(hash_token(token))
        .execute(db)
        .await
        .context("failed to delete session")?;
    Ok(())
}

/// Whether `user_id` holds the admin role.
///
/// The `admins` table is authoritative. If it cannot be read the profile's role column is
/// consulted instead, so a transient failure does not lock admins out.
pub async fn is_admin(db: &Db, user_id: &str) -> anyhow::Result<bool> {
    let listed = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM admins WHERE user_id = ?")
        .bind(user_id)
        .fetch_one(db)
        .await;

    match listed {
        Ok(n) if n > 0 => Ok(true),
        Ok(_) => Ok(false),
        Err(e) => {
            warn!("admin lookup failed, falling back to profile role: {e}");
            let role: Option<String> =
                sqlx::query_scalar("SELECT role FROM profiles WHERE id = ?")
                    .bind(user_id)
                    .fetch_optional(db)
                    .await
                    .context("failed to read profile role")?;
            Ok(role.as_deref() == Some("admin"))
        }
    }
}

/// How long a magic-link token stays redeemable.
const LOGIN_TOKEN_TTL_MINUTES: i64 = 15;

/// Lowercase and sanity-check an email address.
pub fn normalize_email(email: &str) -> Result<String, Error> {
    let email = email.trim().to_lowercase();
    let valid = matches!(
        email.split_once('@'),
        Some((user, domain)) if !user.is_empty() && domain.contains('.')
    );
    if !valid {
        return Err(Error::bad_request("a valid email address is required"));
    }
    Ok(email)
}

pub async fn profile(db: &Db, id: &str) -> Result<Profile, Error> {
    sqlx::query_as::<_, Profile>("SELECT * FROM profiles WHERE id = ?")
        .bind(id)
        .fetch_optional(db)
        .await
        .context("failed to fetch profile")?
        .ok_or_else(|| Error::not_found("profile not found"))
}

pub async fn profile_by_email(db: &Db, email: &str) -> anyhow::Result<Option<Profile>> {
    sqlx::query_as::<_, Profile>("SELECT * FROM profiles WHERE email = ?")
        .bind(email)
        .fetch_optional(db)
        .await
        .context("failed to fetch profile")
}

/// Create a profile. Addresses listed in `admin_emails` are also granted the admin role.
pub async fn create_profile(
    db: &Db,
    email: &str,
    password_hash: Option<&str>,
    display_name: &str,
    admin_emails: &[String],
) -> Result<Profile, Error> {
    let mut tx = db.begin().await.context("failed to begin transaction")?;

    let taken: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM profiles WHERE email = ?")
        .bind(email)
        .fetch_one(&mut *tx)
        .await
        .context("failed to check email")?;
    if taken > 0 {
        return Err(Error::conflict("an account with this email already exists"));
    }

    let is_admin = admin_emails.iter().any(|a| a.eq_ignore_ascii_case(email));
    let now = Utc::now();
    let profile = sqlx::query_as::<_, Profile>(
        r#"
        INSERT INTO profiles (id, email, password_hash, display_name, role, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING *
        "#,
    )
    .bind(new_id())
    .bind(email)
    .bind(password_hash)
    .bind(display_name.trim())
    .bind(if is_admin { "admin" } else { "member" })
    .bind(now)
    .fetch_one(&mut *tx)
    .await
    .context("failed to create profile")?;

    if is_admin {
        sqlx::query("INSERT INTO admins (user_id, created_at) VALUES (?, ?)")
            .bind(&profile.id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("failed to grant admin role")?;
    }

    tx.commit().await.context("failed to commit transaction")?;
    Ok(profile)
}

/// Issue a one-time magic-link token for `user_id`.
pub async fn create_login_token(db: &Db, user_id: &str) -> anyhow::Result<String> {
    let token = generate_token();

    sqlx::query("INSERT INTO login_tokens (token_hash, user_id, expires_at) VALUES (?, ?, ?)")
        .bind(hash_token(&token))
        .bind(user_id)
        .bind(Utc::now() + Duration::minutes(LOGIN_TOKEN_TTL_MINUTES))
        .execute(db)
        .await
        .context("failed to store login token")?;

    Ok(token)
}

/// Redeem a magic-link token, returning its user. Each token works once, before it expires.
pub async fn redeem_login_token(db: &Db, token: &str) -> anyhow::Result<Option<String>> {
    let now = Utc::now();
    sqlx::query_scalar(
        r#"
        UPDATE login_tokens SET used_at = ?
            WHERE token_hash = ? AND used_at IS NULL AND expires_at > ?
            RETURNING user_id
        "#,
    )
    .bind(now)
    .bind(hash_token(token))
    .bind(now)
    .fetch_optional(db)
    .await
    .context("failed to redeem login token")
}

/// Pull the session token from the `Authorization` header or the session cookie.
pub fn session_token(parts: &Parts) -> Option<String> {
    let bearer = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if let Some(token) = bearer {
        return Some(token.trim().to_owned());
    }

    parts
        .headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == SESSION_COOKIE).then(|| value.to_owned())
        })
}

async fn lookup_session(db: &Db, token: &str) -> anyhow::Result<Option<AuthenticatedUser>> {
    sqlx::query_as::<_, AuthenticatedUser>(
        r#"
        SELECT p.id, p.is_banned
        FROM sessions s
        JOIN profiles p ON p.id = s.user_id
        WHERE s.token_hash = ? AND s.expires_at > ?
        "#,
    )
    .bind(hash_token(token))
    .bind(Utc::now())
    .fetch_optional(db)
    .await
    .context("failed to look up session")
}

impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = Error;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = session_token(parts).ok_or_else(|| Error::unauthorized("sign in required"))?;

        match lookup_session(&state.db, &token).await? {
            Some(user) => Ok(user),
            None => {
                counter!(AUTH_FAILED).increment(1);
                Err(Error::unauthorized("invalid or expired session"))
            }
        }
    }
}

impl OptionalFromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = Error;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Option<Self>, Self::Rejection> {
        match session_token(parts) {
            Some(token) => Ok(lookup_session(&state.db, &token).await?),
            None => Ok(None),
        }
    }
}

impl FromRequestParts<AppState> for AdminUser {
    type Rejection = Error;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let user =
            <AuthenticatedUser as FromRequestParts<AppState>>::from_request_parts(parts, state)
                .await?;

        if is_admin(&state.db, &user.id).await? {
            Ok(Self(user))
        } else {
            Err(Error::forbidden("admin role required"))
        }
    }
}
