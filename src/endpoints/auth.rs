//! Sign-up, sign-in, magic links and the caller's own profile.
use anyhow::Context as _;
use axum::{
    extract::{Query, Request, State},
    http::header::SET_COOKIE,
    response::{AppendHeaders, IntoResponse, Redirect},
    routing::{get, post},
    Json, Router,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    auth::{self, AuthenticatedUser, Profile, SESSION_COOKIE},
    config::AppConfig,
    db::Db,
    mailer::{Email, Mailer},
    metrics::AUTH_FAILED,
    error::Body, AppState, Error, Result,
};

const MIN_PASSWORD_CHARS: usize = 8;

#[derive(Debug, Deserialize)]
struct SignUpInput {
    email: String,
    password: String,
    #[serde(default)]
    display_name: String,
}

#[derive(Debug, Deserialize)]
struct SignInInput {
    email: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct SessionOutput {
    token: String,
    profile: Profile,
    is_admin: bool,
}

#[derive(Debug, Serialize)]
struct SessionInfo {
    profile: Profile,
    is_admin: bool,
}

async fn sign_up(
    State(db): State<Db>,
    State(config): State<AppConfig>,
    Body(input): Body<SignUpInput>,
) -> Result<Json<SessionOutput>> {
    let email = auth::normalize_email(&input.email)?;
    if input.password.chars().count() < MIN_PASSWORD_CHARS {
        return Err(Error::bad_request(format!(
            "password must be at least {MIN_PASSWORD_CHARS} characters"
        )));
    }

    let hash = auth::hash_password(&input.password)?;
    let profile =
        auth::create_profile(&db, &email, Some(&hash), &input.display_name, &config.admin_emails)
            .await?;
    let token = auth::create_session(&db, &profile.id, config.session_ttl_days).await?;
    let is_admin = auth::is_admin(&db, &profile.id).await?;

    info!("new account {}", profile.id);
    Ok(Json(SessionOutput {
        token,
        profile,
        is_admin,
    }))
}

async fn sign_in(
    State(db): State<Db>,
    State(config): State<AppConfig>,
    Body(input): Body<SignInInput>,
) -> Result<Json<SessionOutput>> {
    let email = auth::normalize_email(&input.email)?;

    let row: Option<(String, Option<String>)> =
        sqlx::query_as("SELECT id, password_hash FROM profiles WHERE email = ?")
            .bind(&email)
            .fetch_optional(&db)
            .await
            .context("failed to look up account")?;

    let user_id = match row {
        Some((id, Some(hash))) if auth::verify_password(&input.password, &hash)? => id,
        _ => {
            counter!(AUTH_FAILED).increment(1);
            return Err(Error::unauthorized("invalid email or password"));
        }
    };

    let token = auth::create_session(&db, &user_id, config.session_ttl_days).await?;
    Ok(Json(SessionOutput {
        token,
        profile: auth::profile(&db, &user_id).await?,
        is_admin: auth::is_admin(&db, &user_id).await?,
    }))
}

fn session_cookie(token: &str, max_age_secs: i64) -> String {
    format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age_secs}")
}

async fn sign_out(State(db): State<Db>, request: Request) -> Result<impl IntoResponse> {
    let (parts, _body) = request.into_parts();
    if let Some(token) = auth::session_token(&parts) {
        auth::delete_session(&db, &token).await?;
    }

    Ok((
        AppendHeaders([(SET_COOKIE, session_cookie("", 0))]),
        Json(serde_json::json!({ "signed_out": true })),
    ))
}

#[derive(Debug, Deserialize)]
struct MagicLinkInput {
    email: String,
}

#[derive(Debug, Serialize)]
struct MagicLinkOutput {
    sent: bool,
    /// Only returned in test mode, where no email is delivered.
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
}

async fn magic_link(
    State(db): State<Db>,
    State(config): State<AppConfig>,
    State(mailer): State<Mailer>,
    Body(input): Body<MagicLinkInput>,
) -> Result<Json<MagicLinkOutput>> {
    let email = auth::normalize_email(&input.email)?;

    let profile = match auth::profile_by_email(&db, &email).await? {
        Some(profile) => profile,
        None => auth::create_profile(&db, &email, None, "", &config.admin_emails).await?,
    };

    let token = auth::create_login_token(&db, &profile.id).await?;
    let link = format!("{}/auth/callback?token={token}", config.site_url());

    let sent = mailer
        .send(&Email {
            to: email,
            subject: "Your Aikya sign-in link".to_owned(),
            html: format!("<p><a href=\"{link}\">Sign in to Aikya</a>. The link expires in 15 minutes.</p>"),
            text: format!("Sign in to Aikya: {link}\nThe link expires in 15 minutes."),
        })
        .await
        .context("failed to send sign-in link")?;

    Ok(Json(MagicLinkOutput {
        sent,
        token: config.test.then_some(token),
    }))
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    token: String,
}

async fn callback(
    State(db): State<Db>,
    State(config): State<AppConfig>,
    Query(params): Query<CallbackParams>,
) -> Result<impl IntoResponse> {
    let Some(user_id) = auth::redeem_login_token(&db, &params.token).await? else {
        counter!(AUTH_FAILED).increment(1);
        return Err(Error::unauthorized("sign-in link is invalid or has expired"));
    };

    let token = auth::create_session(&db, &user_id, config.session_ttl_days).await?;
    let max_age = config.session_ttl_days * 24 * 60 * 60;

    Ok((
        AppendHeaders([(SET_COOKIE, session_cookie(&token, max_age))]),
        Redirect::to("/"),
    ))
}

async fn session(user: AuthenticatedUser, State(db): State<Db>) -> Result<Json<SessionInfo>> {
    Ok(Json(SessionInfo {
        profile: auth::profile(&db, &user.id).await?,
        is_admin: auth::is_admin(&db, &user.id).await?,
    }))
}

async fn get_profile(user: AuthenticatedUser, State(db): State<Db>) -> Result<Json<Profile>> {
    Ok(Json(auth::profile(&db, &user.id).await?))
}

#[derive(Debug, Deserialize)]
struct ProfileInput {
    display_name: Option<String>,
    bio: Option<String>,
    avatar_url: Option<String>,
    city: Option<String>,
    state: Option<String>,
}

async fn put_profile(
    user: AuthenticatedUser,
    State(db): State<Db>,
    Body(input): Body<ProfileInput>,
) -> Result<Json<Profile>> {
    user.ensure_not_banned()?;
    if let Some(url) = &input.avatar_url {
        url::Url::parse(url).map_err(|e| Error::bad_request(format!("invalid avatar url: {e}")))?;
    }

    let current = auth::profile(&db, &user.id).await?;
    let profile = sqlx::query_as::<_, Profile>(
        r#"
        UPDATE profiles
            SET display_name = ?, bio = ?, avatar_url = ?, city = ?, state = ?
            WHERE id = ?
            RETURNING *
        "#,
    )
    .bind(input.display_name.map_or(current.display_name, |n| n.trim().to_owned()))
    .bind(input.bio.unwrap_or(current.bio))
    .bind(input.avatar_url.or(current.avatar_url))
    .bind(input.city.or(current.city))
    .bind(input.state.or(current.state))
    .bind(&user.id)
    .fetch_one(&db)
    .await
    .context("failed to update profile")?;

    Ok(Json(profile))
}

#[rustfmt::skip]
pub(super) fn routes() -> Router<AppState> {
    // UP /api/auth/sign-up
    // UP /api/auth/sign-in
    // UP /api/auth/sign-out
    // UP /api/auth/magic-link
    // UG /auth/callback
    // AG /api/auth/session
    // AG /api/profile
    // AU /api/profile
    Router::new()
        .route("/api/auth/sign-up",    post(sign_up))
        .route("/api/auth/sign-in",    post(sign_in))
        .route("/api/auth/sign-out",   post(sign_out))
        .route("/api/auth/magic-link", post(magic_link))
        .route("/auth/callback",       get(callback))
        .route("/api/auth/session",    get(session))
        .route("/api/profile",         get(get_profile).put(put_profile))
}
