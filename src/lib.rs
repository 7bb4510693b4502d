//! Aikya: a positive-news publishing and community service.
mod analytics;
mod auth;
mod certificate;
mod comments;
mod config;
mod db;
mod embeddings;
mod endpoints;
pub mod error;
mod feeds;
mod good;
mod jobs;
mod karma;
mod mailer;
mod metrics;
mod partners;
mod serve;
mod status;
mod storage;
mod stories;
mod submissions;
mod support;
#[cfg(test)]
mod tests;

pub use serve::run;
use serve::{AppState, Error, Result};

/// The index (/) route.
async fn index() -> impl axum::response::IntoResponse {
    r"
         _ _
   __ _ (_) | ___   _  __ _
  / _` || | |/ / | | |/ _` |
 | (_| || |   <| |_| | (_| |
  \__,_||_|_|\_\\__, |\__,_|
                |___/

Aikya: good news, shared.

The JSON API lives under /api/
Feeds: /rss.xml /atom.xml /sitemap.xml
    "
}
