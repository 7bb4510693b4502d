//! Metric name constants.

use std::time::Duration;

use anyhow::Context;
use metrics::describe_counter;
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config;

pub const AUTH_FAILED: &str = "aikya.auth.failed"; // Counter.

pub const COMMENTS_CREATED: &str = "aikya.comments.created"; // Counter.
pub const COMMENTS_FLAGGED: &str = "aikya.comments.flagged"; // Counter.

pub const STORIES_PUBLISHED: &str = "aikya.stories.published"; // Counter.
pub const EMBEDDINGS_COMPUTED: &str = "aikya.embeddings.computed"; // Counter.

pub const CERTIFICATES_ISSUED: &str = "aikya.certificates.issued"; // Counter.
pub const KARMA_POINTS: &str = "aikya.karma.points"; // Counter.
pub const DIGEST_SENT: &str = "aikya.digest.sent"; // Counter.

/// Must be ran exactly once on startup. This will declare all of the instruments for `metrics`.
pub fn setup(config: Option<&config::MetricConfig>) -> anyhow::Result<()> {
    describe_counter!(AUTH_FAILED, "The number of failed authentication attempts.");

    describe_counter!(COMMENTS_CREATED, "The count of comments submitted.");
    describe_counter!(
        COMMENTS_FLAGGED,
        "The count of comments moved into the flagged queue by user flags."
    );

    describe_counter!(STORIES_PUBLISHED, "The count of draft to published transitions.");
    describe_counter!(EMBEDDINGS_COMPUTED, "The count of story embeddings written.");

    describe_counter!(CERTIFICATES_ISSUED, "The count of certificates uploaded.");
    describe_counter!(KARMA_POINTS, "Total karma points awarded.");
    describe_counter!(DIGEST_SENT, "The count of digest emails delivered.");

    if let Some(config) = config {
        match config {
            config::MetricConfig::PrometheusPush(prometheus_config) => {
                PrometheusBuilder::new()
                    .with_push_gateway(
                        prometheus_config.url.clone(),
                        Duration::from_secs(10),
                        None,
                        None,
                    )
                    .context("failed to set up push gateway")?
                    .install()
                    .context("failed to install metrics exporter")?;
            }
        }
    }

    Ok(())
}
