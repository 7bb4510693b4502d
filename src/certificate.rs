//! Proof-of-Good certificate rendering.
use chrono::{DateTime, Utc};

use crate::feeds::escape_xml;

/// Everything printed on a certificate.
#[derive(Debug, Clone)]
pub struct CertificateData<'a> {
    pub act_id: &'a str,
    pub recipient: &'a str,
    pub title: &'a str,
    pub level: i64,
    pub place: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub verify_url: &'a str,
}

const LEVEL_NAMES: [&str; 5] = ["Kindness", "Care", "Service", "Impact", "Legacy"];

pub fn level_name(level: i64) -> &'static str {
    usize::try_from(level - 1)
        .ok()
        .and_then(|i| LEVEL_NAMES.get(i))
        .copied()
        .unwrap_or("Kindness")
}

/// Render the certificate as a standalone SVG document.
pub fn render_svg(data: &CertificateData<'_>) -> String {
    let stars = "★".repeat(usize::try_from(data.level.clamp(1, 5)).unwrap_or(1));
    let place = data
        .place
        .as_deref()
        .map(|p| format!("<text x=\"600\" y=\"470\" text-anchor=\"middle\" class=\"small\">{}</text>", escape_xml(p)))
        .unwrap_or_default();

    format!(
        r##"<?xml version="1.0" encoding="UTF-8"?>
<svg xmlns="http://www.w3.org/2000/svg" width="1200" height="800" viewBox="0 0 1200 800">
  <style>
    .title {{ font: bold 56px Georgia, serif; fill: #1f3d2b; }}
    .name {{ font: italic 44px Georgia, serif; fill: #2d6a4f; }}
    .body {{ font: 28px Helvetica, Arial, sans-serif; fill: #333333; }}
    .small {{ font: 20px Helvetica, Arial, sans-serif; fill: #555555; }}
    .stars {{ font: 40px sans-serif; fill: #e9a23b; }}
  </style>
  <rect width="1200" height="800" fill="#fdfaf3"/>
  <rect x="30" y="30" width="1140" height="740" fill="none" stroke="#2d6a4f" stroke-width="6"/>
  <text x="600" y="150" text-anchor="middle" class="title">Proof of Good</text>
  <text x="600" y="230" text-anchor="middle" class="body">This certifies that</text>
  <text x="600" y="310" text-anchor="middle" class="name">{recipient}</text>
  <text x="600" y="390" text-anchor="middle" class="body">{title}</text>
  <text x="600" y="430" text-anchor="middle" class="small">Level {level}: {level_name}</text>
  {place}
  <text x="600" y="540" text-anchor="middle" class="stars">{stars}</text>
  <text x="600" y="660" text-anchor="middle" class="small">Issued {issued} · Certificate {act_id}</text>
  <text x="600" y="700" text-anchor="middle" class="small">Verify at {verify_url}</text>
</svg>
"##,
        recipient = escape_xml(data.recipient),
        title = escape_xml(data.title),
        level = data.level,
        level_name = level_name(data.level),
        place = place,
        stars = stars,
        issued = data.issued_at.format("%B %-d, %Y"),
        act_id = escape_xml(data.act_id),
        verify_url = escape_xml(data.verify_url),
    )
}
