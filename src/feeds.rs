//! RSS, Atom and sitemap documents.
use chrono::{DateTime, Utc};

use crate::stories::Story;

/// Escape the four characters that matter inside XML text and attribute values.
pub fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

pub fn story_url(site_url: &str, story: &Story) -> String {
    format!("{site_url}/stories/{}", story.slug)
}

fn summary(story: &Story) -> &str {
    if story.dek.is_empty() {
        &story.what
    } else {
        &story.dek
    }
}

fn timestamp(story: &Story) -> DateTime<Utc> {
    story.published_at.unwrap_or(story.updated_at)
}

pub fn rss(site_url: &str, stories: &[Story]) -> String {
    let mut items = String::new();
    for story in stories {
        let link = escape_xml(&story_url(site_url, story));
        items.push_str(&format!(
            r#"    <item>
      <title>{title}</title>
      <link>{link}</link>
      <guid isPermaLink="true">{link}</guid>
      <description>{description}</description>
      <pubDate>{date}</pubDate>
    </item>
"#,
            title = escape_xml(&story.title),
            description = escape_xml(summary(story)),
            date = timestamp(story).to_rfc2822(),
        ));
    }

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:atom="http://www.w3.org/2005/Atom">
  <channel>
    <title>Aikya</title>
    <link>{site}</link>
    <description>Good news from real people.</description>
    <language>en</language>
    <atom:link href="{site}/rss.xml" rel="self" type="application/rss+xml"/>
{items}  </channel>
</rss>
"#,
        site = escape_xml(site_url),
    )
}

pub fn atom(site_url: &str, stories: &[Story]) -> String {
    let updated = stories
        .iter()
        .map(timestamp)
        .max()
        .unwrap_or_else(Utc::now)
        .to_rfc3339();

    let mut entries = String::new();
    for story in stories {
        let link = escape_xml(&story_url(site_url, story));
        entries.push_str(&format!(
            r#"  <entry>
    <title>{title}</title>
    <link href="{link}"/>
    <id>{link}</id>
    <updated>{updated}</updated>
    <summary>{summary}</summary>
  </entry>
"#,
            title = escape_xml(&story.title),
            updated = timestamp(story).to_rfc3339(),
            summary = escape_xml(summary(story)),
        ));
    }

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Aikya</title>
  <link href="{site}"/>
  <link href="{site}/atom.xml" rel="self"/>
  <id>{site}/</id>
  <updated>{updated}</updated>
{entries}</feed>
"#,
        site = escape_xml(site_url),
    )
}

/// Static pages listed in the sitemap alongside every story.
const STATIC_PATHS: &[&str] = &["", "/stories", "/submit", "/support", "/good"];

pub fn sitemap(site_url: &str, stories: &[Story]) -> String {
    let mut urls = String::new();
    for path in STATIC_PATHS {
        urls.push_str(&format!(
            "  <url><loc>{}{}</loc></url>\n",
            escape_xml(site_url),
            path
        ));
    }
    for story in stories {
        urls.push_str(&format!(
            "  <url><loc>{}</loc><lastmod>{}</lastmod></url>\n",
            escape_xml(&story_url(site_url, story)),
            story.updated_at.format("%Y-%m-%d"),
        ));
    }

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
{urls}</urlset>
"#
    )
}
