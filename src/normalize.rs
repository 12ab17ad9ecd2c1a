use std::borrow::Cow;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

use crate::config::IngestConfig;
use crate::model::{FeedItem, FeedSource};
use crate::parser::{decode_entities, RawEntry};

const ELLIPSIS: &str = "...";

/// Reasons a parsed entry is dropped before storage.
#[derive(Debug, Error, PartialEq)]
pub enum Rejection {
    #[error("entry has no title")]
    MissingTitle,
    #[error("entry has no link")]
    MissingLink,
    #[error("entry link {0:?} is not a usable http(s) url")]
    InvalidLink(String),
    #[error("entry link is {0} characters long")]
    LinkTooLong(usize),
    #[error("entry date {0:?} could not be parsed")]
    UnparsableDate(Option<String>),
}

/// Turns a raw entry into a storable item.
///
/// Relative links are resolved against the source's feed URL. A missing or
/// unparsable date is replaced by `fetched_at` unless `reject_undated` is set.
pub fn normalize(
    raw: &RawEntry,
    source: &FeedSource,
    limits: &IngestConfig,
    fetched_at: DateTime<Utc>,
) -> Result<FeedItem, Rejection> {
    let title = collapse_whitespace(raw.title.as_deref().unwrap_or_default());
    if title.is_empty() {
        return Err(Rejection::MissingTitle);
    }
    let title = truncate_with_ellipsis(&title, limits.title_max_chars).into_owned();

    let link = resolve_link(raw.link.as_deref().unwrap_or_default(), &source.feed_url)?;
    let link_len = link.chars().count();
    if link_len > limits.link_max_chars {
        return Err(Rejection::LinkTooLong(link_len));
    }

    let published_at = match raw.published_raw.as_deref().and_then(parse_date) {
        Some(date) => date,
        None if limits.reject_undated => {
            return Err(Rejection::UnparsableDate(raw.published_raw.clone()))
        }
        None => fetched_at,
    };

    let summary = raw
        .summary_raw
        .as_deref()
        .map(|s| summary_text(s, limits.summary_max_chars))
        .unwrap_or_default();

    Ok(FeedItem {
        fingerprint: fingerprint(&title, &link, source.id),
        title,
        link,
        summary,
        published_at,
        source_id: source.id,
        source_name: source.name.clone(),
    })
}

/// Idempotency key for an entry: identical inputs always hash identically.
pub fn fingerprint(title: &str, link: &str, source_id: i64) -> String {
    let input = format!("{}|{}|{}", title, link, source_id);
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}

fn resolve_link(raw: &str, base: &str) -> Result<String, Rejection> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Rejection::MissingLink);
    }

    let url = match Url::parse(raw) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(base)
            .and_then(|base| base.join(raw))
            .map_err(|_| Rejection::InvalidLink(raw.to_string()))?,
        Err(_) => return Err(Rejection::InvalidLink(raw.to_string())),
    };

    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(Rejection::InvalidLink(raw.to_string()));
    }
    Ok(url.to_string())
}

/// Best-effort calendar parsing for the date formats feeds actually use.
///
/// Years outside `0..=9999` are treated as unparsable: they would not fit the
/// fixed-width stored timestamp.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    parse_calendar_date(raw).filter(|dt| (0..=9999).contains(&dt.year()))
}

fn parse_calendar_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"] {
        if let Ok(dt) = DateTime::parse_from_str(raw, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }

    // RFC 822 style with a zone abbreviation chrono does not know (CEST, IST, ...);
    // the offset is lost and the time read as UTC.
    let (head, zone) = raw.rsplit_once(' ')?;
    if !zone.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    for fmt in ["%a, %d %b %Y %H:%M:%S", "%d %b %Y %H:%M:%S", "%a, %d %b %Y %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(head, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// Plain-text summary: markup stripped, entities decoded, whitespace collapsed, bounded.
pub fn summary_text(raw: &str, max_chars: usize) -> String {
    let text = decode_entities(&strip_tags(raw));
    let text = collapse_whitespace(&text);
    truncate_with_ellipsis(&text, max_chars).into_owned()
}

/// Removes anything that looks like a tag. A `<` not followed by a tag-like
/// character is kept as text.
pub fn strip_tags(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_tag = false;

    while let Some(c) = chars.next() {
        if in_tag {
            if c == '>' {
                in_tag = false;
                out.push(' ');
            }
            continue;
        }
        if c == '<' {
            let starts_tag = chars
                .peek()
                .is_some_and(|n| n.is_ascii_alphabetic() || matches!(n, '/' | '!' | '?'));
            if starts_tag {
                in_tag = true;
                continue;
            }
        }
        out.push(c);
    }
    out
}

pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Bounds `s` to `max_chars` characters, ending in `...` when cut.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> Cow<'_, str> {
    if s.chars().count() <= max_chars {
        return Cow::Borrowed(s);
    }

    let ellipsis_len = ELLIPSIS.chars().count();
    if max_chars <= ellipsis_len {
        return Cow::Owned(s.chars().take(max_chars).collect());
    }

    let kept: String = s.chars().take(max_chars - ellipsis_len).collect();
    Cow::Owned(format!("{}{}", kept.trim_end(), ELLIPSIS))
}
