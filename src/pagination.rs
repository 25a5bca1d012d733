//! Keyset (cursor) pagination over `created_at DESC, id DESC`.
//!
//! A cursor is the creation timestamp of the last item on the previous
//! page, optionally followed by `|{id}` to break ties between rows created
//! in the same instant.  Stores fetch `limit + 1` rows strictly after the
//! cursor in that order; [`Page::from_rows`] trims the extra row and derives
//! the [`PageInfo`].

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::config::PaginationConfig;
use crate::errors::MediaError;

/// Position after which the next page starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub created_at: DateTime<Utc>,
    pub id: Option<String>,
}

impl Cursor {
    /// Cursor that starts from the newest row.  Set a second ahead of the
    /// clock so rows written in the current instant are included.
    pub fn now() -> Self {
        Self {
            created_at: Utc::now() + chrono::Duration::seconds(1),
            id: None,
        }
    }

    /// Tie-break id as bound into SQL.  An empty string sorts before
    /// every real id, so rows sharing the cursor timestamp are skipped.
    pub fn id_bound(&self) -> &str {
        self.id.as_deref().unwrap_or("")
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ts = self.created_at.to_rfc3339_opts(SecondsFormat::Micros, true);
        match &self.id {
            Some(id) => write!(f, "{ts}|{id}"),
            None => f.write_str(&ts),
        }
    }
}

impl FromStr for Cursor {
    type Err = MediaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ts, id) = match s.split_once('|') {
            Some((ts, id)) if !id.is_empty() => (ts, Some(id.to_string())),
            Some((ts, _)) => (ts, None),
            None => (s, None),
        };
        let created_at = DateTime::parse_from_rfc3339(ts.trim())
            .map_err(|e| MediaError::invalid("cursor", e.to_string()))?
            .with_timezone(&Utc);
        Ok(Self { created_at, id })
    }
}

impl Serialize for Cursor {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A validated page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub cursor: Cursor,
    pub limit: u32,
}

impl PageRequest {
    /// Build a request from raw query values.
    ///
    /// A missing, non-numeric or zero limit falls back to the default; a
    /// limit above the maximum is clamped.  An unparseable cursor is an
    /// error.
    pub fn new(
        cursor: Option<&str>,
        limit: Option<&str>,
        config: &PaginationConfig,
    ) -> Result<Self, MediaError> {
        let cursor = match cursor.map(str::trim).filter(|c| !c.is_empty()) {
            Some(raw) => raw.parse()?,
            None => Cursor::now(),
        };
        let limit = limit
            .and_then(|l| l.trim().parse::<u32>().ok())
            .filter(|l| *l > 0)
            .unwrap_or(config.default_limit)
            .min(config.max_limit.max(1));
        Ok(Self { cursor, limit })
    }

    /// First page with the configured default size.
    pub fn first(config: &PaginationConfig) -> Self {
        Self {
            cursor: Cursor::now(),
            limit: config.default_limit.max(1),
        }
    }

    /// Number of rows a store should fetch.
    pub fn fetch_limit(&self) -> u32 {
        self.limit + 1
    }
}

/// Rows that can be paginated expose their position.
pub trait Keyed {
    fn created_at(&self) -> DateTime<Utc>;
    fn key_id(&self) -> &str;
}

/// Derived pagination state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub has_next_page: bool,
    pub next_cursor: Option<Cursor>,
}

/// One page of results.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page_info: PageInfo,
}

impl<T: Keyed> Page<T> {
    /// Build a page from up to `limit + 1` rows fetched in keyset order.
    pub fn from_rows(mut rows: Vec<T>, limit: u32) -> Self {
        let limit = limit as usize;
        let has_next_page = rows.len() > limit;
        rows.truncate(limit);
        let next_cursor = has_next_page
            .then(|| rows.last())
            .flatten()
            .map(|last| Cursor {
                created_at: last.created_at(),
                id: Some(last.key_id().to_string()),
            });
        Self {
            items: rows,
            page_info: PageInfo {
                has_next_page,
                next_cursor,
            },
        }
    }
}

impl<T> Page<T> {
    /// Transform every item, keeping the page info.
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            page_info: self.page_info,
        }
    }
}
