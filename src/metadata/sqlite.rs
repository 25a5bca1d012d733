//! SQLite-backed metadata store.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite
//! library is required.  All async trait methods are thin wrappers
//! around synchronous rusqlite calls executed under a `Mutex`.
//!
//! Timestamps are stored as fixed-width RFC 3339 text with microsecond
//! precision, so lexical order equals chronological order and keyset
//! pagination can compare them directly.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::ffi;
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use super::store::{
    timestamp_now, Album, BatchScope, BatchSelector, Blog, BlogMetadataPatch, BlogSummary,
    CategoryRef, CategoryRow, ConstraintKind, DeletedRow, DocumentCover, MetadataStore,
    NewsItem, NewsPatch, Photo, Project, RowRef, ServiceInfo, StoreError, StoreFuture,
};
use crate::keys::ResourceKind;
use crate::pagination::PageRequest;

/// Current schema version. Bumped when migrations are added.
const SCHEMA_VERSION: i64 = 2;

/// Name of the root category every project starts with.
pub const ROOT_CATEGORY_NAME: &str = "default";

/// Services seeded into the catalog: (name, icon).
const SERVICE_CATALOG: &[(&str, &str)] = &[
    ("blogs", "article"),
    ("gallery", "photo_library"),
    ("news", "newspaper"),
    ("documents", "folder"),
];

/// Metadata store backed by a single SQLite database file.
pub struct SqliteMetadataStore {
    /// The database connection, guarded by a mutex for Send + Sync.
    conn: Mutex<Connection>,
}

impl SqliteMetadataStore {
    /// Open (or create) the database at `path` and initialize the schema.
    ///
    /// Passing `":memory:"` creates an in-memory database (useful for tests).
    pub fn new(path: &str) -> anyhow::Result<Self> {
        if path != ":memory:" {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.apply_pragmas()?;
        store.init_db()?;
        Ok(store)
    }

    /// Apply recommended SQLite pragmas for performance and safety.
    fn apply_pragmas(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        Ok(())
    }

    /// Create the required tables and indexes if they do not already exist.
    /// This is idempotent -- safe to call on every startup.
    fn init_db(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            -- Schema version tracking
            CREATE TABLE IF NOT EXISTS schema_version (
                version    INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );

            -- Projects (tenants)
            CREATE TABLE IF NOT EXISTS projects (
                id           TEXT PRIMARY KEY,
                name         TEXT NOT NULL UNIQUE,
                cover        TEXT NOT NULL,
                public_token TEXT NOT NULL UNIQUE,
                created_at   TEXT NOT NULL
            );

            -- Category tree; removed with its project, children with parents
            CREATE TABLE IF NOT EXISTS categories (
                id         TEXT PRIMARY KEY,
                project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                parent_id  TEXT REFERENCES categories(id) ON DELETE CASCADE,
                name       TEXT NOT NULL,
                created_at TEXT NOT NULL,

                UNIQUE (project_id, parent_id, name)
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_categories_root
                ON categories(project_id) WHERE parent_id IS NULL;
            CREATE INDEX IF NOT EXISTS idx_categories_parent
                ON categories(parent_id);

            -- Blogs
            CREATE TABLE IF NOT EXISTS blogs (
                id          TEXT PRIMARY KEY,
                project_id  TEXT NOT NULL REFERENCES projects(id),
                author_id   TEXT NOT NULL,
                title       TEXT NOT NULL,
                summary     TEXT NOT NULL DEFAULT '',
                content     TEXT NOT NULL DEFAULT '',
                category_id TEXT NOT NULL REFERENCES categories(id),
                cover       TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                updated_at  TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_blogs_page
                ON blogs(project_id, created_at DESC, id DESC);
            CREATE INDEX IF NOT EXISTS idx_blogs_category
                ON blogs(category_id);

            -- Gallery
            CREATE TABLE IF NOT EXISTS albums (
                id         TEXT PRIMARY KEY,
                project_id TEXT NOT NULL REFERENCES projects(id),
                author_id  TEXT NOT NULL,
                name       TEXT NOT NULL,
                cover      TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_albums_page
                ON albums(project_id, created_at DESC, id DESC);

            CREATE TABLE IF NOT EXISTS photos (
                id         TEXT PRIMARY KEY,
                project_id TEXT NOT NULL REFERENCES projects(id),
                album_id   TEXT NOT NULL REFERENCES albums(id) ON DELETE CASCADE,
                image      TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_photos_page
                ON photos(album_id, created_at DESC, id DESC);

            -- News
            CREATE TABLE IF NOT EXISTS news (
                id         TEXT PRIMARY KEY,
                project_id TEXT NOT NULL REFERENCES projects(id),
                title      TEXT NOT NULL,
                link       TEXT NOT NULL DEFAULT '',
                text       TEXT NOT NULL DEFAULT '',
                image      TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_news_page
                ON news(project_id, created_at DESC, id DESC);

            -- Document folders
            CREATE TABLE IF NOT EXISTS document_covers (
                id         TEXT PRIMARY KEY,
                project_id TEXT NOT NULL REFERENCES projects(id),
                author_id  TEXT NOT NULL,
                name       TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_document_covers_page
                ON document_covers(project_id, created_at DESC, id DESC);

            -- Service catalog and the services each project enables
            CREATE TABLE IF NOT EXISTS services (
                id   TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                icon TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS project_services (
                project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                service_id TEXT NOT NULL REFERENCES services(id),

                PRIMARY KEY (project_id, service_id)
            );

            -- Users granted access to a project
            CREATE TABLE IF NOT EXISTS project_members (
                project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                user_id    TEXT NOT NULL,
                created_at TEXT NOT NULL,

                PRIMARY KEY (project_id, user_id)
            );

            CREATE INDEX IF NOT EXISTS idx_project_members_user
                ON project_members(user_id);
            ",
        )?;

        for (name, icon) in SERVICE_CATALOG {
            conn.execute(
                "INSERT OR IGNORE INTO services (id, name, icon) VALUES (?1, ?2, ?3)",
                params![uuid::Uuid::new_v4().to_string(), name, icon],
            )?;
        }

        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            params![SCHEMA_VERSION, format_ts(&timestamp_now())],
        )?;

        Ok(())
    }

    /// Run `f` against the locked connection.
    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock().expect("mutex poisoned");
        f(&conn)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Fixed-width text form of a timestamp.
fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(idx, &raw)
}

fn opt_ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| parse_ts(idx, &r)).transpose()
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Identifiers are UUIDs; anything else is rejected before it reaches SQL.
fn check_id(field: &str, value: &str) -> Result<(), StoreError> {
    uuid::Uuid::parse_str(value)
        .map(|_| ())
        .map_err(|_| StoreError::constraint(ConstraintKind::InvalidInputSyntax, field))
}

/// Human label for a table in constraint messages.
fn entity(table: &str) -> &str {
    match table {
        "projects" => "project",
        "categories" => "category",
        "blogs" => "blog",
        "albums" => "album",
        "photos" => "photo",
        "document_covers" => "document cover",
        "project_services" => "project service",
        "project_members" => "project member",
        other => other,
    }
}

/// Classify a driver error by SQLite's extended result code.
fn classify(err: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(ref failure, ref message) = err {
        let detail = message
            .as_deref()
            .and_then(|m| m.split_once(": "))
            .map(|(_, cols)| cols)
            .unwrap_or("");
        match failure.extended_code {
            ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                // "UNIQUE constraint failed: categories.project_id, categories.parent_id, categories.name"
                let field = detail.rsplit(", ").next().and_then(|c| c.split_once('.')).map(
                    |(table, col)| format!("{} {}", entity(table), col),
                );
                return StoreError::Constraint {
                    kind: ConstraintKind::UniqueViolation,
                    field,
                };
            }
            ffi::SQLITE_CONSTRAINT_NOTNULL => {
                let field = detail.split_once('.').map(|(_, col)| col.to_string());
                return StoreError::Constraint {
                    kind: ConstraintKind::NotNullViolation,
                    field,
                };
            }
            ffi::SQLITE_CONSTRAINT_FOREIGNKEY => {
                return StoreError::Constraint {
                    kind: ConstraintKind::ForeignKeyViolation,
                    field: None,
                };
            }
            _ => {}
        }
    }
    StoreError::Other(err.into())
}

/// A referenced parent row that must exist for an insert to succeed.
struct Parent<'a> {
    field: &'static str,
    table: &'static str,
    id: &'a str,
    /// When set, the parent must also belong to this project.
    project_id: Option<&'a str>,
}

impl<'a> Parent<'a> {
    fn new(field: &'static str, table: &'static str, id: &'a str) -> Self {
        Self {
            field,
            table,
            id,
            project_id: None,
        }
    }

    fn in_project(mut self, project_id: &'a str) -> Self {
        self.project_id = Some(project_id);
        self
    }

    fn exists(&self, conn: &Connection) -> Result<bool, StoreError> {
        let found = match self.project_id {
            Some(project_id) => conn.query_row(
                &format!(
                    "SELECT 1 FROM {} WHERE id = ?1 AND project_id = ?2",
                    self.table
                ),
                params![self.id, project_id],
                |_| Ok(()),
            ),
            None => conn.query_row(
                &format!("SELECT 1 FROM {} WHERE id = ?1", self.table),
                params![self.id],
                |_| Ok(()),
            ),
        }
        .optional()
        .map_err(classify)?;
        Ok(found.is_some())
    }
}

/// First parent that does not exist (or lives in another project).
fn missing_parent(conn: &Connection, parents: &[Parent<'_>]) -> Result<Option<&'static str>, StoreError> {
    for parent in parents {
        if !parent.exists(conn)? {
            return Ok(Some(parent.field));
        }
    }
    Ok(None)
}

/// Execute an insert, naming the offending parent when a foreign key
/// rejects it.  Project-scoped parents are checked up front because a
/// foreign key cannot see cross-project references.
fn insert_with_parents(
    conn: &Connection,
    sql: &str,
    values: impl rusqlite::Params,
    parents: &[Parent<'_>],
) -> Result<(), StoreError> {
    let scoped: Vec<&Parent<'_>> = parents.iter().filter(|p| p.project_id.is_some()).collect();
    for parent in scoped {
        if !parent.exists(conn)? {
            return Err(StoreError::constraint(
                ConstraintKind::ForeignKeyViolation,
                parent.field,
            ));
        }
    }
    match conn.execute(sql, values) {
        Ok(_) => Ok(()),
        Err(err) => match classify(err) {
            StoreError::Constraint {
                kind: ConstraintKind::ForeignKeyViolation,
                ..
            } => Err(StoreError::Constraint {
                kind: ConstraintKind::ForeignKeyViolation,
                field: missing_parent(conn, parents)?.map(str::to_string),
            }),
            other => Err(other),
        },
    }
}

/// Table layout of a media-backed kind.
struct MediaTable {
    table: &'static str,
    /// Column holding the primary blob key, if the kind has one.
    key_column: Option<&'static str>,
    touches_updated_at: bool,
}

fn media_table(kind: ResourceKind) -> MediaTable {
    let (table, key_column) = match kind {
        ResourceKind::Project => ("projects", Some("cover")),
        ResourceKind::Blog => ("blogs", Some("cover")),
        ResourceKind::Album => ("albums", Some("cover")),
        ResourceKind::Photo => ("photos", Some("image")),
        ResourceKind::News => ("news", Some("image")),
        ResourceKind::DocumentCover => ("document_covers", None),
    };
    MediaTable {
        table,
        key_column,
        touches_updated_at: kind == ResourceKind::Blog,
    }
}

/// `WHERE` clause and bind values addressing one row.
fn row_filter(row: &RowRef) -> Result<(String, Vec<String>), StoreError> {
    check_id("id", &row.id)?;
    match &row.project_id {
        Some(project_id) => {
            check_id("project_id", project_id)?;
            Ok((
                "id = ?1 AND project_id = ?2".to_string(),
                vec![row.id.clone(), project_id.clone()],
            ))
        }
        None => Ok(("id = ?1".to_string(), vec![row.id.clone()])),
    }
}

/// Field a delete reports when dependent rows block it.
fn in_use_field(kind: ResourceKind) -> String {
    format!("{}_id", kind.as_str())
}

fn not_found(kind: ResourceKind) -> StoreError {
    StoreError::not_found(kind.as_str())
}

/// Deleted rows from a `RETURNING id[, key]` statement.
fn collect_deleted(
    conn: &Connection,
    sql: &str,
    values: Vec<String>,
    kind: ResourceKind,
    has_key: bool,
) -> Result<Vec<DeletedRow>, StoreError> {
    let mut stmt = conn.prepare(sql).map_err(classify)?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), |row| {
            let keys = if has_key {
                vec![row.get::<_, String>(1)?]
            } else {
                Vec::new()
            };
            Ok(DeletedRow {
                id: row.get(0)?,
                keys,
            })
        })
        .map_err(classify)?
        .collect::<rusqlite::Result<Vec<_>>>();
    rows.map_err(|e| match classify(e) {
        StoreError::Constraint {
            kind: ConstraintKind::ForeignKeyViolation,
            ..
        } => StoreError::constraint(ConstraintKind::ForeignKeyViolation, in_use_field(kind)),
        other => other,
    })
}

// ── Row mappers ─────────────────────────────────────────────────────

const PROJECT_COLUMNS: &str = "id, name, cover, public_token, created_at";

fn map_project(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        cover: row.get(2)?,
        public_token: row.get(3)?,
        created_at: ts_column(row, 4)?,
    })
}

const BLOG_COLUMNS: &str =
    "id, project_id, author_id, title, summary, content, category_id, cover, created_at, updated_at";

fn map_blog(row: &Row<'_>) -> rusqlite::Result<Blog> {
    Ok(Blog {
        id: row.get(0)?,
        project_id: row.get(1)?,
        author_id: row.get(2)?,
        title: row.get(3)?,
        summary: row.get(4)?,
        content: row.get(5)?,
        category_id: row.get(6)?,
        cover: row.get(7)?,
        created_at: ts_column(row, 8)?,
        updated_at: opt_ts_column(row, 9)?,
    })
}

fn map_blog_summary(row: &Row<'_>) -> rusqlite::Result<BlogSummary> {
    Ok(BlogSummary {
        id: row.get(0)?,
        title: row.get(1)?,
        summary: row.get(2)?,
        author_id: row.get(3)?,
        category: CategoryRef {
            id: row.get(4)?,
            name: row.get(5)?,
        },
        cover: row.get(6)?,
        created_at: ts_column(row, 7)?,
    })
}

fn map_album(row: &Row<'_>) -> rusqlite::Result<Album> {
    Ok(Album {
        id: row.get(0)?,
        project_id: row.get(1)?,
        author_id: row.get(2)?,
        name: row.get(3)?,
        cover: row.get(4)?,
        created_at: ts_column(row, 5)?,
    })
}

fn map_photo(row: &Row<'_>) -> rusqlite::Result<Photo> {
    Ok(Photo {
        id: row.get(0)?,
        project_id: row.get(1)?,
        album_id: row.get(2)?,
        image: row.get(3)?,
        created_at: ts_column(row, 4)?,
    })
}

fn map_news(row: &Row<'_>) -> rusqlite::Result<NewsItem> {
    Ok(NewsItem {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        link: row.get(3)?,
        text: row.get(4)?,
        image: row.get(5)?,
        created_at: ts_column(row, 6)?,
    })
}

fn map_document_cover(row: &Row<'_>) -> rusqlite::Result<DocumentCover> {
    Ok(DocumentCover {
        id: row.get(0)?,
        project_id: row.get(1)?,
        author_id: row.get(2)?,
        name: row.get(3)?,
        created_at: ts_column(row, 4)?,
    })
}

fn map_service(row: &Row<'_>) -> rusqlite::Result<ServiceInfo> {
    Ok(ServiceInfo {
        id: row.get(0)?,
        name: row.get(1)?,
        icon: row.get(2)?,
    })
}

/// A composite-key insert that already exists.
fn duplicate(err: StoreError, what: &str) -> StoreError {
    match err {
        StoreError::Constraint {
            kind: ConstraintKind::UniqueViolation,
            ..
        } => StoreError::constraint(ConstraintKind::UniqueViolation, what),
        other => other,
    }
}

/// Rows of a single-column-bound query.
fn query_all<T>(
    conn: &Connection,
    sql: &str,
    value: &str,
    map: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> Result<Vec<T>, StoreError> {
    let mut stmt = conn.prepare(sql).map_err(classify)?;
    let rows = stmt
        .query_map(params![value], map)
        .map_err(classify)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(classify)?;
    Ok(rows)
}

fn map_category(row: &Row<'_>) -> rusqlite::Result<CategoryRow> {
    Ok(CategoryRow {
        id: row.get(0)?,
        project_id: row.get(1)?,
        parent_id: row.get(2)?,
        name: row.get(3)?,
        created_at: ts_column(row, 4)?,
    })
}

/// Keyset condition shared by every paginated listing.  The caller binds
/// the cursor timestamp, the tie-break id, and the fetch limit last.
const KEYSET: &str = "(t.created_at < :cursor_ts OR (t.created_at = :cursor_ts AND t.id < :cursor_id))
                      ORDER BY t.created_at DESC, t.id DESC
                      LIMIT :fetch";

fn bind_named(
    stmt: &mut rusqlite::Statement<'_>,
    name: &str,
    value: &dyn rusqlite::ToSql,
) -> rusqlite::Result<()> {
    match stmt.parameter_index(name)? {
        Some(idx) => stmt.raw_bind_parameter(idx, value),
        None => Ok(()),
    }
}

/// Run a paginated query whose leading binds are `scope`.
fn query_page<T>(
    conn: &Connection,
    select: &str,
    scope: &[&str],
    page: &PageRequest,
    map: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> Result<Vec<T>, StoreError> {
    let sql = format!("{select} AND {KEYSET}");
    let mut stmt = conn.prepare(&sql).map_err(classify)?;
    let cursor_ts = format_ts(&page.cursor.created_at);
    let fetch = i64::from(page.fetch_limit());

    for (idx, value) in scope.iter().enumerate() {
        stmt.raw_bind_parameter(idx + 1, *value).map_err(classify)?;
    }
    bind_named(&mut stmt, ":cursor_ts", &cursor_ts).map_err(classify)?;
    bind_named(&mut stmt, ":cursor_id", &page.cursor.id_bound()).map_err(classify)?;
    bind_named(&mut stmt, ":fetch", &fetch).map_err(classify)?;

    let mut rows = stmt.raw_query();
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(classify)? {
        out.push(map(row).map_err(classify)?);
    }
    Ok(out)
}

// ── MetadataStore implementation ───────────────────────────────────

impl MetadataStore for SqliteMetadataStore {
    fn ping(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.with_conn(|conn| {
                conn.query_row("SELECT 1", [], |_| Ok(()))
                    .map_err(classify)
            })
        })
    }

    // ── Media rows ──────────────────────────────────────────────────

    fn swap_media_key(
        &self,
        row: RowRef,
        new_key: String,
        expected_current: Option<String>,
    ) -> StoreFuture<'_, String> {
        Box::pin(async move {
            let layout = media_table(row.kind);
            let column = layout.key_column.ok_or_else(|| {
                StoreError::Other(anyhow::anyhow!("{} rows hold no blob key", row.kind))
            })?;
            let (filter, mut values) = row_filter(&row)?;

            self.with_conn(|conn| {
                let tx = conn.unchecked_transaction().map_err(classify)?;
                let previous: Option<String> = tx
                    .query_row(
                        &format!("SELECT {column} FROM {} WHERE {filter}", layout.table),
                        params_from_iter(values.iter()),
                        |r| r.get(0),
                    )
                    .optional()
                    .map_err(classify)?;
                let previous = previous.ok_or_else(|| not_found(row.kind))?;
                if let Some(expected) = &expected_current {
                    if *expected != previous {
                        return Err(not_found(row.kind));
                    }
                }

                let mut set = format!("{column} = ?{}", values.len() + 1);
                values.push(new_key.clone());
                if layout.touches_updated_at {
                    set.push_str(&format!(", updated_at = ?{}", values.len() + 1));
                    values.push(format_ts(&timestamp_now()));
                }
                tx.execute(
                    &format!("UPDATE {} SET {set} WHERE {filter}", layout.table),
                    params_from_iter(values.iter()),
                )
                .map_err(classify)?;
                tx.commit().map_err(classify)?;
                Ok(previous)
            })
        })
    }

    fn delete_media_row(&self, row: RowRef) -> StoreFuture<'_, DeletedRow> {
        Box::pin(async move {
            let layout = media_table(row.kind);
            let (filter, values) = row_filter(&row)?;
            let returning = match layout.key_column {
                Some(column) => format!("id, {column}"),
                None => "id".to_string(),
            };
            let sql = format!(
                "DELETE FROM {} WHERE {filter} RETURNING {returning}",
                layout.table
            );
            self.with_conn(|conn| {
                collect_deleted(conn, &sql, values, row.kind, layout.key_column.is_some())?
                    .into_iter()
                    .next()
                    .ok_or_else(|| not_found(row.kind))
            })
        })
    }

    fn delete_media_rows(
        &self,
        scope: BatchScope,
        selector: BatchSelector,
    ) -> StoreFuture<'_, Vec<DeletedRow>> {
        Box::pin(async move {
            let layout = media_table(scope.kind);
            check_id("project_id", &scope.project_id)?;
            let mut values = vec![scope.project_id.clone()];
            let mut filter = "project_id = ?1".to_string();
            if let Some(album_id) = &scope.album_id {
                check_id("album_id", album_id)?;
                values.push(album_id.clone());
                filter.push_str(&format!(" AND album_id = ?{}", values.len()));
            }
            if let BatchSelector::Ids(ids) = &selector {
                if ids.is_empty() {
                    return Ok(Vec::new());
                }
                let mut placeholders = Vec::with_capacity(ids.len());
                for id in ids {
                    check_id("id", id)?;
                    values.push(id.clone());
                    placeholders.push(format!("?{}", values.len()));
                }
                filter.push_str(&format!(" AND id IN ({})", placeholders.join(", ")));
            }
            let returning = match layout.key_column {
                Some(column) => format!("id, {column}"),
                None => "id".to_string(),
            };
            let sql = format!(
                "DELETE FROM {} WHERE {filter} RETURNING {returning}",
                layout.table
            );
            self.with_conn(|conn| {
                collect_deleted(conn, &sql, values, scope.kind, layout.key_column.is_some())
            })
        })
    }

    // ── Projects ────────────────────────────────────────────────────

    fn insert_project(&self, project: Project) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            check_id("id", &project.id)?;
            self.with_conn(|conn| {
                let tx = conn.unchecked_transaction().map_err(classify)?;
                tx.execute(
                    "INSERT INTO projects (id, name, cover, public_token, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        project.id,
                        project.name,
                        project.cover,
                        project.public_token,
                        format_ts(&project.created_at),
                    ],
                )
                .map_err(classify)?;
                tx.execute(
                    "INSERT INTO categories (id, project_id, parent_id, name, created_at)
                     VALUES (?1, ?2, NULL, ?3, ?4)",
                    params![
                        uuid::Uuid::new_v4().to_string(),
                        project.id,
                        ROOT_CATEGORY_NAME,
                        format_ts(&project.created_at),
                    ],
                )
                .map_err(classify)?;
                tx.commit().map_err(classify)
            })
        })
    }

    fn get_project(&self, id: &str) -> StoreFuture<'_, Project> {
        let id = id.to_string();
        Box::pin(async move {
            check_id("id", &id)?;
            self.with_conn(|conn| {
                conn.query_row(
                    &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
                    params![id],
                    map_project,
                )
                .optional()
                .map_err(classify)?
                .ok_or_else(|| not_found(ResourceKind::Project))
            })
        })
    }

    fn list_projects(&self) -> StoreFuture<'_, Vec<Project>> {
        Box::pin(async move {
            self.with_conn(|conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {PROJECT_COLUMNS} FROM projects ORDER BY created_at DESC, id DESC"
                    ))
                    .map_err(classify)?;
                let rows = stmt
                    .query_map([], map_project)
                    .map_err(classify)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(classify)?;
                Ok(rows)
            })
        })
    }

    // ── Project membership and services ─────────────────────────────

    fn add_member(&self, project_id: &str, user_id: &str) -> StoreFuture<'_, ()> {
        let project_id = project_id.to_string();
        let user_id = user_id.to_string();
        Box::pin(async move {
            check_id("project_id", &project_id)?;
            if user_id.trim().is_empty() {
                return Err(StoreError::constraint(ConstraintKind::NotNullViolation, "user_id"));
            }
            self.with_conn(|conn| {
                insert_with_parents(
                    conn,
                    "INSERT INTO project_members (project_id, user_id, created_at)
                     VALUES (?1, ?2, ?3)",
                    params![project_id, user_id, format_ts(&timestamp_now())],
                    &[Parent::new("project_id", "projects", &project_id)],
                )
                .map_err(|e| duplicate(e, "project member"))
            })
        })
    }

    fn remove_member(&self, project_id: &str, user_id: &str) -> StoreFuture<'_, ()> {
        let project_id = project_id.to_string();
        let user_id = user_id.to_string();
        Box::pin(async move {
            check_id("project_id", &project_id)?;
            self.with_conn(|conn| {
                let changed = conn
                    .execute(
                        "DELETE FROM project_members WHERE project_id = ?1 AND user_id = ?2",
                        params![project_id, user_id],
                    )
                    .map_err(classify)?;
                if changed == 0 {
                    return Err(StoreError::not_found("project member"));
                }
                Ok(())
            })
        })
    }

    fn list_projects_for_user(&self, user_id: &str) -> StoreFuture<'_, Vec<Project>> {
        let user_id = user_id.to_string();
        Box::pin(async move {
            self.with_conn(|conn| {
                query_all(
                    conn,
                    "SELECT p.id, p.name, p.cover, p.public_token, p.created_at
                     FROM projects p
                     JOIN project_members m ON m.project_id = p.id
                     WHERE m.user_id = ?1
                     ORDER BY p.created_at DESC, p.id DESC",
                    &user_id,
                    map_project,
                )
            })
        })
    }

    fn list_services(&self) -> StoreFuture<'_, Vec<ServiceInfo>> {
        Box::pin(async move {
            self.with_conn(|conn| {
                let mut stmt = conn
                    .prepare("SELECT id, name, icon FROM services ORDER BY name")
                    .map_err(classify)?;
                let rows = stmt
                    .query_map([], map_service)
                    .map_err(classify)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(classify)?;
                Ok(rows)
            })
        })
    }

    fn add_project_services(
        &self,
        project_id: &str,
        service_ids: Vec<String>,
    ) -> StoreFuture<'_, ()> {
        let project_id = project_id.to_string();
        Box::pin(async move {
            check_id("project_id", &project_id)?;
            for service_id in &service_ids {
                check_id("service_id", service_id)?;
            }
            self.with_conn(|conn| {
                let tx = conn.unchecked_transaction().map_err(classify)?;
                for service_id in &service_ids {
                    insert_with_parents(
                        &tx,
                        "INSERT INTO project_services (project_id, service_id) VALUES (?1, ?2)",
                        params![project_id, service_id],
                        &[
                            Parent::new("project_id", "projects", &project_id),
                            Parent::new("service_id", "services", service_id),
                        ],
                    )
                    .map_err(|e| duplicate(e, "project service"))?;
                }
                tx.commit().map_err(classify)
            })
        })
    }

    fn remove_project_service(&self, project_id: &str, service_id: &str) -> StoreFuture<'_, ()> {
        let project_id = project_id.to_string();
        let service_id = service_id.to_string();
        Box::pin(async move {
            check_id("project_id", &project_id)?;
            check_id("service_id", &service_id)?;
            self.with_conn(|conn| {
                let changed = conn
                    .execute(
                        "DELETE FROM project_services WHERE project_id = ?1 AND service_id = ?2",
                        params![project_id, service_id],
                    )
                    .map_err(classify)?;
                if changed == 0 {
                    return Err(StoreError::not_found("project service"));
                }
                Ok(())
            })
        })
    }

    fn list_project_services(&self, project_id: &str) -> StoreFuture<'_, Vec<ServiceInfo>> {
        let project_id = project_id.to_string();
        Box::pin(async move {
            check_id("project_id", &project_id)?;
            self.with_conn(|conn| {
                query_all(
                    conn,
                    "SELECT s.id, s.name, s.icon
                     FROM services s
                     JOIN project_services ps ON ps.service_id = s.id
                     WHERE ps.project_id = ?1
                     ORDER BY s.name",
                    &project_id,
                    map_service,
                )
            })
        })
    }

    // ── Blogs ───────────────────────────────────────────────────────

    fn insert_blog(&self, blog: Blog) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            check_id("id", &blog.id)?;
            check_id("project_id", &blog.project_id)?;
            check_id("category_id", &blog.category_id)?;
            self.with_conn(|conn| {
                insert_with_parents(
                    conn,
                    "INSERT INTO blogs
                        (id, project_id, author_id, title, summary, content, category_id,
                         cover, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL)",
                    params![
                        blog.id,
                        blog.project_id,
                        blog.author_id,
                        blog.title,
                        blog.summary,
                        blog.content,
                        blog.category_id,
                        blog.cover,
                        format_ts(&blog.created_at),
                    ],
                    &[
                        Parent::new("project_id", "projects", &blog.project_id),
                        Parent::new("category_id", "categories", &blog.category_id)
                            .in_project(&blog.project_id),
                    ],
                )
            })
        })
    }

    fn get_blog(&self, project_id: &str, id: &str) -> StoreFuture<'_, Blog> {
        let project_id = project_id.to_string();
        let id = id.to_string();
        Box::pin(async move {
            check_id("project_id", &project_id)?;
            check_id("id", &id)?;
            self.with_conn(|conn| {
                conn.query_row(
                    &format!("SELECT {BLOG_COLUMNS} FROM blogs WHERE id = ?1 AND project_id = ?2"),
                    params![id, project_id],
                    map_blog,
                )
                .optional()
                .map_err(classify)?
                .ok_or_else(|| not_found(ResourceKind::Blog))
            })
        })
    }

    fn list_blogs(
        &self,
        project_id: &str,
        category_id: Option<&str>,
        page: &PageRequest,
    ) -> StoreFuture<'_, Vec<BlogSummary>> {
        let project_id = project_id.to_string();
        let category_id = category_id.map(str::to_string);
        let page = page.clone();
        Box::pin(async move {
            check_id("project_id", &project_id)?;
            if let Some(category_id) = &category_id {
                check_id("category_id", category_id)?;
            }
            self.with_conn(|conn| {
                let columns = "t.id, t.title, t.summary, t.author_id, c.id, c.name, t.cover, t.created_at";
                match &category_id {
                    Some(category_id) => query_page(
                        conn,
                        &format!(
                            "WITH RECURSIVE subtree(id) AS (
                                 SELECT id FROM categories WHERE id = ?2 AND project_id = ?1
                                 UNION ALL
                                 SELECT c.id FROM categories c JOIN subtree s ON c.parent_id = s.id
                             )
                             SELECT {columns} FROM blogs t
                             JOIN categories c ON c.id = t.category_id
                             WHERE t.project_id = ?1
                               AND t.category_id IN (SELECT id FROM subtree)"
                        ),
                        &[project_id.as_str(), category_id.as_str()],
                        &page,
                        map_blog_summary,
                    ),
                    None => query_page(
                        conn,
                        &format!(
                            "SELECT {columns} FROM blogs t
                             JOIN categories c ON c.id = t.category_id
                             WHERE t.project_id = ?1"
                        ),
                        &[project_id.as_str()],
                        &page,
                        map_blog_summary,
                    ),
                }
            })
        })
    }

    fn update_blog_metadata(
        &self,
        project_id: &str,
        id: &str,
        patch: BlogMetadataPatch,
    ) -> StoreFuture<'_, ()> {
        let project_id = project_id.to_string();
        let id = id.to_string();
        Box::pin(async move {
            check_id("project_id", &project_id)?;
            check_id("id", &id)?;
            if let Some(category_id) = &patch.category_id {
                check_id("category_id", category_id)?;
            }
            self.with_conn(|conn| {
                if let Some(category_id) = &patch.category_id {
                    let category =
                        Parent::new("category_id", "categories", category_id).in_project(&project_id);
                    if !category.exists(conn)? {
                        return Err(StoreError::constraint(
                            ConstraintKind::ForeignKeyViolation,
                            "category_id",
                        ));
                    }
                }
                let changed = conn
                    .execute(
                        "UPDATE blogs SET
                             title = COALESCE(?3, title),
                             summary = COALESCE(?4, summary),
                             category_id = COALESCE(?5, category_id),
                             updated_at = ?6
                         WHERE id = ?1 AND project_id = ?2",
                        params![
                            id,
                            project_id,
                            patch.title,
                            patch.summary,
                            patch.category_id,
                            format_ts(&timestamp_now()),
                        ],
                    )
                    .map_err(classify)?;
                if changed == 0 {
                    return Err(not_found(ResourceKind::Blog));
                }
                Ok(())
            })
        })
    }

    fn update_blog_content(
        &self,
        project_id: &str,
        id: &str,
        content: String,
    ) -> StoreFuture<'_, ()> {
        let project_id = project_id.to_string();
        let id = id.to_string();
        Box::pin(async move {
            check_id("project_id", &project_id)?;
            check_id("id", &id)?;
            self.with_conn(|conn| {
                let changed = conn
                    .execute(
                        "UPDATE blogs SET content = ?3, updated_at = ?4
                         WHERE id = ?1 AND project_id = ?2",
                        params![id, project_id, content, format_ts(&timestamp_now())],
                    )
                    .map_err(classify)?;
                if changed == 0 {
                    return Err(not_found(ResourceKind::Blog));
                }
                Ok(())
            })
        })
    }

    // ── Gallery ─────────────────────────────────────────────────────

    fn insert_album(&self, album: Album) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            check_id("id", &album.id)?;
            check_id("project_id", &album.project_id)?;
            self.with_conn(|conn| {
                insert_with_parents(
                    conn,
                    "INSERT INTO albums (id, project_id, author_id, name, cover, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        album.id,
                        album.project_id,
                        album.author_id,
                        album.name,
                        album.cover,
                        format_ts(&album.created_at),
                    ],
                    &[Parent::new("project_id", "projects", &album.project_id)],
                )
            })
        })
    }

    fn list_albums(&self, project_id: &str, page: &PageRequest) -> StoreFuture<'_, Vec<Album>> {
        let project_id = project_id.to_string();
        let page = page.clone();
        Box::pin(async move {
            check_id("project_id", &project_id)?;
            self.with_conn(|conn| {
                query_page(
                    conn,
                    "SELECT t.id, t.project_id, t.author_id, t.name, t.cover, t.created_at
                     FROM albums t WHERE t.project_id = ?1",
                    &[project_id.as_str()],
                    &page,
                    map_album,
                )
            })
        })
    }

    fn rename_album(&self, project_id: &str, id: &str, name: String) -> StoreFuture<'_, ()> {
        let project_id = project_id.to_string();
        let id = id.to_string();
        Box::pin(async move {
            check_id("project_id", &project_id)?;
            check_id("id", &id)?;
            self.with_conn(|conn| {
                let changed = conn
                    .execute(
                        "UPDATE albums SET name = ?3 WHERE id = ?1 AND project_id = ?2",
                        params![id, project_id, name],
                    )
                    .map_err(classify)?;
                if changed == 0 {
                    return Err(not_found(ResourceKind::Album));
                }
                Ok(())
            })
        })
    }

    fn insert_photo(&self, photo: Photo) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            check_id("id", &photo.id)?;
            check_id("project_id", &photo.project_id)?;
            check_id("album_id", &photo.album_id)?;
            self.with_conn(|conn| {
                insert_with_parents(
                    conn,
                    "INSERT INTO photos (id, project_id, album_id, image, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        photo.id,
                        photo.project_id,
                        photo.album_id,
                        photo.image,
                        format_ts(&photo.created_at),
                    ],
                    &[
                        Parent::new("project_id", "projects", &photo.project_id),
                        Parent::new("album_id", "albums", &photo.album_id)
                            .in_project(&photo.project_id),
                    ],
                )
            })
        })
    }

    fn list_photos(
        &self,
        project_id: &str,
        album_id: &str,
        page: &PageRequest,
    ) -> StoreFuture<'_, Vec<Photo>> {
        let project_id = project_id.to_string();
        let album_id = album_id.to_string();
        let page = page.clone();
        Box::pin(async move {
            check_id("project_id", &project_id)?;
            check_id("album_id", &album_id)?;
            self.with_conn(|conn| {
                query_page(
                    conn,
                    "SELECT t.id, t.project_id, t.album_id, t.image, t.created_at
                     FROM photos t WHERE t.project_id = ?1 AND t.album_id = ?2",
                    &[project_id.as_str(), album_id.as_str()],
                    &page,
                    map_photo,
                )
            })
        })
    }

    // ── News ────────────────────────────────────────────────────────

    fn insert_news(&self, item: NewsItem) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            check_id("id", &item.id)?;
            check_id("project_id", &item.project_id)?;
            self.with_conn(|conn| {
                insert_with_parents(
                    conn,
                    "INSERT INTO news (id, project_id, title, link, text, image, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        item.id,
                        item.project_id,
                        item.title,
                        item.link,
                        item.text,
                        item.image,
                        format_ts(&item.created_at),
                    ],
                    &[Parent::new("project_id", "projects", &item.project_id)],
                )
            })
        })
    }

    fn list_news(&self, project_id: &str, page: &PageRequest) -> StoreFuture<'_, Vec<NewsItem>> {
        let project_id = project_id.to_string();
        let page = page.clone();
        Box::pin(async move {
            check_id("project_id", &project_id)?;
            self.with_conn(|conn| {
                query_page(
                    conn,
                    "SELECT t.id, t.project_id, t.title, t.link, t.text, t.image, t.created_at
                     FROM news t WHERE t.project_id = ?1",
                    &[project_id.as_str()],
                    &page,
                    map_news,
                )
            })
        })
    }

    fn update_news(&self, project_id: &str, id: &str, patch: NewsPatch) -> StoreFuture<'_, ()> {
        let project_id = project_id.to_string();
        let id = id.to_string();
        Box::pin(async move {
            check_id("project_id", &project_id)?;
            check_id("id", &id)?;
            self.with_conn(|conn| {
                let changed = conn
                    .execute(
                        "UPDATE news SET
                             title = COALESCE(?3, title),
                             link = COALESCE(?4, link),
                             text = COALESCE(?5, text)
                         WHERE id = ?1 AND project_id = ?2",
                        params![id, project_id, patch.title, patch.link, patch.text],
                    )
                    .map_err(classify)?;
                if changed == 0 {
                    return Err(not_found(ResourceKind::News));
                }
                Ok(())
            })
        })
    }

    // ── Documents ───────────────────────────────────────────────────

    fn insert_document_cover(&self, cover: DocumentCover) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            check_id("id", &cover.id)?;
            check_id("project_id", &cover.project_id)?;
            self.with_conn(|conn| {
                insert_with_parents(
                    conn,
                    "INSERT INTO document_covers (id, project_id, author_id, name, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        cover.id,
                        cover.project_id,
                        cover.author_id,
                        cover.name,
                        format_ts(&cover.created_at),
                    ],
                    &[Parent::new("project_id", "projects", &cover.project_id)],
                )
            })
        })
    }

    fn list_document_covers(
        &self,
        project_id: &str,
        page: &PageRequest,
    ) -> StoreFuture<'_, Vec<DocumentCover>> {
        let project_id = project_id.to_string();
        let page = page.clone();
        Box::pin(async move {
            check_id("project_id", &project_id)?;
            self.with_conn(|conn| {
                query_page(
                    conn,
                    "SELECT t.id, t.project_id, t.author_id, t.name, t.created_at
                     FROM document_covers t WHERE t.project_id = ?1",
                    &[project_id.as_str()],
                    &page,
                    map_document_cover,
                )
            })
        })
    }

    fn rename_document_cover(
        &self,
        project_id: &str,
        id: &str,
        name: String,
    ) -> StoreFuture<'_, ()> {
        let project_id = project_id.to_string();
        let id = id.to_string();
        Box::pin(async move {
            check_id("project_id", &project_id)?;
            check_id("id", &id)?;
            self.with_conn(|conn| {
                let changed = conn
                    .execute(
                        "UPDATE document_covers SET name = ?3 WHERE id = ?1 AND project_id = ?2",
                        params![id, project_id, name],
                    )
                    .map_err(classify)?;
                if changed == 0 {
                    return Err(not_found(ResourceKind::DocumentCover));
                }
                Ok(())
            })
        })
    }

    // ── Categories ──────────────────────────────────────────────────

    fn insert_category(&self, category: CategoryRow) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            check_id("id", &category.id)?;
            check_id("project_id", &category.project_id)?;
            let parent_id = category.parent_id.as_deref().ok_or_else(|| {
                StoreError::constraint(ConstraintKind::NotNullViolation, "parent_id")
            })?;
            check_id("parent_id", parent_id)?;
            self.with_conn(|conn| {
                insert_with_parents(
                    conn,
                    "INSERT INTO categories (id, project_id, parent_id, name, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        category.id,
                        category.project_id,
                        parent_id,
                        category.name,
                        format_ts(&category.created_at),
                    ],
                    &[
                        Parent::new("project_id", "projects", &category.project_id),
                        Parent::new("parent_id", "categories", parent_id)
                            .in_project(&category.project_id),
                    ],
                )
            })
        })
    }

    fn rename_category(&self, project_id: &str, id: &str, name: String) -> StoreFuture<'_, ()> {
        let project_id = project_id.to_string();
        let id = id.to_string();
        Box::pin(async move {
            check_id("project_id", &project_id)?;
            check_id("id", &id)?;
            self.with_conn(|conn| {
                let changed = conn
                    .execute(
                        "UPDATE categories SET name = ?3 WHERE id = ?1 AND project_id = ?2",
                        params![id, project_id, name],
                    )
                    .map_err(classify)?;
                if changed == 0 {
                    return Err(StoreError::not_found("category"));
                }
                Ok(())
            })
        })
    }

    fn delete_category(&self, project_id: &str, id: &str) -> StoreFuture<'_, ()> {
        let project_id = project_id.to_string();
        let id = id.to_string();
        Box::pin(async move {
            check_id("project_id", &project_id)?;
            check_id("id", &id)?;
            self.with_conn(|conn| {
                // The root is never deleted on its own; it goes with the project.
                let changed = conn
                    .execute(
                        "DELETE FROM categories
                         WHERE id = ?1 AND project_id = ?2 AND parent_id IS NOT NULL",
                        params![id, project_id],
                    )
                    .map_err(|e| match classify(e) {
                        StoreError::Constraint {
                            kind: ConstraintKind::ForeignKeyViolation,
                            ..
                        } => StoreError::constraint(
                            ConstraintKind::ForeignKeyViolation,
                            "category_id",
                        ),
                        other => other,
                    })?;
                if changed == 0 {
                    return Err(StoreError::not_found("category"));
                }
                Ok(())
            })
        })
    }

    fn list_categories(&self, project_id: &str) -> StoreFuture<'_, Vec<CategoryRow>> {
        let project_id = project_id.to_string();
        Box::pin(async move {
            check_id("project_id", &project_id)?;
            self.with_conn(|conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT id, project_id, parent_id, name, created_at FROM categories
                         WHERE project_id = ?1 ORDER BY created_at, id",
                    )
                    .map_err(classify)?;
                let rows = stmt
                    .query_map(params![project_id], map_category)
                    .map_err(classify)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(classify)?;
                Ok(rows)
            })
        })
    }

    fn category_closure(&self, project_id: &str, id: &str) -> StoreFuture<'_, Vec<String>> {
        let project_id = project_id.to_string();
        let id = id.to_string();
        Box::pin(async move {
            check_id("project_id", &project_id)?;
            check_id("id", &id)?;
            self.with_conn(|conn| {
                let mut stmt = conn
                    .prepare(
                        "WITH RECURSIVE subtree(id) AS (
                             SELECT id FROM categories WHERE id = ?1 AND project_id = ?2
                             UNION
                             SELECT c.id FROM categories c JOIN subtree s ON c.parent_id = s.id
                         )
                         SELECT id FROM subtree",
                    )
                    .map_err(classify)?;
                let ids = stmt
                    .query_map(params![id, project_id], |r| r.get::<_, String>(0))
                    .map_err(classify)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(classify)?;
                if ids.is_empty() {
                    return Err(StoreError::not_found("category"));
                }
                Ok(ids)
            })
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PaginationConfig;
    use crate::pagination::{Cursor, Page};
    use chrono::Duration;

    fn test_store() -> SqliteMetadataStore {
        SqliteMetadataStore::new(":memory:").expect("failed to create in-memory store")
    }

    fn new_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn make_project(name: &str) -> Project {
        Project {
            id: new_id(),
            name: name.to_string(),
            cover: format!("projects/{name}/cover.png"),
            public_token: format!("token-{name}"),
            created_at: timestamp_now(),
        }
    }

    fn make_news(project_id: &str, created_at: DateTime<Utc>) -> NewsItem {
        let id = new_id();
        NewsItem {
            image: format!("services/news/{project_id}/{id}/img.jpg"),
            id,
            project_id: project_id.to_string(),
            title: "headline".to_string(),
            link: String::new(),
            text: String::new(),
            created_at,
        }
    }

    async fn seeded_project(store: &SqliteMetadataStore, name: &str) -> Project {
        let project = make_project(name);
        store.insert_project(project.clone()).await.unwrap();
        project
    }

    async fn root_category(store: &SqliteMetadataStore, project_id: &str) -> CategoryRow {
        store
            .list_categories(project_id)
            .await
            .unwrap()
            .into_iter()
            .find(|c| c.parent_id.is_none())
            .expect("root category")
    }

    fn child(project_id: &str, parent_id: &str, name: &str) -> CategoryRow {
        CategoryRow {
            id: new_id(),
            project_id: project_id.to_string(),
            parent_id: Some(parent_id.to_string()),
            name: name.to_string(),
            created_at: timestamp_now(),
        }
    }

    fn blog_in(project_id: &str, category_id: &str) -> Blog {
        Blog {
            id: new_id(),
            project_id: project_id.to_string(),
            author_id: "author".to_string(),
            title: "Hello".to_string(),
            summary: String::new(),
            content: String::new(),
            category_id: category_id.to_string(),
            cover: "services/blogs/x/cover.png".to_string(),
            created_at: timestamp_now(),
            updated_at: None,
        }
    }

    // ── Schema tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn test_schema_idempotent() {
        let store = test_store();
        store.init_db().expect("second init_db failed");
        store.init_db().expect("third init_db failed");
        store.ping().await.unwrap();
    }

    #[test]
    fn test_timestamp_text_is_fixed_width() {
        let ts = DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_ts(&ts), "2026-03-01T10:00:00.000000Z");
        assert_eq!(parse_ts(0, &format_ts(&ts)).unwrap(), ts);
    }

    // ── Projects ────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_project_gets_default_root_category() {
        let store = test_store();
        let project = seeded_project(&store, "acme").await;

        let fetched = store.get_project(&project.id).await.unwrap();
        assert_eq!(fetched, project);

        let root = root_category(&store, &project.id).await;
        assert_eq!(root.name, ROOT_CATEGORY_NAME);
    }

    #[tokio::test]
    async fn test_duplicate_project_name_is_unique_violation() {
        let store = test_store();
        seeded_project(&store, "acme").await;
        let mut dup = make_project("acme");
        dup.public_token = "other".to_string();

        match store.insert_project(dup).await.unwrap_err() {
            StoreError::Constraint { kind, field } => {
                assert_eq!(kind, ConstraintKind::UniqueViolation);
                assert_eq!(field.as_deref(), Some("project name"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(store.list_projects().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_id_is_invalid_syntax() {
        let store = test_store();
        match store.get_project("not-a-uuid").await.unwrap_err() {
            StoreError::Constraint { kind, field } => {
                assert_eq!(kind, ConstraintKind::InvalidInputSyntax);
                assert_eq!(field.as_deref(), Some("id"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_missing_project_is_not_found() {
        let store = test_store();
        assert!(store.get_project(&new_id()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_project_delete_blocked_by_children() {
        let store = test_store();
        let project = seeded_project(&store, "acme").await;
        store
            .insert_news(make_news(&project.id, timestamp_now()))
            .await
            .unwrap();

        match store.delete_media_row(RowRef::project(&project.id)).await.unwrap_err() {
            StoreError::Constraint { kind, field } => {
                assert_eq!(kind, ConstraintKind::ForeignKeyViolation);
                assert_eq!(field.as_deref(), Some("project_id"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        store.get_project(&project.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_project_delete_returns_cover_and_cascades_categories() {
        let store = test_store();
        let project = seeded_project(&store, "acme").await;

        let deleted = store.delete_media_row(RowRef::project(&project.id)).await.unwrap();
        assert_eq!(deleted.keys, vec![project.cover.clone()]);
        assert!(store.list_categories(&project.id).await.unwrap().is_empty());
    }

    // ── Foreign keys ────────────────────────────────────────────────

    #[tokio::test]
    async fn test_insert_names_missing_parent() {
        let store = test_store();
        let project = seeded_project(&store, "acme").await;
        let root = root_category(&store, &project.id).await;

        let orphan = make_news(&new_id(), timestamp_now());
        match store.insert_news(orphan).await.unwrap_err() {
            StoreError::Constraint { kind, field } => {
                assert_eq!(kind, ConstraintKind::ForeignKeyViolation);
                assert_eq!(field.as_deref(), Some("project_id"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let blog = blog_in(&project.id, &new_id());
        match store.insert_blog(blog).await.unwrap_err() {
            StoreError::Constraint { field, .. } => {
                assert_eq!(field.as_deref(), Some("category_id"))
            }
            other => panic!("unexpected error: {other:?}"),
        }

        store.insert_blog(blog_in(&project.id, &root.id)).await.unwrap();
    }

    #[tokio::test]
    async fn test_category_from_other_project_rejected() {
        let store = test_store();
        let a = seeded_project(&store, "a").await;
        let b = seeded_project(&store, "b").await;
        let b_root = root_category(&store, &b.id).await;

        let err = store.insert_blog(blog_in(&a.id, &b_root.id)).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Constraint {
                kind: ConstraintKind::ForeignKeyViolation,
                ..
            }
        ));
    }

    // ── Swap ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_swap_returns_previous_and_honours_guard() {
        let store = test_store();
        let project = seeded_project(&store, "acme").await;
        let item = make_news(&project.id, timestamp_now());
        store.insert_news(item.clone()).await.unwrap();
        let row = RowRef::owned(ResourceKind::News, &project.id, &item.id);

        let previous = store
            .swap_media_key(row.clone(), "new.jpg".to_string(), None)
            .await
            .unwrap();
        assert_eq!(previous, item.image);

        // Guard no longer matches.
        let err = store
            .swap_media_key(row.clone(), "other.jpg".to_string(), Some(item.image.clone()))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let reverted = store
            .swap_media_key(row, item.image.clone(), Some("new.jpg".to_string()))
            .await
            .unwrap();
        assert_eq!(reverted, "new.jpg");
    }

    #[tokio::test]
    async fn test_swap_missing_row_is_not_found() {
        let store = test_store();
        let project = seeded_project(&store, "acme").await;
        let row = RowRef::owned(ResourceKind::Album, &project.id, &new_id());
        let err = store
            .swap_media_key(row, "k".to_string(), None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_swap_touches_blog_updated_at() {
        let store = test_store();
        let project = seeded_project(&store, "acme").await;
        let root = root_category(&store, &project.id).await;
        let blog = blog_in(&project.id, &root.id);
        store.insert_blog(blog.clone()).await.unwrap();

        store
            .swap_media_key(
                RowRef::owned(ResourceKind::Blog, &project.id, &blog.id),
                "services/blogs/new.png".to_string(),
                None,
            )
            .await
            .unwrap();
        let fetched = store.get_blog(&project.id, &blog.id).await.unwrap();
        assert_eq!(fetched.cover, "services/blogs/new.png");
        assert!(fetched.updated_at.is_some());
    }

    // ── Batch delete ────────────────────────────────────────────────

    #[tokio::test]
    async fn test_batch_delete_by_ids_returns_images() {
        let store = test_store();
        let project = seeded_project(&store, "acme").await;
        let a = make_news(&project.id, timestamp_now());
        let b = make_news(&project.id, timestamp_now());
        let c = make_news(&project.id, timestamp_now());
        for item in [&a, &b, &c] {
            store.insert_news(item.clone()).await.unwrap();
        }

        let scope = BatchScope {
            kind: ResourceKind::News,
            project_id: project.id.clone(),
            album_id: None,
        };
        let mut deleted = store
            .delete_media_rows(scope.clone(), BatchSelector::Ids(vec![a.id.clone(), b.id.clone()]))
            .await
            .unwrap();
        deleted.sort_by(|x, y| x.id.cmp(&y.id));
        let mut expected = vec![
            DeletedRow {
                id: a.id.clone(),
                keys: vec![a.image.clone()],
            },
            DeletedRow {
                id: b.id.clone(),
                keys: vec![b.image.clone()],
            },
        ];
        expected.sort_by(|x, y| x.id.cmp(&y.id));
        assert_eq!(deleted, expected);

        let remaining = store
            .list_news(&project.id, &PageRequest::first(&PaginationConfig::default()))
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, c.id);

        let all = store.delete_media_rows(scope, BatchSelector::All).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_batch_delete_is_scoped_to_project() {
        let store = test_store();
        let a = seeded_project(&store, "a").await;
        let b = seeded_project(&store, "b").await;
        let item = make_news(&b.id, timestamp_now());
        store.insert_news(item.clone()).await.unwrap();

        let deleted = store
            .delete_media_rows(
                BatchScope {
                    kind: ResourceKind::News,
                    project_id: a.id.clone(),
                    album_id: None,
                },
                BatchSelector::Ids(vec![item.id.clone()]),
            )
            .await
            .unwrap();
        assert!(deleted.is_empty());
    }

    // ── Pagination ──────────────────────────────────────────────────

    #[tokio::test]
    async fn test_keyset_pagination_with_tied_timestamps() {
        let store = test_store();
        let project = seeded_project(&store, "acme").await;
        let base = timestamp_now() - Duration::hours(1);
        // 25 rows; every timestamp is shared by five rows.
        for i in 0..25 {
            let ts = base + Duration::seconds(i / 5);
            store.insert_news(make_news(&project.id, ts)).await.unwrap();
        }
        let config = PaginationConfig {
            default_limit: 20,
            max_limit: 20,
        };

        let first = PageRequest::first(&config);
        let rows = store.list_news(&project.id, &first).await.unwrap();
        let page = Page::from_rows(rows, first.limit);
        assert_eq!(page.items.len(), 20);
        assert!(page.page_info.has_next_page);

        let cursor: Cursor = page.page_info.next_cursor.clone().unwrap();
        let second = PageRequest::new(Some(&cursor.to_string()), None, &config).unwrap();
        let rows = store.list_news(&project.id, &second).await.unwrap();
        let page2 = Page::from_rows(rows, second.limit);
        assert_eq!(page2.items.len(), 5);
        assert!(!page2.page_info.has_next_page);
        assert!(page2.page_info.next_cursor.is_none());

        let order: Vec<_> = page
            .items
            .iter()
            .chain(page2.items.iter())
            .map(|n| (n.created_at, n.id.clone()))
            .collect();
        assert!(order.windows(2).all(|w| w[0] > w[1]));

        let mut seen: Vec<&str> = page
            .items
            .iter()
            .chain(page2.items.iter())
            .map(|n| n.id.as_str())
            .collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 25);
    }

    #[tokio::test]
    async fn test_list_blogs_filters_by_category_subtree() {
        let store = test_store();
        let project = seeded_project(&store, "acme").await;
        let root = root_category(&store, &project.id).await;
        let tech = child(&project.id, &root.id, "Tech");
        store.insert_category(tech.clone()).await.unwrap();
        let ai = child(&project.id, &tech.id, "AI");
        store.insert_category(ai.clone()).await.unwrap();

        store.insert_blog(blog_in(&project.id, &root.id)).await.unwrap();
        store.insert_blog(blog_in(&project.id, &tech.id)).await.unwrap();
        store.insert_blog(blog_in(&project.id, &ai.id)).await.unwrap();

        let page = PageRequest::first(&PaginationConfig::default());
        assert_eq!(store.list_blogs(&project.id, None, &page).await.unwrap().len(), 3);
        let tech_rows = store
            .list_blogs(&project.id, Some(&tech.id), &page)
            .await
            .unwrap();
        assert_eq!(tech_rows.len(), 2);
        let ai_rows = store
            .list_blogs(&project.id, Some(&ai.id), &page)
            .await
            .unwrap();
        assert_eq!(ai_rows.len(), 1);
        assert_eq!(ai_rows[0].category.name, "AI");
    }

    // ── Categories ──────────────────────────────────────────────────

    #[tokio::test]
    async fn test_category_closure_and_sibling_uniqueness() {
        let store = test_store();
        let project = seeded_project(&store, "acme").await;
        let root = root_category(&store, &project.id).await;
        let tech = child(&project.id, &root.id, "Tech");
        store.insert_category(tech.clone()).await.unwrap();
        let ai = child(&project.id, &tech.id, "AI");
        store.insert_category(ai.clone()).await.unwrap();

        let mut closure = store.category_closure(&project.id, &tech.id).await.unwrap();
        closure.sort();
        let mut expected = vec![tech.id.clone(), ai.id.clone()];
        expected.sort();
        assert_eq!(closure, expected);

        match store
            .insert_category(child(&project.id, &root.id, "Tech"))
            .await
            .unwrap_err()
        {
            StoreError::Constraint { kind, field } => {
                assert_eq!(kind, ConstraintKind::UniqueViolation);
                assert_eq!(field.as_deref(), Some("category name"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_category_delete_restricted_by_blogs() {
        let store = test_store();
        let project = seeded_project(&store, "acme").await;
        let root = root_category(&store, &project.id).await;
        let tech = child(&project.id, &root.id, "Tech");
        store.insert_category(tech.clone()).await.unwrap();
        let ai = child(&project.id, &tech.id, "AI");
        store.insert_category(ai.clone()).await.unwrap();
        store.insert_blog(blog_in(&project.id, &ai.id)).await.unwrap();

        // Cascading to AI would orphan its blog.
        match store.delete_category(&project.id, &tech.id).await.unwrap_err() {
            StoreError::Constraint { kind, field } => {
                assert_eq!(kind, ConstraintKind::ForeignKeyViolation);
                assert_eq!(field.as_deref(), Some("category_id"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(store.list_categories(&project.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_root_category_cannot_be_deleted_alone() {
        let store = test_store();
        let project = seeded_project(&store, "acme").await;
        let root = root_category(&store, &project.id).await;
        assert!(store
            .delete_category(&project.id, &root.id)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_updates_report_missing_rows() {
        let store = test_store();
        let project = seeded_project(&store, "acme").await;
        let missing = new_id();
        assert!(store
            .update_news(&project.id, &missing, NewsPatch::default())
            .await
            .unwrap_err()
            .is_not_found());
        assert!(store
            .rename_album(&project.id, &missing, "x".to_string())
            .await
            .unwrap_err()
            .is_not_found());
        assert!(store
            .update_blog_content(&project.id, &missing, String::new())
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_membership_lists_only_member_projects() {
        let store = test_store();
        let acme = seeded_project(&store, "acme").await;
        let globex = seeded_project(&store, "globex").await;
        seeded_project(&store, "initech").await;

        store.add_member(&acme.id, "user-1").await.unwrap();
        store.add_member(&globex.id, "user-1").await.unwrap();
        store.add_member(&acme.id, "user-2").await.unwrap();

        let mut names: Vec<String> = store
            .list_projects_for_user("user-1")
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["acme", "globex"]);

        let err = store.add_member(&acme.id, "user-1").await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Constraint { kind: ConstraintKind::UniqueViolation, ref field }
                if field.as_deref() == Some("project member")
        ));
        let err = store.add_member(&new_id(), "user-1").await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Constraint { kind: ConstraintKind::ForeignKeyViolation, ref field }
                if field.as_deref() == Some("project_id")
        ));

        store.remove_member(&globex.id, "user-1").await.unwrap();
        assert!(store.remove_member(&globex.id, "user-1").await.unwrap_err().is_not_found());
        assert_eq!(store.list_projects_for_user("user-1").await.unwrap().len(), 1);
        assert!(store.list_projects_for_user("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_project_services_classify_constraints() {
        let store = test_store();
        let project = seeded_project(&store, "acme").await;
        let catalog = store.list_services().await.unwrap();
        let names: Vec<&str> = catalog.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["blogs", "documents", "gallery", "news"]);
        let blogs = catalog[0].id.clone();
        let news = catalog[3].id.clone();

        store
            .add_project_services(&project.id, vec![blogs.clone(), news.clone()])
            .await
            .unwrap();
        let enabled = store.list_project_services(&project.id).await.unwrap();
        assert_eq!(enabled.len(), 2);

        let err = store
            .add_project_services(&project.id, vec![blogs.clone()])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Constraint { kind: ConstraintKind::UniqueViolation, ref field }
                if field.as_deref() == Some("project service")
        ));

        let err = store
            .add_project_services(&project.id, vec![catalog[1].id.clone(), new_id()])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Constraint { kind: ConstraintKind::ForeignKeyViolation, ref field }
                if field.as_deref() == Some("service_id")
        ));
        // All or nothing: the valid service in the failed call was not kept.
        assert_eq!(store.list_project_services(&project.id).await.unwrap().len(), 2);

        let err = store
            .add_project_services(&new_id(), vec![blogs.clone()])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Constraint { kind: ConstraintKind::ForeignKeyViolation, ref field }
                if field.as_deref() == Some("project_id")
        ));

        store.remove_project_service(&project.id, &news).await.unwrap();
        assert!(store
            .remove_project_service(&project.id, &news)
            .await
            .unwrap_err()
            .is_not_found());
        let enabled = store.list_project_services(&project.id).await.unwrap();
        assert_eq!(enabled, vec![catalog[0].clone()]);
    }

    #[tokio::test]
    async fn test_project_delete_drops_members_and_services() {
        let store = test_store();
        let project = seeded_project(&store, "acme").await;
        let service = store.list_services().await.unwrap()[0].id.clone();
        store.add_member(&project.id, "user-1").await.unwrap();
        store
            .add_project_services(&project.id, vec![service])
            .await
            .unwrap();

        store
            .delete_media_row(RowRef::project(&project.id))
            .await
            .unwrap();
        assert!(store.list_projects_for_user("user-1").await.unwrap().is_empty());
    }
}
