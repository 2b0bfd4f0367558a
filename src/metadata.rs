//! Local mirror of remote video metadata, backed by libsql/SQLite.
//!
//! One database file holds three tables:
//! * `videos`: one row per remote video, keyed by `remote_id`.
//! * `quota_usage`: append-only ledger of API units spent.
//! * `cache_entries`: the persistent search cache (see [`crate::cache`]).
//!
//! Remote-sourced columns are overwritten on every sync while the curation
//! columns (`category`, `tags`, `added_by`) are only ever written by their
//! dedicated operations.

use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use libsql::{Builder, Connection, Row, params};
use serde::{Deserialize, Serialize};

use crate::{
    clock::{format_timestamp, parse_timestamp},
    error::{MirrorError, MirrorResult},
    remote::{RemoteVideo, embed_url, watch_url},
};

/// Row of the `videos` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub remote_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub video_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub thumbnail_url: String,
    pub channel_id: String,
    pub channel_name: String,
    pub duration: String,
    pub duration_seconds: i64,
    /// Unknown until the first sync after an upload; never changes once set.
    pub published_at: Option<DateTime<Utc>>,
    pub views: i64,
    pub likes: i64,
    pub comment_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub added_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VideoRecord {
    pub fn embed_url(&self) -> String {
        embed_url(&self.remote_id)
    }
}

/// Restricts listing and aggregation. Empty filter means every row.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VideoFilter {
    pub channel_id: Option<String>,
    /// Case-insensitive substring matched against title or description.
    pub text: Option<String>,
    pub limit: Option<u32>,
}

impl VideoFilter {
    pub fn channel(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: Some(channel_id.into()),
            ..Self::default()
        }
    }

    pub fn with_text(mut self, text: Option<String>) -> Self {
        self.text = text
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        self
    }

    fn like_pattern(&self) -> Option<String> {
        self.text
            .as_deref()
            .map(|text| format!("%{}%", escape_like(&text.to_lowercase())))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub total_views: i64,
    pub total_likes: i64,
    pub count: i64,
}

/// Remote operations that consume quota, with their unit cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaOperation {
    Search,
    ChannelUploads,
    VideoDetails,
    VideoInsert,
}

impl QuotaOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::ChannelUploads => "channel_uploads",
            Self::VideoDetails => "video_details",
            Self::VideoInsert => "video_insert",
        }
    }

    pub fn cost(self) -> i64 {
        match self {
            Self::Search | Self::ChannelUploads => 100,
            Self::VideoDetails => 1,
            Self::VideoInsert => 1_600,
        }
    }
}

/// Share of the daily limit past which every booking logs a warning.
const QUOTA_WARN_NUMERATOR: i64 = 9;
const QUOTA_WARN_DENOMINATOR: i64 = 10;

const VIDEO_COLUMNS: &str = "remote_id, title, description, video_url, thumbnail_url, \
     channel_id, channel_name, duration, duration_seconds, published_at, views, likes, \
     comment_count, category, tags, added_by, created_at, updated_at";

async fn configure_connection(conn: &Connection) -> MirrorResult<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        PRAGMA busy_timeout=5000;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> MirrorResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS videos (
            remote_id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            video_url TEXT NOT NULL,
            thumbnail_url TEXT NOT NULL DEFAULT '',
            channel_id TEXT NOT NULL DEFAULT '',
            channel_name TEXT NOT NULL DEFAULT '',
            duration TEXT NOT NULL DEFAULT 'PT0S',
            duration_seconds INTEGER NOT NULL DEFAULT 0,
            published_at TEXT,
            views INTEGER NOT NULL DEFAULT 0,
            likes INTEGER NOT NULL DEFAULT 0,
            comment_count INTEGER NOT NULL DEFAULT 0,
            category TEXT,
            tags TEXT,
            added_by TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            search_text TEXT NOT NULL DEFAULT ''
        );

        CREATE INDEX IF NOT EXISTS idx_videos_channel ON videos(channel_id);
        CREATE INDEX IF NOT EXISTS idx_videos_published ON videos(published_at);
        CREATE INDEX IF NOT EXISTS idx_videos_added_by ON videos(added_by);

        CREATE TABLE IF NOT EXISTS quota_usage (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            usage_date TEXT NOT NULL,
            operation TEXT NOT NULL,
            units INTEGER NOT NULL,
            actor TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_quota_usage_date ON quota_usage(usage_date);

        CREATE TABLE IF NOT EXISTS cache_entries (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_cache_entries_expiry ON cache_entries(expires_at);
        "#,
    )
    .await?;
    Ok(())
}

/// Handle on the mirror database. Cheap to clone; clones share the
/// underlying connection.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    conn: Connection,
}

impl MetadataStore {
    /// Opens (and if necessary creates) the database and its schema.
    pub async fn open(path: &Path) -> MirrorResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Builder::new_local(path).build().await?;
        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        tracing::debug!(path = %path.display(), "mirror database ready");
        Ok(Self { conn })
    }

    /// Shared with [`crate::cache::SqlCache`] so both live in one file.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Inserts the video or refreshes its remote-sourced columns.
    ///
    /// One `INSERT .. ON CONFLICT DO UPDATE` statement, so concurrent writers
    /// of the same row cannot interleave. `published_at` keeps its first
    /// non-null value; curation columns and `created_at` are left alone.
    pub async fn upsert(&self, video: &RemoteVideo, now: DateTime<Utc>) -> MirrorResult<VideoRecord> {
        let now = format_timestamp(&now);
        let published_at = format_timestamp(&video.published_at);
        let mut rows = self
            .conn
            .query(
                &format!(
                    r#"
                    INSERT INTO videos (
                        remote_id, title, description, video_url, thumbnail_url,
                        channel_id, channel_name, duration, duration_seconds,
                        published_at, views, likes, comment_count,
                        created_at, updated_at, search_text
                    ) VALUES (
                        ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14, ?15
                    )
                    ON CONFLICT(remote_id) DO UPDATE SET
                        title = excluded.title,
                        description = excluded.description,
                        video_url = excluded.video_url,
                        thumbnail_url = excluded.thumbnail_url,
                        channel_id = excluded.channel_id,
                        channel_name = excluded.channel_name,
                        duration = excluded.duration,
                        duration_seconds = excluded.duration_seconds,
                        published_at = COALESCE(videos.published_at, excluded.published_at),
                        views = excluded.views,
                        likes = excluded.likes,
                        comment_count = excluded.comment_count,
                        updated_at = excluded.updated_at,
                        search_text = excluded.search_text
                    RETURNING {VIDEO_COLUMNS}
                    "#
                ),
                params![
                    video.remote_id.as_str(),
                    video.title.as_str(),
                    video.description.as_str(),
                    video.video_url(),
                    video.thumbnail_url.as_str(),
                    video.channel_id.as_str(),
                    video.channel_name.as_str(),
                    video.duration.as_str(),
                    video.duration_seconds,
                    published_at,
                    video.views,
                    video.likes,
                    video.comment_count,
                    now,
                    search_text(&video.title, &video.description),
                ],
            )
            .await?;

        let row = rows
            .next()
            .await?
            .ok_or_else(|| MirrorError::NotFound(video.remote_id.clone()))?;
        row_to_video_record(&row)
    }

    /// Overwrites views and likes for each known id in one transaction.
    /// Unknown ids are skipped: a video deleted remotely stays mirrored.
    /// Returns how many rows changed.
    pub async fn bulk_update_statistics(
        &self,
        updates: &[(String, i64, i64)],
        now: DateTime<Utc>,
    ) -> MirrorResult<u64> {
        if updates.is_empty() {
            return Ok(0);
        }
        let now = format_timestamp(&now);
        let tx = self.conn.transaction().await?;
        let mut changed = 0;
        for (remote_id, views, likes) in updates {
            changed += tx
                .execute(
                    r#"
                    UPDATE videos
                    SET views = ?2, likes = ?3, updated_at = ?4
                    WHERE remote_id = ?1
                    "#,
                    params![remote_id.as_str(), *views, *likes, now.as_str()],
                )
                .await?;
        }
        tx.commit().await?;
        Ok(changed)
    }

    /// Creates the local row for a video we just uploaded. The publish date
    /// stays unknown until the next sync reads it from the remote.
    pub async fn record_upload(
        &self,
        remote_id: &str,
        title: &str,
        description: &str,
        added_by: Option<&str>,
        now: DateTime<Utc>,
    ) -> MirrorResult<VideoRecord> {
        let now = format_timestamp(&now);
        let mut rows = self
            .conn
            .query(
                &format!(
                    r#"
                    INSERT INTO videos (
                        remote_id, title, description, video_url, added_by,
                        created_at, updated_at, search_text
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7)
                    ON CONFLICT(remote_id) DO UPDATE SET
                        title = excluded.title,
                        description = excluded.description,
                        added_by = COALESCE(videos.added_by, excluded.added_by),
                        updated_at = excluded.updated_at,
                        search_text = excluded.search_text
                    RETURNING {VIDEO_COLUMNS}
                    "#
                ),
                params![
                    remote_id,
                    title,
                    description,
                    watch_url(remote_id),
                    added_by,
                    now,
                    search_text(title, description)
                ],
            )
            .await?;
        let row = rows
            .next()
            .await?
            .ok_or_else(|| MirrorError::NotFound(remote_id.to_owned()))?;
        row_to_video_record(&row)
    }

    /// Owner-set categorization. Sync never writes these columns.
    pub async fn set_curation(
        &self,
        remote_id: &str,
        category: Option<&str>,
        tags: Option<&str>,
        now: DateTime<Utc>,
    ) -> MirrorResult<VideoRecord> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    r#"
                    UPDATE videos
                    SET category = ?2, tags = ?3, updated_at = ?4
                    WHERE remote_id = ?1
                    RETURNING {VIDEO_COLUMNS}
                    "#
                ),
                params![remote_id, category, tags, format_timestamp(&now)],
            )
            .await?;
        let row = rows
            .next()
            .await?
            .ok_or_else(|| MirrorError::NotFound(remote_id.to_owned()))?;
        row_to_video_record(&row)
    }

    /// Detaches every record from a removed owner. The records themselves
    /// stay in the mirror.
    pub async fn release_owner(&self, owner: &str, now: DateTime<Utc>) -> MirrorResult<u64> {
        let changed = self
            .conn
            .execute(
                "UPDATE videos SET added_by = NULL, updated_at = ?2 WHERE added_by = ?1",
                params![owner, format_timestamp(&now)],
            )
            .await?;
        Ok(changed)
    }

    pub async fn get_video(&self, remote_id: &str) -> MirrorResult<Option<VideoRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {VIDEO_COLUMNS} FROM videos WHERE remote_id = ?1"),
                params![remote_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_video_record(&row)?)),
            None => Ok(None),
        }
    }

    /// Newest first; rows without a known publish date (fresh uploads) lead.
    pub async fn list_videos(&self, filter: &VideoFilter) -> MirrorResult<Vec<VideoRecord>> {
        let limit = filter.limit.map(i64::from).unwrap_or(-1);
        let mut rows = self
            .conn
            .query(
                &format!(
                    r#"
                    SELECT {VIDEO_COLUMNS}
                    FROM videos
                    WHERE (?1 IS NULL OR channel_id = ?1)
                      AND (?2 IS NULL OR search_text LIKE ?2 ESCAPE '\')
                    ORDER BY published_at IS NOT NULL, published_at DESC, created_at DESC
                    LIMIT ?3
                    "#
                ),
                params![filter.channel_id.as_deref(), filter.like_pattern(), limit],
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row_to_video_record(&row)?);
        }
        Ok(records)
    }

    /// Sum of views and likes plus row count over the filtered rows. The
    /// filter's `limit` does not apply here.
    pub async fn aggregate(&self, filter: &VideoFilter) -> MirrorResult<AggregateStats> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT COALESCE(SUM(views), 0), COALESCE(SUM(likes), 0), COUNT(*)
                FROM videos
                WHERE (?1 IS NULL OR channel_id = ?1)
                  AND (?2 IS NULL OR search_text LIKE ?2 ESCAPE '\')
                "#,
                params![filter.channel_id.as_deref(), filter.like_pattern()],
            )
            .await?;
        let row = rows
            .next()
            .await?
            .ok_or_else(|| MirrorError::NotFound("aggregate row".into()))?;
        Ok(AggregateStats {
            total_views: row.get(0)?,
            total_likes: row.get(1)?,
            count: row.get(2)?,
        })
    }

    pub async fn all_remote_ids(&self) -> MirrorResult<Vec<String>> {
        let mut rows = self
            .conn
            .query("SELECT remote_id FROM videos ORDER BY rowid", params![])
            .await?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next().await? {
            ids.push(row.get::<String>(0)?);
        }
        Ok(ids)
    }

    /// Appends a ledger row and returns the day's running total. Logs a
    /// warning once the total passes 90% of `daily_limit`.
    pub async fn record_quota_usage(
        &self,
        operation: QuotaOperation,
        units: i64,
        actor: &str,
        date: NaiveDate,
        daily_limit: i64,
    ) -> MirrorResult<i64> {
        let day = date.format("%Y-%m-%d").to_string();
        self.conn
            .execute(
                r#"
                INSERT INTO quota_usage (usage_date, operation, units, actor)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![day.as_str(), operation.as_str(), units, actor],
            )
            .await?;

        let total = self.daily_quota_total(date).await?;
        if total * QUOTA_WARN_DENOMINATOR > daily_limit * QUOTA_WARN_NUMERATOR {
            tracing::warn!(
                date = %day,
                total,
                daily_limit,
                "API quota almost exhausted"
            );
        }
        Ok(total)
    }

    pub async fn daily_quota_total(&self, date: NaiveDate) -> MirrorResult<i64> {
        let day = date.format("%Y-%m-%d").to_string();
        let mut rows = self
            .conn
            .query(
                "SELECT COALESCE(SUM(units), 0) FROM quota_usage WHERE usage_date = ?1",
                params![day],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }
}

/// Escapes LIKE wildcards so user text matches literally.
/// Lowercased title and description, matched by the text filter. SQLite's
/// `lower()` only folds ASCII, so folding happens here.
fn search_text(title: &str, description: &str) -> String {
    format!("{title}\n{description}").to_lowercase()
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Converts a SQL row into a `VideoRecord`.
fn row_to_video_record(row: &Row) -> MirrorResult<VideoRecord> {
    // Column order must match VIDEO_COLUMNS.
    let published_at: Option<String> = row.get(9)?;
    let created_at: String = row.get(16)?;
    let updated_at: String = row.get(17)?;

    Ok(VideoRecord {
        remote_id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        video_url: row.get(3)?,
        thumbnail_url: row.get(4)?,
        channel_id: row.get(5)?,
        channel_name: row.get(6)?,
        duration: row.get(7)?,
        duration_seconds: row.get(8)?,
        published_at: published_at.as_deref().map(parse_timestamp).transpose()?,
        views: row.get(10)?,
        likes: row.get(11)?,
        comment_count: row.get(12)?,
        category: row.get(13)?,
        tags: row.get(14)?,
        added_by: row.get(15)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}
