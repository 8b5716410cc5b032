#![forbid(unsafe_code)]

//! Offline store: whole video files kept in a local SQLite table so they can
//! be played back without the network.
//!
//! A row is only ever written after the full body has been downloaded, so an
//! interrupted save leaves nothing behind.

use std::{io::Read, path::Path, sync::Arc};

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use libsql::{Builder, Connection, Row, params};
use serde::Serialize;
use tracing::info;
use url::Url;

use crate::origin::Origin;

pub const DEFAULT_MIME_TYPE: &str = "video/mp4";

/// Read size while downloading. Progress is reported once per chunk.
const DOWNLOAD_CHUNK_BYTES: usize = 256 * 1024;

/// Listing entry. Never carries the blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineVideoMeta {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    pub mime_type: String,
    pub size: u64,
    pub saved_at: DateTime<Utc>,
}

/// A stored video ready to be served locally.
#[derive(Debug, Clone)]
pub struct PlayableVideo {
    pub meta: OfflineVideoMeta,
    pub data: Bytes,
}

impl PlayableVideo {
    /// Path under which the viewer serves this video.
    pub fn local_url(&self) -> String {
        local_url(&self.meta.id)
    }
}

pub fn local_url(id: &str) -> String {
    format!("/offline/{id}")
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS offline_videos (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            data BLOB NOT NULL,
            thumbnail_url TEXT,
            mime_type TEXT NOT NULL,
            size INTEGER NOT NULL,
            saved_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_offline_videos_saved_at ON offline_videos(saved_at);
        "#,
    )
    .await?;
    Ok(())
}

pub struct OfflineStore {
    conn: Connection,
    origin: Arc<dyn Origin>,
}

impl OfflineStore {
    /// Opens (and if necessary creates) the database and its table.
    pub async fn open(path: &Path, origin: Arc<dyn Origin>) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating offline store directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening offline store {}", path.display()))?;
        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn, origin })
    }

    /// Downloads `source_url` and stores it under `id`, replacing any earlier
    /// copy. `on_progress(loaded, total)` runs after each chunk when the
    /// origin announced a length.
    pub async fn save<F>(
        &self,
        id: &str,
        title: &str,
        source_url: &str,
        thumbnail_url: Option<&str>,
        on_progress: F,
    ) -> Result<OfflineVideoMeta>
    where
        F: FnMut(u64, u64) + Send + 'static,
    {
        let url =
            Url::parse(source_url).with_context(|| format!("invalid source URL {source_url}"))?;
        let origin = Arc::clone(&self.origin);
        let (data, mime_type) =
            tokio::task::spawn_blocking(move || download(origin.as_ref(), &url, on_progress))
                .await
                .context("download task panicked")??;

        let meta = OfflineVideoMeta {
            id: id.to_string(),
            title: title.to_string(),
            thumbnail_url: thumbnail_url.map(str::to_string),
            mime_type,
            size: data.len() as u64,
            saved_at: Utc::now(),
        };
        self.conn
            .execute(
                r#"
                INSERT OR REPLACE INTO offline_videos (
                    id, title, data, thumbnail_url, mime_type, size, saved_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    meta.id.as_str(),
                    meta.title.as_str(),
                    data,
                    meta.thumbnail_url.as_deref(),
                    meta.mime_type.as_str(),
                    meta.size as i64,
                    meta.saved_at.timestamp_millis(),
                ],
            )
            .await
            .with_context(|| format!("storing offline video {id}"))?;
        info!(id, size = meta.size, "saved video for offline playback");
        Ok(meta)
    }

    pub async fn load(&self, id: &str) -> Result<Option<PlayableVideo>> {
        let stmt = self
            .conn
            .prepare(
                r#"
                SELECT id, title, thumbnail_url, mime_type, size, saved_at, data
                FROM offline_videos
                WHERE id = ?1
                "#,
            )
            .await?;
        let mut rows = stmt.query([id]).await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let meta = row_to_meta(&row)?;
        let data: Vec<u8> = row.get(6)?;
        Ok(Some(PlayableVideo {
            meta,
            data: Bytes::from(data),
        }))
    }

    pub async fn exists(&self, id: &str) -> Result<bool> {
        let mut rows = self
            .conn
            .query("SELECT 1 FROM offline_videos WHERE id = ?1", [id])
            .await?;
        Ok(rows.next().await?.is_some())
    }

    /// Returns whether a row was removed.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM offline_videos WHERE id = ?1", [id])
            .await?;
        Ok(removed > 0)
    }

    /// Newest first.
    pub async fn list(&self) -> Result<Vec<OfflineVideoMeta>> {
        let stmt = self
            .conn
            .prepare(
                r#"
                SELECT id, title, thumbnail_url, mime_type, size, saved_at
                FROM offline_videos
                ORDER BY saved_at DESC, id ASC
                "#,
            )
            .await?;
        let mut rows = stmt.query(params![]).await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_meta(&row)?);
        }
        Ok(out)
    }

    pub async fn total_bytes_used(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COALESCE(SUM(size), 0) FROM offline_videos", params![])
            .await?;
        let row = rows.next().await?.context("missing SUM row")?;
        let total: i64 = row.get(0)?;
        Ok(total.max(0) as u64)
    }
}

fn download<F>(origin: &dyn Origin, url: &Url, mut on_progress: F) -> Result<(Vec<u8>, String)>
where
    F: FnMut(u64, u64),
{
    let mut response = origin.fetch(url, None)?;
    if response.status >= 400 {
        bail!("origin responded with HTTP {}", response.status);
    }
    let total = response.content_length.filter(|len| *len > 0);
    let mime_type = response
        .content_type
        .take()
        .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string());

    let mut data = Vec::with_capacity(total.unwrap_or(0).min(64 * 1024 * 1024) as usize);
    let mut buf = vec![0u8; DOWNLOAD_CHUNK_BYTES];
    loop {
        let read = response
            .body
            .read(&mut buf)
            .with_context(|| format!("downloading {url}"))?;
        if read == 0 {
            break;
        }
        data.extend_from_slice(&buf[..read]);
        if let Some(total) = total {
            on_progress(data.len() as u64, total);
        }
    }
    Ok((data, mime_type))
}

fn row_to_meta(row: &Row) -> Result<OfflineVideoMeta> {
    let size: i64 = row.get(4)?;
    let saved_at_ms: i64 = row.get(5)?;
    Ok(OfflineVideoMeta {
        id: row.get(0)?,
        title: row.get(1)?,
        thumbnail_url: row.get(2)?,
        mime_type: row.get(3)?,
        size: size.max(0) as u64,
        saved_at: DateTime::from_timestamp_millis(saved_at_ms)
            .with_context(|| format!("invalid saved_at {saved_at_ms}"))?,
    })
}
