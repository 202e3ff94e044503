//! File-backed media cache.
//!
//! Sends fetch their payload through here (URL, local path, or data URI);
//! inbound media downloads land here too. Every entry is indexed in the
//! `media_cache` table with an expiry; a background sweeper unlinks expired
//! files. The use-case that triggers a fetch owns the entry's lifetime for
//! the send and releases it afterwards, success or not.

use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::store::{MediaCacheItem, Store};

/// A fetched media payload, cached on disk.
#[derive(Debug, Clone)]
pub struct CachedMedia {
    /// Cache key (the `message_id` column; `out-<uuid>` for sends).
    pub key: String,
    pub path: PathBuf,
    pub data: Vec<u8>,
    pub mime_type: String,
    pub filename: Option<String>,
}

/// Media cache over one directory and the `media_cache` table.
pub struct MediaCache {
    store: Store,
    dir: PathBuf,
    ttl: ChronoDuration,
    http: reqwest::Client,
}

/// Best-effort mime from a file extension.
fn mime_from_path(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "3gp" => "video/3gpp",
        "mp3" => "audio/mpeg",
        "ogg" | "oga" | "opus" => "audio/ogg",
        "wav" => "audio/wav",
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

impl MediaCache {
    /// Opens the cache over `dir`, creating it if needed.
    pub fn new(store: Store, dir: PathBuf, ttl_secs: u64) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&dir)?;
        Ok(Arc::new(Self {
            store,
            dir,
            ttl: ChronoDuration::seconds(ttl_secs as i64),
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }))
    }

    /// Fetches a media reference for an outgoing send and caches it.
    ///
    /// Accepts `http(s)://` URLs, `data:<mime>;base64,<payload>` URIs, and
    /// local filesystem paths.
    pub async fn fetch(
        &self,
        session_id: Uuid,
        reference: &str,
        media_type: &str,
        filename: Option<&str>,
    ) -> Result<CachedMedia> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(GatewayError::InvalidArgument(
                "file reference must not be empty".to_string(),
            ));
        }

        let (data, mime_type) = if reference.starts_with("http://")
            || reference.starts_with("https://")
        {
            let resp = self.http.get(reference).send().await.map_err(|e| {
                GatewayError::Unavailable(format!("media download {}: {}", reference, e))
            })?;
            if !resp.status().is_success() {
                return Err(GatewayError::from_status(
                    resp.status().as_u16(),
                    &format!("media download {}", reference),
                ));
            }
            let mime = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
                .unwrap_or_else(|| mime_from_path(reference).to_string());
            let bytes = resp
                .bytes()
                .await
                .map_err(|e| GatewayError::Unavailable(format!("media body: {}", e)))?;
            (bytes.to_vec(), mime)
        } else if let Some(rest) = reference.strip_prefix("data:") {
            let (header, payload) = rest.split_once(',').ok_or_else(|| {
                GatewayError::InvalidArgument("malformed data URI".to_string())
            })?;
            let mime = header
                .split(';')
                .next()
                .filter(|m| !m.is_empty())
                .unwrap_or("application/octet-stream")
                .to_string();
            let data = base64::engine::general_purpose::STANDARD
                .decode(payload.trim())
                .map_err(|e| {
                    GatewayError::InvalidArgument(format!("invalid base64 payload: {}", e))
                })?;
            (data, mime)
        } else {
            let data = tokio::fs::read(reference).await.map_err(|e| {
                GatewayError::InvalidArgument(format!("cannot read file {}: {}", reference, e))
            })?;
            (data, mime_from_path(reference).to_string())
        };

        if data.is_empty() {
            return Err(GatewayError::InvalidArgument(
                "media payload is empty".to_string(),
            ));
        }

        let key = format!("out-{}", Uuid::new_v4());
        self.put(session_id, &key, media_type, &mime_type, &data, filename)
            .await
    }

    /// Caches bytes under a key (used for inbound media downloads too).
    pub async fn put(
        &self,
        session_id: Uuid,
        key: &str,
        media_type: &str,
        mime_type: &str,
        data: &[u8],
        filename: Option<&str>,
    ) -> Result<CachedMedia> {
        let path = self.dir.join(format!("{}-{}", session_id, key));
        tokio::fs::write(&path, data).await?;

        let now = Utc::now();
        self.store.put_media_item(&MediaCacheItem {
            session_id,
            message_id: key.to_string(),
            media_type: media_type.to_string(),
            mime_type: mime_type.to_string(),
            file_path: path.to_string_lossy().to_string(),
            file_size: data.len() as i64,
            filename: filename.map(str::to_string),
            cached_at: now,
            last_access: now,
            expires_at: now + self.ttl,
        })?;

        debug!(key = %key, size = data.len(), "media cached");
        Ok(CachedMedia {
            key: key.to_string(),
            path,
            data: data.to_vec(),
            mime_type: mime_type.to_string(),
            filename: filename.map(str::to_string),
        })
    }

    /// Reads a cached entry back, if present.
    pub async fn get(&self, session_id: Uuid, key: &str) -> Result<Option<CachedMedia>> {
        let Some(item) = self.store.get_media_item(session_id, key)? else {
            return Ok(None);
        };
        let data = match tokio::fs::read(&item.file_path).await {
            Ok(data) => data,
            Err(e) => {
                // Index row without a file: drop the row.
                warn!(key = %key, "cached media file missing: {}", e);
                let _ = self.store.delete_media_item(session_id, key);
                return Ok(None);
            }
        };
        Ok(Some(CachedMedia {
            key: item.message_id,
            path: PathBuf::from(&item.file_path),
            data,
            mime_type: item.mime_type,
            filename: item.filename,
        }))
    }

    /// Releases an entry after a send completes (either way).
    pub fn release(&self, session_id: Uuid, key: &str) {
        match self.store.delete_media_item(session_id, key) {
            Ok(Some(path)) => {
                if let Err(e) = std::fs::remove_file(&path) {
                    debug!(path = %path, "media unlink failed: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => debug!(key = %key, "media release failed: {}", e),
        }
    }

    /// Deletes expired rows and unlinks their files. Returns files removed.
    pub fn sweep(&self) -> Result<usize> {
        let paths = self.store.delete_expired_media(Utc::now())?;
        let count = paths.len();
        for path in paths {
            if let Err(e) = std::fs::remove_file(&path) {
                debug!(path = %path, "expired media unlink failed: {}", e);
            }
        }
        if count > 0 {
            info!("media sweep removed {} expired entries", count);
        }
        Ok(count)
    }

    /// Background expiry sweeper; stops on shutdown signal.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: std::time::Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = cache.sweep() {
                            warn!("media sweep failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}
