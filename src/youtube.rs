//! YouTube Data API v3 implementation of [`RemoteMetadataClient`].
//!
//! HTTP goes through a blocking `ureq` agent. Every call runs inside
//! `spawn_blocking` so the async callers (axum handlers, the CLI) never stall
//! a runtime worker while waiting on the network.

use std::{fs::File, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, de::DeserializeOwned};

use crate::{
    clock::parse_timestamp,
    config::RuntimeSettings,
    duration::{ZERO_DURATION, parse_iso8601_duration},
    error::{MirrorError, MirrorResult},
    remote::{
        RemoteMetadataClient, RemoteVideo, SearchResult, VideoUpload, clamp_page_size,
    },
    security::Credentials,
};

#[derive(Clone)]
pub struct YouTubeClient {
    agent: ureq::Agent,
    api_base: String,
    upload_base: String,
    region_code: String,
}

impl YouTubeClient {
    pub fn new(
        api_base: impl Into<String>,
        upload_base: impl Into<String>,
        region_code: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .build();
        Self {
            agent,
            api_base: api_base.into(),
            upload_base: upload_base.into(),
            region_code: region_code.into(),
        }
    }

    pub fn from_settings(settings: &RuntimeSettings) -> Self {
        Self::new(
            settings.api_base.clone(),
            settings.upload_base.clone(),
            settings.region_code.clone(),
            settings.http_timeout,
        )
    }

    fn get(&self, creds: &Credentials, endpoint: &str) -> ureq::Request {
        authorize(self.agent.get(&format!("{}/{endpoint}", self.api_base)), creds)
    }

    fn search_blocking(
        &self,
        creds: &Credentials,
        query: &str,
        max_results: u32,
    ) -> MirrorResult<Vec<SearchResult>> {
        const OP: &str = "search.list";
        let request = self
            .get(creds, "search")
            .query("part", "id,snippet")
            .query("type", "video")
            .query("order", "relevance")
            .query("q", query)
            .query("maxResults", &clamp_page_size(max_results).to_string())
            .query("regionCode", &self.region_code);
        let response: SearchListResponse = call_json(OP, request.call())?;
        response
            .items
            .into_iter()
            .filter_map(|item| item.into_result(OP).transpose())
            .collect()
    }

    fn channel_uploads_blocking(
        &self,
        creds: &Credentials,
        channel_id: &str,
        max_results: u32,
    ) -> MirrorResult<Vec<String>> {
        const OP: &str = "search.list";
        let request = self
            .get(creds, "search")
            .query("part", "id")
            .query("type", "video")
            .query("order", "date")
            .query("channelId", channel_id)
            .query("maxResults", &clamp_page_size(max_results).to_string());
        let response: SearchListResponse = call_json(OP, request.call())?;
        Ok(response
            .items
            .into_iter()
            .filter_map(|item| item.id.video_id)
            .collect())
    }

    fn details_blocking(
        &self,
        creds: &Credentials,
        remote_ids: &[String],
    ) -> MirrorResult<Vec<RemoteVideo>> {
        const OP: &str = "videos.list";
        let request = self
            .get(creds, "videos")
            .query("part", "snippet,contentDetails,statistics")
            .query("id", &remote_ids.join(","));
        let response: VideoListResponse = call_json(OP, request.call())?;
        response
            .items
            .into_iter()
            .map(|item| item.into_remote_video(OP))
            .collect()
    }

    /// Two round trips: announce the upload with its metadata, then PUT the
    /// bytes to the session URI the API hands back in `Location`.
    fn insert_blocking(&self, creds: &Credentials, upload: &VideoUpload) -> MirrorResult<String> {
        const OP: &str = "videos.insert";
        creds.require_user()?;

        let size = std::fs::metadata(&upload.path)?.len();
        let mime = mime_guess::from_path(&upload.path).first_or_octet_stream();
        let body = serde_json::json!({
            "snippet": {
                "title": upload.title,
                "description": upload.description,
                "categoryId": upload.category_id,
            },
            "status": {
                "privacyStatus": upload.privacy.as_str(),
            },
        });

        let initiate = authorize(
            self.agent
                .post(&format!("{}/videos", self.upload_base))
                .query("uploadType", "resumable")
                .query("part", "snippet,status"),
            creds,
        )
        .set("X-Upload-Content-Type", mime.as_ref())
        .set("X-Upload-Content-Length", &size.to_string());
        let response = initiate.send_json(body).map_err(|err| remote_error(OP, err))?;
        let session_uri = response
            .header("Location")
            .map(str::to_owned)
            .ok_or_else(|| MirrorError::remote(OP, "upload session URI missing"))?;

        let file = File::open(&upload.path)?;
        let put = authorize(self.agent.put(&session_uri), creds)
            .set("Content-Type", mime.as_ref())
            .set("Content-Length", &size.to_string());
        let inserted: InsertResponse = call_json(OP, put.send(file))?;
        Ok(inserted.id)
    }
}

fn authorize(request: ureq::Request, creds: &Credentials) -> ureq::Request {
    let request = match creds.bearer_header() {
        Some(header) => request.set("Authorization", &header),
        None => request,
    };
    match creds.query_key() {
        Some(key) => request.query("key", key),
        None => request,
    }
}

fn call_json<T: DeserializeOwned>(
    operation: &'static str,
    result: Result<ureq::Response, ureq::Error>,
) -> MirrorResult<T> {
    let response = result.map_err(|err| remote_error(operation, err))?;
    response
        .into_json::<T>()
        .map_err(|err| MirrorError::remote(operation, format!("unreadable payload: {err}")))
}

fn remote_error(operation: &'static str, err: ureq::Error) -> MirrorError {
    match err {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            MirrorError::remote_status(operation, code, api_error_message(&body, code))
        }
        ureq::Error::Transport(transport) => MirrorError::remote(operation, transport.to_string()),
    }
}

/// Pulls `error.message` out of a Google API error body when present.
fn api_error_message(body: &str, status: u16) -> String {
    serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .and_then(|parsed| parsed.error.message)
        .filter(|message| !message.trim().is_empty())
        .unwrap_or_else(|| format!("HTTP {status}"))
}

async fn run_blocking<T, F>(operation: &'static str, job: F) -> MirrorResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> MirrorResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|err| MirrorError::remote(operation, format!("worker failed: {err}")))?
}

#[async_trait]
impl RemoteMetadataClient for YouTubeClient {
    async fn search(
        &self,
        creds: &Credentials,
        query: &str,
        max_results: u32,
    ) -> MirrorResult<Vec<SearchResult>> {
        tracing::debug!(query, max_results, "calling search.list");
        let client = self.clone();
        let creds = creds.clone();
        let query = query.to_owned();
        run_blocking("search.list", move || {
            client.search_blocking(&creds, &query, max_results)
        })
        .await
    }

    async fn fetch_details(
        &self,
        creds: &Credentials,
        remote_ids: &[String],
    ) -> MirrorResult<Vec<RemoteVideo>> {
        if remote_ids.is_empty() {
            return Ok(Vec::new());
        }
        tracing::debug!(batch = remote_ids.len(), "calling videos.list");
        let client = self.clone();
        let creds = creds.clone();
        let ids = remote_ids.to_vec();
        run_blocking("videos.list", move || client.details_blocking(&creds, &ids)).await
    }

    async fn list_channel_uploads(
        &self,
        creds: &Credentials,
        channel_id: &str,
        max_results: u32,
    ) -> MirrorResult<Vec<String>> {
        tracing::debug!(channel_id, max_results, "listing channel uploads");
        let client = self.clone();
        let creds = creds.clone();
        let channel_id = channel_id.to_owned();
        run_blocking("search.list", move || {
            client.channel_uploads_blocking(&creds, &channel_id, max_results)
        })
        .await
    }

    async fn insert_video(
        &self,
        creds: &Credentials,
        upload: &VideoUpload,
    ) -> MirrorResult<String> {
        tracing::info!(path = %upload.path.display(), "starting resumable upload");
        let client = self.clone();
        let creds = creds.clone();
        let upload = upload.clone();
        run_blocking("videos.insert", move || {
            client.insert_blocking(&creds, &upload)
        })
        .await
    }
}

// Wire format of the Data API responses. Only the fields the mirror reads
// are declared; everything else is ignored by serde.

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchListResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    id: SearchItemId,
    snippet: Option<Snippet>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchItemId {
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snippet {
    title: Option<String>,
    #[serde(default)]
    description: String,
    channel_id: Option<String>,
    #[serde(default)]
    channel_title: String,
    published_at: Option<String>,
    #[serde(default)]
    thumbnails: Thumbnails,
}

#[derive(Debug, Default, Deserialize)]
struct Thumbnails {
    default: Option<Thumbnail>,
    medium: Option<Thumbnail>,
    high: Option<Thumbnail>,
}

impl Thumbnails {
    /// Largest available rendition: high, then medium, then default.
    fn best_url(&self) -> Option<String> {
        [&self.high, &self.medium, &self.default]
            .into_iter()
            .flatten()
            .map(|thumb| thumb.url.clone())
            .find(|url| !url.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
}

#[derive(Debug, Deserialize)]
struct VideoListResponse {
    #[serde(default)]
    items: Vec<VideoItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoItem {
    id: String,
    snippet: Option<Snippet>,
    content_details: Option<ContentDetails>,
    statistics: Option<Statistics>,
}

#[derive(Debug, Deserialize)]
struct ContentDetails {
    duration: Option<String>,
}

/// Counters arrive as decimal strings and are omitted when the owner hides
/// them.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Statistics {
    view_count: Option<String>,
    like_count: Option<String>,
    comment_count: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InsertResponse {
    id: String,
}

fn required(
    operation: &'static str,
    id: &str,
    field: &str,
    value: Option<String>,
) -> MirrorResult<String> {
    value
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| MirrorError::remote(operation, format!("{id}: missing {field}")))
}

/// A missing counter counts as 0; a present but non-numeric one is a
/// payload error.
fn counter(operation: &'static str, id: &str, field: &str, value: Option<&str>) -> MirrorResult<i64> {
    match value {
        None => Ok(0),
        Some(raw) => raw.trim().parse::<i64>().map_err(|_| {
            MirrorError::remote(operation, format!("{id}: {field} is not a number: {raw:?}"))
        }),
    }
}

impl SearchItem {
    /// `None` for hits that are not videos (channels, playlists).
    fn into_result(self, operation: &'static str) -> MirrorResult<Option<SearchResult>> {
        let Some(remote_id) = self.id.video_id else {
            return Ok(None);
        };
        let snippet = self
            .snippet
            .ok_or_else(|| MirrorError::remote(operation, format!("{remote_id}: missing snippet")))?;
        let published_raw = required(operation, &remote_id, "publishedAt", snippet.published_at)?;
        Ok(Some(SearchResult {
            title: required(operation, &remote_id, "title", snippet.title)?,
            channel_id: required(operation, &remote_id, "channelId", snippet.channel_id)?,
            published_at: parse_timestamp(&published_raw)?,
            thumbnail_url: snippet.thumbnails.best_url(),
            description: snippet.description,
            channel_name: snippet.channel_title,
            remote_id,
        }))
    }
}

impl VideoItem {
    fn into_remote_video(self, operation: &'static str) -> MirrorResult<RemoteVideo> {
        let id = self.id;
        let snippet = self
            .snippet
            .ok_or_else(|| MirrorError::remote(operation, format!("{id}: missing snippet")))?;
        let published_raw = required(operation, &id, "publishedAt", snippet.published_at)?;
        let duration = self
            .content_details
            .and_then(|details| details.duration)
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| ZERO_DURATION.to_string());
        let duration_seconds = parse_iso8601_duration(&duration)?;
        let stats = self.statistics.unwrap_or_default();

        Ok(RemoteVideo {
            title: required(operation, &id, "title", snippet.title)?,
            channel_id: required(operation, &id, "channelId", snippet.channel_id)?,
            thumbnail_url: snippet.thumbnails.best_url().unwrap_or_default(),
            published_at: parse_timestamp(&published_raw)?,
            views: counter(operation, &id, "viewCount", stats.view_count.as_deref())?,
            likes: counter(operation, &id, "likeCount", stats.like_count.as_deref())?,
            comment_count: counter(operation, &id, "commentCount", stats.comment_count.as_deref())?,
            description: snippet.description,
            channel_name: snippet.channel_title,
            duration,
            duration_seconds,
            remote_id: id,
        })
    }
}
