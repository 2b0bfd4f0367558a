#![forbid(unsafe_code)]

//! Axum JSON API in front of the metadata mirror.
//!
//! Reads of the mirror (`/api/videos`) never leave the process. Everything
//! else goes through the remote API with the caller's credentials: a bearer
//! token when the request carries one, the configured API key otherwise.
//! Every remote call made on behalf of a request is booked in the quota
//! ledger under the caller's name.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tubemirror::{
    cache::{CacheStore, SqlCache},
    clock::{Clock, SystemClock},
    config::{RuntimeOverrides, resolve_runtime_settings},
    error::MirrorError,
    metadata::{AggregateStats, MetadataStore, VideoFilter, VideoRecord},
    remote::{MeteredClient, RemoteMetadataClient, RemoteVideo, SearchResult},
    search::CachedSearch,
    security::{Credentials, ensure_not_root},
    sync::{self, RefreshReport, SyncReport},
    youtube::YouTubeClient,
};

const DEFAULT_SEARCH_RESULTS: u32 = 10;
const DEFAULT_SYNC_RESULTS: u32 = 25;
const REFRESH_TOKEN_HEADER: &str = "x-refresh-token";
const ACTOR_HEADER: &str = "x-mirror-user";
const ANONYMOUS_ACTOR: &str = "anonymous";

#[derive(Debug, Clone, Default)]
struct BackendArgs {
    data_root: Option<PathBuf>,
    env_path: Option<PathBuf>,
    port: Option<u16>,
    host: Option<IpAddr>,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut parsed = Self::default();
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--data-root=") {
                parsed.data_root = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--env-file=") {
                parsed.env_path = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                parsed.port = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--host=") {
                parsed.host = Some(parse_host_arg(value)?);
                continue;
            }

            match arg.as_str() {
                "--data-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--data-root requires a value"))?;
                    parsed.data_root = Some(PathBuf::from(value));
                }
                "--env-file" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--env-file requires a value"))?;
                    parsed.env_path = Some(PathBuf::from(value));
                }
                "--port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--port requires a value"))?;
                    parsed.port = Some(parse_port_arg(&value)?);
                }
                "--host" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--host requires a value"))?;
                    parsed.host = Some(parse_host_arg(&value)?);
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }
        Ok(parsed)
    }

    fn overrides(&self) -> RuntimeOverrides {
        RuntimeOverrides {
            data_root: self.data_root.clone(),
            host: self.host.map(|host| host.to_string()),
            port: self.port,
            env_path: self.env_path.clone(),
            ..RuntimeOverrides::default()
        }
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/TUBEMIRROR_HOST")
}

#[derive(Clone)]
struct AppState {
    store: Arc<MetadataStore>,
    remote: Arc<dyn RemoteMetadataClient>,
    search: Arc<CachedSearch<Arc<dyn CacheStore>>>,
    clock: Arc<dyn Clock>,
    api_key: Option<String>,
    quota_daily_limit: i64,
}

impl AppState {
    /// Remote client for one request, booking quota under the caller.
    fn metered(&self, headers: &HeaderMap) -> MeteredClient<Arc<dyn RemoteMetadataClient>> {
        MeteredClient::new(
            self.remote.clone(),
            self.store.clone(),
            self.clock.clone(),
            actor(headers),
            self.quota_daily_limit,
        )
    }

    fn credentials(&self, headers: &HeaderMap) -> ApiResult<Credentials> {
        let bearer = header_value(headers, header::AUTHORIZATION.as_str()).and_then(|value| {
            value
                .strip_prefix("Bearer ")
                .or_else(|| value.strip_prefix("bearer "))
                .map(str::to_string)
        });
        let refresh = header_value(headers, REFRESH_TOKEN_HEADER);
        Ok(Credentials::resolve(bearer, refresh, self.api_key.clone())?)
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn actor(headers: &HeaderMap) -> String {
    header_value(headers, ACTOR_HEADER).unwrap_or_else(|| ANONYMOUS_ACTOR.to_string())
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<MirrorError> for ApiError {
    fn from(err: MirrorError) -> Self {
        let status = match &err {
            MirrorError::NotFound(_) => StatusCode::NOT_FOUND,
            MirrorError::MissingCredentials(_) => StatusCode::UNAUTHORIZED,
            MirrorError::RemoteCall { .. } | MirrorError::MalformedDuration(_) => {
                StatusCode::BAD_GATEWAY
            }
            MirrorError::Database(_)
            | MirrorError::Serialization(_)
            | MirrorError::Io(_)
            | MirrorError::Timestamp { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = BackendArgs::parse()?;
    ensure_not_root("backend")?;

    let settings =
        resolve_runtime_settings(args.overrides()).context("loading runtime settings")?;
    let host = parse_host_arg(&settings.host)?;

    let store = MetadataStore::open(&settings.database_path())
        .await
        .context("opening mirror database")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cache: Arc<dyn CacheStore> =
        Arc::new(SqlCache::new(store.connection().clone(), clock.clone()));
    match cache.purge_expired().await {
        Ok(removed) => tracing::info!(removed, "expired cache entries purged"),
        Err(err) => tracing::warn!(error = %err, "could not purge cache at startup"),
    }
    if settings.api_key.is_none() {
        tracing::warn!("YOUTUBE_API_KEY not set; remote calls require a bearer token");
    }

    let state = AppState {
        store: Arc::new(store),
        remote: Arc::new(YouTubeClient::from_settings(&settings)),
        search: Arc::new(CachedSearch::new(cache, settings.search_ttl)),
        clock,
        api_key: settings.api_key.clone(),
        quota_daily_limit: settings.quota_daily_limit,
    };

    let addr = SocketAddr::new(host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(%addr, data_root = %settings.data_root.display(), "API server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/search", get(search))
        .route("/api/channels/{id}/sync", post(sync_channel))
        .route("/api/statistics/refresh", post(refresh_statistics))
        .route("/api/videos", get(list_videos))
        .route("/api/videos/{id}", get(get_video))
        .route("/api/videos/{id}/remote", get(get_remote_video))
        .route("/api/videos/{id}/curation", put(update_curation))
        .route("/api/quota", get(quota))
        .fallback(|| async { ApiError::not_found("endpoint not found") })
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to install Ctrl+C handler");
    }
}

#[derive(Debug, Default, Deserialize)]
struct SearchParams {
    q: Option<String>,
    max: Option<u32>,
}

#[derive(Debug, Serialize)]
struct SearchResponse {
    query: String,
    results: Vec<SearchResult>,
}

async fn search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<SearchResponse>> {
    let query = params.q.unwrap_or_default();
    if query.trim().is_empty() {
        return Ok(Json(SearchResponse {
            query,
            results: Vec::new(),
        }));
    }

    let creds = state.credentials(&headers)?;
    let client = state.metered(&headers);
    let results = state
        .search
        .search_cached(
            &client,
            &creds,
            &query,
            params.max.unwrap_or(DEFAULT_SEARCH_RESULTS),
        )
        .await?;
    Ok(Json(SearchResponse { query, results }))
}

#[derive(Debug, Default, Deserialize)]
struct SyncParams {
    max: Option<u32>,
    q: Option<String>,
}

async fn sync_channel(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(channel_id): AxumPath<String>,
    Query(params): Query<SyncParams>,
) -> ApiResult<Json<SyncReport>> {
    let creds = state.credentials(&headers)?;
    let client = state.metered(&headers);
    let report = sync::sync_channel(
        &client,
        &state.store,
        state.clock.as_ref(),
        &creds,
        &channel_id,
        params.max.unwrap_or(DEFAULT_SYNC_RESULTS),
        params.q,
    )
    .await?;
    Ok(Json(report))
}

async fn refresh_statistics(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<RefreshReport>> {
    let creds = state.credentials(&headers)?;
    let client = state.metered(&headers);
    let report =
        sync::refresh_statistics(&client, &state.store, state.clock.as_ref(), &creds).await?;
    Ok(Json(report))
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    q: Option<String>,
    channel: Option<String>,
    limit: Option<u32>,
}

#[derive(Debug, Serialize)]
struct VideoListResponse {
    videos: Vec<VideoRecord>,
    stats: AggregateStats,
}

async fn list_videos(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<VideoListResponse>> {
    let filter = VideoFilter {
        channel_id: params.channel.filter(|value| !value.trim().is_empty()),
        limit: params.limit,
        ..VideoFilter::default()
    }
    .with_text(params.q);
    let videos = state.store.list_videos(&filter).await?;
    let stats = state.store.aggregate(&filter).await?;
    Ok(Json(VideoListResponse { videos, stats }))
}

async fn get_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<VideoRecord>> {
    state
        .store
        .get_video(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("video {id} is not mirrored")))
}

#[derive(Debug, Serialize)]
struct RemoteVideoResponse {
    #[serde(flatten)]
    video: RemoteVideo,
    engagement_rate: f64,
}

async fn get_remote_video(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<RemoteVideoResponse>> {
    let creds = state.credentials(&headers)?;
    let client = state.metered(&headers);
    let video = sync::fetch_video(&client, &creds, &id).await?;
    let engagement_rate = video.engagement_rate();
    Ok(Json(RemoteVideoResponse {
        video,
        engagement_rate,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct CurationRequest {
    category: Option<String>,
    tags: Option<String>,
}

async fn update_curation(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(request): Json<CurationRequest>,
) -> ApiResult<Json<VideoRecord>> {
    let record = state
        .store
        .set_curation(
            &id,
            request.category.as_deref().map(str::trim),
            request.tags.as_deref().map(str::trim),
            state.clock.now(),
        )
        .await?;
    Ok(Json(record))
}

#[derive(Debug, Serialize)]
struct QuotaResponse {
    date: NaiveDate,
    used: i64,
    limit: i64,
    remaining: i64,
}

async fn quota(State(state): State<AppState>) -> ApiResult<Json<QuotaResponse>> {
    let date = state.clock.now().date_naive();
    let used = state.store.daily_quota_total(date).await?;
    Ok(Json(QuotaResponse {
        date,
        used,
        limit: state.quota_daily_limit,
        remaining: (state.quota_daily_limit - used).max(0),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::{body::to_bytes, http::HeaderValue};
    use chrono::{DateTime, TimeZone, Utc};
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;
    use tubemirror::{
        cache::MemoryCache,
        clock::ManualClock,
        error::MirrorResult,
        remote::VideoUpload,
    };

    #[derive(Default)]
    struct StubRemote {
        videos: Mutex<HashMap<String, RemoteVideo>>,
        channels: Mutex<HashMap<String, Vec<String>>>,
        failing: Mutex<bool>,
        search_calls: AtomicUsize,
        details_calls: AtomicUsize,
    }

    impl StubRemote {
        fn check(&self, operation: &'static str) -> MirrorResult<()> {
            if *self.failing.lock() {
                return Err(MirrorError::remote_status(operation, 403, "quotaExceeded"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RemoteMetadataClient for StubRemote {
        async fn search(
            &self,
            _creds: &Credentials,
            query: &str,
            max_results: u32,
        ) -> MirrorResult<Vec<SearchResult>> {
            self.search_calls.fetch_add(1, Ordering::SeqCst);
            self.check("search.list")?;
            Ok((0..max_results.min(3))
                .map(|n| SearchResult {
                    remote_id: format!("{query}-{n}"),
                    title: format!("{query} #{n}"),
                    description: String::new(),
                    channel_id: "UCsearch".into(),
                    channel_name: "Search".into(),
                    published_at: published(),
                    thumbnail_url: None,
                })
                .collect())
        }

        async fn fetch_details(
            &self,
            _creds: &Credentials,
            remote_ids: &[String],
        ) -> MirrorResult<Vec<RemoteVideo>> {
            self.details_calls.fetch_add(1, Ordering::SeqCst);
            self.check("videos.list")?;
            let videos = self.videos.lock();
            Ok(remote_ids
                .iter()
                .filter_map(|id| videos.get(id).cloned())
                .collect())
        }

        async fn list_channel_uploads(
            &self,
            _creds: &Credentials,
            channel_id: &str,
            _max_results: u32,
        ) -> MirrorResult<Vec<String>> {
            self.check("search.list")?;
            Ok(self
                .channels
                .lock()
                .get(channel_id)
                .cloned()
                .unwrap_or_default())
        }

        async fn insert_video(
            &self,
            _creds: &Credentials,
            _upload: &VideoUpload,
        ) -> MirrorResult<String> {
            Err(MirrorError::remote("videos.insert", "not supported here"))
        }
    }

    fn published() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 18, 0, 0).unwrap()
    }

    fn remote_video(id: &str, channel: &str, views: i64, likes: i64) -> RemoteVideo {
        RemoteVideo {
            remote_id: id.into(),
            title: format!("Video {id}"),
            description: String::new(),
            channel_id: channel.into(),
            channel_name: format!("Channel {channel}"),
            thumbnail_url: String::new(),
            published_at: published(),
            duration: "PT1H".into(),
            duration_seconds: 3_600,
            views,
            likes,
            comment_count: 0,
        }
    }

    struct BackendTestContext {
        _temp: tempfile::TempDir,
        remote: Arc<StubRemote>,
        state: AppState,
    }

    impl BackendTestContext {
        async fn new(api_key: Option<&str>) -> Self {
            let temp = tempdir().unwrap();
            let store = MetadataStore::open(&temp.path().join("mirror.db"))
                .await
                .unwrap();
            let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap(),
            ));
            let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new(clock.clone()));
            let remote = Arc::new(StubRemote::default());

            Self {
                state: AppState {
                    store: Arc::new(store),
                    remote: remote.clone(),
                    search: Arc::new(CachedSearch::new(cache, Duration::from_secs(3_600))),
                    clock,
                    api_key: api_key.map(str::to_string),
                    quota_daily_limit: 10_000,
                },
                remote,
                _temp: temp,
            }
        }

        fn add_channel(&self, channel: &str, videos: &[(&str, i64, i64)]) {
            self.remote.channels.lock().insert(
                channel.to_string(),
                videos.iter().map(|(id, _, _)| id.to_string()).collect(),
            );
            let mut stored = self.remote.videos.lock();
            for (id, views, likes) in videos {
                stored.insert(id.to_string(), remote_video(id, channel, *views, *likes));
            }
        }

        async fn used_quota(&self) -> i64 {
            let day = self.state.clock.now().date_naive();
            self.state.store.daily_quota_total(day).await.unwrap()
        }
    }

    fn bearer_headers(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers.insert(ACTOR_HEADER, HeaderValue::from_static("ana"));
        headers
    }

    async fn error_body(err: ApiError) -> (StatusCode, Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn backend_args_accept_both_flag_styles() {
        let args = BackendArgs::from_iter(
            ["--data-root", "/srv/mirror", "--port=9000", "--host", "0.0.0.0"]
                .into_iter()
                .map(String::from),
        )
        .unwrap();
        assert_eq!(args.data_root, Some(PathBuf::from("/srv/mirror")));
        assert_eq!(args.port, Some(9000));
        let overrides = args.overrides();
        assert_eq!(overrides.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(overrides.port, Some(9000));
    }

    #[test]
    fn backend_args_reject_unknown_and_incomplete_flags() {
        assert!(BackendArgs::from_iter(["--verbose".to_string()]).is_err());
        assert!(BackendArgs::from_iter(["--port".to_string()]).is_err());
        assert!(BackendArgs::from_iter(["--port=http".to_string()]).is_err());
        assert!(BackendArgs::from_iter(["--host=localhost".to_string()]).is_err());
    }

    #[tokio::test]
    async fn search_is_cached_and_metered_once() {
        let ctx = BackendTestContext::new(Some("server-key")).await;
        let params = || SearchParams {
            q: Some("rust".into()),
            max: Some(2),
        };

        let Json(first) = search(State(ctx.state.clone()), HeaderMap::new(), Query(params()))
            .await
            .unwrap();
        let Json(second) = search(State(ctx.state.clone()), HeaderMap::new(), Query(params()))
            .await
            .unwrap();

        assert_eq!(first.results.len(), 2);
        assert_eq!(first.results, second.results);
        assert_eq!(ctx.remote.search_calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.used_quota().await, 100);
    }

    #[tokio::test]
    async fn blank_search_needs_no_credentials() {
        let ctx = BackendTestContext::new(None).await;
        let Json(response) = search(
            State(ctx.state.clone()),
            HeaderMap::new(),
            Query(SearchParams::default()),
        )
        .await
        .unwrap();
        assert!(response.results.is_empty());
        assert_eq!(ctx.remote.search_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn search_without_any_credentials_is_unauthorized() {
        let ctx = BackendTestContext::new(None).await;
        let err = search(
            State(ctx.state.clone()),
            HeaderMap::new(),
            Query(SearchParams {
                q: Some("rust".into()),
                max: None,
            }),
        )
        .await
        .unwrap_err();
        let (status, body) = error_body(err).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].as_str().unwrap().contains("credentials"));
    }

    #[tokio::test]
    async fn sync_then_list_reports_aggregates() {
        let ctx = BackendTestContext::new(None).await;
        ctx.add_channel("UC1", &[("a", 10, 1), ("b", 20, 2), ("c", 30, 3)]);

        let Json(report) = sync_channel(
            State(ctx.state.clone()),
            bearer_headers("tok"),
            AxumPath("UC1".to_string()),
            Query(SyncParams::default()),
        )
        .await
        .unwrap();
        assert_eq!(report.synced, 3);
        assert_eq!(report.stats.total_views, 60);
        assert_eq!(ctx.remote.details_calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.used_quota().await, 101);

        let Json(listed) = list_videos(
            State(ctx.state.clone()),
            Query(ListParams {
                channel: Some("UC1".into()),
                ..ListParams::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(listed.videos.len(), 3);
        assert_eq!(listed.stats.total_likes, 6);
        assert_eq!(listed.stats.count, 3);
    }

    #[tokio::test]
    async fn refresh_updates_counters_of_mirrored_rows() {
        let ctx = BackendTestContext::new(Some("server-key")).await;
        ctx.add_channel("UC1", &[("a", 10, 1)]);
        sync_channel(
            State(ctx.state.clone()),
            HeaderMap::new(),
            AxumPath("UC1".to_string()),
            Query(SyncParams::default()),
        )
        .await
        .unwrap();
        ctx.add_channel("UC1", &[("a", 99, 9)]);

        let Json(report) = refresh_statistics(State(ctx.state.clone()), HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(report.updated, 1);
        let Json(record) = get_video(State(ctx.state.clone()), AxumPath("a".to_string()))
            .await
            .unwrap();
        assert_eq!((record.views, record.likes), (99, 9));
    }

    #[tokio::test]
    async fn unknown_local_video_is_404() {
        let ctx = BackendTestContext::new(None).await;
        let err = get_video(State(ctx.state.clone()), AxumPath("nope".to_string()))
            .await
            .unwrap_err();
        let (status, body) = error_body(err).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "video nope is not mirrored");
    }

    #[tokio::test]
    async fn remote_lookup_reports_engagement_rate() {
        let ctx = BackendTestContext::new(Some("server-key")).await;
        let mut video = remote_video("live", "UC1", 400, 7);
        video.comment_count = 3;
        ctx.remote.videos.lock().insert("live".to_string(), video);

        let Json(response) = get_remote_video(
            State(ctx.state.clone()),
            HeaderMap::new(),
            AxumPath("live".to_string()),
        )
        .await
        .unwrap();
        assert_eq!(response.engagement_rate, 2.5);

        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(body["remote_id"], "live");
        assert_eq!(body["views"], 400);
        assert_eq!(body["engagement_rate"], 2.5);

        ctx.remote
            .videos
            .lock()
            .insert("quiet".to_string(), remote_video("quiet", "UC1", 0, 0));
        let Json(response) = get_remote_video(
            State(ctx.state.clone()),
            HeaderMap::new(),
            AxumPath("quiet".to_string()),
        )
        .await
        .unwrap();
        assert_eq!(response.engagement_rate, 0.0);
    }

    #[tokio::test]
    async fn remote_lookup_maps_absent_to_404_and_failures_to_502() {
        let ctx = BackendTestContext::new(Some("server-key")).await;
        let err = get_remote_video(
            State(ctx.state.clone()),
            HeaderMap::new(),
            AxumPath("ghost".to_string()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        *ctx.remote.failing.lock() = true;
        let err = get_remote_video(
            State(ctx.state.clone()),
            HeaderMap::new(),
            AxumPath("ghost".to_string()),
        )
        .await
        .unwrap_err();
        let (status, body) = error_body(err).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().contains("quotaExceeded"));
        assert_eq!(ctx.used_quota().await, 2);
    }

    #[tokio::test]
    async fn curation_survives_the_next_sync() {
        let ctx = BackendTestContext::new(None).await;
        ctx.add_channel("UC1", &[("a", 10, 1)]);
        let sync_once = || {
            sync_channel(
                State(ctx.state.clone()),
                bearer_headers("tok"),
                AxumPath("UC1".to_string()),
                Query(SyncParams::default()),
            )
        };
        sync_once().await.unwrap();

        let Json(curated) = update_curation(
            State(ctx.state.clone()),
            AxumPath("a".to_string()),
            Json(CurationRequest {
                category: Some(" educacion ".into()),
                tags: Some("rust".into()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(curated.category.as_deref(), Some("educacion"));

        sync_once().await.unwrap();
        let Json(record) = get_video(State(ctx.state.clone()), AxumPath("a".to_string()))
            .await
            .unwrap();
        assert_eq!(record.category.as_deref(), Some("educacion"));
        assert_eq!(record.tags.as_deref(), Some("rust"));
    }

    #[tokio::test]
    async fn curation_of_unknown_video_is_404() {
        let ctx = BackendTestContext::new(None).await;
        let err = update_curation(
            State(ctx.state.clone()),
            AxumPath("nope".to_string()),
            Json(CurationRequest::default()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn quota_endpoint_reports_todays_usage() {
        let ctx = BackendTestContext::new(Some("server-key")).await;
        search(
            State(ctx.state.clone()),
            HeaderMap::new(),
            Query(SearchParams {
                q: Some("tutorial".into()),
                max: None,
            }),
        )
        .await
        .unwrap();

        let Json(report) = quota(State(ctx.state.clone())).await.unwrap();
        assert_eq!(report.used, 100);
        assert_eq!(report.limit, 10_000);
        assert_eq!(report.remaining, 9_900);
        assert_eq!(report.date, NaiveDate::from_ymd_opt(2026, 6, 1).unwrap());
    }

    #[test]
    fn bearer_header_wins_over_server_key() {
        let headers = bearer_headers("user-token");
        let creds = Credentials::resolve(
            header_value(&headers, header::AUTHORIZATION.as_str())
                .and_then(|value| value.strip_prefix("Bearer ").map(str::to_string)),
            None,
            Some("server-key".into()),
        )
        .unwrap();
        assert_eq!(creds.bearer_header().as_deref(), Some("Bearer user-token"));
        assert_eq!(actor(&headers), "ana");
        assert_eq!(actor(&HeaderMap::new()), ANONYMOUS_ACTOR);
    }
}
