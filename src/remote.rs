//! Contract with the video-hosting API.
//!
//! The core only ever talks to [`RemoteMetadataClient`]; payloads cross this
//! boundary as typed, validated records. [`crate::youtube::YouTubeClient`] is
//! the production implementation, [`MeteredClient`] wraps any client and
//! books the quota each call consumes.

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    clock::Clock,
    error::MirrorResult,
    metadata::{MetadataStore, QuotaOperation},
    security::Credentials,
};

/// Hard cap the Data API enforces on `maxResults` and on ids per
/// `videos.list` call.
pub const MAX_PAGE_SIZE: u32 = 50;

/// One hit of a keyword search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub remote_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub channel_id: String,
    pub channel_name: String,
    pub published_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

/// Full metadata for one video, as returned by the details lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteVideo {
    pub remote_id: String,
    pub title: String,
    pub description: String,
    pub channel_id: String,
    pub channel_name: String,
    pub thumbnail_url: String,
    pub published_at: DateTime<Utc>,
    /// Raw ISO-8601 duration, e.g. `PT15M30S`.
    pub duration: String,
    pub duration_seconds: i64,
    pub views: i64,
    pub likes: i64,
    pub comment_count: i64,
}

impl RemoteVideo {
    pub fn video_url(&self) -> String {
        watch_url(&self.remote_id)
    }

    /// Likes plus comments per hundred views, rounded to two decimals.
    /// Zero when the video has no views.
    pub fn engagement_rate(&self) -> f64 {
        if self.views <= 0 {
            return 0.0;
        }
        let interactions = (self.likes + self.comment_count) as f64;
        (interactions / self.views as f64 * 10_000.0).round() / 100.0
    }
}

pub fn watch_url(remote_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={remote_id}")
}

pub fn embed_url(remote_id: &str) -> String {
    format!("https://www.youtube.com/embed/{remote_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyStatus {
    #[default]
    Private,
    Unlisted,
    Public,
}

impl PrivacyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Unlisted => "unlisted",
            Self::Public => "public",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "private" => Some(Self::Private),
            "unlisted" => Some(Self::Unlisted),
            "public" => Some(Self::Public),
            _ => None,
        }
    }
}

/// A local media file plus the metadata to publish it with.
#[derive(Debug, Clone)]
pub struct VideoUpload {
    pub path: PathBuf,
    pub title: String,
    pub description: String,
    /// Remote category id (22 = People & Blogs, 27 = Education).
    pub category_id: String,
    pub privacy: PrivacyStatus,
}

/// Capabilities the mirror needs from the remote system. Every call is
/// fallible with [`crate::error::MirrorError::RemoteCall`] and carries the
/// caller's credentials explicitly.
#[async_trait]
pub trait RemoteMetadataClient: Send + Sync {
    /// Keyword search, relevance order, at most `max_results` hits.
    async fn search(
        &self,
        creds: &Credentials,
        query: &str,
        max_results: u32,
    ) -> MirrorResult<Vec<SearchResult>>;

    /// Details for a whole batch of ids in a single remote call. Ids the
    /// remote does not know are simply absent from the result.
    async fn fetch_details(
        &self,
        creds: &Credentials,
        remote_ids: &[String],
    ) -> MirrorResult<Vec<RemoteVideo>>;

    /// Ids of a channel's uploads, most recent first, first page only.
    async fn list_channel_uploads(
        &self,
        creds: &Credentials,
        channel_id: &str,
        max_results: u32,
    ) -> MirrorResult<Vec<String>>;

    /// Publishes a video through a resumable upload; returns the new id.
    async fn insert_video(&self, creds: &Credentials, upload: &VideoUpload)
    -> MirrorResult<String>;
}

#[async_trait]
impl<T: RemoteMetadataClient + ?Sized> RemoteMetadataClient for Arc<T> {
    async fn search(
        &self,
        creds: &Credentials,
        query: &str,
        max_results: u32,
    ) -> MirrorResult<Vec<SearchResult>> {
        (**self).search(creds, query, max_results).await
    }

    async fn fetch_details(
        &self,
        creds: &Credentials,
        remote_ids: &[String],
    ) -> MirrorResult<Vec<RemoteVideo>> {
        (**self).fetch_details(creds, remote_ids).await
    }

    async fn list_channel_uploads(
        &self,
        creds: &Credentials,
        channel_id: &str,
        max_results: u32,
    ) -> MirrorResult<Vec<String>> {
        (**self)
            .list_channel_uploads(creds, channel_id, max_results)
            .await
    }

    async fn insert_video(
        &self,
        creds: &Credentials,
        upload: &VideoUpload,
    ) -> MirrorResult<String> {
        (**self).insert_video(creds, upload).await
    }
}

pub(crate) fn clamp_page_size(max_results: u32) -> u32 {
    max_results.clamp(1, MAX_PAGE_SIZE)
}

/// Decorator that appends a quota ledger row for every remote call made
/// through it, attributed to `actor`.
pub struct MeteredClient<C> {
    inner: C,
    store: Arc<MetadataStore>,
    clock: Arc<dyn Clock>,
    actor: String,
    daily_limit: i64,
}

impl<C: RemoteMetadataClient> MeteredClient<C> {
    pub fn new(
        inner: C,
        store: Arc<MetadataStore>,
        clock: Arc<dyn Clock>,
        actor: impl Into<String>,
        daily_limit: i64,
    ) -> Self {
        Self {
            inner,
            store,
            clock,
            actor: actor.into(),
            daily_limit,
        }
    }

    fn today(&self) -> NaiveDate {
        self.clock.now().date_naive()
    }

    /// Books the cost of `operation` and hands back the call outcome
    /// untouched. Failed calls are booked too. A ledger write failure is
    /// logged and never replaces the outcome: the remote call has already
    /// happened and its result (an upload id, say) must reach the caller.
    async fn book<T>(&self, operation: QuotaOperation, outcome: MirrorResult<T>) -> MirrorResult<T> {
        let booked = self
            .store
            .record_quota_usage(
                operation,
                operation.cost(),
                &self.actor,
                self.today(),
                self.daily_limit,
            )
            .await;
        if let Err(ledger_err) = booked {
            tracing::warn!(
                operation = operation.as_str(),
                actor = %self.actor,
                call_succeeded = outcome.is_ok(),
                error = %ledger_err,
                "could not record quota usage"
            );
        }
        outcome
    }
}

#[async_trait]
impl<C: RemoteMetadataClient> RemoteMetadataClient for MeteredClient<C> {
    async fn search(
        &self,
        creds: &Credentials,
        query: &str,
        max_results: u32,
    ) -> MirrorResult<Vec<SearchResult>> {
        let outcome = self.inner.search(creds, query, max_results).await;
        self.book(QuotaOperation::Search, outcome).await
    }

    async fn fetch_details(
        &self,
        creds: &Credentials,
        remote_ids: &[String],
    ) -> MirrorResult<Vec<RemoteVideo>> {
        let outcome = self.inner.fetch_details(creds, remote_ids).await;
        self.book(QuotaOperation::VideoDetails, outcome).await
    }

    async fn list_channel_uploads(
        &self,
        creds: &Credentials,
        channel_id: &str,
        max_results: u32,
    ) -> MirrorResult<Vec<String>> {
        let outcome = self
            .inner
            .list_channel_uploads(creds, channel_id, max_results)
            .await;
        self.book(QuotaOperation::ChannelUploads, outcome).await
    }

    async fn insert_video(
        &self,
        creds: &Credentials,
        upload: &VideoUpload,
    ) -> MirrorResult<String> {
        let outcome = self.inner.insert_video(creds, upload).await;
        self.book(QuotaOperation::VideoInsert, outcome).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory stand-in for the remote API that counts every call.

    use super::*;
    use crate::error::MirrorError;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct FakeRemote {
        pub videos: Mutex<HashMap<String, RemoteVideo>>,
        pub channel_uploads: Mutex<HashMap<String, Vec<String>>>,
        pub search_hits: Mutex<Vec<SearchResult>>,
        pub fail_with: Mutex<Option<&'static str>>,
        pub detail_batches: Mutex<Vec<Vec<String>>>,
        pub search_calls: AtomicUsize,
        pub details_calls: AtomicUsize,
        pub uploads_calls: AtomicUsize,
        pub insert_calls: AtomicUsize,
    }

    impl FakeRemote {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn put_video(&self, video: RemoteVideo) {
            self.videos.lock().insert(video.remote_id.clone(), video);
        }

        pub fn put_channel(&self, channel_id: &str, ids: &[&str]) {
            self.channel_uploads.lock().insert(
                channel_id.to_string(),
                ids.iter().map(|id| id.to_string()).collect(),
            );
        }

        pub fn fail(&self, message: &'static str) {
            *self.fail_with.lock() = Some(message);
        }

        pub fn details_calls(&self) -> usize {
            self.details_calls.load(Ordering::SeqCst)
        }

        pub fn search_calls(&self) -> usize {
            self.search_calls.load(Ordering::SeqCst)
        }

        fn check(&self, operation: &'static str) -> MirrorResult<()> {
            match *self.fail_with.lock() {
                Some(message) => Err(MirrorError::remote(operation, message)),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl RemoteMetadataClient for FakeRemote {
        async fn search(
            &self,
            _creds: &Credentials,
            _query: &str,
            max_results: u32,
        ) -> MirrorResult<Vec<SearchResult>> {
            self.search_calls.fetch_add(1, Ordering::SeqCst);
            self.check("search.list")?;
            Ok(self
                .search_hits
                .lock()
                .iter()
                .take(max_results as usize)
                .cloned()
                .collect())
        }

        async fn fetch_details(
            &self,
            _creds: &Credentials,
            remote_ids: &[String],
        ) -> MirrorResult<Vec<RemoteVideo>> {
            self.details_calls.fetch_add(1, Ordering::SeqCst);
            self.detail_batches.lock().push(remote_ids.to_vec());
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
            max_results: u32,
        ) -> MirrorResult<Vec<String>> {
            self.uploads_calls.fetch_add(1, Ordering::SeqCst);
            self.check("search.list")?;
            Ok(self
                .channel_uploads
                .lock()
                .get(channel_id)
                .map(|ids| ids.iter().take(max_results as usize).cloned().collect())
                .unwrap_or_default())
        }

        async fn insert_video(
            &self,
            creds: &Credentials,
            _upload: &VideoUpload,
        ) -> MirrorResult<String> {
            let n = self.insert_calls.fetch_add(1, Ordering::SeqCst);
            creds.require_user()?;
            self.check("videos.insert")?;
            Ok(format!("uploaded-{n}"))
        }
    }

    pub fn sample_remote(id: &str, channel_id: &str) -> RemoteVideo {
        RemoteVideo {
            remote_id: id.to_string(),
            title: format!("Video {id}"),
            description: format!("About {id}"),
            channel_id: channel_id.to_string(),
            channel_name: format!("Channel {channel_id}"),
            thumbnail_url: format!("https://i.ytimg.com/vi/{id}/hqdefault.jpg"),
            published_at: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
            duration: "PT15M30S".to_string(),
            duration_seconds: 930,
            views: 10,
            likes: 1,
            comment_count: 0,
        }
    }

    pub fn sample_hit(id: &str) -> SearchResult {
        SearchResult {
            remote_id: id.to_string(),
            title: format!("Hit {id}"),
            description: String::new(),
            channel_id: "UCsearch".to_string(),
            channel_name: "Search Channel".to_string(),
            published_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            thumbnail_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FakeRemote, sample_remote};
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn page_size_is_clamped_to_api_limits() {
        assert_eq!(clamp_page_size(0), 1);
        assert_eq!(clamp_page_size(20), 20);
        assert_eq!(clamp_page_size(500), MAX_PAGE_SIZE);
    }

    #[test]
    fn privacy_status_parses_case_insensitively() {
        assert_eq!(PrivacyStatus::parse(" Public "), Some(PrivacyStatus::Public));
        assert_eq!(PrivacyStatus::parse("hidden"), None);
        assert_eq!(PrivacyStatus::default().as_str(), "private");
    }

    #[test]
    fn urls_are_derived_from_the_id() {
        let video = sample_remote("abc", "UC1");
        assert_eq!(video.video_url(), "https://www.youtube.com/watch?v=abc");
        assert_eq!(embed_url("abc"), "https://www.youtube.com/embed/abc");
    }

    #[test]
    fn engagement_rate_counts_likes_and_comments_per_hundred_views() {
        let mut video = sample_remote("abc", "UC1");
        video.views = 400;
        video.likes = 7;
        video.comment_count = 3;
        assert_eq!(video.engagement_rate(), 2.5);

        video.views = 3;
        video.likes = 1;
        video.comment_count = 0;
        assert_eq!(video.engagement_rate(), 33.33);

        video.views = 0;
        video.likes = 5;
        assert_eq!(video.engagement_rate(), 0.0);
    }

    #[tokio::test]
    async fn metered_client_books_quota_per_call() -> MirrorResult<()> {
        let dir = tempdir()?;
        let store = Arc::new(MetadataStore::open(&dir.path().join("mirror.db")).await?);
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 2, 3, 8, 0, 0).unwrap(),
        ));
        let fake = Arc::new(FakeRemote::new());
        fake.put_video(sample_remote("v1", "UC1"));
        let client = MeteredClient::new(fake.clone(), store.clone(), clock, "tester", 10_000);
        let creds = Credentials::api_key("k");

        client.search(&creds, "rust", 5).await?;
        client.fetch_details(&creds, &["v1".to_string()]).await?;

        let day = NaiveDate::from_ymd_opt(2026, 2, 3).unwrap();
        assert_eq!(store.daily_quota_total(day).await?, 101);
        Ok(())
    }

    #[tokio::test]
    async fn metered_client_books_failed_calls_and_keeps_the_remote_error() -> MirrorResult<()> {
        let dir = tempdir()?;
        let store = Arc::new(MetadataStore::open(&dir.path().join("mirror.db")).await?);
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 2, 3, 8, 0, 0).unwrap(),
        ));
        let fake = Arc::new(FakeRemote::new());
        fake.fail("quotaExceeded");
        let client = MeteredClient::new(fake, store.clone(), clock, "tester", 10_000);

        let err = client
            .list_channel_uploads(&Credentials::api_key("k"), "UC1", 10)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("quotaExceeded"));

        let day = NaiveDate::from_ymd_opt(2026, 2, 3).unwrap();
        assert_eq!(store.daily_quota_total(day).await?, 100);
        Ok(())
    }
}
