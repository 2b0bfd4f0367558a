//! Pulls remote metadata into the local mirror.
//!
//! Every routine here runs request-at-a-time: remote calls happen in
//! sequence and the first failure aborts the whole operation. Rows already
//! upserted before a failure stay written; re-running is always safe since
//! upserts are idempotent.

use std::collections::HashSet;

use serde::Serialize;

use crate::{
    clock::Clock,
    error::{MirrorError, MirrorResult},
    metadata::{AggregateStats, MetadataStore, VideoFilter, VideoRecord},
    remote::{MAX_PAGE_SIZE, RemoteMetadataClient, RemoteVideo, VideoUpload, clamp_page_size},
    security::Credentials,
};

/// Outcome of [`sync_channel`].
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub channel_id: String,
    /// Rows upserted by this run.
    pub synced: usize,
    /// Ids listed by the channel that the details lookup did not return.
    pub missing: Vec<String>,
    /// Totals over the channel's mirrored rows matching the text filter.
    pub stats: AggregateStats,
    pub records: Vec<VideoRecord>,
}

/// Outcome of [`refresh_statistics`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshReport {
    pub requested: usize,
    pub updated: u64,
    pub remote_calls: usize,
    /// Mirrored ids the remote no longer returns. Their rows are kept.
    pub missing: Vec<String>,
}

/// Mirrors the first page of a channel's uploads and reports aggregate
/// statistics over the channel's local rows.
///
/// Details for all listed ids come from a single batched lookup, skipped
/// entirely when the channel lists nothing.
pub async fn sync_channel<C>(
    client: &C,
    store: &MetadataStore,
    clock: &dyn Clock,
    creds: &Credentials,
    channel_id: &str,
    max_results: u32,
    text_filter: Option<String>,
) -> MirrorResult<SyncReport>
where
    C: RemoteMetadataClient + ?Sized,
{
    let listed = client
        .list_channel_uploads(creds, channel_id, clamp_page_size(max_results))
        .await?;
    let ids = dedupe(listed);

    let mut missing = Vec::new();
    let mut synced = 0;
    if !ids.is_empty() {
        let details = client.fetch_details(creds, &ids).await?;
        let returned: HashSet<&str> = details.iter().map(|video| video.remote_id.as_str()).collect();
        missing = ids
            .iter()
            .filter(|id| !returned.contains(id.as_str()))
            .cloned()
            .collect();

        for video in &details {
            store.upsert(video, clock.now()).await?;
            synced += 1;
        }
    }

    let filter = VideoFilter::channel(channel_id).with_text(text_filter);
    let stats = store.aggregate(&filter).await?;
    let records = store.list_videos(&filter).await?;

    tracing::info!(
        channel = channel_id,
        synced,
        missing = missing.len(),
        total_views = stats.total_views,
        "channel sync finished"
    );

    Ok(SyncReport {
        channel_id: channel_id.to_owned(),
        synced,
        missing,
        stats,
        records,
    })
}

/// Re-reads views and likes for every mirrored video, 50 ids per remote
/// call, and overwrites the local counters.
pub async fn refresh_statistics<C>(
    client: &C,
    store: &MetadataStore,
    clock: &dyn Clock,
    creds: &Credentials,
) -> MirrorResult<RefreshReport>
where
    C: RemoteMetadataClient + ?Sized,
{
    let ids = store.all_remote_ids().await?;
    let mut report = RefreshReport {
        requested: ids.len(),
        ..RefreshReport::default()
    };

    for batch in ids.chunks(MAX_PAGE_SIZE as usize) {
        let details = client.fetch_details(creds, batch).await?;
        report.remote_calls += 1;

        let returned: HashSet<&str> = details.iter().map(|video| video.remote_id.as_str()).collect();
        report.missing.extend(
            batch
                .iter()
                .filter(|id| !returned.contains(id.as_str()))
                .cloned(),
        );

        let updates: Vec<(String, i64, i64)> = details
            .into_iter()
            .map(|video| (video.remote_id, video.views, video.likes))
            .collect();
        report.updated += store.bulk_update_statistics(&updates, clock.now()).await?;
    }

    tracing::info!(
        requested = report.requested,
        updated = report.updated,
        calls = report.remote_calls,
        "statistics refresh finished"
    );
    Ok(report)
}

/// Live details for one video, without touching the mirror.
pub async fn fetch_video<C>(client: &C, creds: &Credentials, remote_id: &str) -> MirrorResult<RemoteVideo>
where
    C: RemoteMetadataClient + ?Sized,
{
    client
        .fetch_details(creds, &[remote_id.to_owned()])
        .await?
        .into_iter()
        .find(|video| video.remote_id == remote_id)
        .ok_or_else(|| MirrorError::NotFound(remote_id.to_owned()))
}

/// Publishes a local file and records the new video in the mirror,
/// attributed to `owner`.
pub async fn upload_video<C>(
    client: &C,
    store: &MetadataStore,
    clock: &dyn Clock,
    creds: &Credentials,
    upload: &VideoUpload,
    owner: Option<&str>,
) -> MirrorResult<VideoRecord>
where
    C: RemoteMetadataClient + ?Sized,
{
    creds.require_user()?;
    let remote_id = client.insert_video(creds, upload).await?;
    tracing::info!(remote_id = %remote_id, path = %upload.path.display(), "video uploaded");
    store
        .record_upload(
            &remote_id,
            &upload.title,
            &upload.description,
            owner,
            clock.now(),
        )
        .await
}

fn dedupe(ids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter()
        .filter(|id| seen.insert(id.clone()))
        .collect()
}
