#![forbid(unsafe_code)]

//! Command-line front end for the mirror: run a channel sync or statistics
//! refresh from cron, try a cached search, upload a file, inspect quota.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tubemirror::{
    cache::{CacheStore, SqlCache},
    clock::{Clock, SystemClock},
    config::{RuntimeOverrides, RuntimeSettings, resolve_runtime_settings},
    metadata::MetadataStore,
    remote::{MeteredClient, PrivacyStatus, VideoUpload},
    search::CachedSearch,
    security::{Credentials, ensure_not_root},
    sync,
    youtube::YouTubeClient,
};

#[derive(Parser)]
#[command(name = "mirror_tool")]
#[command(about = "Maintain the local YouTube metadata mirror")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Debug, Default)]
struct GlobalArgs {
    /// Directory holding mirror.db (overrides TUBEMIRROR_DATA_ROOT)
    #[arg(long, global = true)]
    data_root: Option<PathBuf>,

    /// Alternate .env file
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Developer API key (overrides YOUTUBE_API_KEY)
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// OAuth access token; takes precedence over the API key
    #[arg(long, global = true, env = "YOUTUBE_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    /// OAuth refresh token passed along with the access token
    #[arg(long, global = true, env = "YOUTUBE_REFRESH_TOKEN", hide_env_values = true)]
    refresh_token: Option<String>,

    /// Name recorded in the quota ledger and as upload owner
    #[arg(long, global = true, env = "TUBEMIRROR_ACTOR", default_value = "cli")]
    actor: String,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Mirror the latest uploads of a channel
    Sync {
        channel_id: String,
        /// Uploads to fetch (1-50)
        #[arg(long, default_value_t = 25)]
        max: u32,
        /// Only aggregate videos whose title or description contains this
        #[arg(long)]
        filter: Option<String>,
    },
    /// Keyword search through the cache
    Search {
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,
        #[arg(long, default_value_t = 10)]
        max: u32,
    },
    /// Refresh views and likes of every mirrored video
    Refresh,
    /// Upload a local file and mirror it
    Upload {
        path: PathBuf,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Remote category id
        #[arg(long, default_value = "22")]
        category: String,
        /// private, unlisted or public
        #[arg(long, default_value = "private", value_parser = parse_privacy)]
        privacy: PrivacyStatus,
    },
    /// Show quota units spent on a day (today by default)
    Quota {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Delete expired search cache entries
    PurgeCache,
    /// Detach a removed owner from the videos they added
    ReleaseOwner { owner: String },
}

fn parse_privacy(value: &str) -> Result<PrivacyStatus, String> {
    PrivacyStatus::parse(value).ok_or_else(|| format!("unknown privacy status: {value}"))
}

struct ToolContext {
    settings: RuntimeSettings,
    store: Arc<MetadataStore>,
    clock: Arc<dyn Clock>,
}

impl ToolContext {
    async fn open(global: &GlobalArgs) -> Result<Self> {
        let settings = resolve_runtime_settings(RuntimeOverrides {
            data_root: global.data_root.clone(),
            api_key: global.api_key.clone(),
            env_path: global.env_file.clone(),
            ..RuntimeOverrides::default()
        })
        .context("loading runtime settings")?;
        let store = MetadataStore::open(&settings.database_path())
            .await
            .with_context(|| format!("opening {}", settings.database_path().display()))?;
        Ok(Self {
            settings,
            store: Arc::new(store),
            clock: Arc::new(SystemClock),
        })
    }

    fn credentials(&self, global: &GlobalArgs) -> Result<Credentials> {
        Credentials::resolve(
            global.access_token.clone(),
            global.refresh_token.clone(),
            self.settings.api_key.clone(),
        )
        .context("set YOUTUBE_ACCESS_TOKEN or YOUTUBE_API_KEY")
    }

    fn client(&self, actor: &str) -> MeteredClient<YouTubeClient> {
        MeteredClient::new(
            YouTubeClient::from_settings(&self.settings),
            self.store.clone(),
            self.clock.clone(),
            actor,
            self.settings.quota_daily_limit,
        )
    }

    fn cache(&self) -> SqlCache {
        SqlCache::new(self.store.connection().clone(), self.clock.clone())
    }
}

fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human(value);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let Cli { global, command } = Cli::parse();
    ensure_not_root("mirror_tool")?;
    let ctx = ToolContext::open(&global).await?;

    match command {
        Commands::Sync {
            channel_id,
            max,
            filter,
        } => {
            let creds = ctx.credentials(&global)?;
            let report = sync::sync_channel(
                &ctx.client(&global.actor),
                &ctx.store,
                ctx.clock.as_ref(),
                &creds,
                &channel_id,
                max,
                filter,
            )
            .await
            .with_context(|| format!("syncing channel {channel_id}"))?;
            emit(global.json, &report, |report| {
                println!(
                    "{}: {} synced, {} missing; {} videos, {} views, {} likes",
                    report.channel_id,
                    report.synced,
                    report.missing.len(),
                    report.stats.count,
                    report.stats.total_views,
                    report.stats.total_likes,
                );
            })
        }
        Commands::Search { query, max } => {
            let creds = ctx.credentials(&global)?;
            let search = CachedSearch::new(ctx.cache(), ctx.settings.search_ttl);
            let results = search
                .search_cached(&ctx.client(&global.actor), &creds, &query.join(" "), max)
                .await
                .context("searching")?;
            emit(global.json, &results, |results| {
                for hit in results {
                    println!("{}  {}  ({})", hit.remote_id, hit.title, hit.channel_name);
                }
            })
        }
        Commands::Refresh => {
            let creds = ctx.credentials(&global)?;
            let report = sync::refresh_statistics(
                &ctx.client(&global.actor),
                &ctx.store,
                ctx.clock.as_ref(),
                &creds,
            )
            .await
            .context("refreshing statistics")?;
            emit(global.json, &report, |report| {
                println!(
                    "{} of {} videos updated in {} calls; {} no longer available",
                    report.updated,
                    report.requested,
                    report.remote_calls,
                    report.missing.len(),
                );
            })
        }
        Commands::Upload {
            path,
            title,
            description,
            category,
            privacy,
        } => {
            if !path.is_file() {
                bail!("{} is not a file", path.display());
            }
            let creds = ctx.credentials(&global)?;
            let upload = VideoUpload {
                path,
                title,
                description,
                category_id: category,
                privacy,
            };
            let record = sync::upload_video(
                &ctx.client(&global.actor),
                &ctx.store,
                ctx.clock.as_ref(),
                &creds,
                &upload,
                Some(&global.actor),
            )
            .await
            .context("uploading video")?;
            emit(global.json, &record, |record| {
                println!("uploaded {} ({})", record.remote_id, record.video_url);
            })
        }
        Commands::Quota { date } => {
            let date = date.unwrap_or_else(|| ctx.clock.now().date_naive());
            let used = ctx.store.daily_quota_total(date).await?;
            let limit = ctx.settings.quota_daily_limit;
            let summary = serde_json::json!({ "date": date, "used": used, "limit": limit });
            emit(global.json, &summary, |_| {
                println!("{date}: {used} of {limit} units used");
            })
        }
        Commands::PurgeCache => {
            let removed = ctx.cache().purge_expired().await?;
            emit(global.json, &serde_json::json!({ "removed": removed }), |_| {
                println!("removed {removed} expired cache entries");
            })
        }
        Commands::ReleaseOwner { owner } => {
            let released = ctx.store.release_owner(&owner, ctx.clock.now()).await?;
            emit(global.json, &serde_json::json!({ "released": released }), |_| {
                println!("{released} videos no longer attributed to {owner}");
            })
        }
    }
}
